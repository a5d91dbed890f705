use std::collections::HashMap;
use std::sync::Arc;

use beamdrop_protocol::{Base64Bytes, ServerEvent};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::checksum::chunk_checksum;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{RelayError, RelayResult};
use crate::model::{now_ms, PendingAck, UploadState, UploadStatus};
use crate::storage::{latest_session, SharedStorage, Storage, FILES_SENT_COUNTER};

/// Serializes mutation per file id. The chunk ingest path, the ack
/// handler, and the retry scan all read-modify-write the same record;
/// everything funnels through here first.
#[derive(Default)]
struct FileLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileLocks {
    async fn acquire(&self, file_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(file_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn discard(&self, file_id: &str) {
        self.inner.lock().await.remove(file_id);
    }
}

/// The transfer relay: upload admission, chunk ingest and fan-out, ack
/// tracking with retry/timeout escalation, completion and cancellation.
pub struct TransferEngine {
    config: Arc<Config>,
    storage: SharedStorage,
    coordinator: Arc<Coordinator>,
    locks: FileLocks,
}

impl TransferEngine {
    pub fn new(
        config: Arc<Config>,
        storage: SharedStorage,
        coordinator: Arc<Coordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            coordinator,
            locks: FileLocks::default(),
        })
    }

    // ── Upload admission ────────────────────────────────────────

    /// Validates budgets, discovers eligible receivers from the sender's
    /// share, allocates the file id and announces the transfer. Returns
    /// `(file_id, resume_from)`.
    pub async fn upload_init(
        &self,
        client_id: &str,
        file_name: &str,
        file_size: u64,
        total_chunks: u32,
        requested_file_id: Option<String>,
    ) -> RelayResult<(String, u32)> {
        if client_id.is_empty() || file_name.is_empty() {
            return Err(RelayError::BadRequest(
                "clientId and fileName are required".into(),
            ));
        }
        if total_chunks == 0 {
            return Err(RelayError::BadRequest("totalChunks must be positive".into()));
        }
        if file_size > self.config.max_file_size {
            return Err(RelayError::FileTooLarge {
                size: file_size,
                limit: self.config.max_file_size,
            });
        }

        // Re-init of a known upload resumes instead of starting over.
        if let Some(file_id) = &requested_file_id {
            if let Ok(Some(existing)) = self.storage.get_upload(file_id).await {
                if existing.client_id == client_id && existing.status == UploadStatus::Uploading {
                    return Ok((file_id.clone(), existing.uploaded_count()));
                }
            }
        }

        let sender = latest_session(self.storage.as_ref(), client_id)
            .await
            .map_err(|err| {
                error!(%err, "sender session lookup failed");
                RelayError::ServiceUnavailable("session store unavailable".into())
            })?
            .ok_or_else(|| RelayError::BadRequest("client is not registered".into()))?;

        let uploading = self
            .storage
            .list_uploads()
            .await
            .map_err(|err| {
                error!(%err, "upload census failed");
                RelayError::ServiceUnavailable("upload store unavailable".into())
            })?
            .into_iter()
            .filter(|u| u.client_id == client_id && u.status == UploadStatus::Uploading)
            .count();
        if uploading >= self.config.max_concurrent_uploads {
            return Err(RelayError::UploadFailed(format!(
                "concurrent upload limit of {} reached",
                self.config.max_concurrent_uploads
            )));
        }
        if sender.transfer_count() >= self.config.max_concurrent_transfers {
            return Err(RelayError::UploadFailed(format!(
                "concurrent transfer limit of {} reached",
                self.config.max_concurrent_transfers
            )));
        }

        // Receivers come from the sender's share: the other participant,
        // when there is one and it has budget left.
        let mut receivers = Vec::new();
        let mut others = 0usize;
        let heartbeat_ttl_ms = self.config.ttl_heartbeat.as_millis() as u64;
        if let Some(share_id) = &sender.share_id {
            if let Ok(Some(share)) = self.storage.get_share(share_id).await {
                for member in share.clients.iter().filter(|c| c.as_str() != client_id) {
                    others += 1;
                    let Ok(Some(candidate)) = latest_session(self.storage.as_ref(), member).await
                    else {
                        continue;
                    };
                    if !candidate.connected
                        || now_ms().saturating_sub(candidate.last_heartbeat_ms) > heartbeat_ttl_ms
                    {
                        continue;
                    }
                    if candidate.downloads.len() >= self.config.max_concurrent_downloads
                        || candidate.transfer_count() >= self.config.max_concurrent_transfers
                    {
                        debug!(member = %member, "receiver over budget, skipping");
                        continue;
                    }
                    receivers.push(member.clone());
                }
            }
        }
        if others > 0 && receivers.is_empty() {
            return Err(RelayError::UploadFailed("All receivers are busy".into()));
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let state = UploadState::new(
            file_id.clone(),
            file_name.to_string(),
            file_size,
            total_chunks,
            client_id.to_string(),
            sender.share_id.clone(),
            receivers.clone(),
        );
        self.storage
            .put_upload(&state, self.config.ttl_upload_state)
            .await
            .map_err(|err| {
                error!(%err, "failed to persist upload state");
                RelayError::ServiceUnavailable("upload store unavailable".into())
            })?;

        for receiver in &receivers {
            if let Ok(Some(mut session)) = latest_session(self.storage.as_ref(), receiver).await {
                session.downloads.insert(file_id.clone());
                if let Err(err) = self
                    .storage
                    .put_session(&session, self.config.ttl_client_session)
                    .await
                {
                    warn!(%err, receiver = %receiver, "failed to record download");
                }
            }
            self.coordinator
                .route_to_client(
                    receiver,
                    ServerEvent::FileTransferStarted {
                        file_id: file_id.clone(),
                        file_name: file_name.to_string(),
                        file_size,
                        total_chunks,
                    },
                )
                .await;
        }

        let mut sender = sender;
        sender.uploads.insert(file_id.clone());
        if let Err(err) = self
            .storage
            .put_session(&sender, self.config.ttl_client_session)
            .await
        {
            warn!(%err, client_id, "failed to record upload on sender session");
        }

        info!(file_id, client_id, file_name, total_chunks, "upload initialized");
        Ok((file_id, 0))
    }

    // ── Chunk ingest & relay ────────────────────────────────────

    /// The per-chunk pipeline. The `Ok` return is the sender's
    /// flow-control signal; it must not be delayed past relay + persist.
    pub async fn upload_chunk(
        &self,
        client_id: &str,
        file_id: &str,
        chunk_index: u32,
        chunk: Base64Bytes,
        client_checksum: Option<String>,
    ) -> RelayResult<()> {
        let _guard = self.locks.acquire(file_id).await;

        let mut state = self
            .storage
            .get_upload(file_id)
            .await
            .map_err(|err| {
                error!(%err, file_id, "upload lookup failed");
                RelayError::ServiceUnavailable("upload store unavailable".into())
            })?
            .ok_or_else(|| RelayError::NotFound(format!("unknown upload {file_id}")))?;

        match state.status {
            UploadStatus::Uploading => {}
            // Duplicate of an already-finished transfer; nothing to redo.
            UploadStatus::Completed => return Ok(()),
            UploadStatus::Cancelled => {
                return Err(RelayError::Conflict("upload was cancelled".into()))
            }
            UploadStatus::Paused => return Err(RelayError::Conflict("upload is paused".into())),
            UploadStatus::Failed => {
                return Err(RelayError::Conflict("transfer already failed".into()))
            }
        }
        if chunk_index >= state.total_chunks {
            return Err(RelayError::BadRequest(format!(
                "chunkIndex {chunk_index} out of range 0..{}",
                state.total_chunks
            )));
        }
        // Senders pick their own slice size, within reason of the
        // configured default.
        let chunk_cap = self.config.chunk_size.saturating_mul(4).max(1024 * 1024);
        if chunk.len() as u64 > chunk_cap {
            return Err(RelayError::PayloadTooLarge(format!(
                "chunk of {} bytes exceeds cap of {chunk_cap}",
                chunk.len()
            )));
        }

        let already_acked = state.uploaded_chunks.contains(&chunk_index)
            && !state.pending_acks.contains_key(&chunk_index);
        let fresh = !state.uploaded_chunks.contains(&chunk_index);

        if fresh {
            if self.config.enable_checksums {
                let computed = chunk_checksum(chunk.as_slice());
                if let Some(claimed) = &client_checksum {
                    if claimed != &computed {
                        return Err(RelayError::ChecksumMismatch { chunk_index });
                    }
                }
                state.chunk_checksums.insert(chunk_index, computed);
            }
            state.uploaded_chunks.insert(chunk_index);
            if !state.receivers.is_empty() {
                state.pending_acks.insert(
                    chunk_index,
                    PendingAck {
                        timestamp_ms: now_ms(),
                        retries: 0,
                    },
                );
            }
        }
        state.last_update_ms = now_ms();
        if let Err(err) = self
            .storage
            .put_upload(&state, self.config.ttl_upload_state)
            .await
        {
            // Loss here is absorbed by the ack/retry machinery.
            warn!(%err, file_id, "chunk state write failed");
        }

        self.coordinator
            .route_to_client(
                client_id,
                ServerEvent::ChunkUploaded {
                    file_id: file_id.to_string(),
                    chunk_index,
                    progress: state.progress_percent(),
                    uploaded_chunks: state.uploaded_count(),
                    total_chunks: state.total_chunks,
                },
            )
            .await;

        // Fan out, except for chunks whose delivery is already confirmed.
        if !already_acked {
            self.relay_chunk(&state, client_id, chunk_index, &chunk).await;
        }

        if state.is_completable() {
            self.finalize_complete(&mut state).await;
        }
        Ok(())
    }

    async fn relay_chunk(
        &self,
        state: &UploadState,
        sender_id: &str,
        chunk_index: u32,
        chunk: &Base64Bytes,
    ) {
        for receiver in &state.receivers {
            match self
                .storage
                .is_download_cancelled(&state.file_id, receiver)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => warn!(%err, "cancellation check failed"),
            }
            let Ok(Some(session)) = latest_session(self.storage.as_ref(), receiver).await else {
                continue;
            };
            if !session.connected || !session.downloads.contains(&state.file_id) {
                continue;
            }
            self.coordinator
                .route_to_client(
                    receiver,
                    ServerEvent::ChunkReceived {
                        file_id: state.file_id.clone(),
                        chunk_index,
                        chunk: chunk.clone(),
                        total_chunks: state.total_chunks,
                    },
                )
                .await;
            // Relay-time ack back to the sender; the receiver's own ack
            // is what clears the pending entry.
            self.coordinator
                .route_to_client(
                    sender_id,
                    ServerEvent::ChunkAcknowledged {
                        file_id: state.file_id.clone(),
                        chunk_index,
                    },
                )
                .await;
        }
    }

    // ── Acknowledgments ─────────────────────────────────────────

    /// Receiver-origin ack: clears the pending entry and may complete the
    /// transfer.
    pub async fn chunk_acknowledged(&self, client_id: &str, file_id: &str, chunk_index: u32) {
        let _guard = self.locks.acquire(file_id).await;
        let Ok(Some(mut state)) = self.storage.get_upload(file_id).await else {
            debug!(file_id, client_id, "ack for unknown upload");
            return;
        };
        if state.pending_acks.remove(&chunk_index).is_none() {
            return;
        }
        let now = now_ms();
        state.last_ack_time_ms = Some(now);
        state.last_update_ms = now;
        if let Err(err) = self
            .storage
            .put_upload(&state, self.config.ttl_upload_state)
            .await
        {
            warn!(%err, file_id, "ack state write failed");
        }
        if state.is_completable() {
            self.finalize_complete(&mut state).await;
        }
    }

    async fn finalize_complete(&self, state: &mut UploadState) {
        if state.status == UploadStatus::Completed {
            return;
        }
        state.status = UploadStatus::Completed;
        state.last_update_ms = now_ms();
        if let Err(err) = self
            .storage
            .put_upload(state, self.config.ttl_upload_state)
            .await
        {
            warn!(%err, file_id = %state.file_id, "completion write failed");
        }
        if let Err(err) = self.storage.incr_counter(FILES_SENT_COUNTER).await {
            warn!(%err, "filesSent counter increment failed");
        }
        if let Err(err) = self
            .storage
            .clear_cancelled_downloads(&state.file_id)
            .await
        {
            warn!(%err, "cancellation cleanup failed");
        }
        self.detach_from_sessions(state).await;

        let duration_ms = now_ms().saturating_sub(state.start_time_ms);
        self.coordinator
            .route_to_client(
                &state.client_id,
                ServerEvent::UploadComplete {
                    file_id: state.file_id.clone(),
                    file_name: state.file_name.clone(),
                    file_size: state.file_size,
                    duration_ms,
                },
            )
            .await;
        info!(file_id = %state.file_id, duration_ms, "upload complete");
    }

    /// Frees the sender's and receivers' transfer budgets.
    async fn detach_from_sessions(&self, state: &UploadState) {
        let mut members = state.receivers.clone();
        members.push(state.client_id.clone());
        for member in members {
            let Ok(sessions) = self.storage.sessions_for_client(&member).await else {
                continue;
            };
            for mut session in sessions {
                let touched = session.uploads.remove(&state.file_id)
                    | session.downloads.remove(&state.file_id);
                if touched {
                    if let Err(err) = self
                        .storage
                        .put_session(&session, self.config.ttl_client_session)
                        .await
                    {
                        warn!(%err, member = %session.client_id, "budget release failed");
                    }
                }
            }
        }
    }

    // ── Cancellation & confirmation ─────────────────────────────

    pub async fn cancel_download(&self, client_id: &str, file_id: &str) -> RelayResult<()> {
        if let Err(err) = self
            .storage
            .add_cancelled_download(file_id, client_id, self.config.ttl_upload_state)
            .await
        {
            error!(%err, file_id, "failed to record cancellation");
            return Err(RelayError::ServiceUnavailable(
                "cancellation store unavailable".into(),
            ));
        }
        if let Ok(sessions) = self.storage.sessions_for_client(client_id).await {
            for mut session in sessions {
                if session.downloads.remove(file_id) {
                    if let Err(err) = self
                        .storage
                        .put_session(&session, self.config.ttl_client_session)
                        .await
                    {
                        warn!(%err, client_id, "failed to drop cancelled download");
                    }
                }
            }
        }
        self.coordinator
            .route_to_client(
                client_id,
                ServerEvent::DownloadCancelled {
                    file_id: file_id.to_string(),
                },
            )
            .await;
        info!(file_id, client_id, "download cancelled");
        Ok(())
    }

    /// A receiver finished reassembly; tell the sender. The upload state
    /// is authoritative for who that is, with the share roster as the
    /// fallback once the state has been reaped.
    pub async fn download_confirmed(
        &self,
        from_client: &str,
        file_id: &str,
        file_name: &str,
        share_id: &str,
    ) {
        let sender = match self.storage.get_upload(file_id).await {
            Ok(Some(state)) => Some(state.client_id),
            _ => match self.storage.get_share(share_id).await {
                Ok(Some(share)) => share.peer_of(from_client).map(|s| s.to_string()),
                _ => None,
            },
        };
        let Some(sender) = sender else {
            warn!(file_id, from_client, "no sender found for download confirmation");
            return;
        };
        self.coordinator
            .route_to_client(
                &sender,
                ServerEvent::DownloadConfirmed {
                    file_id: file_id.to_string(),
                    file_name: file_name.to_string(),
                },
            )
            .await;
    }

    // ── Retry / timeout escalation ──────────────────────────────

    /// One pass over every live upload: entries out of retry budget fail
    /// the transfer, timed-out entries are re-requested from the sender.
    pub async fn scan_pending_acks(&self) {
        let uploads = match self.storage.list_uploads().await {
            Ok(uploads) => uploads,
            Err(err) => {
                error!(%err, "ack scan census failed");
                return;
            }
        };
        for summary in uploads {
            if summary.status != UploadStatus::Uploading || summary.receivers.is_empty() {
                continue;
            }
            self.scan_upload(&summary.file_id).await;
        }
    }

    async fn scan_upload(&self, file_id: &str) {
        let _guard = self.locks.acquire(file_id).await;
        let Ok(Some(mut state)) = self.storage.get_upload(file_id).await else {
            return;
        };
        if state.status != UploadStatus::Uploading {
            return;
        }

        let now = now_ms();
        let timeout_ms = self.config.ack_timeout.as_millis() as u64;
        let mut failed = Vec::new();
        let mut retried = Vec::new();
        for (&index, ack) in state.pending_acks.iter_mut() {
            if ack.retries >= self.config.max_retries {
                failed.push(index);
            } else if now.saturating_sub(ack.timestamp_ms) > timeout_ms {
                ack.retries += 1;
                ack.timestamp_ms = now;
                retried.push((index, ack.retries));
            }
        }

        if !failed.is_empty() {
            state.status = UploadStatus::Failed;
            state.last_update_ms = now;
            if let Err(err) = self
                .storage
                .put_upload(&state, self.config.ttl_upload_state)
                .await
            {
                warn!(%err, file_id, "failure state write failed");
            }
            self.detach_from_sessions(&state).await;
            warn!(file_id, failed = failed.len(), "transfer failed: retry budget exhausted");
            self.coordinator
                .route_to_client(
                    &state.client_id,
                    ServerEvent::TransferFailed {
                        file_id: file_id.to_string(),
                        reason: format!(
                            "{} chunk(s) unacknowledged after {} retries",
                            failed.len(),
                            self.config.max_retries
                        ),
                        failed_chunks: failed,
                    },
                )
                .await;
            return;
        }

        if retried.is_empty() {
            return;
        }
        if let Err(err) = self
            .storage
            .put_upload(&state, self.config.ttl_upload_state)
            .await
        {
            warn!(%err, file_id, "retry state write failed");
        }
        for (index, attempt) in retried {
            debug!(file_id, chunk_index = index, attempt, "requesting chunk retry");
            self.coordinator
                .route_to_client(
                    &state.client_id,
                    ServerEvent::ChunkRetry {
                        file_id: file_id.to_string(),
                        chunk_index: index,
                        attempt,
                    },
                )
                .await;
        }
    }

    pub async fn run_ack_scan(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.ack_scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan_pending_acks().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ── Reaping ─────────────────────────────────────────────────

    /// Deletes finished uploads after a short grace and silent live ones
    /// after a day.
    pub async fn reap_stale_uploads(&self) {
        let uploads = match self.storage.list_uploads().await {
            Ok(uploads) => uploads,
            Err(err) => {
                error!(%err, "upload reap census failed");
                return;
            }
        };
        let now = now_ms();
        let finished_after = self.config.completed_reap_after.as_millis() as u64;
        let silent_after = self.config.uploading_reap_after.as_millis() as u64;
        for state in uploads {
            let idle = now.saturating_sub(state.last_update_ms);
            let reap = match state.status {
                UploadStatus::Completed
                | UploadStatus::Failed
                | UploadStatus::Cancelled => idle > finished_after,
                UploadStatus::Uploading | UploadStatus::Paused => idle > silent_after,
            };
            if !reap {
                continue;
            }
            debug!(file_id = %state.file_id, status = ?state.status, "reaping upload");
            if let Err(err) = self.storage.delete_upload(&state.file_id).await {
                warn!(%err, file_id = %state.file_id, "upload reap failed");
                continue;
            }
            let _ = self.storage.clear_cancelled_downloads(&state.file_id).await;
            self.locks.discard(&state.file_id).await;
        }
    }

    /// Progress snapshot for the HTTP surface.
    pub async fn upload_snapshot(&self, file_id: &str) -> RelayResult<UploadState> {
        self.storage
            .get_upload(file_id)
            .await
            .map_err(|err| {
                error!(%err, "upload lookup failed");
                RelayError::ServiceUnavailable("upload store unavailable".into())
            })?
            .ok_or_else(|| RelayError::NotFound(format!("unknown upload {file_id}")))
    }
}
