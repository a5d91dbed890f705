use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use beamdrop_protocol::{ClientEvent, ClientFrame, ServerEvent};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::NodeEngine;
use crate::error::RelayError;
use crate::sockets::EventSender;

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<NodeEngine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

/// One connected client. All outbound traffic funnels through a single
/// queue so the per-connection stream stays FIFO; inbound frames are
/// handled sequentially, which is what makes the `upload-chunk` ack a
/// usable flow-control gate.
async fn handle_socket(socket: WebSocket, engine: Arc<NodeEngine>) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    engine.sockets.bind_socket(&socket_id, tx.clone()).await;
    debug!(socket_id, "event channel open");

    let mut client_id: Option<String> = None;
    let mut shutdown = engine.shutdown_signal();

    loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(%err, "failed to serialize outbound event");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&engine, &socket_id, &mut client_id, &tx, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    engine.sockets.unbind_socket(&socket_id).await;
    if let Some(client_id) = client_id {
        engine.sessions.disconnect(&client_id, &socket_id).await;
    }
    debug!(socket_id, "event channel closed");
}

fn send_ack(tx: &EventSender, seq: Option<u64>, result: &Result<(), &RelayError>) {
    let Some(seq) = seq else {
        return;
    };
    let event = match result {
        Ok(()) => ServerEvent::Ack {
            seq,
            success: true,
            error: None,
        },
        Err(err) => ServerEvent::Ack {
            seq,
            success: false,
            error: Some(err.to_string()),
        },
    };
    let _ = tx.send(event);
}

async fn handle_frame(
    engine: &Arc<NodeEngine>,
    socket_id: &str,
    bound_client: &mut Option<String>,
    tx: &EventSender,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(socket_id, %err, "undecodable inbound frame");
            return;
        }
    };
    let seq = frame.seq;

    match frame.event {
        ClientEvent::Register { client_id } => {
            match engine.sessions.register(&client_id, socket_id).await {
                Ok(event) => {
                    engine.sockets.bind_client(&client_id, socket_id).await;
                    *bound_client = Some(client_id);
                    let _ = tx.send(event);
                    send_ack(tx, seq, &Ok(()));
                }
                Err(err) => send_ack(tx, seq, &Err(&err)),
            }
        }
        ClientEvent::Heartbeat { client_id } => {
            match engine.sessions.heartbeat(&client_id, socket_id).await {
                Ok(event) => {
                    let _ = tx.send(event);
                    send_ack(tx, seq, &Ok(()));
                }
                Err(RelayError::RateLimited { reset_at_ms }) => {
                    let _ = tx.send(ServerEvent::RateLimited { reset_at_ms });
                    send_ack(tx, seq, &Err(&RelayError::RateLimited { reset_at_ms }));
                }
                Err(err) => send_ack(tx, seq, &Err(&err)),
            }
        }
        ClientEvent::UploadInit {
            client_id,
            file_name,
            file_size,
            total_chunks,
            file_id,
        } => {
            match engine
                .transfers
                .upload_init(&client_id, &file_name, file_size, total_chunks, file_id)
                .await
            {
                Ok((file_id, resume_from)) => {
                    let _ = tx.send(ServerEvent::UploadInitResponse {
                        file_id,
                        resume_from,
                    });
                    send_ack(tx, seq, &Ok(()));
                }
                Err(err) => send_ack(tx, seq, &Err(&err)),
            }
        }
        ClientEvent::UploadChunk {
            client_id,
            file_id,
            chunk_index,
            chunk,
            checksum,
        } => {
            // The ack below is the sender's backpressure signal.
            let result = engine
                .transfers
                .upload_chunk(&client_id, &file_id, chunk_index, chunk, checksum)
                .await;
            send_ack(tx, seq, &result.as_ref().map(|_| ()));
        }
        ClientEvent::ChunkAcknowledged {
            client_id,
            file_id,
            chunk_index,
        } => {
            engine
                .transfers
                .chunk_acknowledged(&client_id, &file_id, chunk_index)
                .await;
            send_ack(tx, seq, &Ok(()));
        }
        ClientEvent::DownloadConfirmed {
            client_id,
            file_id,
            file_name,
            share_id,
        } => {
            engine
                .transfers
                .download_confirmed(&client_id, &file_id, &file_name, &share_id)
                .await;
            send_ack(tx, seq, &Ok(()));
        }
        ClientEvent::CancelDownload { client_id, file_id } => {
            let result = engine.transfers.cancel_download(&client_id, &file_id).await;
            send_ack(tx, seq, &result.as_ref().map(|_| ()));
        }
        ClientEvent::Unknown => {
            warn!(socket_id, "unknown event discriminant, ignoring");
            send_ack(
                tx,
                seq,
                &Err(&RelayError::BadRequest("unknown event type".into())),
            );
        }
    }
}
