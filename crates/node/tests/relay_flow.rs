// ═══════════════════════════════════════════════════════════════
// beamdrop — single-node relay scenarios
// Happy-path transfer · idempotent chunks · admission boundaries
// ═══════════════════════════════════════════════════════════════

mod common;

use std::time::Duration;

use beamdrop_node::error::RelayError;
use beamdrop_node::storage::{Storage, FILES_SENT_COUNTER};
use beamdrop_protocol::{Base64Bytes, ServerEvent};
use common::{build_node, build_node_with, connect, fabric, node_config, settle};

#[tokio::test]
async fn standalone_happy_path_relays_three_chunks_in_order() {
    let (storage, pubsub) = fabric();
    let node = build_node(&storage, &pubsub, "h1", 4001).await;
    node.start().await;
    settle().await;

    let mut alice = connect(&node, "alice").await;
    let share = node
        .sessions
        .create_share("alice", None)
        .await
        .expect("share creation failed");
    alice
        .wait_for(|e| matches!(e, ServerEvent::ConnectionReady { .. }))
        .await;

    let mut bob = connect(&node, "bob").await;
    node.sessions
        .join_share(&share.share_id, "bob")
        .await
        .expect("join failed");
    alice
        .wait_for(|e| matches!(e, ServerEvent::ClientJoinedShare { client_id, .. } if client_id == "bob"))
        .await;
    bob.wait_for(|e| matches!(e, ServerEvent::ClientJoinedShare { client_id, .. } if client_id == "alice"))
        .await;

    let (file_id, resume_from) = node
        .transfers
        .upload_init("alice", "x", 48, 3, None)
        .await
        .expect("upload init failed");
    assert_eq!(resume_from, 0);
    bob.wait_for(
        |e| matches!(e, ServerEvent::FileTransferStarted { file_name, total_chunks, .. } if file_name == "x" && *total_chunks == 3),
    )
    .await;

    let expected_progress = [33u8, 66, 100];
    for index in 0..3u32 {
        node.transfers
            .upload_chunk(
                "alice",
                &file_id,
                index,
                Base64Bytes(vec![index as u8; 16]),
                None,
            )
            .await
            .expect("chunk ingest failed");

        let received = bob
            .wait_for(|e| matches!(e, ServerEvent::ChunkReceived { .. }))
            .await;
        match received {
            ServerEvent::ChunkReceived {
                chunk_index, chunk, ..
            } => {
                assert_eq!(chunk_index, index, "chunks must arrive in send order");
                assert_eq!(chunk.as_slice(), &vec![index as u8; 16][..]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        bob.ack_chunk(&file_id, index).await;

        let uploaded = alice
            .wait_for(|e| matches!(e, ServerEvent::ChunkUploaded { chunk_index, .. } if *chunk_index == index))
            .await;
        match uploaded {
            ServerEvent::ChunkUploaded { progress, .. } => {
                assert_eq!(progress, expected_progress[index as usize]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        alice
            .wait_for(|e| matches!(e, ServerEvent::ChunkAcknowledged { chunk_index, .. } if *chunk_index == index))
            .await;
    }

    alice
        .wait_for(|e| matches!(e, ServerEvent::UploadComplete { file_name, .. } if file_name == "x"))
        .await;

    node.transfers
        .download_confirmed("bob", &file_id, "x", &share.share_id)
        .await;
    alice
        .wait_for(|e| matches!(e, ServerEvent::DownloadConfirmed { file_name, .. } if file_name == "x"))
        .await;

    assert_eq!(storage.get_counter(FILES_SENT_COUNTER).await.unwrap(), 1);
    node.shutdown().await;
}

#[tokio::test]
async fn duplicate_of_an_acked_chunk_is_not_relayed_again() {
    let (storage, pubsub) = fabric();
    let node = build_node(&storage, &pubsub, "h1", 4002).await;
    node.start().await;
    settle().await;

    let _alice = connect(&node, "alice").await;
    let share = node.sessions.create_share("alice", None).await.unwrap();
    let mut bob = connect(&node, "bob").await;
    node.sessions.join_share(&share.share_id, "bob").await.unwrap();

    let (file_id, _) = node
        .transfers
        .upload_init("alice", "dup", 32, 2, None)
        .await
        .unwrap();
    bob.wait_for(|e| matches!(e, ServerEvent::FileTransferStarted { .. }))
        .await;

    node.transfers
        .upload_chunk("alice", &file_id, 0, Base64Bytes(vec![1; 16]), None)
        .await
        .unwrap();
    bob.wait_for(|e| matches!(e, ServerEvent::ChunkReceived { chunk_index, .. } if *chunk_index == 0))
        .await;
    bob.ack_chunk(&file_id, 0).await;
    // Give the ack a moment to clear the pending entry.
    settle().await;

    // Same chunk again: same visible state, no second chunk-received.
    node.transfers
        .upload_chunk("alice", &file_id, 0, Base64Bytes(vec![1; 16]), None)
        .await
        .unwrap();
    bob.assert_silent_for(Duration::from_millis(300), |e| {
        matches!(e, ServerEvent::ChunkReceived { chunk_index, .. } if *chunk_index == 0)
    })
    .await;

    let snapshot = node.transfers.upload_snapshot(&file_id).await.unwrap();
    assert_eq!(snapshot.uploaded_count(), 1);

    node.shutdown().await;
}

#[tokio::test]
async fn file_size_boundary_is_inclusive() {
    let (storage, pubsub) = fabric();
    let mut config = node_config("h1", 4003);
    config.max_file_size = 1024;
    let node = build_node_with(&storage, &pubsub, config).await;

    let _alice = connect(&node, "alice").await;
    node.sessions.create_share("alice", None).await.unwrap();

    assert!(node
        .transfers
        .upload_init("alice", "edge", 1024, 1, None)
        .await
        .is_ok());
    let err = node
        .transfers
        .upload_init("alice", "over", 1025, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::FileTooLarge { .. }));
    assert_eq!(err.code(), "FILE_TOO_LARGE");
}

#[tokio::test]
async fn third_client_is_rejected_with_share_full() {
    let (storage, pubsub) = fabric();
    let node = build_node(&storage, &pubsub, "h1", 4004).await;
    node.start().await;
    settle().await;

    let mut c1 = connect(&node, "c1").await;
    let share = node
        .sessions
        .create_share("c1", Some("room-1".into()))
        .await
        .unwrap();
    assert_eq!(share.share_id, "room-1");

    let mut c2 = connect(&node, "c2").await;
    node.sessions.join_share("room-1", "c2").await.unwrap();

    let _c3 = connect(&node, "c3").await;
    let err = node.sessions.join_share("room-1", "c3").await.unwrap_err();
    assert!(matches!(err, RelayError::ShareFull));
    assert_eq!(err.code(), "SHARE_SESSION_FULL");

    // Each surviving participant saw exactly one join notification.
    c1.wait_for(|e| matches!(e, ServerEvent::ClientJoinedShare { client_id, .. } if client_id == "c2"))
        .await;
    c1.assert_silent_for(Duration::from_millis(200), |e| {
        matches!(e, ServerEvent::ClientJoinedShare { .. })
    })
    .await;
    c2.wait_for(|e| matches!(e, ServerEvent::ClientJoinedShare { client_id, .. } if client_id == "c1"))
        .await;
    c2.assert_silent_for(Duration::from_millis(200), |e| {
        matches!(e, ServerEvent::ClientJoinedShare { .. })
    })
    .await;

    node.shutdown().await;
}

#[tokio::test]
async fn duplicate_share_id_is_a_conflict() {
    let (storage, pubsub) = fabric();
    let node = build_node(&storage, &pubsub, "h1", 4005).await;

    let _c1 = connect(&node, "c1").await;
    let _c2 = connect(&node, "c2").await;
    node.sessions
        .create_share("c1", Some("taken".into()))
        .await
        .unwrap();
    let err = node
        .sessions
        .create_share("c2", Some("taken".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::DuplicateShare(_)));
}

#[tokio::test]
async fn heartbeat_flood_is_rate_limited_with_reset_hint() {
    let (storage, pubsub) = fabric();
    let mut config = node_config("h1", 4006);
    config.heartbeat_rate_limit = 3;
    config.rate_limit_window = Duration::from_secs(30);
    let node = build_node_with(&storage, &pubsub, config).await;

    let alice = connect(&node, "alice").await;
    for _ in 0..3 {
        assert!(node
            .sessions
            .heartbeat("alice", &alice.socket_id)
            .await
            .is_ok());
    }
    let before = beamdrop_node::model::now_ms();
    let err = node
        .sessions
        .heartbeat("alice", &alice.socket_id)
        .await
        .unwrap_err();
    match err {
        RelayError::RateLimited { reset_at_ms } => {
            assert!(reset_at_ms > before);
            assert!(reset_at_ms <= before + 31_000);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn checksum_mismatch_rejects_the_chunk() {
    let (storage, pubsub) = fabric();
    let node = build_node(&storage, &pubsub, "h1", 4007).await;
    node.start().await;
    settle().await;

    let _alice = connect(&node, "alice").await;
    let share = node.sessions.create_share("alice", None).await.unwrap();
    let mut bob = connect(&node, "bob").await;
    node.sessions.join_share(&share.share_id, "bob").await.unwrap();

    let (file_id, _) = node
        .transfers
        .upload_init("alice", "sum", 16, 1, None)
        .await
        .unwrap();
    bob.wait_for(|e| matches!(e, ServerEvent::FileTransferStarted { .. }))
        .await;

    let err = node
        .transfers
        .upload_chunk(
            "alice",
            &file_id,
            0,
            Base64Bytes(vec![9; 16]),
            Some("0000000000000000".into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ChecksumMismatch { chunk_index: 0 }));

    let snapshot = node.transfers.upload_snapshot(&file_id).await.unwrap();
    assert_eq!(snapshot.uploaded_count(), 0, "rejected chunk must not count");

    node.shutdown().await;
}

#[tokio::test]
async fn upload_without_receivers_completes_on_last_chunk() {
    let (storage, pubsub) = fabric();
    let node = build_node(&storage, &pubsub, "h1", 4008).await;
    node.start().await;
    settle().await;

    let mut solo = connect(&node, "solo").await;
    node.sessions.create_share("solo", None).await.unwrap();

    let (file_id, _) = node
        .transfers
        .upload_init("solo", "lonely", 32, 2, None)
        .await
        .expect("single-client init must succeed");
    for index in 0..2u32 {
        node.transfers
            .upload_chunk("solo", &file_id, index, Base64Bytes(vec![0; 16]), None)
            .await
            .unwrap();
    }
    solo.wait_for(|e| matches!(e, ServerEvent::UploadComplete { .. }))
        .await;

    node.shutdown().await;
}

#[tokio::test]
async fn init_fails_when_all_receivers_are_busy() {
    let (storage, pubsub) = fabric();
    let mut config = node_config("h1", 4010);
    config.max_concurrent_downloads = 0;
    let node = build_node_with(&storage, &pubsub, config).await;

    let _alice = connect(&node, "alice").await;
    let share = node.sessions.create_share("alice", None).await.unwrap();
    let _bob = connect(&node, "bob").await;
    node.sessions.join_share(&share.share_id, "bob").await.unwrap();

    let err = node
        .transfers
        .upload_init("alice", "x", 16, 1, None)
        .await
        .unwrap_err();
    match err {
        RelayError::UploadFailed(reason) => assert_eq!(reason, "All receivers are busy"),
        other => panic!("expected upload failure, got {other:?}"),
    }
}

#[tokio::test]
async fn graceful_shutdown_retires_the_node_but_keeps_the_lock() {
    let (storage, pubsub) = fabric();
    let node = build_node(&storage, &pubsub, "h1", 4011).await;
    node.start().await;
    settle().await;

    let _alice = connect(&node, "alice").await;
    assert!(node.coordinator.is_master(), "sole node should hold the lock");

    node.shutdown().await;

    let record = storage.get_node(node.node_id()).await.unwrap().unwrap();
    assert_eq!(record.status, beamdrop_node::model::NodeStatus::Inactive);
    let sessions = storage.sessions_for_client("alice").await.unwrap();
    assert!(sessions.iter().all(|s| !s.connected));
    // The master key is released by expiry, not deleted.
    assert_eq!(
        storage.current_master().await.unwrap().as_deref(),
        Some(node.node_id())
    );
}

#[tokio::test]
async fn transfer_budget_caps_upload_init() {
    let (storage, pubsub) = fabric();
    let mut config = node_config("h1", 4009);
    config.max_concurrent_transfers = 2;
    let node = build_node_with(&storage, &pubsub, config).await;

    let _alice = connect(&node, "alice").await;
    node.sessions.create_share("alice", None).await.unwrap();

    node.transfers
        .upload_init("alice", "a", 16, 1, None)
        .await
        .unwrap();
    node.transfers
        .upload_init("alice", "b", 16, 1, None)
        .await
        .unwrap();
    let err = node
        .transfers
        .upload_init("alice", "c", 16, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UploadFailed(_)));
}
