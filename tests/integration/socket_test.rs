//! Socket-stream backend against real TCP and Unix-domain sockets.

use std::sync::Arc;
use std::time::Duration;

use commgr::backend::socket::{SocketBackend, SocketConfig};
use commgr::backend::Backend;
use commgr::manager::{CommManager, ManagerConfig, WatchdogConfig, WatchdogState};
use commgr::protocol::{AdminMessage, PING};
use commgr::test_utils::RecordingListener;
use commgr::transport::ListenerConfig;
use commgr::LinkKind;

use crate::common::{eventually, TestPeer};

const NAV: u32 = 0x0200_0001;
const AUDIO: u32 = 0x0200_0002;

async fn start(config: SocketConfig) -> (Arc<CommManager>, SocketBackend) {
    let manager = CommManager::new(ManagerConfig::default());
    let backend = SocketBackend::bind(
        manager.clone(),
        &ListenerConfig::tcp("127.0.0.1", 0),
        config,
    )
    .await
    .expect("bind failed");
    (manager, backend)
}

#[tokio::test]
async fn test_tcp_routes_between_peers() {
    let (manager, backend) = start(SocketConfig::default()).await;
    let mut a = TestPeer::connect(backend.local_address()).await;
    let mut b = TestPeer::connect(backend.local_address()).await;
    eventually("two clients", || manager.client_count() == 2).await;

    a.register(&[NAV]).await;
    eventually("subscription", || manager.subscribers(NAV).len() == 1).await;

    b.publish(AUDIO, b"ignored").await;
    b.publish(NAV, b"position").await;

    let msg = a.recv().await;
    assert_eq!(msg.event_id(), Some(NAV));
    assert_eq!(msg.body(), b"position");
    a.expect_silence(Duration::from_millis(100)).await;
    b.expect_silence(Duration::from_millis(50)).await;

    let info = manager.clients();
    assert!(info.iter().all(|c| c.kind == LinkKind::SocketStream));

    backend.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_uds_reports_peer_pid() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = CommManager::new(ManagerConfig::default());
    let backend = SocketBackend::bind(
        manager.clone(),
        &ListenerConfig::uds(dir.path()),
        SocketConfig::default(),
    )
    .await
    .unwrap();

    let mut peer = TestPeer::connect(backend.local_address()).await;
    eventually("client", || manager.client_count() == 1).await;
    let info = &manager.clients()[0];
    assert_eq!(info.pid, Some(std::process::id()));

    peer.send_admin(AdminMessage::Ping { challenge: 9 }).await;
    let pong = peer.recv().await;
    assert_eq!(
        AdminMessage::decode(pong.payload()).unwrap(),
        AdminMessage::Pong { response: 10 }
    );

    backend.shutdown().await;
    assert!(!dir.path().join("commgr.sock").exists());
}

#[tokio::test]
async fn test_order_preserved_across_batches() {
    let (manager, backend) = start(SocketConfig {
        write_batch: 3,
        ..Default::default()
    })
    .await;
    let mut a = TestPeer::connect(backend.local_address()).await;
    let mut b = TestPeer::connect(backend.local_address()).await;
    a.register(&[NAV]).await;
    eventually("subscription", || manager.subscribers(NAV).len() == 1).await;

    for n in 0u32..200 {
        b.publish(NAV, &n.to_ne_bytes()).await;
    }
    for n in 0u32..200 {
        let msg = a.recv().await;
        assert_eq!(msg.body(), &n.to_ne_bytes());
    }

    backend.shutdown().await;
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let (manager, backend) = start(SocketConfig::default()).await;
    let mut a = TestPeer::connect(backend.local_address()).await;
    let mut b = TestPeer::connect(backend.local_address()).await;
    a.register(&[NAV]).await;
    eventually("subscription", || manager.subscribers(NAV).len() == 1).await;

    let payload = commgr::Buffer::event(NAV, &[7u8; 10_000]);
    let mut frame = (payload.len() as u32).to_ne_bytes().to_vec();
    frame.extend_from_slice(payload.payload());
    for chunk in frame.chunks(1_500) {
        b.send_raw(chunk).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let msg = a.recv().await;
    assert_eq!(msg.payload(), payload.payload());

    backend.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_scrubs_client() {
    let (manager, backend) = start(SocketConfig::default()).await;
    let mut a = TestPeer::connect(backend.local_address()).await;
    let mut b = TestPeer::connect(backend.local_address()).await;
    a.register(&[NAV]).await;
    eventually("subscription", || manager.subscribers(NAV).len() == 1).await;

    for _ in 0..50 {
        b.publish(NAV, &[0; 64]).await;
    }
    drop(a);

    eventually("client removed", || manager.client_count() == 1).await;
    assert!(manager.subscribers(NAV).is_empty());

    // The survivor keeps working.
    for _ in 0..10 {
        b.publish(NAV, &[]).await;
    }
    let mut c = TestPeer::connect(backend.local_address()).await;
    c.register(&[NAV]).await;
    eventually("new subscription", || manager.subscribers(NAV).len() == 1).await;
    b.publish(NAV, b"after").await;
    assert_eq!(c.recv().await.body(), b"after");

    backend.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_disconnects() {
    let (manager, backend) = start(SocketConfig {
        max_frame_len: 64,
        ..Default::default()
    })
    .await;
    let mut peer = TestPeer::connect(backend.local_address()).await;
    eventually("client", || manager.client_count() == 1).await;

    peer.send_raw(&1_000u32.to_ne_bytes()).await;

    peer.expect_closed().await;
    eventually("client removed", || manager.client_count() == 0).await;
    backend.shutdown().await;
}

#[tokio::test]
async fn test_short_frame_dropped_connection_kept() {
    let (manager, backend) = start(SocketConfig::default()).await;
    let mut peer = TestPeer::connect(backend.local_address()).await;

    peer.send_raw(&2u32.to_ne_bytes()).await;
    peer.send_raw(&[1, 2]).await;
    peer.send_admin(AdminMessage::Ping { challenge: 1 }).await;

    let pong = peer.recv().await;
    assert_eq!(
        AdminMessage::decode(pong.payload()).unwrap(),
        AdminMessage::Pong { response: 2 }
    );
    assert_eq!(manager.client_count(), 1);
    backend.shutdown().await;
}

#[tokio::test]
async fn test_peer_that_stops_reading_is_dropped() {
    let (manager, backend) = start(SocketConfig {
        max_queue: 8,
        ..Default::default()
    })
    .await;
    let mut stalled = TestPeer::connect(backend.local_address()).await;
    let mut b = TestPeer::connect(backend.local_address()).await;
    eventually("two clients", || manager.client_count() == 2).await;
    stalled.register(&[NAV]).await;
    eventually("subscription", || manager.subscribers(NAV).len() == 1).await;

    // Enough to fill the kernel buffers and then the outbound queue.
    let body = vec![0u8; 64 * 1024];
    let mut sent = 0;
    while manager.client_count() == 2 && sent < 2_000 {
        b.publish(NAV, &body).await;
        sent += 1;
    }

    eventually("stalled peer dropped", || manager.client_count() == 1).await;
    assert!(manager.subscribers(NAV).is_empty());
    stalled.expect_closed().await;

    b.send_admin(AdminMessage::Ping { challenge: 3 }).await;
    let pong = b.recv().await;
    assert_eq!(
        AdminMessage::decode(pong.payload()).unwrap(),
        AdminMessage::Pong { response: 4 }
    );
    backend.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_peers() {
    let (manager, backend) = start(SocketConfig::default()).await;
    let mut a = TestPeer::connect(backend.local_address()).await;
    eventually("client", || manager.client_count() == 1).await;

    backend.shutdown().await;

    assert_eq!(manager.client_count(), 0);
    a.expect_closed().await;
}

#[tokio::test]
async fn test_watchdog_over_socket() {
    let manager = CommManager::new(ManagerConfig {
        watchdog: WatchdogConfig {
            timeout_ticks: 3,
            tick_interval_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    });
    let listener = RecordingListener::new();
    manager.set_watchdog_listener(listener.clone());
    let backend = SocketBackend::bind(
        manager.clone(),
        &ListenerConfig::tcp("127.0.0.1", 0),
        SocketConfig::default(),
    )
    .await
    .unwrap();

    // A responsive peer answers every PING.
    let mut alive = TestPeer::connect(backend.local_address()).await;
    alive.helo("alive").await;
    // A silent peer never does.
    let mut silent = TestPeer::connect(backend.local_address()).await;
    silent.helo("silent").await;

    let mut answered = 0;
    while answered < 6 {
        let msg = alive.recv().await;
        assert_eq!(msg.event_id(), Some(PING));
        if let Ok(AdminMessage::Ping { challenge }) = AdminMessage::decode(msg.payload()) {
            alive
                .send_admin(AdminMessage::Pong {
                    response: challenge + 1,
                })
                .await;
            answered += 1;
        }
    }

    eventually("silent peer declared dead", || {
        listener.died().iter().any(|c| c.name == "silent")
    })
    .await;
    assert!(listener.died().iter().all(|c| c.name != "alive"));
    let alive_state = manager
        .clients()
        .into_iter()
        .find(|c| c.name == "alive")
        .map(|c| c.watchdog);
    assert_ne!(alive_state, Some(WatchdogState::Dead));

    // Dead peers stay connected until they hang up.
    assert_eq!(manager.client_count(), 2);
    drop(silent);
    eventually("silent peer removed", || manager.client_count() == 1).await;

    backend.shutdown().await;
    manager.shutdown().await;
}
