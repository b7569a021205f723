//! Native-channel backend.

use std::sync::Arc;
use std::time::Duration;

use commgr::backend::native::{NativeChannel, NativeChannelBackend, Received};
use commgr::backend::socket::{SocketBackend, SocketConfig};
use commgr::backend::{Backend, BackendError};
use commgr::manager::{CommManager, ManagerConfig};
use commgr::protocol::{AdminMessage, Registration};
use commgr::transport::ListenerConfig;
use commgr::{Buffer, LinkKind};

use crate::common::{eventually, TestPeer};

const NAV: u32 = 0x0200_0001;

fn start() -> (Arc<CommManager>, NativeChannelBackend, NativeChannel) {
    let manager = CommManager::new(ManagerConfig::default());
    let (backend, channel) = NativeChannelBackend::attach(manager.clone(), "test");
    (manager, backend, channel)
}

fn register_payload(events: &[u32]) -> Buffer {
    AdminMessage::RegisterCcEvents(Registration::new("native", events.to_vec())).encode()
}

#[tokio::test]
async fn test_open_registers_client() {
    let (manager, backend, channel) = start();
    assert_eq!(channel.name(), "test");

    let process = channel.connect(4321);
    let _first = process.open().await.unwrap();
    let _second = process.open().await.unwrap();

    assert_eq!(manager.client_count(), 2);
    let info = &manager.clients()[0];
    assert_eq!(info.pid, Some(4321));
    assert_eq!(info.kind, LinkKind::NativeChannel);

    backend.shutdown().await;
}

#[tokio::test]
async fn test_send_and_receive() {
    let (manager, backend, channel) = start();
    let rx_process = channel.connect(1);
    let tx_process = channel.connect(2);
    let receiver = rx_process.open().await.unwrap();
    let sender = tx_process.open().await.unwrap();

    receiver.send(register_payload(&[NAV]).payload()).await.unwrap();
    eventually("subscription", || manager.subscribers(NAV).len() == 1).await;

    sender.send(Buffer::event(NAV, b"hello").payload()).await.unwrap();

    let received = receiver.receive(64).await.unwrap();
    let payload = received.payload().unwrap();
    assert_eq!(&payload[..4], &NAV.to_ne_bytes());
    assert_eq!(&payload[4..], b"hello");
    match received {
        Received::Data(bytes) => assert_eq!(&bytes[..4], &9u32.to_ne_bytes()),
        other => panic!("unexpected reply: {other:?}"),
    }

    backend.shutdown().await;
}

#[tokio::test]
async fn test_receive_blocks_until_data() {
    let (manager, backend, channel) = start();
    let process = channel.connect(1);
    let receiver = process.open().await.unwrap();
    let sender = process.open().await.unwrap();
    receiver.send(register_payload(&[NAV]).payload()).await.unwrap();
    eventually("subscription", || manager.subscribers(NAV).len() == 1).await;

    let (received, ()) = tokio::join!(receiver.receive(64), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.send(Buffer::event(NAV, b"late").payload()).await.unwrap();
    });

    assert_eq!(received.unwrap().payload().map(|p| p[4..].to_vec()), Some(b"late".to_vec()));
    backend.shutdown().await;
}

#[tokio::test]
async fn test_too_small_keeps_message() {
    let (_manager, backend, channel) = start();
    let process = channel.connect(1);
    let conn = process.open().await.unwrap();
    conn.send(register_payload(&[NAV]).payload()).await.unwrap();
    conn.send(Buffer::event(NAV, &[1; 32]).payload()).await.unwrap();

    assert_eq!(conn.receive(16).await.unwrap(), Received::TooSmall(40));
    let received = conn.receive(40).await.unwrap();
    assert_eq!(received.payload().map(<[u8]>::len), Some(36));

    backend.shutdown().await;
}

#[tokio::test]
async fn test_unblock_interrupts_receive() {
    let (_manager, backend, channel) = start();
    let process = channel.connect(1);
    let conn = process.open().await.unwrap();

    let (received, ()) = tokio::join!(conn.receive(64), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.unblock().unwrap();
    });
    assert_eq!(received.unwrap(), Received::Interrupted);

    backend.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_receive_does_not_eat_message() {
    let (_manager, backend, channel) = start();
    let process = channel.connect(1);
    let conn = process.open().await.unwrap();
    conn.send(register_payload(&[NAV]).payload()).await.unwrap();

    let timed_out = tokio::time::timeout(Duration::from_millis(30), conn.receive(64)).await;
    assert!(timed_out.is_err());

    conn.send(Buffer::event(NAV, b"kept").payload()).await.unwrap();
    let received = conn.receive(64).await.unwrap();
    assert_eq!(received.payload().map(|p| p[4..].to_vec()), Some(b"kept".to_vec()));

    backend.shutdown().await;
}

#[tokio::test]
async fn test_process_exit_scrubs_all_connections() {
    let (manager, backend, channel) = start();
    let keep = channel.connect(1);
    let _kept = keep.open().await.unwrap();

    let process = channel.connect(2);
    let a = process.open().await.unwrap();
    let b = process.open().await.unwrap();
    a.send(register_payload(&[NAV]).payload()).await.unwrap();
    b.send(register_payload(&[NAV]).payload()).await.unwrap();
    assert_eq!(manager.client_count(), 3);

    // Connections are still held: only the disconnect pulse can remove them.
    process.exit();

    eventually("process clients removed", || manager.client_count() == 1).await;
    assert!(manager.subscribers(NAV).is_empty());
    assert!(matches!(
        a.send(&NAV.to_ne_bytes()).await,
        Err(BackendError::ChannelClosed(_))
    ));
    assert!(matches!(
        b.receive(64).await,
        Err(BackendError::ChannelClosed(_))
    ));

    drop(a);
    drop(b);
    assert_eq!(manager.client_count(), 1);
    backend.shutdown().await;
}

#[tokio::test]
async fn test_process_exit_interrupts_blocked_receive() {
    let (manager, backend, channel) = start();
    let process = channel.connect(2);
    let conn = process.open().await.unwrap();

    let (received, ()) = tokio::join!(conn.receive(64), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        process.exit();
    });
    assert_eq!(received.unwrap(), Received::Interrupted);
    eventually("client removed", || manager.client_count() == 0).await;

    backend.shutdown().await;
}

#[tokio::test]
async fn test_dropped_process_closes_each_connection() {
    let (manager, backend, channel) = start();
    let process = channel.connect(2);
    let a = process.open().await.unwrap();
    let b = process.open().await.unwrap();

    drop(a);
    drop(b);
    drop(process);

    eventually("process clients removed", || manager.client_count() == 0).await;
    backend.shutdown().await;
}

#[tokio::test]
async fn test_closed_connection_removed() {
    let (manager, backend, channel) = start();
    let process = channel.connect(1);
    let a = process.open().await.unwrap();
    let _b = process.open().await.unwrap();

    drop(a);
    eventually("one client left", || manager.client_count() == 1).await;
    backend.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_channel() {
    let (manager, backend, channel) = start();
    let process = channel.connect(1);
    let conn = process.open().await.unwrap();

    let (received, ()) = tokio::join!(conn.receive(64), backend.shutdown());
    assert!(matches!(
        received,
        Ok(Received::Interrupted) | Err(BackendError::ChannelClosed(_))
    ));
    assert_eq!(manager.client_count(), 0);

    assert!(matches!(
        conn.send(&[0; 4]).await,
        Err(BackendError::ChannelClosed(_))
    ));
    assert!(process.open().await.is_err());
}

#[tokio::test]
async fn test_native_and_socket_peers_interoperate() {
    let manager = CommManager::new(ManagerConfig::default());
    let (native, channel) = NativeChannelBackend::attach(manager.clone(), "mixed");
    let sockets = SocketBackend::bind(
        manager.clone(),
        &ListenerConfig::tcp("127.0.0.1", 0),
        SocketConfig::default(),
    )
    .await
    .unwrap();

    let mut peer = TestPeer::connect(sockets.local_address()).await;
    peer.register(&[NAV]).await;
    eventually("socket subscription", || manager.subscribers(NAV).len() == 1).await;

    let process = channel.connect(1);
    let conn = process.open().await.unwrap();
    conn.send(register_payload(&[NAV]).payload()).await.unwrap();

    conn.send(Buffer::event(NAV, b"native").payload()).await.unwrap();
    assert_eq!(peer.recv().await.body(), b"native");

    peer.publish(NAV, b"socket").await;
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let received = conn.receive(64).await.unwrap();
        bodies.push(received.payload().map(|p| p[4..].to_vec()).unwrap());
    }
    assert_eq!(bodies, vec![b"native".to_vec(), b"socket".to_vec()]);

    sockets.shutdown().await;
    native.shutdown().await;
    manager.shutdown().await;
}
