//! Two managers chained over a real socket.

use std::sync::Arc;
use std::time::Duration;

use commgr::backend::socket::{SocketBackend, SocketConfig};
use commgr::backend::Backend;
use commgr::manager::{CommManager, ManagerConfig, ManagerError, DOWNSTREAM_NAME, UPSTREAM_NAME};
use commgr::transport::ListenerConfig;
use commgr::LinkKind;

use crate::common::{eventually, TestPeer};

const NAV: u32 = 0x0200_0001;
const AUDIO: u32 = 0x0200_0002;

struct Node {
    manager: Arc<CommManager>,
    backend: SocketBackend,
}

impl Node {
    async fn start() -> Self {
        let manager = CommManager::new(ManagerConfig::default());
        let backend = SocketBackend::bind(
            manager.clone(),
            &ListenerConfig::tcp("127.0.0.1", 0),
            SocketConfig::default(),
        )
        .await
        .expect("bind failed");
        Self { manager, backend }
    }

    async fn peer(&self) -> TestPeer {
        TestPeer::connect(self.backend.local_address()).await
    }

    async fn stop(self) {
        self.backend.shutdown().await;
        self.manager.shutdown().await;
    }
}

/// M1 chains downstream to M2.
async fn chain() -> (Node, Node) {
    let m1 = Node::start().await;
    let m2 = Node::start().await;
    m1.manager
        .connect_downstream(m2.backend.local_address())
        .await
        .expect("connect_downstream failed");
    eventually("M2 sees its upstream", || m2.manager.upstream().is_some()).await;
    (m1, m2)
}

#[tokio::test]
async fn test_link_roles() {
    let (m1, m2) = chain().await;

    let down = m1.manager.downstream().unwrap();
    let info = m1.manager.client_info(down).unwrap();
    assert_eq!(info.name, DOWNSTREAM_NAME);
    assert_eq!(info.kind, LinkKind::ManagerLink);
    assert!(info.is_manager);

    let up = m2.manager.upstream().unwrap();
    let info = m2.manager.client_info(up).unwrap();
    assert_eq!(info.name, UPSTREAM_NAME);
    assert!(info.is_manager);

    m1.stop().await;
    m2.stop().await;
}

#[tokio::test]
async fn test_event_crosses_once_in_each_direction() {
    let (m1, m2) = chain().await;

    let mut a = m1.peer().await;
    let mut b = m2.peer().await;
    let mut c = m2.peer().await;
    a.register(&[NAV]).await;
    c.register(&[NAV]).await;
    eventually("M2 forwards NAV upstream", || m2.manager.upstream_events() == vec![NAV]).await;
    eventually("M1 forwards NAV downstream", || {
        m1.manager.downstream_events() == vec![NAV]
    })
    .await;

    b.publish(NAV, b"from-b").await;
    assert_eq!(a.recv().await.body(), b"from-b");
    assert_eq!(c.recv().await.body(), b"from-b");

    a.publish(NAV, b"from-a").await;
    assert_eq!(a.recv().await.body(), b"from-a");
    assert_eq!(c.recv().await.body(), b"from-a");

    // Nothing bounces back across the link.
    a.expect_silence(Duration::from_millis(150)).await;
    c.expect_silence(Duration::from_millis(50)).await;
    b.expect_silence(Duration::from_millis(50)).await;

    m1.stop().await;
    m2.stop().await;
}

#[tokio::test]
async fn test_existing_subscriptions_replayed() {
    let m1 = Node::start().await;
    let m2 = Node::start().await;
    let mut a = m1.peer().await;
    let mut c = m2.peer().await;
    a.register(&[NAV]).await;
    c.register(&[AUDIO]).await;
    eventually("local subscriptions", || {
        m1.manager.subscribers(NAV).len() == 1 && m2.manager.subscribers(AUDIO).len() == 1
    })
    .await;

    m1.manager
        .connect_downstream(m2.backend.local_address())
        .await
        .unwrap();

    eventually("M2 learns M1 interest", || m2.manager.upstream_events() == vec![NAV]).await;
    eventually("M1 learns M2 interest", || {
        m1.manager.downstream_events() == vec![AUDIO]
    })
    .await;

    let mut b = m2.peer().await;
    b.publish(NAV, b"x").await;
    assert_eq!(a.recv().await.body(), b"x");

    m1.stop().await;
    m2.stop().await;
}

#[tokio::test]
async fn test_withdrawn_interest_stops_forwarding() {
    let (m1, m2) = chain().await;
    let mut a = m1.peer().await;
    a.register(&[NAV]).await;
    eventually("M2 forwards NAV", || m2.manager.upstream_events() == vec![NAV]).await;

    a.deregister(&[NAV]).await;
    eventually("M2 stops forwarding", || m2.manager.upstream_events().is_empty()).await;

    a.register(&[NAV]).await;
    eventually("M2 forwards NAV again", || m2.manager.upstream_events() == vec![NAV]).await;
    drop(a);
    eventually("peer loss withdraws interest", || {
        m2.manager.upstream_events().is_empty()
    })
    .await;

    m1.stop().await;
    m2.stop().await;
}

#[tokio::test]
async fn test_second_downstream_rejected() {
    let (m1, m2) = chain().await;
    let m3 = Node::start().await;

    let result = m1.manager.connect_downstream(m3.backend.local_address()).await;
    assert!(matches!(result, Err(ManagerError::DownstreamExists(_))));
    assert_eq!(m3.manager.client_count(), 0);

    m1.stop().await;
    m2.stop().await;
    m3.stop().await;
}

#[tokio::test]
async fn test_connect_to_nothing_fails() {
    let m1 = Node::start().await;
    let result = m1.manager.connect_downstream("127.0.0.1:1").await;
    assert!(matches!(result, Err(ManagerError::Connect(_))));
    assert!(m1.manager.downstream().is_none());
    m1.stop().await;
}

#[tokio::test]
async fn test_downstream_loss_clears_link() {
    let (m1, m2) = chain().await;
    let mut a = m1.peer().await;
    let mut c = m2.peer().await;
    a.register(&[NAV]).await;
    c.register(&[NAV]).await;
    eventually("M1 forwards NAV", || m1.manager.downstream_events() == vec![NAV]).await;

    m2.stop().await;

    eventually("M1 drops its downstream", || m1.manager.downstream().is_none()).await;
    assert!(m1.manager.downstream_events().is_empty());

    // Reconnect to a fresh manager.
    let m3 = Node::start().await;
    m1.manager
        .connect_downstream(m3.backend.local_address())
        .await
        .unwrap();
    eventually("M3 learns M1 interest", || m3.manager.upstream_events() == vec![NAV]).await;

    m1.stop().await;
    m3.stop().await;
}
