//! Agents talking through a real router on loopback.

use async_trait::async_trait;
use bytes::Bytes;
use pamr_agent::retry::{call_when_available, RetryConfig};
use pamr_agent::{Agent, BoxedStream, IncomingMessage, MessageHandler, PlainSocketFactory, SocketFactory};
use pamr_router::Router;
use pamr_types::config::{AgentConfig, RouterConfig};
use pamr_types::{AgentId, MagicCookie, PamrError, PamrResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

/// Answers "ping" with "pong", echoes anything else.
struct PingPong;

#[async_trait]
impl MessageHandler for PingPong {
    async fn handle_message(&self, message: IncomingMessage) -> Result<Bytes, String> {
        if message.payload == "ping" {
            Ok(Bytes::from_static(b"pong"))
        } else {
            Ok(message.payload)
        }
    }
}

/// Records every payload in arrival order.
struct Collector(mpsc::UnboundedSender<Bytes>);

#[async_trait]
impl MessageHandler for Collector {
    async fn handle_message(&self, message: IncomingMessage) -> Result<Bytes, String> {
        let _ = self.0.send(message.payload);
        Ok(Bytes::new())
    }
}

/// Never answers.
struct Stall;

#[async_trait]
impl MessageHandler for Stall {
    async fn handle_message(&self, _message: IncomingMessage) -> Result<Bytes, String> {
        std::future::pending::<()>().await;
        Ok(Bytes::new())
    }
}

/// Forwards "outer" and "middle" to its peer, answers anything else itself.
#[derive(Default)]
struct Relay {
    agent: OnceLock<Agent>,
    peer: OnceLock<AgentId>,
}

#[async_trait]
impl MessageHandler for Relay {
    async fn handle_message(&self, message: IncomingMessage) -> Result<Bytes, String> {
        let next: &'static str = match &message.payload[..] {
            b"outer" => "middle",
            b"middle" => "back",
            _ => return Ok(Bytes::from_static(b"done")),
        };
        let (Some(agent), Some(peer)) = (self.agent.get(), self.peer.get()) else {
            return Err("relay not wired".to_string());
        };
        agent.call(*peer, next).await.map_err(|e| e.to_string())
    }
}

/// Plain TCP through an in-process relay that the test can cut, freeze, or
/// refuse to open.
#[derive(Default)]
struct KillableFactory {
    kill: Arc<Notify>,
    freeze: Arc<Notify>,
    hold: AtomicBool,
    connects: AtomicUsize,
}

impl KillableFactory {
    /// Drop every relay currently open. Later connections are unaffected.
    fn cut(&self) {
        self.kill.notify_waiters();
    }

    /// Stop forwarding on every open relay while keeping both sockets open,
    /// like a peer that vanished without a FIN.
    fn freeze(&self) {
        self.freeze.notify_waiters();
    }

    /// Fail new connections until released.
    fn hold(&self, held: bool) {
        self.hold.store(held, Ordering::SeqCst);
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketFactory for KillableFactory {
    async fn connect(&self, host: &str, port: u16) -> PamrResult<BoxedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            return Err(PamrError::ConnectionLost);
        }
        let mut upstream = TcpStream::connect((host, port)).await?;
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let kill = Arc::clone(&self.kill);
        let freeze = Arc::clone(&self.freeze);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut far, &mut upstream) => {}
                _ = kill.notified() => {}
                _ = freeze.notified() => std::future::pending::<()>().await,
            }
        });
        Ok(Box::new(near))
    }

    fn name(&self) -> &'static str {
        "killable"
    }
}

async fn start_router(config: RouterConfig) -> Arc<Router> {
    let config = RouterConfig {
        listen_addr: "127.0.0.1:0".into(),
        ..config
    };
    let (router, _handle) = Router::start(config).await.unwrap();
    router
}

async fn quiet_router() -> Arc<Router> {
    start_router(RouterConfig {
        heartbeat_period_ms: 0,
        ..RouterConfig::default()
    })
    .await
}

fn config_for(router: &Router) -> AgentConfig {
    AgentConfig {
        router_host: "127.0.0.1".into(),
        router_port: router.local_addr().port(),
        connect_timeout_ms: 3_000,
        ..AgentConfig::default()
    }
}

fn reserved(router: &Router, id: u32, cookie: &str) -> AgentConfig {
    AgentConfig {
        agent_id: Some(id),
        magic_cookie: Some(MagicCookie::new(cookie).unwrap()),
        ..config_for(router)
    }
}

async fn plain_agent(config: AgentConfig, handler: Arc<dyn MessageHandler>) -> PamrResult<Agent> {
    Agent::connect(config, Arc::new(PlainSocketFactory::default()), handler).await
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never became true");
}

fn id(raw: u32) -> AgentId {
    AgentId::new(raw).unwrap()
}

#[tokio::test]
async fn test_reserved_agent_reclaims_its_id_after_losing_the_connection() {
    let router = quiet_router().await;
    let factory = Arc::new(KillableFactory::default());
    let a = Agent::connect(reserved(&router, 10, "abc"), factory.clone(), Arc::new(PingPong))
        .await
        .unwrap();
    let b = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();

    assert_eq!(a.agent_id(), Some(id(10)));
    assert!(b.agent_id().unwrap().get() >= AgentId::MIN_DYNAMIC);
    assert_eq!(b.call(id(10), "ping").await.unwrap(), "pong");

    factory.cut();
    wait_until(|| factory.connects() >= 2 && a.is_connected()).await;
    assert_eq!(a.agent_id(), Some(id(10)));

    assert_eq!(b.call(id(10), "ping").await.unwrap(), "pong");
    assert_eq!(router.table().len(), 2);
}

#[tokio::test]
async fn test_dynamic_agent_keeps_its_id_across_reconnect() {
    let router = quiet_router().await;
    let factory = Arc::new(KillableFactory::default());
    let a = Agent::connect(config_for(&router), factory.clone(), Arc::new(PingPong))
        .await
        .unwrap();
    let first = a.agent_id().unwrap();

    factory.cut();
    wait_until(|| factory.connects() >= 2 && a.is_connected()).await;
    assert_eq!(a.agent_id(), Some(first));
}

#[tokio::test]
async fn test_unknown_destination() {
    let router = quiet_router().await;
    let a = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();
    match a.call(id(4242), "hello").await {
        Err(PamrError::DestinationUnknown(dest)) => assert_eq!(dest, id(4242)),
        other => panic!("expected DestinationUnknown, got {other:?}"),
    }
}

#[tokio::test]
async fn test_one_way_messages_arrive_in_order() {
    let router = quiet_router().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();
    let b = plain_agent(config_for(&router), Arc::new(Collector(tx))).await.unwrap();
    let b_id = b.agent_id().unwrap();

    for n in 0..200u32 {
        a.send_one_way(b_id, n.to_be_bytes().to_vec()).await.unwrap();
    }
    for n in 0..200u32 {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], &n.to_be_bytes()[..]);
    }
}

#[tokio::test]
async fn test_losing_the_router_wakes_every_pending_call() {
    let router = quiet_router().await;
    let factory = Arc::new(KillableFactory::default());
    let a = Agent::connect(config_for(&router), factory.clone(), Arc::new(PingPong))
        .await
        .unwrap();
    let b = plain_agent(config_for(&router), Arc::new(Stall)).await.unwrap();
    let b_id = b.agent_id().unwrap();

    let calls: Vec<_> = (0..5u8)
        .map(|n| {
            let a = a.clone();
            tokio::spawn(async move { a.call(b_id, vec![n]).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    factory.cut();

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PamrError::ConnectionLost)), "{result:?}");
    }
}

#[tokio::test]
async fn test_peer_departure_fails_calls_to_it() {
    let router = quiet_router().await;
    let factory = Arc::new(KillableFactory::default());
    let a = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();
    let b = Agent::connect(config_for(&router), factory.clone(), Arc::new(Stall))
        .await
        .unwrap();
    let b_id = b.agent_id().unwrap();

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let a = a.clone();
            tokio::spawn(async move { a.call(b_id, "anyone?").await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    factory.cut();

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(PamrError::PeerDisconnected(gone)) => assert_eq!(gone, b_id),
            other => panic!("expected PeerDisconnected, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_reserved_id_is_guarded_by_its_cookie() {
    let router = quiet_router().await;
    let owner = plain_agent(reserved(&router, 10, "abc"), Arc::new(PingPong))
        .await
        .unwrap();

    let live = plain_agent(reserved(&router, 10, "xyz"), Arc::new(PingPong)).await;
    assert!(matches!(live, Err(PamrError::IdInUse(i)) if i == id(10)));

    owner.shutdown().await;
    wait_until(|| !router.table().is_live(id(10))).await;

    let stale = plain_agent(reserved(&router, 10, "xyz"), Arc::new(PingPong)).await;
    assert!(matches!(stale, Err(PamrError::AuthFailure(i)) if i == id(10)));

    let rightful = plain_agent(reserved(&router, 10, "abc"), Arc::new(PingPong))
        .await
        .unwrap();
    assert_eq!(rightful.agent_id(), Some(id(10)));
}

#[tokio::test]
async fn test_call_when_available_gives_up_with_not_yet_available() {
    let router = quiet_router().await;
    let a = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();
    let policy = RetryConfig {
        max_attempts: 4,
        min_delay_ms: 10,
        max_delay_ms: 20,
        jitter: 0.0,
    };
    match call_when_available(&a, id(4000), Bytes::from_static(b"ping"), &policy).await {
        Err(PamrError::NotYetAvailable { agent, attempts }) => {
            assert_eq!(agent, id(4000));
            assert_eq!(attempts, 4);
        }
        other => panic!("expected NotYetAvailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_call_when_available_reaches_late_registrant() {
    let router = quiet_router().await;
    let a = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();

    let late_config = reserved(&router, 11, "late");
    let late = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        plain_agent(late_config, Arc::new(PingPong)).await
    });

    let policy = RetryConfig {
        max_attempts: 50,
        min_delay_ms: 20,
        max_delay_ms: 40,
        jitter: 0.0,
    };
    let reply = call_when_available(&a, id(11), Bytes::from_static(b"ping"), &policy)
        .await
        .unwrap();
    assert_eq!(reply, "pong");
    assert!(late.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_listing_marks_reserved_agents() {
    let router = quiet_router().await;
    let a = plain_agent(reserved(&router, 7, "seven"), Arc::new(PingPong))
        .await
        .unwrap();
    let b = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();

    let agents = b.list_agents().await.unwrap();
    assert_eq!(agents.len(), 2);
    let seven = agents.iter().find(|d| d.agent_id == id(7)).unwrap();
    assert!(seven.reserved);
    let dynamic = agents
        .iter()
        .find(|d| Some(d.agent_id) == b.agent_id())
        .unwrap();
    assert!(!dynamic.reserved);
    drop(a);
}

#[tokio::test]
async fn test_agent_answers_router_heartbeats() {
    let router = start_router(RouterConfig {
        heartbeat_period_ms: 50,
        heartbeat_timeout_ms: 200,
        ..RouterConfig::default()
    })
    .await;
    let a = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();
    let b = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(router.table().is_live(a.agent_id().unwrap()));
    assert_eq!(a.call(b.agent_id().unwrap(), "ping").await.unwrap(), "pong");
}

#[tokio::test]
async fn test_router_restart_reassigns_a_taken_dynamic_id() {
    let (first, accept_loop) = Router::start(RouterConfig {
        listen_addr: "127.0.0.1:0".into(),
        heartbeat_period_ms: 0,
        ..RouterConfig::default()
    })
    .await
    .unwrap();
    let addr = first.local_addr();
    let factory = Arc::new(KillableFactory::default());
    let a = Agent::connect(config_for(&first), factory.clone(), Arc::new(PingPong))
        .await
        .unwrap();
    let old_id = a.agent_id().unwrap();

    factory.hold(true);
    first.shutdown();
    accept_loop.await.unwrap();
    wait_until(|| !a.is_connected()).await;

    // The new router starts its allocator from scratch and hands our old id
    // to the first newcomer.
    let second = start_router_at(addr.to_string()).await;
    let b = plain_agent(config_for(&second), Arc::new(PingPong)).await.unwrap();
    assert_eq!(b.agent_id(), Some(old_id));

    factory.hold(false);
    wait_until(|| a.is_connected()).await;
    let new_id = a.agent_id().unwrap();
    assert_ne!(new_id, old_id);
    assert!(!new_id.is_reserved());
    assert_eq!(second.table().len(), 2);
    assert_eq!(b.call(new_id, "ping").await.unwrap(), "pong");
}

async fn start_router_at(listen_addr: String) -> Arc<Router> {
    let config = RouterConfig {
        listen_addr,
        heartbeat_period_ms: 0,
        ..RouterConfig::default()
    };
    Router::start(config).await.unwrap().0
}

#[tokio::test]
async fn test_frozen_link_fails_call_through_advertised_heartbeat() {
    let router = start_router(RouterConfig {
        heartbeat_period_ms: 100,
        heartbeat_timeout_ms: 300,
        ..RouterConfig::default()
    })
    .await;
    let factory = Arc::new(KillableFactory::default());
    // No agent-side watchdog or call timeout configured.
    let a = Agent::connect(config_for(&router), factory.clone(), Arc::new(PingPong))
        .await
        .unwrap();
    let b = plain_agent(config_for(&router), Arc::new(Stall)).await.unwrap();
    let b_id = b.agent_id().unwrap();

    let call = tokio::spawn({
        let a = a.clone();
        async move { a.call(b_id, "hello?").await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    factory.freeze();

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call still blocked on a frozen link")
        .unwrap();
    assert!(matches!(result, Err(PamrError::ConnectionLost)), "{result:?}");
}

#[tokio::test]
async fn test_configured_watchdog_reconnects_silent_link() {
    let router = quiet_router().await;
    let factory = Arc::new(KillableFactory::default());
    let config = AgentConfig {
        heartbeat_timeout_ms: 200,
        ..config_for(&router)
    };
    let a = Agent::connect(config, factory.clone(), Arc::new(PingPong))
        .await
        .unwrap();
    let first = a.agent_id().unwrap();

    wait_until(|| factory.connects() >= 2 && a.is_connected()).await;
    assert_eq!(a.agent_id(), Some(first));
}

#[tokio::test]
async fn test_nested_callbacks_complete() {
    let router = quiet_router().await;
    let config = AgentConfig {
        call_timeout_ms: 3_000,
        ..config_for(&router)
    };
    let relay_a = Arc::new(Relay::default());
    let relay_b = Arc::new(Relay::default());
    let a = plain_agent(config.clone(), relay_a.clone()).await.unwrap();
    let b = plain_agent(config.clone(), relay_b.clone()).await.unwrap();
    let _ = relay_a.agent.set(a.clone());
    let _ = relay_a.peer.set(b.agent_id().unwrap());
    let _ = relay_b.agent.set(b.clone());
    let _ = relay_b.peer.set(a.agent_id().unwrap());

    // C -> B "outer", B -> A "middle", A -> B "back" while B still waits on A.
    let c = plain_agent(config, Arc::new(PingPong)).await.unwrap();
    assert_eq!(c.call(b.agent_id().unwrap(), "outer").await.unwrap(), "done");
}

#[tokio::test]
async fn test_parallel_registrations_get_distinct_ids() {
    let router = quiet_router().await;
    let joins: Vec<_> = (0..20)
        .map(|_| {
            let config = config_for(&router);
            tokio::spawn(async move { plain_agent(config, Arc::new(PingPong)).await })
        })
        .collect();

    let mut agents = Vec::new();
    for join in joins {
        agents.push(join.await.unwrap().unwrap());
    }
    let ids: HashSet<AgentId> = agents.iter().filter_map(Agent::agent_id).collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(router.table().len(), 20);
}

#[tokio::test]
async fn test_router_shutdown_wakes_pending_calls() {
    let router = quiet_router().await;
    let a = plain_agent(config_for(&router), Arc::new(PingPong)).await.unwrap();
    let b = plain_agent(config_for(&router), Arc::new(Stall)).await.unwrap();
    let b_id = b.agent_id().unwrap();

    let call = tokio::spawn({
        let a = a.clone();
        async move { a.call(b_id, "still there?").await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    router.shutdown();

    // B's departure may be announced before our own connection closes.
    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(
            result,
            Err(PamrError::ConnectionLost | PamrError::PeerDisconnected(_))
        ),
        "{result:?}"
    );
}
