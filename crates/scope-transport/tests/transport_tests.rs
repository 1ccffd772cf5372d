//! Transport tests — endpoint lifecycle, peer enumeration, clustered
//! broadcast and liveness probing, driven through loopback connections.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;
use scope_cluster::{ClusterContext, MemoryCluster};
use scope_core::{Context, ContextId, HttpSessionContext, Key, ScopeModule, ScopedProvider, WebsocketEvent};
use scope_transport::*;

/// Connection-scoped counter used to check instance sharing.
struct Counter {
    serial: usize,
}

/// Endpoint that records what it observes from inside its callbacks.
struct Recording {
    scopes: ScopeModule,
    counter: ScopedProvider<Counter>,
    events: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    calls: Mutex<Vec<ContextId>>,
    counters: Mutex<Vec<usize>>,
}

impl Recording {
    fn new(scopes: &ScopeModule) -> Arc<Self> {
        let serial = Arc::new(AtomicUsize::new(0));
        let counter = scopes.connection().provider(Key::of::<Counter>(), move || Counter {
            serial: serial.fetch_add(1, Ordering::SeqCst),
        });
        Arc::new(Self {
            scopes: scopes.clone(),
            counter,
            events: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            counters: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, event: &str) {
        let call = self.scopes.call().current().unwrap();
        assert_eq!(
            call.kind(),
            &scope_core::CallKind::WebsocketEvent(match event {
                "open" => WebsocketEvent::Open,
                "close" => WebsocketEvent::Close,
                "error" => WebsocketEvent::Error,
                _ => WebsocketEvent::Message,
            })
        );
        self.calls.lock().push(call.id());
        self.counters.lock().push(self.counter.get().unwrap().serial);
        self.events.lock().push(event.to_string());
    }
}

impl Endpoint for Recording {
    async fn on_open(&self, _session: &Arc<ConnectionProxy>) -> anyhow::Result<()> {
        self.record("open");
        Ok(())
    }

    async fn on_message(&self, session: &Arc<ConnectionProxy>, message: Message) -> anyhow::Result<()> {
        tokio::task::yield_now().await;
        self.record("message");
        match message.as_text() {
            Some("fail") => bail!("handler refused"),
            Some(text) => {
                session.send_text(format!("echo:{text}")).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn on_error(&self, _session: &Arc<ConnectionProxy>, error: &anyhow::Error) {
        self.record("error");
        self.errors.lock().push(error.to_string());
    }

    async fn on_close(&self, _session: &Arc<ConnectionProxy>, _reason: &CloseReason) {
        self.record("close");
    }
}

fn endpoint_proxy(scopes: &ScopeModule, registry: &Arc<ConnectionRegistry>) -> (EndpointProxy<Recording>, Arc<Recording>) {
    let endpoint = Recording::new(scopes);
    (EndpointProxy::new(endpoint.clone(), scopes.clone(), registry.clone()), endpoint)
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn open_message_close() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (proxy_driver, endpoint) = endpoint_proxy(&scopes, &registry);

        let conn = Arc::new(LoopbackConnection::new("/chat"));
        let proxy = proxy_driver.open(conn.clone(), None).await.unwrap();
        assert_eq!(proxy.state(), ConnectionState::Open);
        assert_eq!(registry.connection_count(), 1);

        proxy_driver.message(&proxy, Message::text("hi")).await.unwrap();
        assert_eq!(conn.sent_text(), vec!["echo:hi".to_string()]);

        proxy_driver.close(&proxy, CloseReason::normal()).await.unwrap();
        assert_eq!(proxy.state(), ConnectionState::Closed);
        assert_eq!(registry.connection_count(), 0);
        assert!(proxy.context().unwrap().injection().is_closed());
        assert_eq!(*endpoint.events.lock(), vec!["open", "message", "close"]);

        // Contexts never leak past a callback
        assert!(scopes.call().current().is_err());
        assert!(scopes.connection().current().is_err());
    }

    #[tokio::test]
    async fn each_callback_gets_its_own_call_and_shares_the_connection() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, endpoint) = endpoint_proxy(&scopes, &registry);

        let first = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
        driver.message(&first, Message::text("a")).await.unwrap();
        driver.message(&first, Message::text("b")).await.unwrap();
        let second = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();

        let calls = endpoint.calls.lock().clone();
        assert_eq!(calls.len(), 4);
        assert_ne!(calls[0], calls[1]);
        assert_ne!(calls[1], calls[2]);

        // One counter per connection
        assert_eq!(*endpoint.counters.lock(), vec![0, 0, 0, 1]);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn handshake_session_is_visible_to_callbacks() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, _) = endpoint_proxy(&scopes, &registry);

        let session = Arc::new(HttpSessionContext::new("cookie-1"));
        let proxy = driver
            .open(Arc::new(LoopbackConnection::new("/chat")), Some(session.clone()))
            .await
            .unwrap();
        let linked = proxy.context().unwrap().session().unwrap();
        assert!(Arc::ptr_eq(linked, &session));
    }

    #[tokio::test]
    async fn callback_errors_reach_on_error() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, endpoint) = endpoint_proxy(&scopes, &registry);

        let proxy = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
        driver.message(&proxy, Message::text("fail")).await.unwrap();

        assert_eq!(*endpoint.errors.lock(), vec!["handler refused".to_string()]);
        assert_eq!(proxy.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn second_close_is_a_no_op() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, endpoint) = endpoint_proxy(&scopes, &registry);

        let proxy = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
        driver.close(&proxy, CloseReason::normal()).await.unwrap();
        driver.close(&proxy, CloseReason::going_away()).await.unwrap();

        let closes = endpoint.events.lock().iter().filter(|e| *e == "close").count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn closed_proxy_refuses_frames() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, _) = endpoint_proxy(&scopes, &registry);

        let proxy = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
        driver.close(&proxy, CloseReason::normal()).await.unwrap();

        let err = proxy.send_text("late").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_closes_run_on_close_once() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, endpoint) = endpoint_proxy(&scopes, &registry);
        let driver = Arc::new(driver);

        for _ in 0..16 {
            let proxy = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
            let closes: Vec<_> = (0..4)
                .map(|_| {
                    let driver = driver.clone();
                    let proxy = proxy.clone();
                    tokio::spawn(async move { driver.close(&proxy, CloseReason::normal()).await })
                })
                .collect();
            for close in closes {
                close.await.unwrap().unwrap();
            }
            assert_eq!(proxy.state(), ConnectionState::Closed);
        }

        let closes = endpoint.events.lock().iter().filter(|e| *e == "close").count();
        assert_eq!(closes, 16);
        assert_eq!(registry.connection_count(), 0);
    }

    /// Endpoint whose callbacks inspect the scopes before returning a future.
    struct Eager {
        scopes: ScopeModule,
        seen: Mutex<Vec<bool>>,
    }

    impl Eager {
        fn observe(&self) {
            let active = self.scopes.call().current().is_ok() && self.scopes.connection().current().is_ok();
            self.seen.lock().push(active);
        }
    }

    impl Endpoint for Eager {
        fn on_open(&self, _session: &Arc<ConnectionProxy>) -> impl Future<Output = anyhow::Result<()>> + Send {
            self.observe();
            async { Ok(()) }
        }

        fn on_message(
            &self,
            _session: &Arc<ConnectionProxy>,
            _message: Message,
        ) -> impl Future<Output = anyhow::Result<()>> + Send {
            self.observe();
            async { Ok(()) }
        }

        fn on_close(&self, _session: &Arc<ConnectionProxy>, _reason: &CloseReason) -> impl Future<Output = ()> + Send {
            self.observe();
            async {}
        }
    }

    #[tokio::test]
    async fn synchronous_callback_prologue_sees_contexts() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let endpoint = Arc::new(Eager { scopes: scopes.clone(), seen: Mutex::new(Vec::new()) });
        let driver = EndpointProxy::new(endpoint.clone(), scopes.clone(), registry);

        let proxy = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
        driver.message(&proxy, Message::text("hi")).await.unwrap();
        driver.close(&proxy, CloseReason::normal()).await.unwrap();

        assert_eq!(*endpoint.seen.lock(), vec![true, true, true]);
        assert!(scopes.call().current().is_err());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peers
// ─────────────────────────────────────────────────────────────────────────────

mod peers {
    use super::*;

    #[tokio::test]
    async fn repeated_queries_return_the_same_local_proxy() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, _) = endpoint_proxy(&scopes, &registry);

        let me = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
        let other = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();
        driver.open(Arc::new(LoopbackConnection::new("/elsewhere")), None).await.unwrap();

        let first = me.peers();
        let second = me.peers();
        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert!(first.iter().any(|p| Arc::ptr_eq(p, &me)));
        assert!(first.iter().any(|p| Arc::ptr_eq(p, &other)));
        assert_eq!(registry.open_connections("/chat").len(), 2);
    }

    #[tokio::test]
    async fn peers_are_empty_once_the_registry_is_gone() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, _) = endpoint_proxy(&scopes, &registry);
        let me = driver.open(Arc::new(LoopbackConnection::new("/chat")), None).await.unwrap();

        drop(driver);
        drop(registry);
        assert!(me.peers().is_empty());
    }

    #[tokio::test]
    async fn clustered_broadcast_reaches_remote_peer() {
        let cluster = MemoryCluster::new();
        let node_a: Arc<dyn ClusterContext> = cluster.join("a");
        let node_b: Arc<dyn ClusterContext> = cluster.join("b");

        let scopes = ScopeModule::new();
        let registry_a = ConnectionRegistry::new(Some(node_a.clone()));
        let registry_b = ConnectionRegistry::new(Some(node_b.clone()));
        let (driver_a, _) = endpoint_proxy(&scopes, &registry_a);
        let (driver_b, _) = endpoint_proxy(&scopes, &registry_b);

        let conn_a = Arc::new(LoopbackConnection::new("/chat"));
        let conn_b = Arc::new(LoopbackConnection::new("/chat"));
        let on_a = driver_a.open(conn_a.clone(), None).await.unwrap();
        let on_b = driver_b.open(conn_b.clone(), None).await.unwrap();

        // The session opened on A is listed from B
        assert_eq!(node_b.remote_session_ids("/chat"), vec![on_a.session_id().clone()]);

        let peers = on_a.peers();
        assert_eq!(peers.len(), 2);
        let remote: Vec<_> = peers.iter().filter(|p| p.is_remote()).collect();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].session_id(), on_b.session_id());

        let delivered = registry_a.broadcast_text("/chat", "hello cluster").await;
        assert_eq!(delivered, 2);
        assert_eq!(conn_a.sent_text(), vec!["hello cluster".to_string()]);
        assert_eq!(conn_b.sent_text(), vec!["hello cluster".to_string()]);

        // Remote proxies are built per query
        let again = on_a.peers();
        let remote_again = again.iter().find(|p| p.is_remote()).unwrap();
        assert!(!Arc::ptr_eq(remote[0], remote_again));

        driver_b.close(&on_b, CloseReason::normal()).await.unwrap();
        assert!(node_a.remote_session_ids("/chat").is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_failing_peers() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let (driver, _) = endpoint_proxy(&scopes, &registry);

        let healthy = Arc::new(LoopbackConnection::new("/chat"));
        let broken = Arc::new(LoopbackConnection::new("/chat"));
        driver.open(healthy.clone(), None).await.unwrap();
        driver.open(broken.clone(), None).await.unwrap();
        broken.set_failing(true);

        assert_eq!(registry.broadcast_text("/chat", "ping").await, 1);
        assert_eq!(healthy.sent_text(), vec!["ping".to_string()]);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pinger
// ─────────────────────────────────────────────────────────────────────────────

mod pinger {
    use super::*;

    fn pinger(mode: PingerMode) -> Pinger {
        Pinger::new(PingerConfig {
            interval: Duration::from_secs(1),
            failure_limit: 3,
            mode,
        })
    }

    fn last_ping(conn: &LoopbackConnection) -> bytes::Bytes {
        conn.sent()
            .into_iter()
            .rev()
            .find_map(|m| match m {
                Message::Ping(payload) => Some(payload),
                _ => None,
            })
            .unwrap()
    }

    #[derive(Default)]
    struct Observer {
        pongs: Mutex<Vec<Duration>>,
        dead: AtomicUsize,
    }

    impl PingObserver for Observer {
        fn on_pong(&self, _connection: ConnectionId, round_trip: Duration) {
            self.pongs.lock().push(round_trip);
        }

        fn on_dead(&self, _connection: ConnectionId) {
            self.dead.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unanswered_probes_close_once() {
        let pinger = pinger(PingerMode::ExpectPongs);
        let conn = Arc::new(LoopbackConnection::new("/chat"));
        let observer = Arc::new(Observer::default());
        assert!(pinger.add_connection(conn.clone(), Some(observer.clone())));

        // First round sends, the next three each find the previous probe unanswered
        for _ in 0..3 {
            assert!(pinger.probe_round().is_empty());
        }
        assert_eq!(pinger.failures(conn.id()), Some(2));
        assert_eq!(pinger.probe_round(), vec![conn.id()]);

        assert!(pinger.probe_round().is_empty());
        assert_eq!(conn.closes(), vec![CloseReason::protocol_error("too many failed pings")]);
        assert_eq!(observer.dead.load(Ordering::SeqCst), 1);
        assert!(!pinger.contains(conn.id()));
        assert!(!pinger.remove_connection(conn.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn matching_pong_resets_failures() {
        let pinger = pinger(PingerMode::ExpectPongs);
        let conn = Arc::new(LoopbackConnection::new("/chat"));
        let observer = Arc::new(Observer::default());
        pinger.add_connection(conn.clone(), Some(observer.clone()));

        pinger.probe_round();
        pinger.probe_round();
        assert_eq!(pinger.failures(conn.id()), Some(1));

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(!pinger.on_pong(conn.id(), b"not the payload"));
        assert!(pinger.on_pong(conn.id(), &last_ping(&conn)));
        assert_eq!(pinger.failures(conn.id()), Some(0));
        assert_eq!(*observer.pongs.lock(), vec![Duration::from_millis(40)]);
    }

    #[test]
    fn send_failures_count() {
        let pinger = pinger(PingerMode::ExpectPongs);
        let conn = Arc::new(LoopbackConnection::new("/chat"));
        conn.set_failing(true);
        pinger.add_connection(conn.clone(), None);

        assert!(pinger.probe_round().is_empty());
        assert!(pinger.probe_round().is_empty());
        assert_eq!(pinger.probe_round(), vec![conn.id()]);
        assert_eq!(conn.closes().len(), 1);
    }

    #[test]
    fn keep_alive_never_closes() {
        let pinger = pinger(PingerMode::KeepAlive);
        let conn = Arc::new(LoopbackConnection::new("/chat"));
        pinger.add_connection(conn.clone(), None);

        for _ in 0..10 {
            assert!(pinger.probe_round().is_empty());
        }
        assert_eq!(conn.sent().len(), 10);
        assert!(conn.closes().is_empty());
        assert_eq!(pinger.failures(conn.id()), Some(0));
    }

    #[test]
    fn adding_twice_keeps_one_registration() {
        let pinger = pinger(PingerMode::ExpectPongs);
        let conn = Arc::new(LoopbackConnection::new("/chat"));
        pinger.add_connection(conn.clone(), None);
        pinger.probe_round();
        pinger.probe_round();
        pinger.add_connection(conn.clone(), Some(Arc::new(Observer::default())));

        assert_eq!(pinger.connection_count(), 1);
        assert_eq!(pinger.failures(conn.id()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_rounds_stop_and_terminate() {
        let pinger = Pinger::start(PingerConfig {
            interval: Duration::from_secs(10),
            failure_limit: 4,
            mode: PingerMode::KeepAlive,
        });
        let conn = Arc::new(LoopbackConnection::new("/chat"));
        pinger.add_connection(conn.clone(), None);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(conn.sent().len(), 2);

        assert_eq!(pinger.stop(), vec![conn.id()]);
        assert!(pinger.await_termination(Duration::from_secs(1)).await);
        assert!(!pinger.add_connection(conn.clone(), None));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(conn.sent().len(), 2);
    }

    #[tokio::test]
    async fn endpoint_proxy_routes_pongs_and_deregisters() {
        let scopes = ScopeModule::new();
        let registry = ConnectionRegistry::new(None);
        let pinger = pinger(PingerMode::ExpectPongs);
        let endpoint = Recording::new(&scopes);
        let driver = EndpointProxy::new(endpoint.clone(), scopes.clone(), registry.clone()).with_pinger(pinger.clone(), None);

        let conn = Arc::new(LoopbackConnection::new("/chat"));
        let proxy = driver.open(conn.clone(), None).await.unwrap();
        assert!(pinger.contains(conn.id()));

        pinger.probe_round();
        driver.message(&proxy, Message::Pong(last_ping(&conn))).await.unwrap();
        // The probe answer is consumed by the pinger
        assert_eq!(*endpoint.events.lock(), vec!["open"]);

        driver.close(&proxy, CloseReason::normal()).await.unwrap();
        assert!(!pinger.contains(conn.id()));
    }
}
