#![cfg(feature = "transport")]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{stream, SinkExt, StreamExt};
use stockfeed::transport::{Connector, FrameStream};
use stockfeed::{
    Connection, ConnectionState, CounterAggregator, DeliveryPolicy, Error, FeedConfig,
    InventoryAggregator, MessageBus, QuantityPolicy, ReconnectPolicy,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

// Only one connection may be open per process, so these tests take turns.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Session {
    Refuse,
    Frames(Vec<&'static str>),
    /// Frames, then the session stays open.
    Hold(Vec<&'static str>),
}

/// Plays back one scripted session per connect; hangs once the script is spent.
struct ScriptedConnector {
    sessions: VecDeque<Session>,
}

impl ScriptedConnector {
    fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: sessions.into(),
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect(&mut self) -> BoxFuture<'_, stockfeed::Result<FrameStream>> {
        let session = self.sessions.pop_front();
        Box::pin(async move {
            match session {
                Some(Session::Refuse) => Err(Error::ConnectionLost("refused".to_string())),
                Some(Session::Frames(frames)) => Ok(stream::iter(
                    frames.into_iter().map(|frame| Ok(frame.to_string())),
                )
                .boxed()),
                Some(Session::Hold(frames)) => Ok(stream::iter(
                    frames.into_iter().map(|frame| Ok(frame.to_string())),
                )
                .chain(stream::pending())
                .boxed()),
                None => Ok(stream::pending().boxed()),
            }
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

async fn wait_for<F>(what: &str, mut done: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_state(
    health: &mut watch::Receiver<ConnectionState>,
    done: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let state = tokio::time::timeout(Duration::from_secs(5), health.wait_for(|s| done(s)))
        .await
        .expect("state change timed out")
        .expect("connection task dropped its sender")
        .clone();
    state
}

#[tokio::test]
async fn reconnects_after_refusal_and_end_of_stream() {
    let _serial = serial();
    let bus = MessageBus::default();
    let counters = CounterAggregator::with_default_topics(&bus);
    let inventory = InventoryAggregator::attach(&bus, QuantityPolicy::Strict);

    let connector = ScriptedConnector::new(vec![
        Session::Frames(vec!["orders:1:placed", "stock-levels:A:10"]),
        Session::Refuse,
        Session::Frames(vec!["orders:2:placed", "reserved-stock:A:2"]),
    ]);
    let policy = ReconnectPolicy::Backoff {
        initial_ms: 1,
        max_ms: 1,
    };
    let connection = Connection::open(&bus, connector, policy).expect("open");
    assert_eq!(connection.target(), "scripted");

    wait_for("both sessions", || counters.value("orders") == Some(2)).await;
    wait_for("reserved stock", || {
        inventory.record("A").map(|r| r.reserved_stock) == Some(2.0)
    })
    .await;
    assert_eq!(inventory.record("A").expect("A").stock_level, 10.0);

    let mut health = connection.health();
    wait_for_state(&mut health, ConnectionState::is_connected).await;
    connection.close().await;
    assert_eq!(*health.borrow(), ConnectionState::Closed);
}

#[tokio::test]
async fn never_policy_stays_disconnected() {
    let _serial = serial();
    let bus = MessageBus::default();
    let counters = CounterAggregator::with_default_topics(&bus);

    let connector = ScriptedConnector::new(vec![
        Session::Frames(vec!["shipments:9"]),
        Session::Frames(vec!["shipments:10"]),
    ]);
    let connection = Connection::open(&bus, connector, ReconnectPolicy::Never).expect("open");
    let mut health = connection.health();
    let state = wait_for_state(&mut health, |s| {
        matches!(s, ConnectionState::Disconnected { .. })
    })
    .await;

    assert!(state.to_string().starts_with("disconnected"));
    assert_eq!(counters.value("shipments"), Some(1));
    connection.close().await;
}

/// Accepts every connect, sends one frame and hangs up.
struct FlappingConnector {
    attempts: Arc<AtomicUsize>,
}

impl Connector for FlappingConnector {
    fn connect(&mut self) -> BoxFuture<'_, stockfeed::Result<FrameStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(stream::iter(vec![Ok("orders:1".to_string())]).boxed()) })
    }

    fn describe(&self) -> String {
        "flapping".to_string()
    }
}

#[tokio::test(start_paused = true)]
async fn short_sessions_keep_backing_off() {
    let _serial = serial();
    let bus = MessageBus::default();
    let counters = CounterAggregator::with_default_topics(&bus);
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = FlappingConnector {
        attempts: Arc::clone(&attempts),
    };
    let policy = ReconnectPolicy::Backoff {
        initial_ms: 10,
        max_ms: 10_000,
    };
    let connection = Connection::open(&bus, connector, policy).expect("open");

    tokio::time::sleep(Duration::from_secs(1)).await;
    // 10 + 20 + 40 + ... ms between attempts: seven fit in one second.
    let seen = attempts.load(Ordering::SeqCst);
    assert!((5..=10).contains(&seen), "{seen} connect attempts in 1s");
    assert_eq!(counters.value("orders"), Some(seen as u64));
    connection.close().await;
}

#[tokio::test]
async fn fail_fast_listener_panic_is_reported() {
    let _serial = serial();
    let bus = MessageBus::new(DeliveryPolicy::FailFast);
    let _listener = bus.add_listener(|frame| {
        if frame == "boom" {
            panic!("cannot handle {frame}");
        }
        Ok(())
    });

    let connector = ScriptedConnector::new(vec![Session::Hold(vec!["boom"])]);
    let connection = Connection::open(&bus, connector, ReconnectPolicy::Never).expect("open");
    let mut health = connection.health();
    let state = wait_for_state(&mut health, |s| {
        matches!(s, ConnectionState::Disconnected { .. })
    })
    .await;

    assert!(
        state.to_string().contains("listener panicked: cannot handle boom"),
        "{state}"
    );
    wait_for("task to stop", || connection.is_finished()).await;
    assert_eq!(connection.state(), state);
    connection.close().await;
}

#[tokio::test]
async fn dropping_the_handle_aborts_the_task() {
    let _serial = serial();
    let bus = MessageBus::default();
    let connector = ScriptedConnector::new(vec![Session::Hold(vec!["orders:1"])]);
    let connection = Connection::open(&bus, connector, ReconnectPolicy::Never).expect("open");
    let mut health = connection.health();
    wait_for_state(&mut health, ConnectionState::is_connected).await;

    drop(connection);
    // The task owns the only sender; it goes away once the task is aborted.
    tokio::time::timeout(Duration::from_secs(5), async {
        while health.changed().await.is_ok() {}
    })
    .await
    .expect("task still running after drop");

    let reopened = Connection::open(&bus, ScriptedConnector::new(vec![]), ReconnectPolicy::Never)
        .expect("slot freed by drop");
    reopened.close().await;
}

#[tokio::test]
async fn only_one_connection_per_process() {
    let _serial = serial();
    let bus = MessageBus::default();

    let first = Connection::open(&bus, ScriptedConnector::new(vec![]), ReconnectPolicy::Never)
        .expect("first open");
    let second = Connection::open(&bus, ScriptedConnector::new(vec![]), ReconnectPolicy::Never);
    assert!(matches!(second, Err(Error::ConnectionAlreadyOpen)));

    first.close().await;
    let third = Connection::open(&bus, ScriptedConnector::new(vec![]), ReconnectPolicy::Never)
        .expect("slot freed by close");
    drop(third);
    let fourth = Connection::open(&bus, ScriptedConnector::new(vec![]), ReconnectPolicy::Never)
        .expect("slot freed by drop");
    fourth.close().await;
}

#[tokio::test]
async fn rejects_non_websocket_endpoint() {
    let _serial = serial();
    let bus = MessageBus::default();
    let config = FeedConfig {
        endpoint: "http://localhost:8080/topic/messages".to_string(),
        ..FeedConfig::default()
    };
    let err = Connection::connect(&bus, &config).unwrap_err();
    assert!(matches!(err, Error::InvalidEndpoint { .. }));

    // A failed connect must not hold the slot.
    let ok = Connection::open(&bus, ScriptedConnector::new(vec![]), ReconnectPolicy::Never)
        .expect("slot still free");
    ok.close().await;
}

#[tokio::test]
async fn websocket_text_frames_reach_aggregators() {
    let _serial = serial();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
        ws.send(Message::Ping(vec![1, 2, 3])).await.expect("ping");
        match ws.next().await {
            Some(Ok(Message::Pong(payload))) => assert_eq!(payload, vec![1, 2, 3]),
            other => panic!("expected a pong, got {other:?}"),
        }
        for frame in [
            "orders:1:placed",
            "stock-levels:SKU-1:40",
            "reserved-stock:SKU-1:5",
            "reserved-stock:SKU-1:3",
        ] {
            ws.send(Message::Text(frame.to_string())).await.expect("text");
        }
        ws.send(Message::Binary(b"orders:ignored".to_vec()))
            .await
            .expect("binary");
        ws.send(Message::Text("shipments:1:dispatched".to_string()))
            .await
            .expect("text");
        ws.send(Message::Close(None)).await.expect("close");
        while let Some(Ok(_)) = ws.next().await {}
    });

    let bus = MessageBus::default();
    let counters = CounterAggregator::with_default_topics(&bus);
    let inventory = InventoryAggregator::attach(&bus, QuantityPolicy::Strict);
    let config = FeedConfig {
        endpoint: format!("ws://{addr}/topic/messages"),
        reconnect: ReconnectPolicy::Never,
        ..FeedConfig::default()
    };

    let connection = Connection::connect(&bus, &config).expect("connect");
    let mut health = connection.health();
    wait_for_state(&mut health, |s| {
        matches!(s, ConnectionState::Disconnected { .. })
    })
    .await;
    connection.close().await;
    server.await.expect("server task");

    assert_eq!(counters.value("orders"), Some(1));
    assert_eq!(counters.value("shipments"), Some(1));
    let record = inventory.record("SKU-1").expect("SKU-1");
    assert_eq!(record.stock_level, 40.0);
    assert_eq!(record.reserved_stock, 8.0);
    assert_eq!(inventory.stats().applied, 3);
}
