use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use trendwatch::ingest::{EventSender, FeedTransport, TransportEvent};
use trendwatch::{
    ConnectionState, DataSource, IngestError, PointOrigin, SharedReplayPool, StreamIngestionController, TrendConfig,
};

/// Transport that hands every connection's sender back to the test
#[derive(Default)]
struct ScriptedTransport {
    connections: Mutex<Vec<(u64, EventSender)>>,
    live_sessions: Arc<AtomicUsize>,
}

/// Counts a session as live until its task is dropped
struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    fn opened(&self) -> Vec<u64> {
        self.connections.lock().unwrap().iter().map(|(g, _)| *g).collect()
    }

    fn latest(&self) -> (u64, EventSender) {
        self.connections.lock().unwrap().last().cloned().expect("no connection opened")
    }

    fn open_latest(&self) -> u64 {
        let (generation, tx) = self.latest();
        tx.send(TransportEvent::Open { generation }).unwrap();
        generation
    }

    fn send(&self, event_type: &str, payload: &str) {
        let (generation, tx) = self.latest();
        let _ = tx.send(TransportEvent::Message {
            generation,
            event_type: event_type.to_string(),
            payload: payload.to_string(),
        });
    }

    fn fail(&self, reason: &str) {
        let (generation, tx) = self.latest();
        let _ = tx.send(TransportEvent::Error {
            generation,
            reason: reason.to_string(),
        });
    }
}

impl FeedTransport for ScriptedTransport {
    fn open(&self, generation: u64, events: EventSender) -> JoinHandle<()> {
        self.connections.lock().unwrap().push((generation, events));
        self.live_sessions.fetch_add(1, Ordering::SeqCst);
        let guard = SessionGuard(self.live_sessions.clone());
        tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn test_config() -> TrendConfig {
    let mut config = TrendConfig::default();
    config.window.size = 10;
    config.replay.capacity = 20;
    config
}

fn controller(transport: &Arc<ScriptedTransport>, replay: SharedReplayPool) -> StreamIngestionController {
    StreamIngestionController::new(test_config(), transport.clone(), replay).unwrap()
}

/// Let the controller task drain its queues without moving the clock much.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn start_seeds_window_and_connects() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));

    ctl.start();
    ctl.start();
    settle().await;

    assert_eq!(transport.opened(), vec![1]);
    let snapshot = ctl.snapshot();
    assert_eq!(snapshot.connection, ConnectionState::Connecting);
    assert_eq!(snapshot.series.len(), 10);
    assert!(snapshot.series.iter().all(|p| p.origin == PointOrigin::Placeholder));

    transport.open_latest();
    settle().await;
    assert_eq!(ctl.snapshot().connection, ConnectionState::Connected);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn live_messages_update_snapshot() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;
    transport.open_latest();

    transport.send(
        "message",
        r##"{"type":"vks_update","data":{"vks_score":45,"platform":"tiktok","hashtag":"#x"}}"##,
    );
    transport.send("heartbeat", "");
    transport.send("trend_update", "{oops");
    transport.send(
        "message",
        r#"{"type":"trend_update","data":{"trend_score":0,"platform":"x"}}"#,
    );
    settle().await;

    let snapshot = ctl.snapshot();
    assert_eq!(snapshot.current_score, 45.0);
    assert_eq!(snapshot.platform.as_deref(), Some("tiktok"));
    assert_eq!(snapshot.label.as_deref(), Some("#x"));
    assert_eq!(snapshot.source, DataSource::Live);
    assert_eq!(snapshot.series.len(), 10);
    assert_eq!(snapshot.latest().map(|p| p.score), Some(45.0));
    assert!(snapshot.latest().is_some_and(|p| p.is_live()));
    assert_eq!(snapshot.stats.accepted, 1);
    assert_eq!(snapshot.stats.heartbeats, 1);
    assert_eq!(snapshot.stats.parse_failures, 1);
    assert_eq!(snapshot.stats.dropped_noise, 1);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn quiet_feed_switches_to_replay() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;
    transport.open_latest();
    transport.send("vks_update", r#"{"vks_score":62,"platform":"instagram"}"#);
    settle().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ctl.snapshot().source, DataSource::Live);

    // 2s threshold plus one 500ms tick
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let snapshot = ctl.snapshot();
    assert_eq!(snapshot.source, DataSource::Replay);
    let latest = snapshot.latest().unwrap();
    assert_eq!(latest.origin, PointOrigin::Replay);
    assert!((0.0..=100.0).contains(&latest.score));
    assert_eq!(latest.source.as_deref(), Some("instagram"));
    assert_eq!(snapshot.current_score, 62.0);

    transport.send("vks_update", r#"{"vks_score":70,"platform":"instagram"}"#);
    settle().await;
    assert_eq!(ctl.snapshot().source, DataSource::Live);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_pool_never_replays() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;
    transport.open_latest();
    settle().await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    let snapshot = ctl.snapshot();
    assert_eq!(snapshot.source, DataSource::Live);
    assert_eq!(snapshot.stats.replayed, 0);
    assert!(snapshot.series.iter().all(|p| p.origin == PointOrigin::Placeholder));

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn errors_reconnect_once_after_delay() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;
    transport.open_latest();
    settle().await;

    transport.fail("connection reset");
    transport.fail("connection reset");
    settle().await;
    assert_eq!(ctl.snapshot().connection, ConnectionState::Error);

    tokio::time::sleep(Duration::from_millis(4900)).await;
    assert_eq!(transport.opened(), vec![1]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.opened(), vec![1, 2]);
    assert_eq!(ctl.snapshot().connection, ConnectionState::Connecting);

    // No stacked timer fires a third connection
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(transport.opened(), vec![1, 2]);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_forever_with_fixed_delay() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;

    for expected in 2..=6u64 {
        transport.fail("refused");
        settle().await;
        tokio::time::sleep(Duration::from_millis(5010)).await;
        assert_eq!(transport.opened().last(), Some(&expected));
    }
    assert_eq!(ctl.snapshot().stats.connection_attempts, 6);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_replaces_connection() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;
    let (old_generation, old_tx) = transport.latest();
    transport.open_latest();
    settle().await;

    ctl.reconnect();
    settle().await;
    assert_eq!(transport.opened(), vec![1, 2]);
    assert_eq!(transport.live_sessions(), 1);
    assert_eq!(ctl.snapshot().connection, ConnectionState::Connecting);

    // Late traffic from the replaced connection is ignored
    let _ = old_tx.send(TransportEvent::Message {
        generation: old_generation,
        event_type: "vks_update".to_string(),
        payload: r#"{"vks_score":80,"platform":"tiktok"}"#.to_string(),
    });
    settle().await;
    assert_eq!(ctl.snapshot().stats.accepted, 0);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_cancels_pending_retry() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;

    transport.fail("refused");
    settle().await;
    ctl.reconnect();
    settle().await;
    assert_eq!(transport.opened(), vec![1, 2]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.opened(), vec![1, 2]);

    ctl.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_stops_all_mutation() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;
    transport.open_latest();
    transport.send("vks_update", r#"{"vks_score":33,"platform":"tiktok"}"#);
    settle().await;
    transport.fail("reset");
    settle().await;

    ctl.teardown().await;
    ctl.teardown().await;
    let frozen = ctl.snapshot();
    assert_eq!(frozen.connection, ConnectionState::Disconnected);

    transport.send("vks_update", r#"{"vks_score":90,"platform":"tiktok"}"#);
    transport.fail("reset");
    ctl.reconnect();
    ctl.start();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(ctl.snapshot(), frozen);
    assert_eq!(transport.opened(), vec![1]);
    assert_eq!(transport.live_sessions(), 0);
    assert!(!ctl.is_running());
}

#[tokio::test(start_paused = true)]
async fn dropping_controller_closes_connection() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut ctl = controller(&transport, SharedReplayPool::new(20));
    ctl.start();
    settle().await;
    transport.open_latest();
    settle().await;
    assert_eq!(transport.live_sessions(), 1);

    drop(ctl);
    settle().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn replay_pool_outlives_controller() {
    let transport = Arc::new(ScriptedTransport::default());
    let pool = SharedReplayPool::new(20);

    let mut first = controller(&transport, pool.clone());
    first.start();
    settle().await;
    transport.open_latest();
    transport.send("trend_update", r#"{"trend_score":48,"platform":"youtube","author":"@kim"}"#);
    settle().await;
    first.teardown().await;
    assert_eq!(pool.len(), 1);

    let mut second = controller(&transport, pool);
    second.start();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let snapshot = second.snapshot();
    assert_eq!(snapshot.source, DataSource::Replay);
    assert_eq!(
        snapshot.latest().and_then(|p| p.attribution.as_deref()),
        Some("@kim")
    );

    second.teardown().await;
}

#[test]
fn undersized_replay_pool_rejected() {
    let transport: Arc<dyn FeedTransport> = Arc::new(ScriptedTransport::default());
    let result = StreamIngestionController::new(test_config(), transport, SharedReplayPool::new(1));
    assert!(matches!(result, Err(IngestError::Config(_))));

    let transport: Arc<dyn FeedTransport> = Arc::new(ScriptedTransport::default());
    assert!(StreamIngestionController::new(test_config(), transport, SharedReplayPool::new(10)).is_ok());
}

#[test]
fn invalid_config_rejected() {
    let mut config = test_config();
    config.replay.capacity = 5;
    let transport: Arc<dyn FeedTransport> = Arc::new(ScriptedTransport::default());
    let result = StreamIngestionController::new(config, transport, SharedReplayPool::new(5));
    assert!(result.is_err());
}
