//! Ingestion state machine.
//!
//! `IngestState` is deliberately synchronous: every handler takes the current
//! [`Moment`] and returns what the caller must do next (open a connection,
//! arm the reconnect timer). The async controller owns one instance and calls
//! it from a single task, so handlers never interleave.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::TrendConfig;
use crate::core::{
    clamp_score, ConnectionState, DataPoint, DataSource, FeedStats, Moment, PointOrigin, TrendSnapshot,
    DISPLAY_TIME_FORMAT,
};
use crate::ingest::{normalize, NoiseReason, Normalized, Observation, TransportEvent};

use super::replay::SharedReplayPool;
use super::window::RollingSeries;

/// Result of handing one message to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Accepted(DataPoint),
    Heartbeat,
    Noise(NoiseReason),
    /// Body could not be parsed; carries the error text
    Malformed(String),
    /// Controller already torn down
    Ignored,
}

impl MessageOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MessageOutcome::Accepted(_))
    }
}

/// What the driver must do after a transport event
#[derive(Debug, Clone, PartialEq)]
pub enum TransportDirective {
    /// Nothing to do; `changed` tells whether the snapshot moved
    Continue { changed: bool },
    /// Close the current connection and arm the reconnect timer for `at`
    ScheduleReconnect { at: Instant },
}

pub struct IngestState {
    config: TrendConfig,
    series: RollingSeries,
    replay: SharedReplayPool,
    last_accepted: Option<DataPoint>,
    connection: ConnectionState,
    source: DataSource,
    current_score: f64,
    label: Option<String>,
    platform: Option<String>,
    author: Option<String>,
    stats: FeedStats,
    started: bool,
    torn_down: bool,
    generation: u64,
    live_generation: Option<u64>,
    reconnect_due: Option<Instant>,
    rng: StdRng,
}

impl std::fmt::Debug for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestState")
            .field("connection", &self.connection)
            .field("source", &self.source)
            .field("series_len", &self.series.len())
            .field("generation", &self.generation)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl IngestState {
    pub fn new(config: TrendConfig, replay: SharedReplayPool) -> Self {
        Self::with_rng(config, replay, StdRng::from_entropy())
    }

    pub fn with_rng(config: TrendConfig, replay: SharedReplayPool, rng: StdRng) -> Self {
        Self {
            series: RollingSeries::new(config.window.size),
            config,
            replay,
            last_accepted: None,
            connection: ConnectionState::Disconnected,
            source: DataSource::Live,
            current_score: 0.0,
            label: None,
            platform: None,
            author: None,
            stats: FeedStats::default(),
            started: false,
            torn_down: false,
            generation: 0,
            live_generation: None,
            reconnect_due: None,
            rng,
        }
    }

    /// Seed the series and begin the first connection attempt.
    ///
    /// Returns the generation to open, or `None` when already started or torn down.
    pub fn start(&mut self, now: Moment) -> Option<u64> {
        if self.started || self.torn_down {
            return None;
        }
        self.started = true;
        self.series
            .seed_placeholders(now.wall, self.config.window.seed_spacing());
        info!(window = self.series.capacity(), "Trend ingestion started");
        Some(self.begin_connection())
    }

    /// Drop the current connection (and any pending retry) and open a new one.
    pub fn reconnect(&mut self, now: Moment) -> Option<u64> {
        if self.torn_down {
            return None;
        }
        if !self.started {
            return self.start(now);
        }
        info!(previous = ?self.live_generation, "Manual reconnect requested");
        Some(self.begin_connection())
    }

    fn begin_connection(&mut self) -> u64 {
        self.generation += 1;
        self.live_generation = Some(self.generation);
        self.reconnect_due = None;
        self.connection = ConnectionState::Connecting;
        self.stats.connection_attempts += 1;
        debug!(generation = self.generation, "Opening feed connection");
        self.generation
    }

    /// Route a transport event, discarding anything from a closed connection.
    pub fn handle_transport(&mut self, event: TransportEvent, now: Moment) -> TransportDirective {
        if self.torn_down || Some(event.generation()) != self.live_generation {
            trace!(generation = event.generation(), "Discarding event from closed connection");
            return TransportDirective::Continue { changed: false };
        }
        match event {
            TransportEvent::Open { .. } => {
                self.on_open();
                TransportDirective::Continue { changed: true }
            }
            TransportEvent::Message {
                event_type, payload, ..
            } => {
                let outcome = self.on_message(&event_type, &payload, now);
                let changed = !matches!(outcome, MessageOutcome::Ignored);
                TransportDirective::Continue { changed }
            }
            TransportEvent::Error { reason, .. } => {
                warn!(error = %reason, "Feed connection error");
                match self.on_error(now) {
                    Some(at) => TransportDirective::ScheduleReconnect { at },
                    None => TransportDirective::Continue { changed: false },
                }
            }
        }
    }

    pub fn on_open(&mut self) {
        if self.torn_down {
            return;
        }
        info!(generation = ?self.live_generation, "Feed connected");
        self.connection = ConnectionState::Connected;
        self.source = DataSource::Live;
    }

    pub fn on_message(&mut self, event_type: &str, raw_payload: &str, now: Moment) -> MessageOutcome {
        if self.torn_down {
            return MessageOutcome::Ignored;
        }
        match normalize(event_type, raw_payload) {
            Ok(Normalized::Observation(observation)) => {
                MessageOutcome::Accepted(self.accept(observation, now))
            }
            Ok(Normalized::Heartbeat) => {
                self.stats.heartbeats += 1;
                MessageOutcome::Heartbeat
            }
            Ok(Normalized::Noise(reason)) => {
                debug!(event_type, ?reason, "Dropping message");
                self.stats.dropped_noise += 1;
                MessageOutcome::Noise(reason)
            }
            Err(e) => {
                warn!(event_type, error = %e, "Failed to parse feed message");
                self.stats.parse_failures += 1;
                MessageOutcome::Malformed(e.to_string())
            }
        }
    }

    fn accept(&mut self, observation: Observation, now: Moment) -> DataPoint {
        let score = clamp_score(observation.raw_score);
        let (velocity, acceleration) = match &self.last_accepted {
            Some(previous) => {
                let velocity = score - previous.score;
                (velocity, velocity - previous.velocity)
            }
            None => (0.0, 0.0),
        };

        let point = DataPoint {
            timestamp: now.wall.format(DISPLAY_TIME_FORMAT).to_string(),
            observed_at: now.wall.with_timezone(&Utc),
            score,
            velocity,
            acceleration,
            label: observation.label,
            source: Some(observation.platform),
            attribution: observation.author,
            metrics: observation.metrics,
            origin: PointOrigin::Live,
        };

        self.series.push(point.clone());
        self.replay.lock().record(point.clone(), now.at);

        self.current_score = score;
        self.label = point.label.clone();
        self.platform = point.source.clone();
        self.author = point.attribution.clone();
        self.source = DataSource::Live;
        self.stats.accepted += 1;
        self.last_accepted = Some(point.clone());

        debug!(
            event_type = %observation.event_type,
            score,
            velocity,
            platform = ?self.platform,
            "Accepted trend point"
        );
        point
    }

    /// Mark the connection failed and schedule the single retry.
    ///
    /// Returns the retry deadline, replacing any earlier one.
    pub fn on_error(&mut self, now: Moment) -> Option<Instant> {
        if self.torn_down {
            return None;
        }
        self.connection = ConnectionState::Error;
        self.live_generation = None;
        let at = now.at + self.config.feed.reconnect_delay();
        self.reconnect_due = Some(at);
        info!(delay = ?self.config.feed.reconnect_delay(), "Reconnect scheduled");
        Some(at)
    }

    /// The reconnect timer fired. Returns the generation to open.
    pub fn on_reconnect_due(&mut self) -> Option<u64> {
        if self.torn_down || self.reconnect_due.take().is_none() {
            return None;
        }
        Some(self.begin_connection())
    }

    /// Staleness check; synthesizes one replay point when the feed is quiet.
    pub fn on_tick(&mut self, now: Moment) -> Option<DataPoint> {
        if self.torn_down || !self.started {
            return None;
        }

        let base = {
            let mut pool = self.replay.lock();
            if pool.is_empty() || !pool.is_stale(now.at, self.config.replay.stale_after()) {
                return None;
            }
            pool.next_round_robin()?
        };

        let replay = &self.config.replay;
        let jitter = symmetric(&mut self.rng, replay.score_jitter);
        let velocity = symmetric(&mut self.rng, replay.velocity_range);
        let acceleration = symmetric(&mut self.rng, replay.acceleration_range);

        let point = DataPoint {
            timestamp: now.wall.format(DISPLAY_TIME_FORMAT).to_string(),
            observed_at: now.wall.with_timezone(&Utc),
            score: clamp_score(base.score + jitter),
            velocity,
            acceleration,
            origin: PointOrigin::Replay,
            ..base
        };

        self.series.push(point.clone());
        if self.source != DataSource::Replay {
            info!("Feed quiet, switching to replay");
        }
        self.source = DataSource::Replay;
        self.stats.replayed += 1;
        trace!(score = point.score, "Replayed trend point");
        Some(point)
    }

    /// Stop for good. Every later call is a no-op.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.started = false;
        self.live_generation = None;
        self.reconnect_due = None;
        self.connection = ConnectionState::Disconnected;
        info!("Trend ingestion torn down");
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        TrendSnapshot {
            series: self.series.to_vec(),
            current_score: self.current_score,
            label: self.label.clone(),
            platform: self.platform.clone(),
            author: self.author.clone(),
            connection: self.connection,
            source: self.source,
            stats: self.stats.clone(),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn series(&self) -> &RollingSeries {
        &self.series
    }

    pub fn replay(&self) -> &SharedReplayPool {
        &self.replay
    }

    pub fn reconnect_due(&self) -> Option<Instant> {
        self.reconnect_due
    }

    pub fn live_generation(&self) -> Option<u64> {
        self.live_generation
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

fn symmetric(rng: &mut StdRng, bound: f64) -> f64 {
    if bound > 0.0 {
        rng.gen_range(-bound..=bound)
    } else {
        0.0
    }
}
