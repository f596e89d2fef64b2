use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Display format used for the `timestamp` column of a point
pub const DISPLAY_TIME_FORMAT: &str = "%H:%M:%S";

/// Lower bound of the score scale
pub const SCORE_MIN: f64 = 0.0;
/// Upper bound of the score scale
pub const SCORE_MAX: f64 = 100.0;

/// Clamp a raw score into the [0, 100] display scale.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return SCORE_MIN;
    }
    score.clamp(SCORE_MIN, SCORE_MAX)
}

/// A single instant seen by the ingestion state machine.
///
/// Carries both the monotonic clock (staleness arithmetic) and the wall clock
/// (display timestamps) so that every handler works off one consistent reading.
#[derive(Debug, Clone, Copy)]
pub struct Moment {
    pub at: Instant,
    pub wall: DateTime<Local>,
}

impl Moment {
    pub fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Local::now(),
        }
    }

    /// Moment shifted forward by `offset` on both clocks.
    pub fn after(&self, offset: std::time::Duration) -> Self {
        let wall_offset = chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            at: self.at + offset,
            wall: self.wall + wall_offset,
        }
    }
}

/// How a point came to exist
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PointOrigin {
    /// Accepted from the push connection
    Live,
    /// Synthesized from the replay pool while the feed is quiet
    Replay,
    /// Zero-score filler seeded when the controller starts
    Placeholder,
}

/// Normalized trend observation, immutable once built
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    /// Wall-clock ingestion time formatted for display
    pub timestamp: String,
    pub observed_at: DateTime<Utc>,
    pub score: f64,
    pub velocity: f64,
    pub acceleration: f64,
    /// Hashtag or topic
    pub label: Option<String>,
    /// Platform the signal came from
    pub source: Option<String>,
    /// Author of the underlying post
    pub attribution: Option<String>,
    /// Engagement counters, passed through untouched
    pub metrics: Option<Value>,
    pub origin: PointOrigin,
}

impl DataPoint {
    /// Zero-score filler stamped at `wall`.
    pub fn placeholder(wall: DateTime<Local>) -> Self {
        Self {
            timestamp: wall.format(DISPLAY_TIME_FORMAT).to_string(),
            observed_at: wall.with_timezone(&Utc),
            score: 0.0,
            velocity: 0.0,
            acceleration: 0.0,
            label: None,
            source: None,
            attribution: None,
            metrics: None,
            origin: PointOrigin::Placeholder,
        }
    }

    pub fn is_live(&self) -> bool {
        self.origin == PointOrigin::Live
    }
}

/// Health of the push connection; drives UI affordances only
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Whether the most recent point came from the feed or from replay
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    #[default]
    Live,
    Replay,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::Live => f.write_str("live"),
            DataSource::Replay => f.write_str("replay"),
        }
    }
}

/// Running counters for monitoring the feed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedStats {
    pub accepted: u64,
    pub dropped_noise: u64,
    pub parse_failures: u64,
    pub heartbeats: u64,
    pub replayed: u64,
    pub connection_attempts: u64,
}

/// Everything a rendering collaborator needs, published on every change
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrendSnapshot {
    /// Rolling series, oldest first
    pub series: Vec<DataPoint>,
    /// Latest accepted live score
    pub current_score: f64,
    pub label: Option<String>,
    pub platform: Option<String>,
    pub author: Option<String>,
    pub connection: ConnectionState,
    pub source: DataSource,
    pub stats: FeedStats,
}

impl TrendSnapshot {
    pub fn latest(&self) -> Option<&DataPoint> {
        self.series.last()
    }
}
