/// Configuration structures for the trend feed

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::core::{IngestError, IngestResult};

/// Prefix for environment overrides, e.g. `TRENDWATCH_FEED_URL`
pub const ENV_PREFIX: &str = "TRENDWATCH_";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct TrendConfig {
    pub feed: FeedConfig,
    pub window: WindowConfig,
    pub replay: ReplayConfig,
}

/// Wire protocol used to reach the push endpoint
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// `text/event-stream` over a long-lived HTTP GET
    #[default]
    Sse,
    /// JSON envelopes over WebSocket text frames
    #[serde(rename = "websocket", alias = "ws")]
    WebSocket,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    /// Push endpoint URL
    pub url: String,
    pub transport: TransportKind,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Fixed delay before a reconnect attempt, in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/api/stream".to_string(),
            transport: TransportKind::Sse,
            connect_timeout_ms: 10_000,
            reconnect_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// Number of points kept in the rolling series
    pub size: usize,
    /// Spacing between seeded placeholder points, in milliseconds
    pub seed_spacing_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 30,
            seed_spacing_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReplayConfig {
    /// Number of real points retained for replay; must be >= window size
    pub capacity: usize,
    /// Silence after which the feed is considered stale, in milliseconds
    pub stale_after_ms: u64,
    /// Staleness check period, in milliseconds
    pub tick_interval_ms: u64,
    /// Maximum absolute score perturbation applied to replayed points
    pub score_jitter: f64,
    /// Replayed velocity is drawn from [-velocity_range, velocity_range]
    pub velocity_range: f64,
    /// Replayed acceleration is drawn from [-acceleration_range, acceleration_range]
    pub acceleration_range: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            stale_after_ms: 2_000,
            tick_interval_ms: 500,
            score_jitter: 5.0,
            velocity_range: 2.0,
            acceleration_range: 1.0,
        }
    }
}

impl FeedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn parsed_url(&self) -> IngestResult<Url> {
        Ok(Url::parse(&self.url)?)
    }
}

impl WindowConfig {
    pub fn seed_spacing(&self) -> Duration {
        Duration::from_millis(self.seed_spacing_ms)
    }
}

impl ReplayConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl TrendConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> IngestResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: TrendConfig = toml::from_str(&content)?;
        debug!(path = %path.as_ref().display(), "Loaded trend feed configuration");
        Ok(config)
    }

    /// Apply `TRENDWATCH_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup; unparsable values are
    /// logged and ignored.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(url) = var("FEED_URL") {
            self.feed.url = url;
        }
        if let Some(kind) = var("TRANSPORT") {
            match kind.to_ascii_lowercase().as_str() {
                "sse" => self.feed.transport = TransportKind::Sse,
                "websocket" | "ws" => self.feed.transport = TransportKind::WebSocket,
                other => warn!(value = %other, "Ignoring unknown TRENDWATCH_TRANSPORT"),
            }
        }
        override_number(&var, "RECONNECT_DELAY_MS", &mut self.feed.reconnect_delay_ms);
        override_number(&var, "CONNECT_TIMEOUT_MS", &mut self.feed.connect_timeout_ms);
        override_number(&var, "WINDOW_SIZE", &mut self.window.size);
        override_number(&var, "REPLAY_CAPACITY", &mut self.replay.capacity);
        override_number(&var, "STALE_AFTER_MS", &mut self.replay.stale_after_ms);
        override_number(&var, "TICK_INTERVAL_MS", &mut self.replay.tick_interval_ms);

        self
    }

    pub fn validate(&self) -> IngestResult<()> {
        self.feed.parsed_url()?;

        if self.window.size == 0 {
            return Err(IngestError::Config("window.size must be at least 1".to_string()));
        }
        if self.replay.capacity < self.window.size {
            return Err(IngestError::Config(format!(
                "replay.capacity ({}) must be >= window.size ({})",
                self.replay.capacity, self.window.size
            )));
        }
        if self.replay.tick_interval_ms == 0 || self.feed.reconnect_delay_ms == 0 {
            return Err(IngestError::Config(
                "tick_interval_ms and reconnect_delay_ms must be non-zero".to_string(),
            ));
        }
        for (name, value) in [
            ("score_jitter", self.replay.score_jitter),
            ("velocity_range", self.replay.velocity_range),
            ("acceleration_range", self.replay.acceleration_range),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(IngestError::Config(format!(
                    "replay.{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

fn override_number<T, V>(var: &V, name: &str, slot: &mut T)
where
    T: std::str::FromStr,
    V: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(variable = %name, value = %raw, "Ignoring unparsable override"),
        }
    }
}
