// Core types and errors
pub mod core;

// Feed configuration
pub mod config;

// Push-feed transports and payload normalization
pub mod ingest;

// Rolling series, replay and the ingestion controller
pub mod stream;

// Re-export commonly used types for convenience
pub use crate::core::*;
pub use config::TrendConfig;
pub use stream::{SharedReplayPool, StreamIngestionController};
