use thiserror::Error;

/// Errors raised by the ingestion subsystem.
///
/// Only `Config` ever reaches a caller: parse failures and transport failures
/// are recovered inside the controller and surface as log entries and
/// `ConnectionState` transitions.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed payload for event '{event_type}': {source}")]
    Parse {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected payload shape for event '{event_type}': {detail}")]
    UnexpectedShape { event_type: String, detail: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read configuration file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ConfigFormat(#[from] toml::de::Error),

    #[error("Invalid feed URL: {0}")]
    Url(#[from] url::ParseError),
}

pub type IngestResult<T> = Result<T, IngestError>;
