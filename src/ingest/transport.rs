use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::normalize::DEFAULT_EVENT;
use super::sse::SseDecoder;
use crate::config::{FeedConfig, TransportKind};
use crate::core::{IngestError, IngestResult};

/// Event emitted by a connection attempt.
///
/// `generation` identifies the attempt; the controller discards anything
/// tagged with a generation it has already closed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open {
        generation: u64,
    },
    Message {
        generation: u64,
        event_type: String,
        payload: String,
    },
    Error {
        generation: u64,
        reason: String,
    },
}

impl TransportEvent {
    pub fn generation(&self) -> u64 {
        match self {
            TransportEvent::Open { generation }
            | TransportEvent::Message { generation, .. }
            | TransportEvent::Error { generation, .. } => *generation,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A push endpoint the controller can (re)connect to.
pub trait FeedTransport: Send + Sync + 'static {
    /// Start one connection attempt. Aborting the returned handle closes it.
    fn open(&self, generation: u64, events: EventSender) -> JoinHandle<()>;

    fn describe(&self) -> String;
}

/// Build the transport selected by the feed configuration.
pub fn transport_for(config: &FeedConfig) -> IngestResult<Arc<dyn FeedTransport>> {
    let url = config.parsed_url()?;
    let transport: Arc<dyn FeedTransport> = match config.transport {
        TransportKind::Sse => Arc::new(SseTransport::new(url, config.connect_timeout())?),
        TransportKind::WebSocket => Arc::new(WebSocketTransport::new(url, config.connect_timeout())),
    };
    Ok(transport)
}

/// Spawn `session` and turn its failure (or a server-side close) into an
/// `Error` event. `Ok` means the controller hung up and nothing is reported.
fn spawn_session<F>(generation: u64, events: EventSender, session: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = session.await {
            let reason = format!("{:#}", e);
            warn!(generation, error = %reason, "Feed connection failed");
            let _ = events.send(TransportEvent::Error { generation, reason });
        }
    })
}

/// Server-sent events over a long-lived HTTP GET
pub struct SseTransport {
    url: Url,
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl SseTransport {
    pub fn new(url: Url, connect_timeout: Duration) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| IngestError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url,
            client,
            connect_timeout,
        })
    }

    #[instrument(skip(client, url, events), fields(url = %url))]
    async fn stream(
        client: reqwest::Client,
        url: Url,
        connect_timeout: Duration,
        generation: u64,
        events: EventSender,
    ) -> Result<()> {
        info!("Opening event stream");

        let response = timeout(
            connect_timeout,
            client
                .get(url.clone())
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .send(),
        )
        .await
        .context("Connection timeout")?
        .context("Failed to reach event stream")?
        .error_for_status()
        .context("Event stream rejected the request")?;

        info!(status = %response.status(), "Event stream connected");
        if events.send(TransportEvent::Open { generation }).is_err() {
            return Ok(());
        }

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("Event stream read failed")?;
            for frame in decoder.feed(&chunk) {
                let event = TransportEvent::Message {
                    generation,
                    event_type: frame.event,
                    payload: frame.data,
                };
                if events.send(event).is_err() {
                    debug!("Controller gone, closing event stream");
                    return Ok(());
                }
            }
        }

        bail!("Event stream closed by server")
    }
}

impl FeedTransport for SseTransport {
    fn open(&self, generation: u64, events: EventSender) -> JoinHandle<()> {
        let session = Self::stream(
            self.client.clone(),
            self.url.clone(),
            self.connect_timeout,
            generation,
            events.clone(),
        );
        spawn_session(generation, events, session)
    }

    fn describe(&self) -> String {
        format!("sse {}", self.url)
    }
}

/// `{type, data}` JSON envelopes over WebSocket text frames
pub struct WebSocketTransport {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self { url, connect_timeout }
    }

    #[instrument(skip(url, events), fields(url = %url))]
    async fn stream(url: Url, connect_timeout: Duration, generation: u64, events: EventSender) -> Result<()> {
        info!("Attempting to connect to trend WebSocket");

        let (mut ws_stream, response) = timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to WebSocket")?;

        info!("Successfully connected (HTTP {})", response.status());
        if events.send(TransportEvent::Open { generation }).is_err() {
            return Ok(());
        }

        while let Some(msg) = ws_stream.next().await {
            let payload = match msg.context("WebSocket receive error")? {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping non-UTF-8 binary message: {} bytes", e.as_bytes().len());
                        continue;
                    }
                },
                Message::Close(close_frame) => {
                    bail!("WebSocket closed: {:?}", close_frame);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            let event = TransportEvent::Message {
                generation,
                event_type: DEFAULT_EVENT.to_string(),
                payload,
            };
            if events.send(event).is_err() {
                debug!("Controller gone, closing WebSocket");
                return Ok(());
            }
        }

        bail!("WebSocket stream ended")
    }
}

impl FeedTransport for WebSocketTransport {
    fn open(&self, generation: u64, events: EventSender) -> JoinHandle<()> {
        let session = Self::stream(self.url.clone(), self.connect_timeout, generation, events.clone());
        spawn_session(generation, events, session)
    }

    fn describe(&self) -> String {
        format!("websocket {}", self.url)
    }
}
