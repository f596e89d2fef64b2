pub mod normalize;
pub mod sse;
pub mod transport;

pub use normalize::{normalize, Normalized, NoiseReason, Observation};
pub use sse::{SseDecoder, SseFrame};
pub use transport::{transport_for, EventSender, FeedTransport, SseTransport, TransportEvent, WebSocketTransport};
