/// Rolling window, replay fallback and the controller that drives them

pub mod window;
pub mod replay;
pub mod scheduler;
pub mod state;
pub mod controller;

pub use window::RollingSeries;
pub use replay::{ReplayPool, SharedReplayPool};
pub use scheduler::{ReconnectTimer, RepeatingTask};
pub use state::{IngestState, MessageOutcome, TransportDirective};
pub use controller::StreamIngestionController;
