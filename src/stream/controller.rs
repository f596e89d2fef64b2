use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::replay::SharedReplayPool;
use super::scheduler::{ReconnectTimer, RepeatingTask};
use super::state::{IngestState, TransportDirective};
use crate::config::TrendConfig;
use crate::core::{IngestError, IngestResult, Moment, TrendSnapshot};
use crate::ingest::{EventSender, FeedTransport, TransportEvent};

#[derive(Debug)]
enum Command {
    Reconnect,
    Shutdown,
}

/// Keeps a bounded trend series flowing from a push feed.
///
/// All handlers run inside one spawned task that owns the [`IngestState`];
/// this handle only sends commands and reads snapshots. Consumers call
/// [`subscribe`](Self::subscribe) to get a `watch` receiver that updates on
/// every change.
pub struct StreamIngestionController {
    pending: Option<FeedActor>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    snapshots: watch::Receiver<TrendSnapshot>,
    transport_name: String,
}

impl std::fmt::Debug for StreamIngestionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIngestionController")
            .field("transport", &self.transport_name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl StreamIngestionController {
    /// Build a controller; nothing is opened until [`start`](Self::start).
    pub fn new(
        config: TrendConfig,
        transport: Arc<dyn FeedTransport>,
        replay: SharedReplayPool,
    ) -> IngestResult<Self> {
        let state = IngestState::new(config.clone(), replay);
        Self::with_state(config, transport, state)
    }

    /// Build around a prepared state machine (seeded RNG, pre-shared pool).
    pub fn with_state(
        config: TrendConfig,
        transport: Arc<dyn FeedTransport>,
        state: IngestState,
    ) -> IngestResult<Self> {
        config.validate()?;
        let pool_capacity = state.replay().capacity();
        if pool_capacity < config.window.size {
            return Err(IngestError::Config(format!(
                "replay pool holds {} points but the window needs at least {}",
                pool_capacity, config.window.size
            )));
        }

        let (snapshot_tx, snapshots) = watch::channel(state.snapshot());
        let transport_name = transport.describe();
        let actor = FeedActor {
            state,
            transport,
            connection: None,
            ticker: RepeatingTask::new(),
            reconnect: ReconnectTimer::new(),
            tick_interval: config.replay.tick_interval(),
            snapshots: snapshot_tx,
        };

        Ok(Self {
            pending: Some(actor),
            commands: None,
            task: None,
            snapshots,
            transport_name,
        })
    }

    /// Open the feed, seed the series and start the staleness ticker.
    /// Must be called from within a tokio runtime; repeated calls do nothing.
    #[instrument(skip(self), fields(transport = %self.transport_name))]
    pub fn start(&mut self) {
        let Some(actor) = self.pending.take() else {
            debug!("Controller already started or torn down");
            return;
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.commands = Some(command_tx);
        self.task = Some(tokio::spawn(actor.run(command_rx)));
        info!("Trend feed controller started");
    }

    /// Close the current connection and open a fresh one.
    pub fn reconnect(&self) {
        match &self.commands {
            Some(commands) => {
                if commands.send(Command::Reconnect).is_err() {
                    warn!("Reconnect requested after controller stopped");
                }
            }
            None => debug!("Reconnect ignored, controller not running"),
        }
    }

    /// Stop the ticker, cancel any pending retry and close the connection.
    ///
    /// Once this returns no further snapshot changes are published. Safe to
    /// call any number of times.
    #[instrument(skip(self), fields(transport = %self.transport_name))]
    pub async fn teardown(&mut self) {
        self.pending = None;
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Shutdown);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Trend feed task failed: {}", e);
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TrendSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for StreamIngestionController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Task-side half of the controller; sole owner of the state machine
struct FeedActor {
    state: IngestState,
    transport: Arc<dyn FeedTransport>,
    connection: Option<JoinHandle<()>>,
    ticker: RepeatingTask,
    reconnect: ReconnectTimer,
    tick_interval: Duration,
    snapshots: watch::Sender<TrendSnapshot>,
}

impl FeedActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<TransportEvent>();

        if let Some(generation) = self.state.start(Moment::now()) {
            self.open(generation, &events_tx);
        }
        self.ticker.start(self.tick_interval);
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Reconnect) => {
                        self.close_connection();
                        self.reconnect.cancel();
                        if let Some(generation) = self.state.reconnect(Moment::now()) {
                            self.open(generation, &events_tx);
                        }
                        self.publish();
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = events_rx.recv() => {
                    match self.state.handle_transport(event, Moment::now()) {
                        TransportDirective::Continue { changed } => {
                            if changed {
                                self.publish();
                            }
                        }
                        TransportDirective::ScheduleReconnect { at } => {
                            self.close_connection();
                            self.reconnect.schedule_at(at);
                            self.publish();
                        }
                    }
                }
                _ = self.ticker.tick() => {
                    if self.state.on_tick(Moment::now()).is_some() {
                        self.publish();
                    }
                }
                _ = self.reconnect.fired() => {
                    if let Some(generation) = self.state.on_reconnect_due() {
                        info!(generation, "Reconnecting to trend feed");
                        self.open(generation, &events_tx);
                        self.publish();
                    }
                }
            }
        }

        self.shutdown();
    }

    fn open(&mut self, generation: u64, events: &EventSender) {
        self.close_connection();
        self.connection = Some(self.transport.open(generation, events.clone()));
    }

    fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }

    fn shutdown(&mut self) {
        self.ticker.cancel();
        self.reconnect.cancel();
        self.close_connection();
        self.state.teardown();
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.state.snapshot());
    }
}

impl Drop for FeedActor {
    fn drop(&mut self) {
        // Dropping a JoinHandle only detaches the session
        self.close_connection();
    }
}
