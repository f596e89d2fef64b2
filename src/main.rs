use anyhow::{Context, Result};
use colored::Colorize;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trendwatch::ingest::transport_for;
use trendwatch::{
    ConnectionState, DataSource, PointOrigin, SharedReplayPool, StreamIngestionController, TrendConfig,
    TrendSnapshot,
};

/// Environment variable naming the TOML configuration file
const CONFIG_ENV: &str = "TRENDWATCH_CONFIG";

fn init_tracing() -> Result<()> {
    // Create logs directory if it doesn't exist
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "trendwatch.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    // Console goes to stderr so stdout stays the live view
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Keep the file writer alive for the whole process
    std::mem::forget(guard);

    Ok(())
}

/// First CLI argument, then `TRENDWATCH_CONFIG`, then built-in defaults;
/// `TRENDWATCH_*` overrides apply on top.
fn load_config() -> Result<TrendConfig> {
    let path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok());
    let config = match path {
        Some(path) => TrendConfig::load_from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => TrendConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn render_connection(state: ConnectionState) -> colored::ColoredString {
    let label = format!("{:<12}", state.to_string());
    match state {
        ConnectionState::Connected => label.green().bold(),
        ConnectionState::Connecting => label.yellow(),
        ConnectionState::Error => label.red().bold(),
        ConnectionState::Disconnected => label.dimmed(),
    }
}

fn print_snapshot(snapshot: &TrendSnapshot) {
    let source = match snapshot.source {
        DataSource::Live => "LIVE  ".bright_green(),
        DataSource::Replay => "REPLAY".bright_magenta(),
    };

    let Some(point) = snapshot.latest() else {
        println!("{} {}", render_connection(snapshot.connection), source);
        return;
    };
    if point.origin == PointOrigin::Placeholder {
        println!(
            "{} {} {}",
            render_connection(snapshot.connection),
            source,
            "waiting for data".dimmed()
        );
        return;
    }

    let velocity = format!("{:+6.1}", point.velocity);
    let velocity = if point.velocity >= 0.0 {
        velocity.green()
    } else {
        velocity.red()
    };

    println!(
        "{} {} {} {} {:>5.1} {} {} {} {}",
        point.timestamp.cyan(),
        render_connection(snapshot.connection),
        source,
        "score".dimmed(),
        point.score,
        velocity,
        point.label.as_deref().unwrap_or("-").bright_white(),
        point.source.as_deref().unwrap_or("-").yellow(),
        point.attribution.as_deref().unwrap_or("").dimmed(),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("📈 Trendwatch - live trend feed monitor");

    let config = load_config()?;
    config.validate().context("Invalid configuration")?;

    let transport = transport_for(&config.feed).context("Failed to set up feed transport")?;
    info!("Feed endpoint: {}", transport.describe());

    let replay = SharedReplayPool::new(config.replay.capacity);
    let mut controller = StreamIngestionController::new(config, transport, replay)?;
    controller.start();

    let mut snapshots = controller.subscribe();
    let mut last_printed = None;
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let key = (snapshot.connection, snapshot.stats.accepted, snapshot.stats.replayed);
                if last_printed != Some(key) {
                    print_snapshot(&snapshot);
                    last_printed = Some(key);
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("🛑 Shutdown signal received"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
        }
    }

    controller.teardown().await;

    let stats = controller.snapshot().stats;
    info!(
        accepted = stats.accepted,
        replayed = stats.replayed,
        dropped = stats.dropped_noise,
        parse_failures = stats.parse_failures,
        "👋 Trendwatch shutdown complete"
    );
    Ok(())
}
