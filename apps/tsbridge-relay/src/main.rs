use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::info;
use tsbridge_transport_websocket::{RelayServer, RelayServerConfig};

/// Topic-routing WebSocket relay for tsbridge publishers and subscribers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "TSBRIDGE_RELAY_BIND", default_value = "127.0.0.1:9001")]
    bind: String,
    /// Frames buffered per client before deliveries to it are dropped
    #[arg(long, default_value_t = 1024)]
    client_queue_capacity: usize,
    /// Seconds between stats log lines (0 disables them)
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let filter = std::env::var("TSBRIDGE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = RelayServerConfig::new(cli.bind.clone());
    config.client_queue_capacity = cli.client_queue_capacity;
    let relay = RelayServer::listen(config)
        .with_context(|| format!("failed to start relay on {}", cli.bind))?;
    info!("relay ready at {}", relay.url());

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown)).context("registering SIGTERM")?;
    flag::register(SIGINT, Arc::clone(&shutdown)).context("registering SIGINT")?;

    let stats_interval = Duration::from_secs(cli.stats_interval_secs);
    let mut last_stats = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
        if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            let stats = relay.stats_snapshot();
            info!(
                sessions = relay.live_sessions(),
                publishes = stats.publishes_routed,
                deliveries = stats.deliveries_sent,
                dropped = stats.deliveries_dropped,
                "relay stats"
            );
        }
    }

    let stats = relay.stats_snapshot();
    relay.shutdown();
    info!(
        accepted = stats.sessions_accepted,
        refused = stats.sessions_refused,
        taken_over = stats.sessions_taken_over,
        publishes = stats.publishes_routed,
        "relay stopped"
    );
    Ok(())
}
