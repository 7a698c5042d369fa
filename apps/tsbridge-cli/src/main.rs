use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{debug, error, info};
use tsbridge_node::{
    ActionHandle, FatalError, FatalSignal, LocalScheduler, Publisher, Subscriber,
};
use tsbridge_transport_websocket::WebSocketTransport;

mod settings;

use settings::BridgeSettings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (TOML, or a .env file loaded into the environment)
    #[arg(long, short, env = "TSBRIDGE_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides the configured broker URL
    #[arg(long)]
    broker: Option<String>,
    /// Overrides the configured topic
    #[arg(long)]
    topic: Option<String>,
    /// Overrides the configured client id
    #[arg(long)]
    client_id: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish each stdin line as one timestamped message
    Publish,
    /// Print arrivals as `tag<TAB>payload` once physical time reaches them
    Subscribe,
    /// Print the effective settings as TOML
    ShowConfig,
}

fn main() -> anyhow::Result<()> {
    let filter = std::env::var("TSBRIDGE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = BridgeSettings::load(cli.config).context("loading settings")?;
    if let Some(broker) = cli.broker {
        settings.broker = broker;
    }
    if let Some(topic) = cli.topic {
        settings.topic = topic;
    }
    if let Some(client_id) = cli.client_id {
        settings.client_id = Some(client_id);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown)).context("registering SIGTERM")?;
    flag::register(SIGINT, Arc::clone(&shutdown)).context("registering SIGINT")?;

    match cli.command {
        Commands::Publish => run_publisher(&settings, &shutdown),
        Commands::Subscribe => run_subscriber(&settings, &shutdown),
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

/// The first fatal error ends the process.
fn exit_on_fatal() -> FatalSignal {
    FatalSignal::with_hook(Arc::new(|err: &FatalError| {
        error!("exiting: {err}");
        std::process::exit(1);
    }))
}

fn run_publisher(settings: &BridgeSettings, shutdown: &AtomicBool) -> anyhow::Result<()> {
    let config = settings.publisher_config()?;
    let scheduler = LocalScheduler::system();
    let mut publisher = Publisher::start(WebSocketTransport::default(), config, exit_on_fatal())?;

    let (lines_tx, lines_rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("tsbridge-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning stdin reader")?;

    while !shutdown.load(Ordering::Relaxed) {
        match lines_rx.recv_timeout(settings.poll_interval) {
            Ok(line) => {
                scheduler.advance_to_physical();
                if let Err(err) = publisher.send(line.as_bytes(), &scheduler) {
                    debug!("line not sent: {err}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let stats = publisher.shutdown(settings.disconnect_timeout);
    info!(
        sent = stats.sent,
        dropped = stats.dropped,
        ack_timeouts = stats.gate.timeouts,
        "publisher finished"
    );
    Ok(())
}

fn run_subscriber(settings: &BridgeSettings, shutdown: &AtomicBool) -> anyhow::Result<()> {
    let config = settings.subscriber_config()?;
    let scheduler = Arc::new(LocalScheduler::system());
    let subscriber = Subscriber::start(
        WebSocketTransport::default(),
        config,
        scheduler.clone(),
        ActionHandle(0),
        exit_on_fatal(),
    )?;

    let stdout = io::stdout();
    while !shutdown.load(Ordering::Relaxed) {
        let mut out = stdout.lock();
        while let Some(event) = scheduler.next_ready_event() {
            writeln!(out, "{}\t{}", event.tag, String::from_utf8_lossy(&event.payload))?;
        }
        out.flush()?;
        drop(out);
        scheduler.advance_to_physical();
        thread::sleep(settings.poll_interval);
    }

    if let Some(report) = subscriber.shutdown(settings.disconnect_timeout) {
        eprintln!("{report}");
    }
    Ok(())
}
