//! Facesift encode daemon.
//!
//! Drains the queue of uploaded photos through the face encoding pipeline:
//! - Photos left mid-encode by a previous run are marked `interrupted`
//! - Queued photos are picked up oldest first
//! - The database is swept periodically for uploads made by the CLI
//!
//! Run one daemon per database.
//!
//! ## Usage
//!
//! ```bash
//! facesift-daemon              # Run in foreground until Ctrl-C
//! facesift-daemon --once       # Encode everything queued, then exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use facesift::logging::{self, Fallback};
use facesift::tasks::WorkerPool;
use facesift::{Config, Engine};

/// Daemon command line
#[derive(Default)]
struct DaemonArgs {
    /// Overrides `workers.poll_interval_secs`
    poll_interval: Option<u64>,
    /// Run once and exit
    once: bool,
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    logging::init(Fallback::Stderr)?;

    info!("Facesift daemon starting...");

    let config = load_config(&args)?;
    let poll_interval = args.poll_interval.unwrap_or(config.workers.poll_interval_secs).max(1);
    let workers = config.workers.count;

    let engine = Engine::open(config)?;
    info!(
        database = ?engine.config().database.sqlite_path,
        photos_indexed = engine.index().len(),
        "Engine opened"
    );

    if args.once {
        info!("Running in single-shot mode");
        let shared = engine.worker_shared();
        shared.recover()?;
        let processed = WorkerPool::drain(shared, workers).await;
        info!(processed, "Queue drained");
    } else {
        info!(poll_interval, workers, "Running in daemon mode");
        run_daemon_loop(&engine, poll_interval).await?;
    }

    info!("Facesift daemon stopped");
    Ok(())
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = DaemonArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                parsed.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    if let Ok(interval) = args[i + 1].parse() {
                        parsed.poll_interval = Some(interval);
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"facesift-daemon - Face encoding worker for facesift

USAGE:
    facesift-daemon [OPTIONS]

OPTIONS:
    --once, -1          Encode every queued photo once and exit
    --interval, -i N    Queue sweep interval in seconds (default: from config, 30)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    FACESIFT_CONFIG     Path to config file (overrides default location)
    FACESIFT_LOG        Log level (trace, debug, info, warn, error)
"#
    );
}

/// Missing config file means defaults; the daemon never writes one.
fn load_config(args: &DaemonArgs) -> Result<Config> {
    let path = args.config_path.clone().unwrap_or_else(Config::config_path);

    if path.exists() {
        Config::load_from(&path).context("Failed to load daemon config")
    } else {
        warn!("Config file not found at {:?}, using defaults", path);
        Ok(Config::default())
    }
}

async fn run_daemon_loop(engine: &Engine, poll_interval: u64) -> Result<()> {
    let pool = engine.start_workers()?;
    let queue = engine.worker_shared().queue;

    let mut ticker = tokio::time::interval(Duration::from_secs(poll_interval));
    // The first tick fires immediately; recovery already swept
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, finishing in-flight encodes");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = queue.sweep(engine.db()) {
                    error!("Error sweeping queued photos: {}", e);
                }
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}
