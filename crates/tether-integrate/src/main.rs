//! # tether-integrate
//!
//! `serve` runs the coordinator: it waits for workers, integrates
//! `1 / ln(x)` over the requested range and prints the sum. `work` runs a
//! worker that serves tasks until the coordinator goes away.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tether_core::logging::{LogFormat, init_subscriber_with_format};
use tether_integrate::{Coordinator, Worker};
use tether_net::{Reactor, ReactorHandle, Server};
use tether_settings::TetherSettings;
use tracing::{info, warn};

/// Distributed integration over tether.
#[derive(Parser, Debug)]
#[command(name = "tether-integrate", about = "Distributed integration of 1/ln(x)")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (overrides settings).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print a Prometheus metrics snapshot on exit.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator.
    Serve(ServeArgs),
    /// Run a worker.
    Work(WorkArgs),
}

#[derive(Args, Debug)]
struct Endpoint {
    /// Host (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    endpoint: Endpoint,

    /// Lower integration bound.
    #[arg(long)]
    lower: f64,

    /// Upper integration bound.
    #[arg(long)]
    upper: f64,

    /// Rectangle width.
    #[arg(long, default_value_t = 1e-4)]
    step: f64,

    /// Workers to wait for before starting.
    #[arg(long, default_value_t = 1)]
    min_workers: usize,

    /// Longest wait for workers, in seconds.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

#[derive(Args, Debug)]
struct WorkArgs {
    #[command(flatten)]
    endpoint: Endpoint,

    /// Cores to compute with (defaults to available parallelism).
    #[arg(long)]
    cores: Option<usize>,
}

fn available_cores() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn load_settings(cli: &Cli) -> Result<TetherSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    let endpoint = match &cli.command {
        Command::Serve(args) => &args.endpoint,
        Command::Work(args) => &args.endpoint,
    };
    if let Some(host) = &endpoint.host {
        settings.server.host.clone_from(host);
        settings.client.host.clone_from(host);
    }
    if let Some(port) = endpoint.port {
        settings.server.port = port;
        settings.client.port = port;
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    if cli.json_logs {
        settings.logging.json = true;
    }
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

async fn serve(reactor: ReactorHandle, settings: &TetherSettings, args: &ServeArgs) -> Result<()> {
    if args.upper <= args.lower || args.step <= 0.0 {
        bail!(
            "invalid range: need lower < upper and step > 0 (got [{}, {}] step {})",
            args.lower,
            args.upper,
            args.step
        );
    }

    let server = Arc::new(Server::new(reactor, settings));
    let coordinator = Coordinator::new(
        Arc::clone(&server),
        available_cores(),
        settings.client.default_call_timeout(),
    )
    .context("Failed to register handshake handler")?;
    let addr = server
        .start_configured()
        .await
        .context("Failed to start server")?;
    info!(%addr, min_workers = args.min_workers, "coordinator listening");

    let workers = coordinator
        .wait_for_workers(args.min_workers, Duration::from_secs(args.wait_secs))
        .await;
    if workers < args.min_workers {
        warn!(workers, min_workers = args.min_workers, "starting with fewer workers than requested");
    }

    let report = coordinator.integrate(args.lower, args.upper, args.step).await;
    println!("{}", report.value);
    for failure in &report.failed {
        eprintln!(
            "task {} on {} failed: {}",
            failure.task_id, failure.worker, failure.error
        );
    }

    let _ = server.stop().await;
    if !report.is_complete() {
        bail!("{} of {} tasks failed", report.failed.len(), report.tasks);
    }
    Ok(())
}

async fn work(reactor: ReactorHandle, settings: &TetherSettings, args: &WorkArgs) -> Result<()> {
    let cores = args.cores.unwrap_or_else(available_cores);
    let worker = Worker::new(reactor, settings, cores).context("Failed to create worker")?;
    let address = settings.client.server_address();
    let welcome = worker
        .connect(&address, &settings.client.retry)
        .await
        .with_context(|| format!("Failed to join coordinator at {address}"))?;
    info!(session_id = welcome.session_id, cores, "worker ready");

    tokio::select! {
        () = worker.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("interrupted");
        }
    }
    let _ = worker.close().await;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber_with_format(&settings.logging.level, format);
    if tether_settings::init_settings(settings.clone()).is_err() {
        warn!("process settings were already initialized");
    }

    let metrics = if cli.metrics {
        Some(tether_net::metrics::install_recorder().context("Failed to install metrics recorder")?)
    } else {
        None
    };

    let reactor = Reactor::new(&settings.reactor).context("Failed to start reactor")?;
    let handle = reactor.handle();
    let result = reactor.block_on(async {
        match &cli.command {
            Command::Serve(args) => serve(handle, &settings, args).await,
            Command::Work(args) => work(handle, &settings, args).await,
        }
    });
    let _ = reactor.shutdown(settings.server.shutdown_timeout());

    if let Some(metrics) = metrics {
        print!("{}", tether_net::metrics::render(&metrics));
    }
    result
}
