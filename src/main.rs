use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use vitalscope::clock::{SharedClock, SystemClock};
use vitalscope::config::{self, Config};
use vitalscope::server::health::HealthMetrics;
use vitalscope::server::{self, AppState};
use vitalscope::store::{MemoryEventStore, SharedStore, SqliteEventStore};

/// Frontend performance and error monitoring server.
#[derive(Parser)]
#[command(name = "vitalscope", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion and dashboard API (default).
    Serve,
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("vitalscope {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting vitalscope",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

fn open_store(cfg: &Config) -> Result<SharedStore> {
    if cfg.store.path.is_empty() {
        tracing::warn!("store.path is empty, events are kept in memory only");
        return Ok(Arc::new(MemoryEventStore::new()));
    }

    let store = SqliteEventStore::open(&cfg.store.path)
        .with_context(|| format!("opening event store {}", cfg.store.path))?;
    tracing::info!(path = %cfg.store.path, "opened event store");

    Ok(Arc::new(store))
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let metrics = if cfg.health.addr.is_empty() {
        None
    } else {
        let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        metrics.start().await?;
        Some(metrics)
    };

    let store = open_store(&cfg)?;
    let clock: SharedClock = Arc::new(SystemClock);
    let state = AppState::from_config(&cfg, store, clock, metrics.clone())?;

    let bind_addr = config::bind_address(&cfg.server.listen_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;

    server::serve(listener, Arc::new(state), async move {
        let _ = shutdown_rx.await;
    })
    .await?;

    if let Some(metrics) = metrics {
        metrics.stop();
    }

    tracing::info!("vitalscope stopped");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "failed to register SIGTERM handler"),
        }
    }

    let _ = ctrl_c.await;
    tracing::info!("received SIGINT, shutting down");
}
