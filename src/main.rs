use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use relaymon::agent::Agent;
use relaymon::confdiff::ConfigDiffer;
use relaymon::config::Config;

/// Terminal status monitor for a Tor relay.
#[derive(Parser)]
#[command(name = "relaymon", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Run the monitor, logging a summary of every snapshot (default).
    Run,
    /// Compare a configuration file against a running configuration dump.
    Diff {
        /// The daemon's configuration file.
        #[arg(long)]
        torrc: PathBuf,
        /// Dump of the running configuration. Without it every file entry
        /// is reported invalid.
        #[arg(long)]
        live: Option<PathBuf>,
    },
    /// Collect for a few snapshot ticks, then write the latest one as JSON.
    Snapshot {
        /// Output path.
        #[arg(long)]
        out: PathBuf,
        /// Snapshot ticks to wait before writing.
        #[arg(long, default_value_t = 5)]
        ticks: u32,
    },
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("relaymon {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::Diff { torrc, live }) = &cli.command {
        return diff(&cfg, torrc, live.as_deref());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        process = %cfg.process.name,
        "starting relaymon",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Snapshot { out, ticks }) => rt.block_on(snapshot(cfg, &out, ticks)),
        _ => rt.block_on(run(cfg)),
    }
}

fn diff(cfg: &Config, torrc: &Path, live: Option<&Path>) -> Result<()> {
    let file = std::fs::read_to_string(torrc)
        .with_context(|| format!("reading {}", torrc.display()))?;
    let live = live
        .map(|path| {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        })
        .transpose()?;

    let differ = ConfigDiffer::from_config(&cfg.confdiff);
    for entry in differ.diff(live.as_deref(), &file) {
        let line = entry
            .line
            .map_or_else(|| "-".to_string(), |l| l.to_string());
        println!(
            "{:>5}  {:<20}  {:<40}  {:<30}  {}",
            line,
            entry.classification,
            entry.key,
            entry.file_value.as_deref().unwrap_or("-"),
            entry.live_value.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    let handle = agent.handle();
    let mut updates = handle.subscribe();

    agent.start().await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = handle.latest();
                tracing::info!("{}", snapshot.summary());
            }
        }
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("relaymon stopped");

    Ok(())
}

async fn snapshot(cfg: Config, out: &Path, ticks: u32) -> Result<()> {
    let wait = cfg.snapshot.tick * ticks.max(1) + Duration::from_millis(50);
    let mut agent = Agent::new(cfg)?;
    let handle = agent.handle();

    agent.start().await?;

    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = shutdown_signal() => {}
    }

    agent.stop().await?;

    let latest = handle.latest();
    relaymon::export::write_snapshot(out, &latest).await?;
    tracing::info!(path = %out.display(), generation = latest.generation, "snapshot written");

    Ok(())
}
