use anyhow::{Context, Result};
use calwindow::config::Config;
use calwindow::feed::{HttpTransport, IcsParser};
use calwindow::health::HealthTracker;
use calwindow::refresh::{
    CycleOutcome, FetchOrchestrator, FetchSettings, RefreshOrchestrator, RefreshSettings,
};
use calwindow::skip::{CombinedSkipList, FileSkipList, StaticSkipList};
use calwindow::storage::{EventWindow, SourceChangeCache};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Default config path (~/.config/calwindow/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("calwindow")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(
    name = "calwindow",
    about = "Keeps a fresh in-memory window of upcoming calendar events"
)]
struct Args {
    /// Config file (default: ~/.config/calwindow/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run a single refresh, print the window as JSON and exit
    #[arg(long)]
    once: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(5))
        .pool_max_idle_per_host(2)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(config.fetch_timeout())
        .user_agent(concat!("calwindow/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

fn build_orchestrator(mut config: Config) -> Result<RefreshOrchestrator<HttpTransport>> {
    let client = build_client(&config)?;
    let transport = HttpTransport::new(client, config.fetch_timeout())
        .with_max_size(config.max_feed_bytes)
        .allow_private_hosts(config.allow_private_hosts);
    let parser = Arc::new(IcsParser::new(config.tz()?));
    let health = Arc::new(HealthTracker::new());
    let cache = Arc::new(SourceChangeCache::new(config.source_cache_capacity));

    let mut skip = CombinedSkipList::new().with(StaticSkipList::new(config.skip_ids.clone()));
    if let Some(path) = config.skip_file.clone() {
        skip = skip.with(FileSkipList::new(path));
    }

    let fetcher = FetchOrchestrator::new(
        transport,
        parser,
        cache,
        health.clone(),
        FetchSettings::from_config(&config)?,
    );
    let settings = RefreshSettings::from_config(&config)?;
    let sources = config.take_enabled_sources();
    if sources.is_empty() {
        tracing::warn!("No enabled sources configured; the window will stay empty");
    }

    Ok(RefreshOrchestrator::new(
        fetcher,
        sources,
        Arc::new(EventWindow::new()),
        Arc::new(skip),
        health,
        settings,
    ))
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Received Ctrl-C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Received Ctrl-C, shutting down");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?;

    let orchestrator = build_orchestrator(config)?;

    if args.once {
        let outcome = orchestrator.run_cycle().await;
        if let CycleOutcome::Failed { reason } = &outcome {
            tracing::error!(reason = %reason, "Refresh failed");
        }
        let snapshot = orchestrator.window().snapshot();
        let json = serde_json::to_string_pretty(&*snapshot).context("Failed to serialize window")?;
        println!("{json}");
        return Ok(());
    }

    let handle = Arc::new(orchestrator).spawn();
    wait_for_shutdown().await?;
    handle.stop().await;
    Ok(())
}
