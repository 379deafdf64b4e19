mod api;
mod config;
mod dispatcher;
mod history;
mod metrics;
mod policy;
mod retention;
mod runner;
mod sandbox;
mod store;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, LoggingConfig};
use dispatcher::Dispatcher;
use history::HistoryService;
use metrics::MetricsCollector;
use runner::Runner;
use sandbox::SafeExecutor;
use store::{FsJobStore, JobStore};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (.yaml, .yml or .toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Node identity, overrides the config file and SANDRUN_IDENTITY
    #[arg(long, global = true)]
    identity: Option<String>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single dispatch cycle and retention sweep, then exit
    RunOnce,
    /// Dispatch continuously and serve the history API
    Serve {
        /// Override server.bind_addr
        #[arg(long)]
        bind: Option<String>,
        /// Override server.poll_interval (e.g. "30s")
        #[arg(long)]
        interval: Option<String>,
    },
    /// Delete finished records past the retention window
    Sweep {
        /// Override retention.completed_after (e.g. "7d")
        #[arg(long)]
        older_than: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    setup_logging(&config.logging, cli.log_level.as_deref())?;
    let identity = config.resolve_identity(cli.identity)?;
    log::info!("Starting sandrun-daemon for {}...", identity);

    let queue_dir = config.queue_dir();
    let store: Arc<dyn JobStore> = Arc::new(
        FsJobStore::open(&queue_dir).with_context(|| format!("Failed to open job queue at {:?}", queue_dir))?,
    );
    log::info!("Using job queue at {:?}", queue_dir);

    match cli.command {
        Commands::RunOnce => {
            let runner = build_runner(&config, store, Arc::new(MetricsCollector::new()), &identity);
            match runner.run_once().await {
                Some(report) => {
                    log::info!(
                        "Run finished: {} started, {} completed, {} failed",
                        report.started.len(),
                        report.completed,
                        report.failed
                    );
                }
                None => std::process::exit(1),
            }
        }
        Commands::Serve { bind, interval } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(interval) = interval {
                config.server.poll_interval = common::parse_duration(&interval)?;
            }
            config.validate()?;
            serve(config, store, identity).await?;
        }
        Commands::Sweep { older_than } => {
            let window = match older_than {
                Some(s) => common::parse_duration(&s)?,
                None => config.retention.completed_after,
            };
            let runner = build_runner(&config, store, Arc::new(MetricsCollector::new()), &identity);
            let report = runner.sweep(window).await?;
            println!(
                "Removed {} record(s) older than {} ({} failed)",
                report.deleted,
                common::format_duration(window),
                report.failed
            );
        }
    }

    Ok(())
}

fn build_runner(
    config: &Config,
    store: Arc<dyn JobStore>,
    metrics: Arc<MetricsCollector>,
    identity: &str,
) -> Runner<SafeExecutor> {
    let executor = SafeExecutor::new(config.sandbox.clone());
    let dispatcher = Dispatcher::new(store.clone(), executor, metrics.clone())
        .with_mode(config.server.execution_mode)
        .with_stale_after(config.sandbox.stale_after());
    Runner::new(
        dispatcher,
        store,
        metrics,
        identity,
        config.server.max_concurrent_jobs as usize,
    )
    .with_retention(config.retention.completed_after, config.sandbox.output_root.clone())
}

async fn serve(config: Config, store: Arc<dyn JobStore>, identity: String) -> anyhow::Result<()> {
    let metrics = Arc::new(MetricsCollector::new());
    let runner = Arc::new(build_runner(&config, store.clone(), metrics.clone(), &identity));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let loop_handle = {
        let runner = runner.clone();
        let interval = config.server.poll_interval;
        tokio::spawn(async move { runner.run_forever(interval, shutdown_rx).await })
    };

    let state = api::AppState {
        history: HistoryService::new(store, identity, config.sandbox.output_root.clone()),
        metrics,
        stale_after: config.sandbox.stale_after(),
        dispatcher: format!("{:?}", config.server.execution_mode).to_lowercase(),
    };
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    log::info!("History API listening on {}", config.server.bind_addr);

    let mut api_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(listener, api::router(state)).with_graceful_shutdown(async move {
        let _ = api_shutdown.changed().await;
    });
    let server_handle = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    log::info!("Shutdown requested, waiting for the current cycle to finish...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = loop_handle.await {
        log::error!("Dispatcher loop ended abnormally: {}", e);
    }
    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => log::error!("HTTP server error: {}", e),
        Ok(Err(e)) => log::error!("HTTP server task failed: {}", e),
        Err(_) => log::warn!("HTTP server did not stop within 5s"),
    }
    log::info!("sandrun-daemon stopped");
    Ok(())
}

fn setup_logging(logging: &LoggingConfig, level_override: Option<&str>) -> anyhow::Result<()> {
    let level_name = level_override.unwrap_or(&logging.level);
    let level: log::LevelFilter = level_name
        .parse()
        .with_context(|| format!("Invalid log level: {}", level_name))?;

    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    // Main log: everything except job output
    let mut main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "job_output")
        .chain(std::io::stdout());
    if let Some(path) = &logging.output {
        main_log = main_log.chain(
            fern::log_file(path).with_context(|| format!("Failed to open log file {:?}", path))?,
        );
    }

    let mut dispatch = base_config.chain(main_log);

    // Jobs log file: only job_output, and only when configured
    if let Some(path) = &logging.jobs_output {
        let jobs_log = fern::Dispatch::new()
            .filter(|metadata| metadata.target() == "job_output")
            .chain(fern::log_file(path).with_context(|| format!("Failed to open jobs log {:?}", path))?);
        dispatch = dispatch.chain(jobs_log);
    }

    dispatch.apply()?;
    Ok(())
}
