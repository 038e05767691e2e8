use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use autosubmit_core::AutosubmitConfig;
use autosubmit_scheduler::{
    ClaimEngine, Dispatcher, DispatchWorker, Executor, HttpExecutor, JobStore, ReconcileWorker,
    Reconciler,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

mod app;
mod http;

#[derive(Parser)]
#[command(name = "autosubmit", version, about = "Crash-safe scheduled submission service")]
struct Cli {
    /// Config file. Falls back to $AUTOSUBMIT_CONFIG, then ~/.autosubmit/autosubmit.toml.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Owner API plus dispatch and reconcile workers (default).
    Serve,
    /// Dispatch and reconcile workers without the API.
    Worker,
    /// Claim and dispatch one batch, print the summary, exit.
    ClaimOnce,
    /// Sweep expired claims once, print the report, exit.
    ReconcileOnce,
    /// Schedule a job on behalf of an owner.
    Submit {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        target: String,
        /// RFC 3339 due time; defaults to now.
        #[arg(long, conflicts_with = "in_secs")]
        at: Option<DateTime<Utc>>,
        /// Due time relative to now.
        #[arg(long)]
        in_secs: Option<i64>,
    },
    /// Print an owner's jobs, newest first.
    List {
        #[arg(long)]
        owner: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "autosubmit_gateway=info,autosubmit_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > AUTOSUBMIT_CONFIG env > ~/.autosubmit/autosubmit.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("AUTOSUBMIT_CONFIG").ok());
    let config = AutosubmitConfig::load(config_path.as_deref())?;

    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, "opening SQLite database");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Worker => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handles = spawn_workers(&config, shutdown_rx)?;
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
            for handle in handles {
                handle.await?;
            }
            Ok(())
        }
        Command::ClaimOnce => {
            let worker = dispatch_worker(&config)?;
            let summary = worker.tick().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::ReconcileOnce => {
            let report = Reconciler::new(open_store(&config)?, &config.scheduler)
                .reconcile_once(Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Submit {
            owner,
            target,
            at,
            in_secs,
        } => {
            let not_before = match (at, in_secs) {
                (Some(at), _) => at,
                (None, Some(secs)) => chrono::Duration::try_seconds(secs)
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                    .ok_or_else(|| anyhow::anyhow!("--in-secs {secs} is out of range"))?,
                (None, None) => Utc::now(),
            };
            let job = open_store(&config)?
                .for_owner(&owner)
                .create(&target, not_before)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::List { owner } => {
            let jobs = open_store(&config)?.for_owner(&owner).list()?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
    }
}

async fn serve(config: AutosubmitConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_workers(&config, shutdown_rx)?;

    let addr: SocketAddr = format!("{}:{}", config.api.bind, config.api.port).parse()?;
    let jobs = open_store(&config)?;
    let state = Arc::new(app::AppState::new(config, jobs));
    let router = app::build_router(state);

    info!("autosubmit API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // in-flight ticks finish writing their statuses before the workers exit
    let _ = shutdown_tx.send(true);
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

/// Each component gets its own connection; they coordinate only through the database.
fn open_store(config: &AutosubmitConfig) -> anyhow::Result<Arc<JobStore>> {
    let store = JobStore::open(
        &config.database.path,
        Duration::from_millis(config.database.store_timeout_ms),
    )?;
    Ok(Arc::new(store))
}

fn dispatch_worker(config: &AutosubmitConfig) -> anyhow::Result<DispatchWorker> {
    let timeout = Duration::from_secs(config.scheduler.execution_timeout_secs);
    let executor: Arc<dyn Executor> = Arc::new(HttpExecutor::new(&config.executor, timeout)?);
    info!(executor = executor.name(), url = %config.executor.url, "executor configured");

    let store = open_store(config)?;
    let claim = ClaimEngine::new(Arc::clone(&store), &config.scheduler);
    let dispatcher = Dispatcher::new(store, executor, &config.scheduler);
    Ok(DispatchWorker::new(claim, dispatcher, &config.scheduler))
}

fn spawn_workers(
    config: &AutosubmitConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let dispatch = dispatch_worker(config)?;
    let reconcile = ReconcileWorker::new(
        Reconciler::new(open_store(config)?, &config.scheduler),
        &config.scheduler,
    );

    let dispatch_shutdown = shutdown.clone();
    Ok(vec![
        tokio::spawn(async move { dispatch.run(dispatch_shutdown).await }),
        tokio::spawn(async move { reconcile.run(shutdown).await }),
    ])
}
