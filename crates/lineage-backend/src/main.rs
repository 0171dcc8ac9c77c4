//! Lineage Backend - worker manager entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use lineage_common::logging::{init_logging, LogConfig, LogLevel};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use lineage_backend::{
    config::Config,
    dataset::Datasets,
    db,
    manager::WorkerManager,
    processor::RunnerEnv,
    processors::builtin_registry,
    queue::JobQueue,
    store::PgStore,
};

#[derive(Parser, Debug)]
#[command(name = "lineage-backend")]
#[command(author, version, about = "Lineage processing backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker manager until interrupted
    Run,

    /// Apply database migrations and exit
    Migrate,

    /// List queued jobs
    Jobs {
        /// Only show jobs of this type
        #[arg(short, long)]
        jobtype: Option<String>,
    },

    /// Release every claimed job
    Release,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("lineage-backend".to_string())
        .filter_directives("lineage_backend=debug,sqlx=warn".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().with_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    let config = Config::load()?;
    info!(data_dir = %config.storage.data_dir.display(), "Configuration loaded");

    let pool = db::create_pool(&config.database).await?;

    match cli.command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
        },
        Command::Jobs { jobtype } => {
            let queue = JobQueue::new(Arc::new(PgStore::new(pool)));
            for job in queue.all_jobs(jobtype.as_deref()).await? {
                info!(
                    job_id = job.id,
                    jobtype = %job.jobtype,
                    remote_id = %job.remote_id,
                    claimed = job.is_claimed(),
                    attempts = job.attempts,
                    "Queued job"
                );
            }
        },
        Command::Release => {
            let queue = JobQueue::new(Arc::new(PgStore::new(pool)));
            let released = queue.release_all().await?;
            info!(released, "Released claimed jobs");
        },
        Command::Run => {
            db::run_migrations(&pool).await?;

            let store = Arc::new(PgStore::new(pool));
            let env = RunnerEnv {
                queue: JobQueue::new(store.clone()),
                datasets: Datasets::new(store, config.storage.data_dir.clone()),
                registry: Arc::new(builtin_registry()),
                config: config.workers.clone(),
            };

            let manager = WorkerManager::new(env);
            let handle = manager.handle();
            let task = manager.start();

            shutdown_signal().await;
            handle.shutdown();
            task.await?;
        },
    }

    info!("Done");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => tracing::error!("Failed to install signal handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
