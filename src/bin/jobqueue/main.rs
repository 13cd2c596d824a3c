mod queue;
mod scaffold;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobqueue::config::{BrokerConfig, load_queues};
use jobqueue::{JobRegistry, PgBroker, QueueRegistry, Runner, jobs, setup_database};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Background job dispatch and processing
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Queue configuration file
    #[arg(long, global = true, default_value = "queues.toml")]
    queues: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers for every configured queue until SIGINT or SIGTERM
    Work {
        /// Apply database migrations before starting
        #[arg(long)]
        migrate: bool,
    },
    /// Apply database migrations
    Migrate,
    /// Inspect and maintain queues
    #[command(subcommand)]
    Queue(queue::QueueCommand),
    /// Scaffold jobs, queues, events and listeners
    Make {
        /// Source directory of the application
        #[arg(long, default_value = "src")]
        src: PathBuf,

        #[command(subcommand)]
        command: scaffold::MakeCommand,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

fn queue_registry(queues_path: &Path) -> Result<(QueueRegistry, PgBroker)> {
    let broker_config = BrokerConfig::from_env()?;
    info!(?broker_config, "Using broker");
    let broker = PgBroker::connect_lazy(&broker_config);

    let configs = load_queues(queues_path)
        .with_context(|| format!("failed to load {}", queues_path.display()))?;
    let queues = QueueRegistry::new(Arc::new(broker.clone()), configs)?;
    Ok((queues, broker))
}

async fn work(queues_path: &Path, migrate: bool) -> Result<()> {
    let (queues, broker) = queue_registry(queues_path)?;
    if migrate {
        setup_database(broker.pool()).await?;
    }

    let mut job_registry = JobRegistry::new();
    jobs::register_all(&mut job_registry)?;

    let handle = Runner::new(Arc::new(queues), Arc::new(job_registry)).start();

    shutdown_signal().await?;
    info!("Received shutdown signal. Waiting for in-flight jobs…");
    handle.shutdown_and_wait().await;
    info!("All workers shut down gracefully");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Work { migrate } => work(&cli.queues, migrate).await,
        Command::Migrate => {
            let (_, broker) = queue_registry(&cli.queues)?;
            setup_database(broker.pool()).await?;
            println!("Migrations applied");
            Ok(())
        }
        Command::Queue(command) => {
            let (queues, _) = queue_registry(&cli.queues)?;
            queue::run(command, &queues, &mut std::io::stdout()).await
        }
        Command::Make { src, command } => {
            let project = scaffold::Project {
                src,
                queues: cli.queues,
            };
            scaffold::run(command, &project, &mut std::io::stdout())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
