use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast;

use batchgen::config::Config;
use batchgen::generation::{PollResponse, SubmitItem};
use batchgen::orchestrator::Orchestrator;
use batchgen::scheduler::{run_cycle, Scheduler};
use batchgen::store::JobListFilter;
use batchgen::{
    load_config_or_default, resolve_secret, Database, DirectorySink, GeminiClient,
    GenerationClient, ItemQueue, JobStatus, JobStore, JsonlItemQueue, PollError, Reconciler,
    Result, SubmissionError,
};

#[derive(Parser)]
#[command(name = "batchgen", version, about = "Batch image-generation orchestrator")]
struct Cli {
    /// Config file (default: ~/.batchgen/config.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit, poll and reconcile on the configured interval until Ctrl-C
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Submit one batch from the queue
    Submit,
    /// Poll every due job once
    Tick,
    /// Deliver completed items and surface failed ones
    Reconcile,
    /// Show a job with its items
    Status { job_id: String },
    /// Cancel a job that has not finished
    Cancel { job_id: String },
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 20)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Job and item counts
    Stats,
    /// Fail jobs left pending by an interrupted run
    Recover,
}

/// Stand-in client for commands that never reach the provider.
struct NoProvider;

#[async_trait]
impl GenerationClient for NoProvider {
    async fn submit(&self, _items: &[SubmitItem]) -> std::result::Result<String, SubmissionError> {
        Err(SubmissionError::Request(
            "provider is not configured for this command".to_string(),
        ))
    }

    async fn poll(&self, _external_job_id: &str) -> std::result::Result<PollResponse, PollError> {
        Err(PollError::Transient(
            "provider is not configured for this command".to_string(),
        ))
    }
}

fn provider_client(config: &Config) -> Result<Arc<dyn GenerationClient>> {
    let provider = &config.provider;
    let api_key = resolve_secret(
        provider.api_key.as_deref(),
        provider.api_key_file.as_deref(),
        provider.api_key_env.as_deref(),
    )?;
    Ok(Arc::new(GeminiClient::new(provider, api_key)?))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config_or_default(cli.config.as_deref())?;
    let db = Database::open(&config.database_path())?;
    let store = JobStore::new(db, config.orchestrator.persistence_retry_attempts);

    let needs_provider = matches!(
        cli.command,
        Command::Run { .. } | Command::Submit | Command::Tick
    );
    let client: Arc<dyn GenerationClient> = if needs_provider {
        provider_client(&config)?
    } else {
        Arc::new(NoProvider)
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        store.clone(),
        client,
    ));
    let reconciler = Arc::new(Reconciler::new(
        store,
        Arc::new(DirectorySink::new(config.sink.directory())),
    ));
    let queue: Arc<dyn ItemQueue> = Arc::new(JsonlItemQueue::new(config.queue.path()));

    match cli.command {
        Command::Run { once } => {
            let recovered = orchestrator.recover_interrupted()?;
            if recovered > 0 {
                log::warn!("Marked {} interrupted jobs as failed", recovered);
            }

            if once {
                let rt = tokio::runtime::Runtime::new()?;
                let report =
                    rt.block_on(run_cycle(&orchestrator, &reconciler, Some(queue.as_ref())));
                return print_json(&report);
            }

            let scheduler = Arc::new(Scheduler::new(
                Arc::clone(&orchestrator),
                Arc::clone(&reconciler),
                Some(queue),
                config.orchestrator.poll_interval(),
            ));
            let (trigger_tx, trigger_rx) = broadcast::channel(16);
            let handle = scheduler.start(trigger_rx);

            let stopper = Arc::clone(&scheduler);
            if let Err(e) = ctrlc::set_handler(move || {
                log::info!("Shutdown requested");
                stopper.stop();
                let _ = trigger_tx.send(());
            }) {
                log::warn!("Failed to install Ctrl-C handler: {}", e);
            }

            log::info!(
                "batchgen v{} running every {:?}",
                env!("CARGO_PKG_VERSION"),
                config.orchestrator.poll_interval()
            );
            if handle.join().is_err() {
                log::error!("Scheduler thread panicked");
            }
            Ok(())
        }
        Command::Submit => {
            let rt = tokio::runtime::Runtime::new()?;
            match rt.block_on(orchestrator.submit_from_queue(queue.as_ref()))? {
                Some(job) => print_json(&job),
                None => {
                    log::info!("Queue is empty");
                    Ok(())
                }
            }
        }
        Command::Tick => {
            let rt = tokio::runtime::Runtime::new()?;
            print_json(&rt.block_on(orchestrator.tick())?)
        }
        Command::Reconcile => {
            let rt = tokio::runtime::Runtime::new()?;
            print_json(&rt.block_on(reconciler.run())?)
        }
        Command::Status { job_id } => print_json(&orchestrator.job_status(&job_id)?),
        Command::Cancel { job_id } => print_json(&orchestrator.cancel(&job_id)?),
        Command::List {
            status,
            limit,
            offset,
        } => print_json(&orchestrator.list(&JobListFilter {
            status,
            limit: Some(limit),
            offset: Some(offset),
        })?),
        Command::Stats => print_json(&orchestrator.statistics()?),
        Command::Recover => {
            let recovered = orchestrator.recover_interrupted()?;
            print_json(&serde_json::json!({ "recovered": recovered }))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    batchgen::logging::init(cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
