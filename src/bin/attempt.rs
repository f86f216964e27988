//! attempt CLI: run one scheduled work item on this worker.

use attempt_rs::TaskAttemptExecutor;
use attempt_rs::config::{AttemptConfig, WorkerConfig};
use attempt_rs::engine::{HookRunner, MultiTaskAttemptBuilder};
use attempt_rs::flatten::flatten;
use attempt_rs::job_state::JobStateLoader;
use attempt_rs::model::{DescriptorLocation, JobId, TerminalResult};
use attempt_rs::storage::{FsBlobStore, StateStores};
use attempt_rs::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "attempt", about = "Run scheduled work items on this worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task attempt and print its terminal result
    Run {
        /// Attempt configuration file (TOML: job.name, job.id, work.unit.file.path)
        config: PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the flattened units of a stored work descriptor
    Show {
        /// Descriptor location, `<store>/<file>`
        path: String,
    },
    /// List the task states committed for a job
    States {
        /// Job id (job_<name>_<sequence>)
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;
    let stores = StateStores::shared(Arc::new(FsBlobStore::new(&config.state_store_root)));

    match cli.command {
        Command::Run { config: file, json } => cmd_run(config, stores, file, json).await,
        Command::Show { path } => cmd_show(&stores, &path),
        Command::States { job_id } => cmd_states(&stores, &job_id),
    }
}

async fn cmd_run(
    config: WorkerConfig,
    stores: StateStores,
    file: PathBuf,
    json: bool,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "attempt-worker".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let text = tokio::fs::read_to_string(&file).await?;
    let attempt_config = AttemptConfig::from_toml_str(&text)?;

    let builder = MultiTaskAttemptBuilder::new(Arc::new(HookRunner::default()), stores.clone());
    let executor = Arc::new(TaskAttemptExecutor::new(
        attempt_config,
        stores,
        JobStateLoader::new(&config.app_work_dir),
        Arc::new(builder),
    ));

    let runner = Arc::clone(&executor);
    let mut attempt = tokio::task::spawn_blocking(move || runner.start());

    let finished = tokio::select! {
        done = &mut attempt => Some(done?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("interrupt received, cancelling attempt");
            let canceller = Arc::clone(&executor);
            let outcome = tokio::task::spawn_blocking(move || canceller.cancel()).await??;
            tracing::info!(?outcome, "cancel finished");
            attempt.await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{result}");
    }

    match result {
        TerminalResult::Completed { .. } => Ok(()),
        other => anyhow::bail!("attempt {} did not complete: {}", executor.id(), other.state()),
    }
}

fn cmd_show(stores: &StateStores, path: &str) -> anyhow::Result<()> {
    let location = DescriptorLocation::parse(path)?;
    let descriptor = stores.load_descriptor(&location)?;
    let units = flatten(&descriptor);

    println!("{location}: {} unit(s)", units.len());
    for (i, unit) in units.iter().enumerate() {
        println!("  [{i}] {}", serde_json::to_string(&unit.properties)?);
    }
    Ok(())
}

fn cmd_states(stores: &StateStores, job_id: &str) -> anyhow::Result<()> {
    let job_id = JobId::parse(job_id)?;
    let states = stores.task_states(&job_id)?;

    if states.is_empty() {
        println!("No task states for {job_id}.");
        return Ok(());
    }

    println!(
        "{:<32} {:<10} {:>10}  ERROR",
        "TASK", "STATUS", "MS"
    );
    for s in &states {
        println!(
            "{:<32} {:<10} {:>10}  {}",
            s.task_id,
            s.status,
            s.duration_ms(),
            s.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
