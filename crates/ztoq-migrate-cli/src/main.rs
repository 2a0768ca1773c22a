//! ztoq-migrate CLI - resumable Zephyr to qTest migration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use ztoq_migrate::{
    CheckpointStore, Config, ExportDirFetcher, FileStagingStore, FileStateBackend, JsonlLoader,
    MemoryStagingStore, MemoryStateBackend, MigrateError, Phase, RunSnapshot, StagingStore,
    StateBackend, StateBackendKind, WorkflowController,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "ztoq-migrate")]
#[command(about = "Resumable Zephyr to qTest migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration run for a project
    Run {
        /// Source project key
        #[arg(long)]
        project_key: String,

        /// Override records per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override number of concurrent batch workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// Override directory holding attachment binaries
        #[arg(long)]
        attachments_dir: Option<PathBuf>,
    },

    /// Resume a paused, failed or interrupted run
    Resume {
        #[arg(long)]
        run_id: String,
    },

    /// Show progress, failures and the last error of a run
    Status {
        /// Run to inspect
        #[arg(long, conflicts_with = "project_key", required_unless_present = "project_key")]
        run_id: Option<String>,

        /// Inspect the most recent run of this project
        #[arg(long)]
        project_key: Option<String>,
    },

    /// Remove checkpoints and staged data of a run
    Cleanup {
        #[arg(long)]
        run_id: String,

        /// Delete the run record as well
        #[arg(long)]
        purge: bool,
    },

    /// Drive a run through transform, then pause
    Transform {
        #[arg(long)]
        run_id: String,
    },

    /// Drive a run through validate, then pause
    Validate {
        #[arg(long)]
        run_id: String,
    },

    /// Drive a run through load
    Load {
        #[arg(long)]
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            project_key,
            batch_size,
            max_workers,
            attachments_dir,
        } => {
            // Apply overrides
            if let Some(size) = batch_size {
                config.migration.batch_size = size;
            }
            if let Some(w) = max_workers {
                config.migration.max_workers = Some(w);
            }
            if let Some(dir) = attachments_dir {
                config.migration.attachments_dir = Some(dir);
            }
            let config = config.with_auto_tuning();

            let controller = build_controller(&config, true).await?;
            setup_signal_handler(controller.clone());

            let run_id = controller.start(&project_key, config.migration).await?;
            let snapshot = controller.status(&run_id).await?;
            print_snapshot(&snapshot, cli.output_json)?;
        }

        Commands::Resume { run_id } => {
            let controller = build_controller(&config, true).await?;
            setup_signal_handler(controller.clone());

            info!("Resuming run {}", run_id);
            controller.resume(&run_id).await?;
            let snapshot = controller.status(&run_id).await?;
            print_snapshot(&snapshot, cli.output_json)?;
        }

        Commands::Transform { run_id } => {
            advance(&config, &run_id, Phase::Transform, cli.output_json).await?;
        }

        Commands::Validate { run_id } => {
            advance(&config, &run_id, Phase::Validate, cli.output_json).await?;
        }

        Commands::Load { run_id } => {
            advance(&config, &run_id, Phase::Load, cli.output_json).await?;
        }

        Commands::Status {
            run_id,
            project_key,
        } => {
            let store = CheckpointStore::new(state_backend(&config));
            store.init().await?;

            let run_id = match (run_id, project_key) {
                (Some(run_id), _) => run_id,
                (None, Some(project_key)) => store
                    .latest_run(&project_key)
                    .await?
                    .map(|run| run.run_id)
                    .ok_or_else(|| {
                        MigrateError::RunNotFound(format!("no runs for project {}", project_key))
                    })?,
                (None, None) => {
                    return Err(MigrateError::Config(
                        "--run-id or --project-key is required".to_string(),
                    ))
                }
            };

            let snapshot = store.snapshot(&run_id).await?;
            print_snapshot(&snapshot, cli.output_json)?;
        }

        Commands::Cleanup { run_id, purge } => {
            let controller = build_controller(&config, false).await?;
            let report = controller.cleanup(&run_id, purge).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Cleaned up run {}", report.run_id);
                println!("  Checkpoints removed: {}", report.checkpoints_removed);
                println!("  Staging purged: {}", report.staging_purged);
                println!("  Run deleted: {}", report.run_deleted);
            }
        }
    }

    Ok(())
}

/// Drive a run up to `phase` and print where it stopped.
async fn advance(
    config: &Config,
    run_id: &str,
    phase: Phase,
    output_json: bool,
) -> Result<(), MigrateError> {
    let controller = build_controller(config, true).await?;
    setup_signal_handler(controller.clone());

    controller.advance_to(run_id, phase).await?;
    let snapshot = controller.status(run_id).await?;
    print_snapshot(&snapshot, output_json)
}

fn state_backend(config: &Config) -> Arc<dyn StateBackend> {
    match config.state.backend {
        StateBackendKind::File => Arc::new(FileStateBackend::new(config.state.dir.join("runs"))),
        StateBackendKind::Memory => Arc::new(MemoryStateBackend::new()),
    }
}

fn staging_store(config: &Config) -> Arc<dyn StagingStore> {
    match config.state.backend {
        StateBackendKind::File => Arc::new(FileStagingStore::new(config.state.dir.join("staging"))),
        StateBackendKind::Memory => Arc::new(MemoryStagingStore::new()),
    }
}

/// Build the controller over the configured export and output directories.
///
/// With `drive` unset the collaborators are never called, so missing
/// directories fall back to the state directory.
async fn build_controller(
    config: &Config,
    drive: bool,
) -> Result<Arc<WorkflowController>, MigrateError> {
    let export_dir = match (&config.source.export_dir, drive) {
        (Some(dir), _) => dir.clone(),
        (None, true) => {
            return Err(MigrateError::Config(
                "source.export_dir is required".to_string(),
            ))
        }
        (None, false) => config.state.dir.clone(),
    };
    let output_dir = match (&config.target.output_dir, drive) {
        (Some(dir), _) => dir.clone(),
        (None, true) => {
            return Err(MigrateError::Config(
                "target.output_dir is required".to_string(),
            ))
        }
        (None, false) => config.state.dir.clone(),
    };

    let controller = WorkflowController::new(
        Arc::new(ExportDirFetcher::new(export_dir)),
        Arc::new(JsonlLoader::new(output_dir)),
        state_backend(config),
        staging_store(config),
    );
    controller.init().await?;
    Ok(Arc::new(controller))
}

fn print_snapshot(snapshot: &RunSnapshot, output_json: bool) -> Result<(), MigrateError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    let run = &snapshot.run;
    println!("\nRun {}", run.run_id);
    println!("  Project: {}", run.project_key);
    println!("  Status: {}", run.status);
    println!("  Phase: {}", run.phase);
    println!("  Records committed: {}", snapshot.records_committed);
    println!("  Records failed: {}", snapshot.records_failed);

    if !snapshot.entities.is_empty() {
        println!("\n  Progress:");
        for entity in &snapshot.entities {
            let total = entity
                .progress
                .estimated_total
                .map(|t| format!("/{}", t))
                .unwrap_or_default();
            println!(
                "    {:<9} {:<11} {}{} records at {}{}",
                entity.phase.to_string(),
                entity.entity_type.to_string(),
                entity.progress.records_committed,
                total,
                entity.checkpoint,
                if entity.complete { " (complete)" } else { "" }
            );
        }
    }

    if !snapshot.failed_batches.is_empty() {
        println!("\n  Failed batches: {}", snapshot.failed_batches.len());
    }
    if let Some(ref err) = snapshot.last_error {
        println!("\n  Last error ({} in {}): {}", err.kind, err.phase, err.message);
    }
    if let Some(ref perf) = snapshot.performance {
        println!(
            "\n  Operations: {} (avg {:.1}ms, error rate {:.1}%)",
            perf.summary.total_operations,
            perf.summary.avg_operation_time_ms,
            perf.summary.error_rate * 100.0
        );
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Pause the run on SIGINT (Ctrl-C) or SIGTERM.
/// In-flight batches finish and commit before the command returns.
#[cfg(unix)]
fn setup_signal_handler(controller: Arc<WorkflowController>) {
    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let controller = controller.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Pausing after in-flight batches...", name);
                    controller.pause();
                });
            }
            Err(e) => warn!("Failed to set up {} handler: {}", name, e),
        }
    }
}

/// Windows only delivers Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler(controller: Arc<WorkflowController>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Pausing after in-flight batches...");
                controller.pause();
            }
            Err(e) => warn!("Failed to set up Ctrl-C handler: {}", e),
        }
    });
}
