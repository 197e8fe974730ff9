// Scheduler binary entry point
// The external trigger: one-shot ticks, a minute loop, listing and manual runs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::bootstrap;
use common::config::Settings;
use common::scheduler::{RunOutcome, Scheduler, SchedulerEngine};
use common::telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "scheduler")]
#[command(version)]
#[command(about = "Cadence task scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding default.toml and local.toml
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Evaluate once against the current minute, then wait for background runs
    Run,
    /// Evaluate every tick until Ctrl+C
    Work,
    /// Print every task with its expression and next due time
    List,
    /// Run one task now, ignoring its schedule
    Test {
        /// Task name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config_dir)
        .with_context(|| format!("Failed to load configuration from {}", cli.config_dir.display()))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.json_logs,
    )?;
    if let Some(port) = settings.observability.metrics_port {
        if cli.command == Command::Work {
            telemetry::init_metrics(port)?;
        }
    }

    info!(
        timezone = %settings.scheduler.timezone,
        lock_backend = ?settings.lock.backend,
        declared_tasks = settings.tasks.len(),
        "Configuration loaded"
    );

    let engine = bootstrap::build_engine(&settings, None).await?;

    match cli.command {
        Command::Run => run_once(&engine).await,
        Command::Work => work(Arc::new(engine)).await,
        Command::List => {
            list(&engine);
            Ok(())
        }
        Command::Test { name } => test_task(&engine, &name).await,
    }
}

async fn run_once(engine: &SchedulerEngine) -> Result<()> {
    let report = engine.evaluate_now().await;
    info!(
        due = report.due_count(),
        started = report.started_count(),
        skipped = report.skipped_count(),
        "Evaluation complete"
    );

    let grace = Duration::from_secs(engine.config().shutdown_grace_seconds);
    let still_running = engine.wait_for_background(grace).await;
    if still_running > 0 {
        warn!(still_running = still_running, "Exiting with background runs in flight");
    }
    Ok(())
}

async fn work(engine: Arc<SchedulerEngine>) -> Result<()> {
    let engine_for_shutdown = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Err(e) = engine_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    engine.start().await
}

fn list(engine: &SchedulerEngine) {
    let timezone = engine.config().timezone;
    let tasks = engine.list();
    if tasks.is_empty() {
        println!("No scheduled tasks have been defined.");
        return;
    }

    let width = tasks.iter().map(|t| t.expression.len()).max().unwrap_or(0);
    for task in tasks {
        let next_due = task
            .next_due
            .map(|at| at.with_timezone(&timezone).format("%Y-%m-%d %H:%M:%S %Z").to_string())
            .unwrap_or_else(|| "never".to_string());
        let mut flags = Vec::new();
        if task.without_overlapping {
            flags.push("no-overlap");
        }
        if task.run_in_background {
            flags.push("background");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!(
            "{:<width$}  {}  {}{}  Next Due: {}",
            task.expression,
            task.name,
            task.description.as_deref().unwrap_or(&task.action),
            flags,
            next_due,
            width = width
        );
    }
}

async fn test_task(engine: &SchedulerEngine, name: &str) -> Result<()> {
    let outcome = engine.run_task_now(name).await?;
    match outcome {
        RunOutcome::Skipped { reason, .. } => {
            println!("Task '{}' skipped: {}", name, reason.as_str());
        }
        RunOutcome::HookFailed { error, .. } => {
            println!("{}", error);
        }
        outcome => {
            if let Some(result) = outcome.into_result().await {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
                println!(
                    "Task '{}' finished: {} ({:.2}s)",
                    name,
                    result.status,
                    result.duration_seconds()
                );
            }
        }
    }
    Ok(())
}
