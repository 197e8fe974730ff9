// Scheduler engine implementation

use super::dispatcher::{Dispatcher, RunOutcome};
use crate::clock::Clock;
use crate::errors::ScheduleError;
use crate::models::{TaskDefinition, DEFAULT_OVERLAP_EXPIRY};
use crate::registry::TaskRegistry;
use crate::schedule::{default_timezone, truncate_to_minute, ScheduleTrigger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Reference timezone for every due-time comparison
    pub timezone: Tz,
    /// Seconds between ticks of the built-in loop
    pub tick_interval_seconds: u64,
    /// Lock lifetime for tasks that do not set their own
    pub default_overlap_expiry: Duration,
    /// When this file exists the scheduler is in maintenance mode
    pub maintenance_marker: Option<PathBuf>,
    /// How long `stop` waits for background runs
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            tick_interval_seconds: 60,
            default_overlap_expiry: DEFAULT_OVERLAP_EXPIRY,
            maintenance_marker: None,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Scheduler trait for the host-facing lifecycle
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the tick loop until `stop` is called
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop the loop and wait for background runs
    async fn stop(&self) -> anyhow::Result<()>;

    /// One evaluation tick against the current time
    async fn evaluate_now(&self) -> TickReport;
}

/// One task's outcome within a tick
#[derive(Debug)]
pub struct TaskRun {
    pub task_name: String,
    /// `None` when the dispatch itself panicked
    pub outcome: Option<RunOutcome>,
}

/// What one evaluation tick did
#[derive(Debug)]
pub struct TickReport {
    pub evaluated_at: DateTime<Utc>,
    pub maintenance: bool,
    pub runs: Vec<TaskRun>,
}

impl TickReport {
    pub fn due_count(&self) -> usize {
        self.runs.len()
    }

    pub fn started_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|run| run.outcome.as_ref().map_or(false, RunOutcome::started))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|run| run.outcome.as_ref().map_or(false, RunOutcome::is_skipped))
            .count()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.runs.iter().map(|run| run.task_name.as_str()).collect()
    }

    pub fn outcome_for(&self, task_name: &str) -> Option<&RunOutcome> {
        self.runs
            .iter()
            .find(|run| run.task_name == task_name)
            .and_then(|run| run.outcome.as_ref())
    }

    /// Consume the report, waiting for every started run to finish
    pub async fn into_results(self) -> Vec<crate::models::ExecutionResult> {
        let mut results = Vec::new();
        for run in self.runs {
            if let Some(outcome) = run.outcome {
                if let Some(result) = outcome.into_result().await {
                    results.push(result);
                }
            }
        }
        results
    }
}

/// A registered task as shown by `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub name: String,
    pub expression: String,
    pub description: Option<String>,
    pub action: String,
    pub next_due: Option<DateTime<Utc>>,
    pub without_overlapping: bool,
    pub run_in_background: bool,
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: SchedulerConfig,
    registry: RwLock<TaskRegistry>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    maintenance: AtomicBool,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    /// `true` while the tick loop is running or draining
    loop_running: watch::Sender<bool>,
}

impl SchedulerEngine {
    /// Create a new scheduler engine
    pub fn new(
        config: SchedulerConfig,
        registry: TaskRegistry,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
        let (loop_running, _) = watch::channel(false);
        let dispatcher = dispatcher
            .with_clock(clock.clone())
            .with_default_overlap_expiry(config.default_overlap_expiry);

        Self {
            config,
            registry: RwLock::new(registry),
            dispatcher,
            clock,
            maintenance: AtomicBool::new(false),
            shutdown_tx,
            loop_running,
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register or replace a task definition
    pub fn register(&self, definition: TaskDefinition) -> Result<(), ScheduleError> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(definition)
    }

    pub fn task_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        info!(enabled = enabled, "Maintenance mode changed");
        self.maintenance.store(enabled, Ordering::SeqCst);
    }

    /// Maintenance flag or marker file
    pub fn is_in_maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
            || self
                .config
                .maintenance_marker
                .as_ref()
                .map_or(false, |marker| marker.exists())
    }

    fn due_tasks(&self, now: DateTime<Utc>, maintenance: bool) -> Vec<Arc<TaskDefinition>> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .due_tasks(now, self.config.timezone, maintenance)
            .collect()
    }

    /// Evaluate the registry against `now` and dispatch every due task in
    /// registration order. A failing or panicking task never stops the
    /// tick; foreground runs block it until they finish.
    #[instrument(skip(self), fields(now = %now))]
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> TickReport {
        let now = truncate_to_minute(now);
        let maintenance = self.is_in_maintenance_mode();
        self.dispatcher.reap_finished().await;

        let due = self.due_tasks(now, maintenance);
        let mut report = TickReport {
            evaluated_at: now,
            maintenance,
            runs: Vec::with_capacity(due.len()),
        };

        if due.is_empty() {
            debug!("No tasks due");
            return report;
        }

        debug!(due_count = due.len(), maintenance = maintenance, "Dispatching due tasks");
        for task in due {
            let task_name = task.name.clone();
            let dispatcher = self.dispatcher.clone();
            let outcome = match tokio::spawn(async move { dispatcher.dispatch(task, now).await }).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(task = %task_name, error = %e, "Dispatch aborted, continuing with remaining tasks");
                    None
                }
            };
            report.runs.push(TaskRun { task_name, outcome });
        }

        report
    }

    /// Run one task immediately, ignoring its frequency rule
    #[instrument(skip(self))]
    pub async fn run_task_now(&self, name: &str) -> Result<RunOutcome, ScheduleError> {
        let task = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .map(|registered| registered.definition().clone())
            .ok_or_else(|| ScheduleError::TaskNotFound(name.to_string()))?;

        info!(task = %name, "Running task on demand");
        Ok(self.dispatcher.dispatch(task, self.clock.now()).await)
    }

    /// Every registered task with its next due instant after `after`
    pub fn upcoming(&self, after: DateTime<Utc>) -> Vec<TaskSummary> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry
            .iter()
            .map(|task| {
                let definition = task.definition();
                TaskSummary {
                    name: definition.name.clone(),
                    expression: task.schedule().expression().to_string(),
                    description: definition.description.clone(),
                    action: definition.action.describe(),
                    next_due: task.schedule().next_due_after(after, self.config.timezone),
                    without_overlapping: definition.policy.without_overlapping,
                    run_in_background: definition.policy.run_in_background,
                }
            })
            .collect()
    }

    pub fn list(&self) -> Vec<TaskSummary> {
        self.upcoming(self.clock.now())
    }

    /// Wait for in-flight background runs, returning how many outlived `grace`
    pub async fn wait_for_background(&self, grace: Duration) -> usize {
        self.dispatcher.wait_for_background(grace).await
    }

    /// Wait out background runs for at most the configured grace period
    async fn drain_background(&self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        let still_running = self.wait_for_background(grace).await;
        if still_running > 0 {
            warn!(
                still_running = still_running,
                "Background runs outlived the grace period; their locks will expire"
            );
        }
    }

    /// Delay until the next multiple of the tick interval
    fn delay_to_next_boundary(&self) -> Duration {
        let period = self.config.tick_interval_seconds.max(1) as i64;
        let now = self.clock.now();
        let into_period_ms = now.timestamp_millis().rem_euclid(period * 1000);
        if into_period_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((period * 1000 - into_period_ms) as u64)
        }
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    /// Start the tick loop, aligned to interval boundaries
    #[instrument(skip(self))]
    async fn start(&self) -> anyhow::Result<()> {
        let period = Duration::from_secs(self.config.tick_interval_seconds.max(1));
        info!(
            tick_interval_seconds = period.as_secs(),
            timezone = %self.config.timezone,
            tasks = self.task_count(),
            "Starting scheduler engine"
        );

        let mut ticker = interval_at(Instant::now() + self.delay_to_next_boundary(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Marked running before subscribing so a successful `stop` signal always sees it
        self.loop_running.send_replace(true);
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.evaluate_now().await;
                    if report.due_count() > 0 {
                        info!(
                            due = report.due_count(),
                            started = report.started_count(),
                            skipped = report.skipped_count(),
                            "Evaluation tick complete"
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        // Runs spawned by the last tick are drained before the loop reports done
        self.drain_background().await;
        self.loop_running.send_replace(false);

        info!("Scheduler engine stopped");
        Ok(())
    }

    /// Stop the scheduler gracefully
    #[instrument(skip(self))]
    async fn stop(&self) -> anyhow::Result<()> {
        info!("Stopping scheduler engine");

        let mut running_rx = self.loop_running.subscribe();
        if self.shutdown_tx.send(()).is_ok() {
            // The loop drains background runs itself; wait until it has
            running_rx.wait_for(|running| !*running).await.map(|_| ())?;
        } else {
            // Nobody listening means the loop is not running
            self.drain_background().await;
        }

        info!("Scheduler engine stopped gracefully");
        Ok(())
    }

    async fn evaluate_now(&self) -> TickReport {
        self.evaluate_at(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::RecordingEventSink;
    use crate::executor::TaskExecutor;
    use crate::lock::{InMemoryLockStore, OverlapLock};
    use crate::models::{FrequencyRule, RunPhase, TimeOfDay};
    use chrono::TimeZone;

    fn engine_at(start: DateTime<Utc>, events: Arc<RecordingEventSink>) -> SchedulerEngine {
        let lock = OverlapLock::new(Arc::new(InMemoryLockStore::new()));
        let dispatcher = Dispatcher::new(lock, Arc::new(TaskExecutor::default()), events);
        SchedulerEngine::new(
            SchedulerConfig::default(),
            TaskRegistry::new(),
            dispatcher,
            Arc::new(ManualClock::new(start)),
        )
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval_seconds, 60);
        assert_eq!(config.default_overlap_expiry, Duration::from_secs(86_400));
        assert_eq!(config.shutdown_grace_seconds, 30);
        assert_eq!(config.timezone, chrono_tz::UTC);
    }

    #[tokio::test]
    async fn test_evaluate_at_dispatches_due_tasks() {
        let events = Arc::new(RecordingEventSink::new());
        let engine = engine_at(at(9, 0), events.clone());
        engine
            .register(TaskDefinition::call("five", FrequencyRule::every_minutes(5), || async {
                Ok(String::new())
            }))
            .unwrap();

        let report = engine.evaluate_at(at(9, 5)).await;
        assert_eq!(report.task_names(), vec!["five"]);
        assert_eq!(report.started_count(), 1);

        let report = engine.evaluate_at(at(9, 3)).await;
        assert_eq!(report.due_count(), 0);
        assert_eq!(events.phases_for("five"), vec![RunPhase::Started, RunPhase::Succeeded]);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_tick() {
        let events = Arc::new(RecordingEventSink::new());
        let engine = engine_at(at(9, 0), events.clone());
        engine
            .register(TaskDefinition::call("explodes", FrequencyRule::EveryMinute, || async {
                if true {
                    panic!("kaboom");
                }
                Ok(String::new())
            }))
            .unwrap();
        engine
            .register(TaskDefinition::call("steady", FrequencyRule::EveryMinute, || async {
                Ok("ok".to_string())
            }))
            .unwrap();

        let report = engine.evaluate_at(at(9, 0)).await;
        assert_eq!(report.task_names(), vec!["explodes", "steady"]);
        assert_eq!(events.phases_for("explodes"), vec![RunPhase::Started, RunPhase::Failed]);
        assert_eq!(events.phases_for("steady"), vec![RunPhase::Started, RunPhase::Succeeded]);
    }

    #[tokio::test]
    async fn test_maintenance_mode_skips_regular_tasks() {
        let events = Arc::new(RecordingEventSink::new());
        let engine = engine_at(at(9, 0), events);
        engine
            .register(TaskDefinition::call("regular", FrequencyRule::EveryMinute, || async {
                Ok(String::new())
            }))
            .unwrap();
        engine
            .register(
                TaskDefinition::call("always", FrequencyRule::EveryMinute, || async {
                    Ok(String::new())
                })
                .even_in_maintenance_mode(),
            )
            .unwrap();

        engine.set_maintenance_mode(true);
        let report = engine.evaluate_at(at(9, 0)).await;
        assert!(report.maintenance);
        assert_eq!(report.task_names(), vec!["always"]);

        engine.set_maintenance_mode(false);
        assert_eq!(engine.evaluate_at(at(9, 1)).await.due_count(), 2);
    }

    #[tokio::test]
    async fn test_maintenance_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("down");
        let lock = OverlapLock::new(Arc::new(InMemoryLockStore::new()));
        let dispatcher = Dispatcher::new(
            lock,
            Arc::new(TaskExecutor::default()),
            Arc::new(RecordingEventSink::new()),
        );
        let config = SchedulerConfig {
            maintenance_marker: Some(marker.clone()),
            ..SchedulerConfig::default()
        };
        let engine = SchedulerEngine::new(
            config,
            TaskRegistry::new(),
            dispatcher,
            Arc::new(ManualClock::new(at(9, 0))),
        );

        assert!(!engine.is_in_maintenance_mode());
        std::fs::write(&marker, b"").unwrap();
        assert!(engine.is_in_maintenance_mode());
    }

    #[tokio::test]
    async fn test_run_task_now_unknown_task() {
        let engine = engine_at(at(9, 0), Arc::new(RecordingEventSink::new()));
        let err = engine.run_task_now("ghost").await.unwrap_err();
        assert_eq!(err, ScheduleError::TaskNotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_run_task_now_ignores_frequency() {
        let events = Arc::new(RecordingEventSink::new());
        let engine = engine_at(at(9, 3), events.clone());
        engine
            .register(TaskDefinition::call(
                "nightly",
                FrequencyRule::daily_at(TimeOfDay::new(2, 0).unwrap()),
                || async { Ok("ran".to_string()) },
            ))
            .unwrap();

        let outcome = engine.run_task_now("nightly").await.unwrap();
        let result = outcome.into_result().await.unwrap();
        assert_eq!(result.stdout, "ran");
    }

    #[tokio::test]
    async fn test_upcoming_lists_next_due() {
        let engine = engine_at(at(9, 3), Arc::new(RecordingEventSink::new()));
        engine
            .register(
                TaskDefinition::call("five", FrequencyRule::every_minutes(5), || async {
                    Ok(String::new())
                })
                .description("Every five minutes"),
            )
            .unwrap();

        let listed = engine.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].expression, "*/5 * * * *");
        assert_eq!(listed[0].next_due, Some(at(9, 5)));
        assert_eq!(listed[0].description.as_deref(), Some("Every five minutes"));
        assert_eq!(listed[0].action, "<callable>");
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let engine = engine_at(at(9, 0), Arc::new(RecordingEventSink::new()));
        assert!(engine.stop().await.is_ok());
    }
}
