// Execution dispatcher
//
// One dispatched run walks Pending -> LockCheck -> {Skipped | Running} ->
// {Succeeded | Failed} -> Released. Background runs finish on their own tokio
// task and report back through a oneshot channel.

use crate::clock::{Clock, SystemClock};
use crate::errors::DispatchError;
use crate::events::EventSink;
use crate::executor::{isolate, ActionExecutor};
use crate::lock::{LockGuard, OverlapLock};
use crate::models::{
    ExecutionResult, RunPhase, ScheduleEvent, SkipReason, TaskDefinition, DEFAULT_OVERLAP_EXPIRY,
};
use crate::output::OutputRouter;
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type BackgroundRuns = Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>;

/// How a dispatch call ended from the caller's point of view
#[derive(Debug)]
pub enum RunOutcome {
    /// The overlap lock could not be taken; nothing ran
    Skipped { run_id: Uuid, reason: SkipReason },
    /// The before hook failed; the action never started
    HookFailed { run_id: Uuid, error: DispatchError },
    /// Ran to completion on the calling task
    Completed(ExecutionResult),
    /// Handed off; the result arrives on `completion`
    Backgrounded {
        run_id: Uuid,
        completion: oneshot::Receiver<ExecutionResult>,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunOutcome::Skipped { run_id, .. }
            | RunOutcome::HookFailed { run_id, .. }
            | RunOutcome::Backgrounded { run_id, .. } => *run_id,
            RunOutcome::Completed(result) => result.run_id,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }

    /// Whether the action was started, in the foreground or background
    pub fn started(&self) -> bool {
        matches!(
            self,
            RunOutcome::Completed(_) | RunOutcome::Backgrounded { .. }
        )
    }

    /// Wait for the final result. Skipped and hook-failed runs have none.
    pub async fn into_result(self) -> Option<ExecutionResult> {
        match self {
            RunOutcome::Completed(result) => Some(result),
            RunOutcome::Backgrounded { completion, .. } => completion.await.ok(),
            RunOutcome::Skipped { .. } | RunOutcome::HookFailed { .. } => None,
        }
    }
}

/// Dispatcher runs a due task's action and routes what it produced
#[derive(Clone)]
pub struct Dispatcher {
    lock: OverlapLock,
    executor: Arc<dyn ActionExecutor>,
    router: OutputRouter,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    default_overlap_expiry: Duration,
    background: BackgroundRuns,
}

impl Dispatcher {
    pub fn new(
        lock: OverlapLock,
        executor: Arc<dyn ActionExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            lock,
            executor,
            router: OutputRouter::default(),
            events,
            clock: Arc::new(SystemClock),
            default_overlap_expiry: DEFAULT_OVERLAP_EXPIRY,
            background: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_router(mut self, router: OutputRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_overlap_expiry(mut self, expiry: Duration) -> Self {
        self.default_overlap_expiry = expiry;
        self
    }

    pub fn lock(&self) -> &OverlapLock {
        &self.lock
    }

    /// Dispatch one run of `task` for the tick at `now`
    #[instrument(skip(self, task), fields(task = %task.name, background = task.policy.run_in_background))]
    pub async fn dispatch(&self, task: Arc<TaskDefinition>, now: DateTime<Utc>) -> RunOutcome {
        let run_id = Uuid::new_v4();

        let guard = if task.policy.without_overlapping {
            let max_runtime = task
                .policy
                .overlap_expires_after
                .unwrap_or(self.default_overlap_expiry);
            match self.lock.acquire_guard(&task.name, max_runtime, now).await {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => {
                    return self
                        .skip(&task, run_id, now, SkipReason::Overlapping, None)
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "Lock store unavailable, skipping run");
                    return self
                        .skip(
                            &task,
                            run_id,
                            now,
                            SkipReason::LockStoreUnavailable,
                            Some(e.to_string()),
                        )
                        .await;
                }
            }
        } else {
            None
        };

        if let Some(hook) = &task.hooks.before {
            if let Err(reason) = isolate(hook()).await {
                let error = DispatchError::HookFailure {
                    task: task.name.clone(),
                    reason,
                };
                warn!(run_id = %run_id, error = %error, "Before hook failed, run aborted");
                release(guard).await;
                let event = ScheduleEvent::new(run_id, &task.name, RunPhase::Failed, self.clock.now())
                    .with_detail(error.to_string());
                self.events.record(&event).await;
                return RunOutcome::HookFailed { run_id, error };
            }
        }

        let started_at = self.clock.now();
        self.events
            .record(&ScheduleEvent::new(run_id, &task.name, RunPhase::Started, started_at))
            .await;
        telemetry::record_run_started(&task.name);

        if !task.policy.run_in_background {
            let result = self.run_to_completion(&task, run_id, started_at, guard).await;
            return RunOutcome::Completed(result);
        }

        let (completion_tx, completion) = oneshot::channel();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this.run_to_completion(&task, run_id, started_at, guard).await;
            // The receiver may have been dropped; the run is already recorded
            let _ = completion_tx.send(result);
        });
        self.background.lock().await.insert(run_id, handle);
        debug!(run_id = %run_id, "Run handed off to background");

        RunOutcome::Backgrounded { run_id, completion }
    }

    async fn skip(
        &self,
        task: &TaskDefinition,
        run_id: Uuid,
        now: DateTime<Utc>,
        reason: SkipReason,
        detail: Option<String>,
    ) -> RunOutcome {
        info!(run_id = %run_id, reason = reason.as_str(), "Skipping run");
        let detail = match detail {
            Some(detail) => format!("{}: {}", reason.as_str(), detail),
            None => reason.as_str().to_string(),
        };
        let event = ScheduleEvent::new(run_id, &task.name, RunPhase::Skipped, now).with_detail(detail);
        self.events.record(&event).await;
        telemetry::record_run_skipped(&task.name, reason.as_str());
        RunOutcome::Skipped { run_id, reason }
    }

    /// Execute, release the lock, run the after hook, route output and
    /// record the final event. Every step after execution is best effort.
    async fn run_to_completion(
        &self,
        task: &TaskDefinition,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        guard: Option<LockGuard>,
    ) -> ExecutionResult {
        let captured = self.executor.execute(&task.action).await;
        let result = ExecutionResult {
            run_id,
            task_name: task.name.clone(),
            started_at,
            finished_at: self.clock.now(),
            status: captured.status,
            stdout: captured.stdout,
            stderr: captured.stderr,
        };

        release(guard).await;

        if let Some(hook) = &task.hooks.after {
            if let Err(reason) = isolate(hook(result.clone())).await {
                warn!(run_id = %run_id, error = %reason, "After hook failed");
            }
        }

        for failure in self.router.route(&task.output, &result).await {
            warn!(run_id = %run_id, error = %failure, "Failed to route task output");
        }

        let mut event = ScheduleEvent::finished(&result);
        if !result.succeeded() {
            let error = DispatchError::ActionFailure {
                task: task.name.clone(),
                reason: result.status.to_string(),
            };
            event = event.with_detail(error.to_string());
        }
        self.events.record(&event).await;
        telemetry::record_run_finished(&task.name, result.succeeded(), result.duration_seconds());

        result
    }

    /// Number of background runs not yet reaped
    pub async fn background_count(&self) -> usize {
        self.background.lock().await.len()
    }

    /// Forget handles of background runs that already finished
    pub async fn reap_finished(&self) -> usize {
        let mut handles = self.background.lock().await;
        let before = handles.len();
        handles.retain(|_, handle| !handle.is_finished());
        let reaped = before - handles.len();
        if reaped > 0 {
            debug!(reaped = reaped, remaining = handles.len(), "Reaped finished background runs");
        }
        reaped
    }

    /// Wait up to `grace` for every in-flight background run.
    /// Returns how many were still running when the grace period ended.
    pub async fn wait_for_background(&self, grace: Duration) -> usize {
        let handles: Vec<(Uuid, JoinHandle<()>)> = self.background.lock().await.drain().collect();
        if handles.is_empty() {
            return 0;
        }

        info!(in_flight = handles.len(), grace_seconds = grace.as_secs(), "Waiting for background runs");
        let deadline = tokio::time::Instant::now() + grace;
        let mut still_running = 0;
        for (run_id, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(run_id = %run_id, error = %e, "Background run aborted"),
                Err(_) => {
                    warn!(run_id = %run_id, "Background run still in flight after grace period");
                    still_running += 1;
                }
            }
        }
        still_running
    }
}

async fn release(guard: Option<LockGuard>) {
    if let Some(guard) = guard {
        // Failures are logged by the guard; the record expires on its own
        let _ = guard.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::executor::TaskExecutor;
    use crate::lock::InMemoryLockStore;
    use crate::models::{ExitStatus, FrequencyRule};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn eight_am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
    }

    fn dispatcher(events: Arc<RecordingEventSink>) -> Dispatcher {
        let lock = OverlapLock::new(Arc::new(InMemoryLockStore::new()));
        Dispatcher::new(lock, Arc::new(TaskExecutor::default()), events)
    }

    #[tokio::test]
    async fn test_foreground_run_records_started_and_succeeded() {
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = dispatcher(events.clone());
        let task = Arc::new(TaskDefinition::call("hello", FrequencyRule::EveryMinute, || async {
            Ok("hi".to_string())
        }));

        let outcome = dispatcher.dispatch(task, eight_am()).await;
        let result = outcome.into_result().await.unwrap();

        assert_eq!(result.status, ExitStatus::Success);
        assert_eq!(result.stdout, "hi");
        assert_eq!(
            events.phases_for("hello"),
            vec![RunPhase::Started, RunPhase::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_failed_action_records_failed_and_releases_lock() {
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = dispatcher(events.clone());
        let task = Arc::new(
            TaskDefinition::call("broken", FrequencyRule::EveryMinute, || async {
                Err(anyhow::anyhow!("no database"))
            })
            .without_overlapping(),
        );

        let result = dispatcher
            .dispatch(task, eight_am())
            .await
            .into_result()
            .await
            .unwrap();

        assert!(!result.succeeded());
        assert_eq!(events.phases_for("broken"), vec![RunPhase::Started, RunPhase::Failed]);
        let failed = events.events().pop().unwrap();
        let detail = failed.detail.unwrap_or_default();
        assert!(detail.starts_with("Action failed for task 'broken': "), "{}", detail);
        assert!(detail.contains("no database"), "{}", detail);
        assert!(!dispatcher.lock().is_held("broken", eight_am()).await.unwrap());
    }

    #[tokio::test]
    async fn test_held_lock_skips_run() {
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = dispatcher(events.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = Arc::new(
            TaskDefinition::call("nightly", FrequencyRule::EveryMinute, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(String::new())
                }
            })
            .without_overlapping(),
        );

        assert!(dispatcher
            .lock()
            .try_acquire("nightly", Duration::from_secs(3600), eight_am())
            .await
            .unwrap());

        let outcome = dispatcher.dispatch(task, eight_am()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Skipped {
                reason: SkipReason::Overlapping,
                ..
            }
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].phase, RunPhase::Skipped);
        assert_eq!(recorded[0].detail.as_deref(), Some("overlapping"));
    }

    #[tokio::test]
    async fn test_before_hook_failure_aborts_run() {
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = dispatcher(events.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = Arc::new(
            TaskDefinition::call("guarded", FrequencyRule::EveryMinute, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(String::new())
                }
            })
            .without_overlapping()
            .before(|| async { Err(anyhow::anyhow!("precondition not met")) }),
        );

        let outcome = dispatcher.dispatch(task, eight_am()).await;
        match outcome {
            RunOutcome::HookFailed { error, .. } => {
                assert!(error.to_string().contains("precondition not met"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(events.phases_for("guarded"), vec![RunPhase::Failed]);
        assert!(!dispatcher.lock().is_held("guarded", eight_am()).await.unwrap());
    }

    #[tokio::test]
    async fn test_after_hook_failure_keeps_status() {
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = dispatcher(events.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_hook = seen.clone();
        let task = Arc::new(
            TaskDefinition::call("report", FrequencyRule::EveryMinute, || async {
                Ok("done".to_string())
            })
            .after(move |result| {
                let seen = seen_in_hook.clone();
                async move {
                    assert!(result.succeeded());
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("cleanup failed"))
                }
            }),
        );

        let result = dispatcher
            .dispatch(task, eight_am())
            .await
            .into_result()
            .await
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(events.phases_for("report"), vec![RunPhase::Started, RunPhase::Succeeded]);
    }

    #[tokio::test]
    async fn test_background_run_returns_immediately() {
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = dispatcher(events.clone());
        let gate = Arc::new(Notify::new());
        let waiter = gate.clone();
        let task = Arc::new(
            TaskDefinition::call("slow", FrequencyRule::EveryMinute, move || {
                let waiter = waiter.clone();
                async move {
                    waiter.notified().await;
                    Ok("finished".to_string())
                }
            })
            .run_in_background()
            .without_overlapping(),
        );

        let outcome = dispatcher.dispatch(task, eight_am()).await;
        assert!(matches!(outcome, RunOutcome::Backgrounded { .. }));
        assert_eq!(events.phases_for("slow"), vec![RunPhase::Started]);
        assert!(dispatcher.lock().is_held("slow", eight_am()).await.unwrap());
        assert_eq!(dispatcher.background_count().await, 1);

        gate.notify_one();
        let result = outcome.into_result().await.unwrap();
        assert_eq!(result.stdout, "finished");
        assert_eq!(dispatcher.wait_for_background(Duration::from_secs(5)).await, 0);
        assert_eq!(events.phases_for("slow"), vec![RunPhase::Started, RunPhase::Succeeded]);
        assert!(!dispatcher.lock().is_held("slow", eight_am()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reap_finished_background_runs() {
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = dispatcher(events);
        let task = Arc::new(
            TaskDefinition::call("quick", FrequencyRule::EveryMinute, || async {
                Ok(String::new())
            })
            .run_in_background(),
        );

        let outcome = dispatcher.dispatch(task, eight_am()).await;
        outcome.into_result().await.unwrap();
        // The handle finishes right after the result is sent
        for _ in 0..100 {
            if dispatcher.reap_finished().await == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.background_count().await, 0);
    }
}
