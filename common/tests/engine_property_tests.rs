// Property-based tests for evaluation ticks

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use common::clock::ManualClock;
use common::errors::LockError;
use common::events::RecordingEventSink;
use common::executor::TaskExecutor;
use common::lock::{InMemoryLockStore, LockStore, OverlapLock};
use common::models::{FrequencyRule, RunPhase, SkipReason, TaskDefinition, TimeOfDay};
use common::registry::TaskRegistry;
use common::scheduler::{Dispatcher, RunOutcome, Scheduler, SchedulerConfig, SchedulerEngine};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Counts every call that reaches the store
#[derive(Default)]
struct CountingLockStore {
    inner: InMemoryLockStore,
    calls: AtomicUsize,
}

impl CountingLockStore {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for CountingLockStore {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, LockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_if_absent_or_expired(key, now, expires_at).await
    }

    async fn delete(&self, key: &str) -> Result<(), LockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }
}

struct Harness {
    engine: SchedulerEngine,
    store: Arc<CountingLockStore>,
    events: Arc<RecordingEventSink>,
}

fn harness(start: DateTime<Utc>) -> Harness {
    let store = Arc::new(CountingLockStore::default());
    let events = Arc::new(RecordingEventSink::new());
    let dispatcher = Dispatcher::new(
        OverlapLock::new(store.clone()),
        Arc::new(TaskExecutor::default()),
        events.clone(),
    );
    let engine = SchedulerEngine::new(
        SchedulerConfig::default(),
        TaskRegistry::new(),
        dispatcher,
        Arc::new(ManualClock::new(start)),
    );
    Harness {
        engine,
        store,
        events,
    }
}

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, second).unwrap()
}

/// A tick with nothing due records no events and performs no lock operations
#[test]
fn property_empty_tick_has_no_side_effects() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    proptest!(|(minute in 0u32..60, second in 0u32..60)| {
        prop_assume!(minute % 5 != 0);
        let (due, lock_calls, events) = runtime.block_on(async {
            let h = harness(at(9, 0, 0));
            h.engine
                .register(
                    TaskDefinition::call("five", FrequencyRule::every_minutes(5), || async {
                        Ok(String::new())
                    })
                    .without_overlapping(),
                )
                .unwrap();

            let report = h.engine.evaluate_at(at(9, minute, second)).await;
            (report.due_count(), h.store.calls(), h.events.events().len())
        });
        prop_assert_eq!(due, 0);
        prop_assert_eq!(lock_calls, 0);
        prop_assert_eq!(events, 0);
    });
}

#[tokio::test]
async fn test_empty_registry_tick_is_noop() {
    let h = harness(at(9, 0, 0));
    let report = h.engine.evaluate_now().await;
    assert_eq!(report.due_count(), 0);
    assert_eq!(h.store.calls(), 0);
    assert!(h.events.events().is_empty());
}

/// Daily 08:00 task whose previous run still holds the lock is skipped and logged
#[tokio::test]
async fn test_daily_task_skipped_while_previous_run_holds_lock() {
    let h = harness(at(8, 0, 0));
    h.engine
        .register(
            TaskDefinition::call(
                "nightly-report",
                FrequencyRule::daily_at("08:00".parse::<TimeOfDay>().unwrap()),
                || async { Ok(String::new()) },
            )
            .without_overlapping(),
        )
        .unwrap();

    // Yesterday's run is still in flight
    let yesterday = at(8, 0, 0) - ChronoDuration::days(1) + ChronoDuration::hours(2);
    assert!(h
        .engine
        .dispatcher()
        .lock()
        .try_acquire("nightly-report", Duration::from_secs(24 * 3600), yesterday)
        .await
        .unwrap());

    let report = h.engine.evaluate_at(at(8, 0, 0)).await;
    assert!(matches!(
        report.outcome_for("nightly-report"),
        Some(RunOutcome::Skipped {
            reason: SkipReason::Overlapping,
            ..
        })
    ));

    let recorded = h.events.events();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].task_name, "nightly-report");
    assert_eq!(recorded[0].phase, RunPhase::Skipped);
    assert_eq!(recorded[0].at, at(8, 0, 0));
}

/// A background run spanning several ticks does not block them
#[tokio::test]
async fn test_background_run_does_not_block_next_tick() {
    let h = harness(at(10, 0, 0));
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    h.engine
        .register(
            TaskDefinition::call("long-export", FrequencyRule::EveryMinute, move || {
                let release_rx = release_rx.clone();
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        // Finishes when the test says so, standing in for T+90s
                        let _ = rx.await;
                    }
                    Ok("exported".to_string())
                }
            })
            .run_in_background()
            .without_overlapping(),
        )
        .unwrap();
    h.engine
        .register(TaskDefinition::call("heartbeat", FrequencyRule::EveryMinute, || async {
            Ok("alive".to_string())
        }))
        .unwrap();

    // Tick T
    let first = h.engine.evaluate_at(at(10, 0, 0)).await;
    assert!(matches!(
        first.outcome_for("long-export"),
        Some(RunOutcome::Backgrounded { .. })
    ));

    // Tick T+60s returns while the export is still running
    let second = tokio::time::timeout(
        Duration::from_secs(5),
        h.engine.evaluate_at(at(10, 1, 0)),
    )
    .await
    .expect("tick blocked by background run");
    assert!(matches!(
        second.outcome_for("long-export"),
        Some(RunOutcome::Skipped {
            reason: SkipReason::Overlapping,
            ..
        })
    ));
    assert!(matches!(
        second.outcome_for("heartbeat"),
        Some(RunOutcome::Completed(result)) if result.stdout == "alive"
    ));

    let _ = release_tx.send(());
    let results = first.into_results().await;
    assert!(results
        .iter()
        .any(|r| r.task_name == "long-export" && r.stdout == "exported"));
    assert_eq!(h.engine.wait_for_background(Duration::from_secs(5)).await, 0);
    assert!(!h
        .engine
        .dispatcher()
        .lock()
        .is_held("long-export", at(10, 2, 0))
        .await
        .unwrap());
}

/// One failing task does not keep the others in the same tick from running
#[test]
fn property_failures_are_isolated() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    proptest!(|(failing in prop::collection::vec(any::<bool>(), 1..8))| {
        let (succeeded, failed, total) = runtime.block_on(async {
            let h = harness(at(12, 0, 0));
            for (i, fails) in failing.iter().enumerate() {
                let fails = *fails;
                h.engine
                    .register(TaskDefinition::call(
                        format!("task-{}", i),
                        FrequencyRule::EveryMinute,
                        move || async move {
                            if fails {
                                Err(anyhow::anyhow!("task {} failed", i))
                            } else {
                                Ok(String::new())
                            }
                        },
                    ))
                    .unwrap();
            }

            let report = h.engine.evaluate_at(at(12, 0, 0)).await;
            let events = h.events.events();
            let succeeded = events.iter().filter(|e| e.phase == RunPhase::Succeeded).count();
            let failed = events.iter().filter(|e| e.phase == RunPhase::Failed).count();
            (succeeded, failed, report.due_count())
        });

        let expected_failed = failing.iter().filter(|f| **f).count();
        prop_assert_eq!(total, failing.len());
        prop_assert_eq!(failed, expected_failed);
        prop_assert_eq!(succeeded, failing.len() - expected_failed);
    });
}
