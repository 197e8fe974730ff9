// Run lifecycle events handed to the logging collaborator

use crate::models::{RunPhase, ScheduleEvent};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{error, info};

/// EventSink records run lifecycle events (skipped, started, succeeded, failed)
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &ScheduleEvent);
}

/// Writes every event to the structured log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: &ScheduleEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.phase {
            RunPhase::Started => info!(
                task = %event.task_name,
                run_id = %event.run_id,
                at = %event.at,
                "Scheduled task started"
            ),
            RunPhase::Succeeded => info!(
                task = %event.task_name,
                run_id = %event.run_id,
                started_at = ?event.started_at,
                finished_at = ?event.finished_at,
                "Scheduled task succeeded"
            ),
            RunPhase::Skipped => info!(
                task = %event.task_name,
                run_id = %event.run_id,
                at = %event.at,
                reason = detail,
                "Scheduled task skipped"
            ),
            RunPhase::Failed => error!(
                task = %event.task_name,
                run_id = %event.run_id,
                started_at = ?event.started_at,
                finished_at = ?event.finished_at,
                error = detail,
                "Scheduled task failed"
            ),
        }
    }
}

/// Keeps events in memory, for embedding hosts that inspect recent runs
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ScheduleEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScheduleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn phases_for(&self, task_name: &str) -> Vec<RunPhase> {
        self.events()
            .into_iter()
            .filter(|event| event.task_name == task_name)
            .map(|event| event.phase)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn record(&self, event: &ScheduleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
