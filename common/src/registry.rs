// Task registry and due-time evaluation

use crate::errors::ScheduleError;
use crate::models::TaskDefinition;
use crate::schedule::{CompiledSchedule, ScheduleTrigger};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What `register` does when a task name is already taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Last registration wins and keeps the original position
    #[default]
    Replace,
    /// Fail with `DuplicateFrequencyConflict`
    Reject,
}

/// A definition together with its compiled schedule
#[derive(Debug, Clone)]
pub struct RegisteredTask {
    definition: Arc<TaskDefinition>,
    schedule: CompiledSchedule,
}

impl RegisteredTask {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &Arc<TaskDefinition> {
        &self.definition
    }

    pub fn schedule(&self) -> &CompiledSchedule {
        &self.schedule
    }
}

/// Explicitly owned set of task definitions, kept in registration order
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<RegisteredTask>,
    index: HashMap<String, usize>,
    policy: DuplicatePolicy,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Insert or replace a definition by name.
    ///
    /// The frequency rule is compiled first; a definition that does not
    /// compile is never added.
    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), ScheduleError> {
        validate_definition(&definition)?;
        let schedule = CompiledSchedule::new(&definition.frequency, &definition.constraints)?;
        let name = definition.name.clone();
        let entry = RegisteredTask {
            definition: Arc::new(definition),
            schedule,
        };

        match self.index.get(&name) {
            Some(_) if self.policy == DuplicatePolicy::Reject => {
                Err(ScheduleError::DuplicateFrequencyConflict(name))
            }
            Some(&slot) => {
                info!(task = %name, expression = %entry.schedule.expression(), "Replacing task definition");
                self.tasks[slot] = entry;
                Ok(())
            }
            None => {
                info!(task = %name, expression = %entry.schedule.expression(), "Registered task");
                self.index.insert(name, self.tasks.len());
                self.tasks.push(entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.index.get(name).map(|&slot| &self.tasks[slot])
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<TaskDefinition>> {
        let slot = self.index.remove(name)?;
        let removed = self.tasks.remove(slot);
        for position in self.index.values_mut() {
            if *position > slot {
                *position -= 1;
            }
        }
        Some(removed.definition)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTask> {
        self.tasks.iter()
    }

    /// Definitions due during the minute containing `now`, in registration
    /// order. The iterator is lazy and evaluates against the registry as it
    /// is right now.
    pub fn due_tasks(
        &self,
        now: DateTime<Utc>,
        timezone: Tz,
        maintenance: bool,
    ) -> impl Iterator<Item = Arc<TaskDefinition>> + '_ {
        self.tasks
            .iter()
            .filter(move |task| !maintenance || task.definition.policy.even_in_maintenance_mode)
            .filter(move |task| task.schedule.is_due(now, timezone))
            .map(|task| {
                debug!(task = %task.name(), "Task is due");
                task.definition.clone()
            })
    }
}

fn validate_definition(definition: &TaskDefinition) -> Result<(), ScheduleError> {
    if definition.name.trim().is_empty() {
        return Err(ScheduleError::InvalidDefinition(
            "task name must not be empty".to_string(),
        ));
    }
    if definition.policy.overlap_expires_after == Some(std::time::Duration::ZERO) {
        return Err(ScheduleError::InvalidDefinition(format!(
            "task '{}': overlap expiry must be positive",
            definition.name
        )));
    }
    if let Some(email) = &definition.output.email {
        if email.recipients.iter().any(|r| r.trim().is_empty()) {
            return Err(ScheduleError::InvalidDefinition(format!(
                "task '{}': empty mail recipient",
                definition.name
            )));
        }
    }
    Ok(())
}
