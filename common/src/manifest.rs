// Declarative task definitions read from settings

use crate::errors::ScheduleError;
use crate::models::{
    Action, DayFilter, EmailOutput, FrequencyRule, OutputFile, TaskDefinition, TimeWindow,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Either a raw five-field expression or a tagged frequency rule:
///
/// ```toml
/// schedule = "*/5 * * * *"
/// schedule = { type = "daily_at", time = "08:00" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    Expression(String),
    Rule(FrequencyRule),
}

impl ScheduleSpec {
    pub fn into_rule(self) -> FrequencyRule {
        match self {
            ScheduleSpec::Expression(expression) => FrequencyRule::cron(expression),
            ScheduleSpec::Rule(rule) => rule,
        }
    }
}

/// Actions that can be declared in configuration. Callables only exist in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Shell {
        command_line: String,
    },
}

impl From<ActionSpec> for Action {
    fn from(spec: ActionSpec) -> Self {
        match spec {
            ActionSpec::Command { program, args } => Action::Command { program, args },
            ActionSpec::Shell { command_line } => Action::Shell { command_line },
        }
    }
}

/// One `[[tasks]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule: ScheduleSpec,
    pub action: ActionSpec,
    #[serde(default)]
    pub without_overlapping: bool,
    #[serde(default)]
    pub overlap_expiry_minutes: Option<u64>,
    #[serde(default)]
    pub run_in_background: bool,
    #[serde(default)]
    pub even_in_maintenance_mode: bool,
    #[serde(default)]
    pub between: Option<TimeWindow>,
    #[serde(default)]
    pub unless_between: Option<TimeWindow>,
    #[serde(default)]
    pub days: Option<DayFilter>,
    #[serde(default)]
    pub output: Option<OutputFile>,
    #[serde(default)]
    pub email: Option<EmailOutput>,
}

impl TaskSpec {
    /// Build the definition. The schedule is checked here so a bad entry
    /// fails at startup rather than at its first tick.
    pub fn into_definition(self) -> Result<TaskDefinition, ScheduleError> {
        let frequency = self.schedule.into_rule();
        frequency.compile()?;

        let mut definition = TaskDefinition::new(self.name, self.action.into(), frequency);
        definition.description = self.description;
        definition.policy.without_overlapping =
            self.without_overlapping || self.overlap_expiry_minutes.is_some();
        definition.policy.overlap_expires_after = self
            .overlap_expiry_minutes
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)));
        definition.policy.run_in_background = self.run_in_background;
        definition.policy.even_in_maintenance_mode = self.even_in_maintenance_mode;
        definition.constraints.between = self.between;
        definition.constraints.unless_between = self.unless_between;
        definition.constraints.days = self.days;
        definition.output.file = self.output;
        definition.output.email = self.email;
        Ok(definition)
    }
}
