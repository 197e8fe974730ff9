use crate::errors::ScheduleError;
use chrono::{DateTime, Utc, Weekday};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lock lifetime applied when a task does not set its own
pub const DEFAULT_OVERLAP_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Time of day
// ============================================================================

/// Wall-clock time with minute precision, written as `H:MM` or `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidTimeOfDay(format!(
                "{}:{:02}",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// Minutes since midnight
    pub fn minute_of_day(&self) -> u32 {
        self.hour * 60 + self.minute
    }
}

impl FromStr for TimeOfDay {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTimeOfDay(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        TimeOfDay::new(hour, minute).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

// ============================================================================
// Frequency rules and constraints
// ============================================================================

/// FrequencyRule defines when a task recurs. Every variant compiles to a
/// five-field expression, see [`crate::schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrequencyRule {
    EveryMinute,
    EveryMinutes {
        interval: u32,
    },
    Hourly {
        #[serde(default)]
        minute: u32,
    },
    DailyAt {
        time: TimeOfDay,
    },
    TwiceDaily {
        first_hour: u32,
        second_hour: u32,
        #[serde(default)]
        minute: u32,
    },
    WeeklyOn {
        weekday: Weekday,
        time: TimeOfDay,
    },
    MonthlyOn {
        day: u32,
        time: TimeOfDay,
    },
    Quarterly,
    Yearly,
    Cron {
        expression: String,
    },
}

impl FrequencyRule {
    pub fn every_minutes(interval: u32) -> Self {
        FrequencyRule::EveryMinutes { interval }
    }

    pub fn daily_at(time: TimeOfDay) -> Self {
        FrequencyRule::DailyAt { time }
    }

    pub fn weekly_on(weekday: Weekday, time: TimeOfDay) -> Self {
        FrequencyRule::WeeklyOn { weekday, time }
    }

    pub fn monthly_on(day: u32, time: TimeOfDay) -> Self {
        FrequencyRule::MonthlyOn { day, time }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        FrequencyRule::Cron {
            expression: expression.into(),
        }
    }
}

/// Inclusive wall-clock window; `end < start` wraps past midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: TimeOfDay) -> bool {
        let (start, end, t) = (
            self.start.minute_of_day(),
            self.end.minute_of_day(),
            time.minute_of_day(),
        );
        if start <= end {
            start <= t && t <= end
        } else {
            t >= start || t <= end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayFilter {
    Weekdays,
    Weekends,
}

impl DayFilter {
    pub fn allows(&self, weekday: Weekday) -> bool {
        let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        match self {
            DayFilter::Weekdays => !weekend,
            DayFilter::Weekends => weekend,
        }
    }
}

/// Extra conditions checked after the frequency rule matched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub between: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless_between: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<DayFilter>,
}

/// Execution policy flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub without_overlapping: bool,
    /// Lock lifetime; `None` falls back to the scheduler default
    pub overlap_expires_after: Option<Duration>,
    pub run_in_background: bool,
    pub even_in_maintenance_mode: bool,
}

// ============================================================================
// Output routing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: PathBuf,
    #[serde(default = "default_append")]
    pub append: bool,
}

fn default_append() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailOutput {
    pub recipients: Vec<String>,
    #[serde(default)]
    pub only_on_failure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputRouting {
    pub file: Option<OutputFile>,
    pub email: Option<EmailOutput>,
}

impl OutputRouting {
    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.email.is_none()
    }
}

// ============================================================================
// Actions and hooks
// ============================================================================

/// In-process unit of work. The returned string is the captured output.
pub type TaskCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

pub type BeforeHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub type AfterHook =
    Arc<dyn Fn(ExecutionResult) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Action is the executable unit a task runs
#[derive(Clone)]
pub enum Action {
    /// Spawn a program directly
    Command { program: String, args: Vec<String> },
    /// Run a command line through `sh -c`
    Shell { command_line: String },
    Callable(TaskCallback),
}

impl Action {
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Action::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shell(command_line: impl Into<String>) -> Self {
        Action::Shell {
            command_line: command_line.into(),
        }
    }

    pub fn callable<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Action::Callable(Arc::new(move || f().boxed()))
    }

    /// Short human-readable description, used by `list` and mail subjects
    pub fn describe(&self) -> String {
        match self {
            Action::Command { program, args } if args.is_empty() => program.clone(),
            Action::Command { program, args } => format!("{} {}", program, args.join(" ")),
            Action::Shell { command_line } => command_line.clone(),
            Action::Callable(_) => "<callable>".to_string(),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command { program, args } => f
                .debug_struct("Command")
                .field("program", program)
                .field("args", args)
                .finish(),
            Action::Shell { command_line } => f
                .debug_struct("Shell")
                .field("command_line", command_line)
                .finish(),
            Action::Callable(_) => f.write_str("Callable"),
        }
    }
}

#[derive(Clone, Default)]
pub struct Hooks {
    pub before: Option<BeforeHook>,
    pub after: Option<AfterHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

// ============================================================================
// Task definition
// ============================================================================

/// TaskDefinition represents one schedulable unit of work
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub description: Option<String>,
    pub action: Action,
    pub frequency: FrequencyRule,
    pub constraints: Constraints,
    pub policy: ExecutionPolicy,
    pub output: OutputRouting,
    pub hooks: Hooks,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, action: Action, frequency: FrequencyRule) -> Self {
        Self {
            name: name.into(),
            description: None,
            action,
            frequency,
            constraints: Constraints::default(),
            policy: ExecutionPolicy::default(),
            output: OutputRouting::default(),
            hooks: Hooks::default(),
        }
    }

    /// Shorthand for a task backed by an async closure
    pub fn call<F, Fut>(name: impl Into<String>, frequency: FrequencyRule, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self::new(name, Action::callable(f), frequency)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn without_overlapping(mut self) -> Self {
        self.policy.without_overlapping = true;
        self
    }

    pub fn without_overlapping_for(mut self, expires_after: Duration) -> Self {
        self.policy.without_overlapping = true;
        self.policy.overlap_expires_after = Some(expires_after);
        self
    }

    pub fn run_in_background(mut self) -> Self {
        self.policy.run_in_background = true;
        self
    }

    pub fn even_in_maintenance_mode(mut self) -> Self {
        self.policy.even_in_maintenance_mode = true;
        self
    }

    pub fn between(mut self, start: TimeOfDay, end: TimeOfDay) -> Self {
        self.constraints.between = Some(TimeWindow::new(start, end));
        self
    }

    pub fn unless_between(mut self, start: TimeOfDay, end: TimeOfDay) -> Self {
        self.constraints.unless_between = Some(TimeWindow::new(start, end));
        self
    }

    pub fn weekdays(mut self) -> Self {
        self.constraints.days = Some(DayFilter::Weekdays);
        self
    }

    pub fn weekends(mut self) -> Self {
        self.constraints.days = Some(DayFilter::Weekends);
        self
    }

    pub fn send_output_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.output.file = Some(OutputFile {
            path: path.into(),
            append: false,
        });
        self
    }

    pub fn append_output_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.output.file = Some(OutputFile {
            path: path.into(),
            append: true,
        });
        self
    }

    pub fn email_output_to<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output.email = Some(EmailOutput {
            recipients: recipients.into_iter().map(Into::into).collect(),
            only_on_failure: false,
        });
        self
    }

    pub fn email_output_on_failure<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output.email = Some(EmailOutput {
            recipients: recipients.into_iter().map(Into::into).collect(),
            only_on_failure: true,
        });
        self
    }

    pub fn before<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.before = Some(Arc::new(move || hook().boxed()));
        self
    }

    pub fn after<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ExecutionResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.after = Some(Arc::new(move |result| hook(result).boxed()));
        self
    }
}

// ============================================================================
// Execution results and events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    NonZero(i32),
    Exception(String),
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => f.write_str("success"),
            ExitStatus::NonZero(code) => write!(f, "exit code {}", code),
            ExitStatus::Exception(reason) => write!(f, "exception: {}", reason),
        }
    }
}

/// ExecutionResult is produced once per dispatched run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status.is_success()
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Skipped,
    Started,
    Succeeded,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Skipped => "skipped",
            RunPhase::Started => "started",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous run still holds the overlap lock
    Overlapping,
    /// The lock store could not be reached; the run is skipped rather than
    /// executed without exclusion
    LockStoreUnavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Overlapping => "overlapping",
            SkipReason::LockStoreUnavailable => "lock_store_unavailable",
        }
    }
}

/// ScheduleEvent is what the logging collaborator receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub run_id: Uuid,
    pub task_name: String,
    pub phase: RunPhase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ScheduleEvent {
    pub fn new(run_id: Uuid, task_name: &str, phase: RunPhase, at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            task_name: task_name.to_string(),
            phase,
            at,
            started_at: None,
            finished_at: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn finished(result: &ExecutionResult) -> Self {
        let phase = if result.succeeded() {
            RunPhase::Succeeded
        } else {
            RunPhase::Failed
        };
        let mut event = Self::new(result.run_id, &result.task_name, phase, result.finished_at);
        event.started_at = Some(result.started_at);
        event.finished_at = Some(result.finished_at);
        if !result.succeeded() {
            event.detail = Some(result.status.to_string());
        }
        event
    }
}
