// Scheduler module: evaluation ticks and run dispatch

pub mod dispatcher;
pub mod engine;

pub use dispatcher::{Dispatcher, RunOutcome};
pub use engine::{Scheduler, SchedulerConfig, SchedulerEngine, TaskRun, TaskSummary, TickReport};
