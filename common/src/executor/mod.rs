// Executor module for task actions
// Runs subprocesses and in-process callables and captures their output

pub mod callable;
pub mod process;

pub use process::ProcessExecutor;

use crate::models::{Action, ExitStatus};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;

/// Output captured from one action invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn exception(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: ExitStatus::Exception(reason.clone()),
            stdout: String::new(),
            stderr: reason,
        }
    }
}

/// ActionExecutor runs a task action to completion. It never fails: every
/// error ends up in the captured exit status.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> CapturedOutput;
}

/// Default executor dispatching on the action kind
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor {
    process: ProcessExecutor,
}

impl TaskExecutor {
    pub fn new(process: ProcessExecutor) -> Self {
        Self { process }
    }
}

#[async_trait]
impl ActionExecutor for TaskExecutor {
    async fn execute(&self, action: &Action) -> CapturedOutput {
        match action {
            Action::Command { program, args } => self.process.run(program, args).await,
            Action::Shell { command_line } => self.process.run_shell(command_line).await,
            Action::Callable(callback) => callable::run(callback).await,
        }
    }
}

/// Run a future on its own task so a panic inside it is contained.
/// Errors and panics are flattened to a message.
pub(crate) async fn isolate<T: Send + 'static>(
    fut: BoxFuture<'static, anyhow::Result<T>>,
) -> Result<T, String> {
    match tokio::spawn(fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(join_error) if join_error.is_panic() => Err(format!(
            "panicked: {}",
            panic_message(join_error.into_panic())
        )),
        Err(_) => Err("cancelled".to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
