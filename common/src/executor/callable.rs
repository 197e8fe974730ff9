// In-process callable actions

use super::{isolate, CapturedOutput};
use crate::models::{ExitStatus, TaskCallback};

/// Invoke the callback on its own task; its returned string is stdout, an
/// error or panic becomes an `Exception` with the message on stderr.
pub async fn run(callback: &TaskCallback) -> CapturedOutput {
    match isolate(callback()).await {
        Ok(stdout) => CapturedOutput {
            status: ExitStatus::Success,
            stdout,
            stderr: String::new(),
        },
        Err(reason) => CapturedOutput::exception(reason),
    }
}
