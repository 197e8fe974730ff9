// Subprocess actions

use super::CapturedOutput;
use crate::models::ExitStatus;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Spawns programs and shell command lines, capturing stdout and stderr
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
        }
    }
}

impl ProcessExecutor {
    pub fn new(shell: impl Into<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            working_dir,
        }
    }

    #[instrument(skip(self, args), fields(program = %program))]
    pub async fn run(&self, program: &str, args: &[String]) -> CapturedOutput {
        let mut command = Command::new(program);
        command.args(args);
        self.spawn(command, program).await
    }

    /// Run a full command line through the configured shell
    #[instrument(skip(self))]
    pub async fn run_shell(&self, command_line: &str) -> CapturedOutput {
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(command_line);
        self.spawn(command, &self.shell).await
    }

    async fn spawn(&self, mut command: Command, program: &str) -> CapturedOutput {
        command.stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                return CapturedOutput::exception(format!("failed to spawn '{}': {}", program, e));
            }
        };

        let status = match output.status.code() {
            Some(0) => ExitStatus::Success,
            Some(code) => ExitStatus::NonZero(code),
            None => ExitStatus::Exception("terminated by signal".to_string()),
        };
        debug!(status = %status, "Process finished");

        CapturedOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}
