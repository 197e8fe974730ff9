// Output routing: file append and mail delivery of captured task output

use crate::errors::OutputError;
use crate::models::{ExecutionResult, OutputFile, OutputRouting};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    pub fn for_result(recipients: &[String], result: &ExecutionResult) -> Self {
        Self {
            to: recipients.to_vec(),
            subject: format!("Scheduled Job Output For [{}]", result.task_name),
            body: render_body(result),
        }
    }
}

fn render_body(result: &ExecutionResult) -> String {
    let mut body = format!(
        "Task: {}\nRun: {}\nStatus: {}\nStarted: {}\nFinished: {}\n",
        result.task_name, result.run_id, result.status, result.started_at, result.finished_at
    );
    if !result.stdout.is_empty() {
        body.push_str("\n--- stdout ---\n");
        body.push_str(&result.stdout);
    }
    if !result.stderr.is_empty() {
        body.push_str("\n--- stderr ---\n");
        body.push_str(&result.stderr);
    }
    body
}

/// MailSender delivers output mails
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), OutputError>;
}

/// Writes the mail to the log instead of delivering it
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailSender;

#[async_trait]
impl MailSender for LogMailSender {
    async fn send(&self, message: &MailMessage) -> Result<(), OutputError> {
        info!(
            to = ?message.to,
            subject = %message.subject,
            body = %message.body,
            "Output mail (no relay configured)"
        );
        Ok(())
    }
}

/// POSTs each mail as JSON to an HTTP mail relay
pub struct HttpRelayMailSender {
    client: Client,
    relay_url: String,
    from: String,
}

impl HttpRelayMailSender {
    pub fn new(
        relay_url: impl Into<String>,
        from: impl Into<String>,
        timeout_seconds: u64,
    ) -> Result<Self, OutputError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| OutputError::MailFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            relay_url: relay_url.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl MailSender for HttpRelayMailSender {
    #[instrument(skip(self, message), fields(relay = %self.relay_url, subject = %message.subject))]
    async fn send(&self, message: &MailMessage) -> Result<(), OutputError> {
        let payload = json!({
            "from": self.from,
            "to": message.to,
            "subject": message.subject,
            "text": message.body,
        });

        self.client
            .post(&self.relay_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OutputError::MailFailed(format!("Relay request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| OutputError::MailFailed(format!("Relay rejected mail: {}", e)))?;

        Ok(())
    }
}

/// Routes a finished run's output to the targets configured on its task
#[derive(Clone)]
pub struct OutputRouter {
    mailer: Arc<dyn MailSender>,
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::new(Arc::new(LogMailSender))
    }
}

impl OutputRouter {
    pub fn new(mailer: Arc<dyn MailSender>) -> Self {
        Self { mailer }
    }

    /// Deliver to every configured target; one failing target does not stop
    /// the others. Returns the failures.
    pub async fn route(&self, routing: &OutputRouting, result: &ExecutionResult) -> Vec<OutputError> {
        let mut failures = Vec::new();

        if let Some(file) = &routing.file {
            if let Err(e) = write_output_file(file, result).await {
                failures.push(e);
            }
        }

        if let Some(email) = &routing.email {
            let wanted = !email.only_on_failure || !result.succeeded();
            if wanted && !email.recipients.is_empty() {
                let message = MailMessage::for_result(&email.recipients, result);
                if let Err(e) = self.mailer.send(&message).await {
                    failures.push(e);
                }
            }
        }

        failures
    }
}

/// Write stdout followed by stderr, appending or truncating per `file.append`
pub async fn write_output_file(file: &OutputFile, result: &ExecutionResult) -> Result<(), OutputError> {
    let path_str = file.path.display().to_string();
    let fail = |e: std::io::Error| OutputError::FileWriteFailed {
        path: path_str.clone(),
        reason: e.to_string(),
    };

    if let Some(parent) = file.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true);
    if file.append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }

    let mut handle = options.open(&file.path).await.map_err(fail)?;
    handle.write_all(result.stdout.as_bytes()).await.map_err(fail)?;
    handle.write_all(result.stderr.as_bytes()).await.map_err(fail)?;
    handle.flush().await.map_err(fail)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailOutput, ExitStatus};
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<MailMessage>>,
    }

    #[async_trait]
    impl MailSender for RecordingMailer {
        async fn send(&self, message: &MailMessage) -> Result<(), OutputError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn result(status: ExitStatus, stdout: &str) -> ExecutionResult {
        let now = Utc::now();
        ExecutionResult {
            run_id: Uuid::new_v4(),
            task_name: "report:generate".to_string(),
            started_at: now,
            finished_at: now,
            status,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_append_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("report.log");
        let file = OutputFile {
            path: path.clone(),
            append: true,
        };

        write_output_file(&file, &result(ExitStatus::Success, "one\n")).await.unwrap();
        write_output_file(&file, &result(ExitStatus::Success, "two\n")).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_truncate_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.log");
        let file = OutputFile {
            path: path.clone(),
            append: false,
        };

        write_output_file(&file, &result(ExitStatus::Success, "first run\n")).await.unwrap();
        write_output_file(&file, &result(ExitStatus::Success, "second\n")).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
    }

    #[tokio::test]
    async fn test_email_only_on_failure() {
        let mailer = Arc::new(RecordingMailer::default());
        let router = OutputRouter::new(mailer.clone());
        let routing = OutputRouting {
            file: None,
            email: Some(EmailOutput {
                recipients: vec!["admin@example.com".to_string()],
                only_on_failure: true,
            }),
        };

        assert!(router.route(&routing, &result(ExitStatus::Success, "ok")).await.is_empty());
        assert!(mailer.sent.lock().unwrap().is_empty());

        assert!(router
            .route(&routing, &result(ExitStatus::NonZero(1), "bad"))
            .await
            .is_empty());
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Scheduled Job Output For [report:generate]");
        assert!(sent[0].body.contains("Status: exit code 1"));
        assert!(sent[0].body.contains("bad"));
    }

    #[tokio::test]
    async fn test_file_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as an output file
        let routing = OutputRouting {
            file: Some(OutputFile {
                path: dir.path().to_path_buf(),
                append: true,
            }),
            email: None,
        };
        let failures = OutputRouter::default()
            .route(&routing, &result(ExitStatus::Success, "x"))
            .await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], OutputError::FileWriteFailed { .. }));
    }
}
