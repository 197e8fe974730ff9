// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over `log_level`. With `json` the output is
/// one JSON object per line including the current span; otherwise a compact
/// human-readable format is used.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");
    Ok(())
}

/// Initialize the Prometheus metrics exporter and describe the run metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "schedule_runs_started_total",
        "Total number of scheduled task runs started"
    );
    describe_counter!(
        "schedule_runs_succeeded_total",
        "Total number of scheduled task runs that succeeded"
    );
    describe_counter!(
        "schedule_runs_failed_total",
        "Total number of scheduled task runs that failed"
    );
    describe_counter!(
        "schedule_runs_skipped_total",
        "Total number of due task runs that were skipped"
    );
    describe_histogram!(
        "schedule_run_duration_seconds",
        "Duration of scheduled task runs in seconds"
    );

    tracing::info!(
        metrics_port = metrics_port,
        "Prometheus metrics exporter initialized"
    );
    Ok(())
}

#[inline]
pub fn record_run_started(task_name: &str) {
    counter!("schedule_runs_started_total", "task" => task_name.to_string()).increment(1);
}

#[inline]
pub fn record_run_finished(task_name: &str, succeeded: bool, duration_seconds: f64) {
    if succeeded {
        counter!("schedule_runs_succeeded_total", "task" => task_name.to_string()).increment(1);
    } else {
        counter!("schedule_runs_failed_total", "task" => task_name.to_string()).increment(1);
    }
    histogram!("schedule_run_duration_seconds", "task" => task_name.to_string())
        .record(duration_seconds);
}

#[inline]
pub fn record_run_skipped(task_name: &str, reason: &str) {
    counter!(
        "schedule_runs_skipped_total",
        "task" => task_name.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}
