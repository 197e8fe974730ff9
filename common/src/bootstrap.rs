// Bootstrap utilities for binary initialization
// Builds the engine and its collaborators from settings

use crate::clock::SystemClock;
use crate::config::{LockBackend, Settings};
use crate::events::{EventSink, TracingEventSink};
use crate::executor::TaskExecutor;
use crate::lock::{InMemoryLockStore, LockStore, OverlapLock, RedisLockStore, RedisPool};
use crate::manifest::TaskSpec;
use crate::output::{HttpRelayMailSender, LogMailSender, MailSender, OutputRouter};
use crate::registry::TaskRegistry;
use crate::schedule::parse_timezone;
use crate::scheduler::{Dispatcher, SchedulerConfig, SchedulerEngine};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Initialize Redis pool for shared overlap locks
///
/// # Errors
/// Returns error if Redis pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_redis_pool(settings: &Settings) -> Result<RedisPool> {
    info!("Initializing Redis pool");

    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;

    redis_pool
        .health_check()
        .await
        .context("Redis health check failed")?;

    info!("Redis pool initialized");
    Ok(redis_pool)
}

/// Initialize the lock store for the configured backend
#[tracing::instrument(skip(settings), fields(backend = ?settings.lock.backend))]
pub async fn init_lock_store(settings: &Settings) -> Result<Arc<dyn LockStore>> {
    let store: Arc<dyn LockStore> = match settings.lock.backend {
        LockBackend::Memory => Arc::new(InMemoryLockStore::new()),
        LockBackend::Redis => Arc::new(RedisLockStore::new(init_redis_pool(settings).await?)),
    };
    info!("Lock store initialized");
    Ok(store)
}

/// Initialize the mail sender: HTTP relay when configured, log otherwise
pub fn init_mail_sender(settings: &Settings) -> Result<Arc<dyn MailSender>> {
    match &settings.mail.relay_url {
        Some(relay_url) => {
            let sender = HttpRelayMailSender::new(
                relay_url.clone(),
                settings.mail.from.clone(),
                settings.mail.timeout_seconds,
            )
            .context("Failed to initialize mail relay client")?;
            info!(relay_url = %relay_url, "Mail relay sender initialized");
            Ok(Arc::new(sender))
        }
        None => {
            info!("No mail relay configured, mail output goes to the log");
            Ok(Arc::new(LogMailSender))
        }
    }
}

/// Engine configuration derived from settings
pub fn engine_config(settings: &Settings) -> Result<SchedulerConfig> {
    let timezone = parse_timezone(&settings.scheduler.timezone)
        .context("Invalid scheduler timezone")?;

    Ok(SchedulerConfig {
        timezone,
        tick_interval_seconds: settings.scheduler.tick_interval_seconds,
        default_overlap_expiry: Duration::from_secs(
            settings
                .scheduler
                .default_overlap_expiry_minutes
                .saturating_mul(60),
        ),
        maintenance_marker: settings.scheduler.maintenance_marker.clone(),
        shutdown_grace_seconds: settings.scheduler.shutdown_grace_seconds,
    })
}

/// Register every declared task. The first invalid entry aborts startup.
pub fn register_declared_tasks(engine: &SchedulerEngine, tasks: &[TaskSpec]) -> Result<()> {
    for spec in tasks {
        let name = spec.name.clone();
        let definition = spec
            .clone()
            .into_definition()
            .with_context(|| format!("Invalid task '{}'", name))?;
        engine
            .register(definition)
            .with_context(|| format!("Failed to register task '{}'", name))?;
    }
    info!(count = tasks.len(), "Declared tasks registered");
    Ok(())
}

/// Build a ready-to-run engine: lock store, mailer, dispatcher, registry
/// and the tasks declared in settings.
#[tracing::instrument(skip(settings, events))]
pub async fn build_engine(
    settings: &Settings,
    events: Option<Arc<dyn EventSink>>,
) -> Result<SchedulerEngine> {
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let config = engine_config(settings)?;
    let store = init_lock_store(settings).await?;
    let lock = OverlapLock::with_prefix(store, settings.lock.key_prefix.clone());
    let router = OutputRouter::new(init_mail_sender(settings)?);
    let events = events.unwrap_or_else(|| Arc::new(TracingEventSink) as Arc<dyn EventSink>);

    let dispatcher =
        Dispatcher::new(lock, Arc::new(TaskExecutor::default()), events).with_router(router);
    let registry = TaskRegistry::with_policy(settings.scheduler.duplicate_policy);
    let engine = SchedulerEngine::new(config, registry, dispatcher, Arc::new(SystemClock));

    register_declared_tasks(&engine, &settings.tasks)?;

    info!(
        tasks = engine.task_count(),
        timezone = %engine.config().timezone,
        "Scheduler engine built"
    );
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ActionSpec, ScheduleSpec};

    fn shell_task(name: &str, schedule: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            description: None,
            schedule: ScheduleSpec::Expression(schedule.to_string()),
            action: ActionSpec::Shell {
                command_line: "true".to_string(),
            },
            without_overlapping: false,
            overlap_expiry_minutes: None,
            run_in_background: false,
            even_in_maintenance_mode: false,
            between: None,
            unless_between: None,
            days: None,
            output: None,
            email: None,
        }
    }

    #[test]
    fn test_engine_config_from_settings() {
        let mut settings = Settings::default();
        settings.scheduler.timezone = "Asia/Tokyo".to_string();
        settings.scheduler.default_overlap_expiry_minutes = 90;

        let config = engine_config(&settings).unwrap();
        assert_eq!(config.timezone, chrono_tz::Asia::Tokyo);
        assert_eq!(config.default_overlap_expiry, Duration::from_secs(5400));
    }

    #[tokio::test]
    async fn test_build_engine_registers_declared_tasks() {
        let mut settings = Settings::default();
        settings.tasks = vec![shell_task("a", "*/5 * * * *"), shell_task("b", "0 3 * * *")];

        let engine = build_engine(&settings, None).await.unwrap();
        assert_eq!(engine.task_count(), 2);
    }

    #[tokio::test]
    async fn test_build_engine_rejects_invalid_task() {
        let mut settings = Settings::default();
        settings.tasks = vec![shell_task("bad", "99 * * * *")];

        let err = build_engine(&settings, None).await.err().unwrap();
        assert!(format!("{:#}", err).contains("Invalid task 'bad'"));
    }

    #[test]
    fn test_mail_sender_without_relay() {
        assert!(init_mail_sender(&Settings::default()).is_ok());
    }
}
