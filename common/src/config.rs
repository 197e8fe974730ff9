// Configuration management with layered configuration (file, env)

use crate::manifest::TaskSpec;
use crate::registry::DuplicatePolicy;
use crate::schedule::parse_timezone;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// IANA timezone name, fixed for the life of the process
    pub timezone: String,
    pub tick_interval_seconds: u64,
    pub default_overlap_expiry_minutes: u64,
    pub duplicate_policy: DuplicatePolicy,
    pub maintenance_marker: Option<PathBuf>,
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            tick_interval_seconds: 60,
            default_overlap_expiry_minutes: 24 * 60,
            duplicate_policy: DuplicatePolicy::Replace,
            maintenance_marker: None,
            shutdown_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Single-process deployments
    #[default]
    Memory,
    /// Shared between every scheduler process using the same Redis
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Memory,
            key_prefix: crate::lock::DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// All lock traffic shares one multiplexed connection to this server
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// HTTP mail relay; without it mail is written to the log
    pub relay_url: Option<String>,
    pub from: String,
    pub timeout_seconds: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            from: "scheduler@localhost".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_port: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // e.g. CADENCE__SCHEDULER__TIMEZONE=Asia/Tokyo
            .add_source(
                Environment::with_prefix("CADENCE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        // Validate scheduler config
        parse_timezone(&self.scheduler.timezone).map_err(|e| e.to_string())?;
        if self.scheduler.tick_interval_seconds == 0 {
            return Err("Scheduler tick_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.default_overlap_expiry_minutes == 0 {
            return Err(
                "Scheduler default_overlap_expiry_minutes must be greater than 0".to_string(),
            );
        }

        // Validate lock config
        if self.lock.key_prefix.is_empty() {
            return Err("Lock key_prefix cannot be empty".to_string());
        }
        if self.lock.backend == LockBackend::Redis && self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty when the lock backend is 'redis'".to_string());
        }

        // Validate mail config
        if let Some(relay_url) = &self.mail.relay_url {
            if relay_url.is_empty() {
                return Err("Mail relay_url cannot be empty when set".to_string());
            }
            if self.mail.from.is_empty() {
                return Err("Mail from address cannot be empty".to_string());
            }
        }

        // Validate observability config
        if self.observability.log_level.is_empty() {
            return Err("Log level cannot be empty".to_string());
        }

        // Validate declared tasks
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err("Task name cannot be empty".to_string());
            }
            if self.scheduler.duplicate_policy == DuplicatePolicy::Reject
                && !seen.insert(task.name.as_str())
            {
                return Err(format!("Task '{}' is declared more than once", task.name));
            }
        }

        Ok(())
    }
}
