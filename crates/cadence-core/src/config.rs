use std::path::{Path, PathBuf};

use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::step::parse_send_time;

/// Top-level Cadence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.cadence/cadence.db".to_string() }

/// Scheduler tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks in `serve` mode. Default: 60.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Due enrollments fetched per page. Default: 200.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Enrollments processed in parallel within a page. Default: 8.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Civil timezone for day delays, as a UTC offset in hours. Default: 0.
    #[serde(default)]
    pub utc_offset_hours: i32,
    /// Time of day day-delays fire at when a step has no sendTime. Default: "10:00".
    #[serde(default = "default_send_time")]
    pub default_send_time: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            page_size: default_page_size(),
            max_concurrency: default_max_concurrency(),
            utc_offset_hours: 0,
            default_send_time: default_send_time(),
        }
    }
}

fn default_tick_interval() -> u64 { 60 }
fn default_page_size() -> usize { 200 }
fn default_max_concurrency() -> usize { 8 }
fn default_send_time() -> String { "10:00".to_string() }

impl SchedulerConfig {
    /// The fixed civil timezone day delays are anchored in.
    pub fn timezone(&self) -> Result<FixedOffset> {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                CadenceError::Config(format!(
                    "utc_offset_hours out of range: {}",
                    self.utc_offset_hours
                ))
            })
    }

    /// The default time-of-day anchor.
    pub fn anchor_time(&self) -> Result<NaiveTime> {
        parse_send_time(&self.default_send_time).ok_or_else(|| {
            CadenceError::Config(format!(
                "invalid default_send_time '{}'",
                self.default_send_time
            ))
        })
    }
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Webhook receiving outbound messages. None = log-only delivery.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Bearer token sent with webhook requests.
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout in seconds. Default: 10.
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            token: None,
            timeout_secs: default_delivery_timeout(),
        }
    }
}

fn default_delivery_timeout() -> u64 { 10 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CadenceError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| CadenceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.timezone()?;
        self.scheduler.anchor_time()?;
        if self.scheduler.page_size == 0 {
            return Err(CadenceError::Config("page_size must be positive".into()));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(CadenceError::Config("max_concurrency must be positive".into()));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(CadenceError::Config("tick_interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let path = &self.store.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
