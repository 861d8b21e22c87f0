//! Handler configuration read from the process environment.

use std::time::Duration;

use thiserror::Error;

pub const EXPERIMENT_NAME_VAR: &str = "EXPERIMENT_NAME";
pub const EXPERIMENT_NAMESPACE_VAR: &str = "EXPERIMENT_NAMESPACE";
pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";
pub const RETRY_BUDGET_VAR: &str = "RETRY_BUDGET";
pub const RETRY_INTERVAL_VAR: &str = "RETRY_INTERVAL";

const DEFAULT_RETRIES: u32 = 18;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("environment variable {0} must be set to a non-empty value")]
    MissingVar(&'static str),

    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidVar { var: &'static str, value: String },
}

/// Fixed-interval retry schedule shared by fetch and readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Attempts allowed after the first one.
    pub retries: u32,
    /// Wait before each retry.
    pub interval: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl PollSchedule {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    /// Longest time a poll on this schedule can block.
    /// None when the total wait does not fit in a `Duration`.
    pub fn max_wait(&self) -> Option<Duration> {
        self.interval.checked_mul(self.retries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub experiment_name: String,
    pub experiment_namespace: String,
    /// Raw `LOG_LEVEL`; logging stays off unless this names a level.
    pub log_level: Option<String>,
    pub schedule: PollSchedule,
}

impl HandlerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingVar(var))
        };

        let experiment_name = required(EXPERIMENT_NAME_VAR)?;
        let experiment_namespace = required(EXPERIMENT_NAMESPACE_VAR)?;
        let log_level = lookup(LOG_LEVEL_VAR).filter(|v| !v.trim().is_empty());

        let mut schedule = PollSchedule::default();
        if let Some(value) = lookup(RETRY_BUDGET_VAR) {
            schedule.retries = value.trim().parse().map_err(|_| ConfigError::InvalidVar {
                var: RETRY_BUDGET_VAR,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(RETRY_INTERVAL_VAR) {
            schedule.interval = parse_duration(&value).ok_or(ConfigError::InvalidVar {
                var: RETRY_INTERVAL_VAR,
                value: value.clone(),
            })?;
        }

        if schedule.max_wait().is_none() {
            return Err(ConfigError::InvalidVar {
                var: RETRY_INTERVAL_VAR,
                value: format!("{:?} x {} retries", schedule.interval, schedule.retries),
            });
        }

        Ok(Self {
            experiment_name,
            experiment_namespace,
            log_level,
            schedule,
        })
    }
}

/// Parse a duration string like "10s", "500ms", "1m".
///
/// A bare number is seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = digits.parse().ok()?;
    value.checked_mul(unit_ms).map(Duration::from_millis)
}
