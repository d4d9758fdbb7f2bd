//! Tunables for the control loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Hard ceiling on attempts per step. Configuration may lower it, never raise it.
pub const MAX_ATTEMPTS_CEILING: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executions of one step before it is handed to recovery and fallback.
    /// Default: 3
    pub max_attempts: u32,

    /// Fixed pause after a processing-likely action.
    /// Default: 3 seconds
    #[serde(with = "millis")]
    pub processing_pause: Duration,

    /// Pause before re-snapshotting when the planner is blocked.
    /// Default: 1 second
    #[serde(with = "millis")]
    pub recheck_pause: Duration,

    /// Blocked re-checks for one goal before the goal is escalated.
    /// Default: 3
    pub max_blocked_rechecks: u32,

    /// Attempts the secondary action model gets per escalation.
    /// Default: 2
    pub fallback_max_retries: u32,

    /// Distance of the recovery "small scroll" gesture, in pixels.
    /// Default: 120
    pub small_scroll_px: i32,

    /// Planning cycles before the session gives up.
    /// Default: 100
    pub max_cycles: u32,

    /// Words that mark a click target as processing-likely.
    pub processing_keywords: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_CEILING,
            processing_pause: Duration::from_secs(3),
            recheck_pause: Duration::from_secs(1),
            max_blocked_rechecks: 3,
            fallback_max_retries: 2,
            small_scroll_px: 120,
            max_cycles: 100,
            processing_keywords: default_keywords(),
        }
    }
}

fn default_keywords() -> Vec<String> {
    [
        "submit", "login", "log in", "sign in", "save", "send", "confirm", "close",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("AGENT_MAX_ATTEMPTS") {
            config.max_attempts = parse_num("AGENT_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("AGENT_PROCESSING_PAUSE_MS") {
            config.processing_pause =
                Duration::from_millis(parse_num("AGENT_PROCESSING_PAUSE_MS", &v)?);
        }
        if let Some(v) = lookup("AGENT_RECHECK_PAUSE_MS") {
            config.recheck_pause = Duration::from_millis(parse_num("AGENT_RECHECK_PAUSE_MS", &v)?);
        }
        if let Some(v) = lookup("AGENT_MAX_BLOCKED_RECHECKS") {
            config.max_blocked_rechecks = parse_num("AGENT_MAX_BLOCKED_RECHECKS", &v)?;
        }
        if let Some(v) = lookup("AGENT_FALLBACK_MAX_RETRIES") {
            config.fallback_max_retries = parse_num("AGENT_FALLBACK_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("AGENT_SMALL_SCROLL_PX") {
            config.small_scroll_px = parse_num("AGENT_SMALL_SCROLL_PX", &v)?;
        }
        if let Some(v) = lookup("AGENT_MAX_CYCLES") {
            config.max_cycles = parse_num("AGENT_MAX_CYCLES", &v)?;
        }
        if let Some(v) = lookup("AGENT_PROCESSING_KEYWORDS") {
            config.processing_keywords = v
                .split(',')
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_attempts", self.max_attempts as u64, 1, MAX_ATTEMPTS_CEILING as u64)?;
        check_range("fallback_max_retries", self.fallback_max_retries as u64, 1, 10)?;
        check_range("max_cycles", self.max_cycles as u64, 1, 10_000)?;
        Ok(())
    }

    /// Builder: set attempts per step.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder: set the post-processing pause.
    pub fn processing_pause(mut self, pause: Duration) -> Self {
        self.processing_pause = pause;
        self
    }

    /// Builder: set the blocked re-check pause.
    pub fn recheck_pause(mut self, pause: Duration) -> Self {
        self.recheck_pause = pause;
        self
    }

    pub fn max_blocked_rechecks(mut self, rechecks: u32) -> Self {
        self.max_blocked_rechecks = rechecks;
        self
    }

    pub fn fallback_max_retries(mut self, retries: u32) -> Self {
        self.fallback_max_retries = retries;
        self
    }

    pub fn max_cycles(mut self, cycles: u32) -> Self {
        self.max_cycles = cycles;
        self
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn check_range(key: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            min,
            max,
            value,
        });
    }
    Ok(())
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
