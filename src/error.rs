//! Error types for the control loop.

use thiserror::Error;

/// Failures the loop distinguishes while driving a session.
///
/// Only `RetryExhausted` and `FallbackFailure` ever leave the loop; the rest are
/// recovered locally (re-snapshot, retry) and show up in the history instead.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("planning blocked: {0}")]
    PlanningBlocked(String),

    #[error("driver could not perform {step}: {detail}")]
    ExecutionFailure { step: String, detail: String },

    #[error("expected evidence not observed after {step}: {expected}")]
    VerificationMismatch { step: String, expected: String },

    #[error("retry bound reached for {step} after {attempts} attempts")]
    RetryExhausted { step: String, attempts: u32 },

    #[error("fallback could not produce evidence: {0}")]
    FallbackFailure(String),

    #[error("screenshot capture failed: {0}")]
    Capture(String),

    #[error("navigation to {url} failed: {detail}")]
    Navigation { url: String, detail: String },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Problems with the text of a user request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request is empty")]
    Empty,

    #[error("blocked URL {0}: only http:// and https:// pages can be opened")]
    InvalidScheme(String),

    #[error("blocked placeholder URL {0}")]
    PlaceholderUrl(String),

    #[error("navigation must be the first instruction, found it at clause {0}")]
    NavigationNotFirst(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: String,
        min: u64,
        max: u64,
        value: u64,
    },
}
