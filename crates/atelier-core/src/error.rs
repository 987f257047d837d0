//! Error types for atelier

use crate::types::AttemptRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for atelier operations
#[derive(Debug, Error)]
pub enum AtelierError {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Rate limited by {service}: {message}")]
    RateLimited {
        service: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Content policy rejection from {service}: {message}")]
    ContentPolicy { service: String, message: String },

    #[error("Parameters rejected by {service}: {message}")]
    ParameterRejected { service: String, message: String },

    #[error("Provider error from {service}: {message}")]
    Provider { service: String, message: String },

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Budget exceeded: requested ${requested:.4}, remaining ${remaining:.4}")]
    BudgetExceeded { requested: f64, remaining: f64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Generation failed for '{asset}' after {} attempts", .attempts.len())]
    GenerationFailed {
        asset: String,
        attempts: Vec<AttemptRecord>,
        /// Stopped on a non-retryable answer; running it again won't help
        fatal: bool,
    },

    #[error("Shared generation {fingerprint} failed: {message}")]
    SharedGenerationFailed { fingerprint: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(String),

    #[error("TOML serialization error: {0}")]
    TomlSerError(String),

    #[error("JSON error: {0}")]
    JsonError(String),
}

/// Result type alias for atelier operations
pub type Result<T> = std::result::Result<T, AtelierError>;

/// Coarse failure class used to pick a retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network blip, timeout, dropped connection
    Transient,
    /// Upstream asked us to slow down
    RateLimited,
    /// Prompt refused by a safety filter
    ContentPolicy,
    /// Request parameters refused (size, steps, model options)
    ParameterRejected,
    /// Anything else the provider blamed on itself
    Provider,
    /// Not retryable
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::ContentPolicy => "content_policy",
            ErrorClass::ParameterRejected => "parameter_rejected",
            ErrorClass::Provider => "provider",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl AtelierError {
    /// Classify this error for retry purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            AtelierError::Transient(_) | AtelierError::Timeout(_) => ErrorClass::Transient,
            AtelierError::RateLimited { .. } => ErrorClass::RateLimited,
            AtelierError::ContentPolicy { .. } => ErrorClass::ContentPolicy,
            AtelierError::ParameterRejected { .. } => ErrorClass::ParameterRejected,
            AtelierError::Provider { .. } | AtelierError::CircuitOpen(_) => ErrorClass::Provider,
            _ => ErrorClass::Fatal,
        }
    }

    /// Budget, storage and cancellation errors threaten run invariants and
    /// must never be absorbed by a retry loop.
    pub fn must_propagate(&self) -> bool {
        matches!(
            self,
            AtelierError::BudgetExceeded { .. } | AtelierError::Storage(_) | AtelierError::Cancelled
        )
    }

    /// Whether a failed task is worth putting back on the queue
    pub fn is_requeueable(&self) -> bool {
        match self {
            AtelierError::GenerationFailed { fatal, .. } => !fatal,
            AtelierError::SharedGenerationFailed { .. } => true,
            other => !other.must_propagate() && other.class() != ErrorClass::Fatal,
        }
    }

    /// Build an error from an upstream HTTP status and body.
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        let service = service.to_string();
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, truncate(body, 300))
        };
        match status {
            429 => AtelierError::RateLimited {
                service,
                message,
                retry_after: None,
            },
            400 | 422 if mentions_policy(body) => AtelierError::ContentPolicy { service, message },
            400 | 422 => AtelierError::ParameterRejected { service, message },
            401 | 403 => AtelierError::Config(format!("{} rejected credentials: {}", service, message)),
            408 => AtelierError::Transient(message),
            500..=599 => AtelierError::Provider { service, message },
            _ => AtelierError::Provider { service, message },
        }
    }

    /// Build an error from a failure message reported inside a successful
    /// response (e.g. a prediction whose status is "failed").
    pub fn from_upstream_failure(service: &str, message: &str) -> Self {
        if mentions_policy(message) {
            AtelierError::ContentPolicy {
                service: service.to_string(),
                message: message.to_string(),
            }
        } else {
            AtelierError::Provider {
                service: service.to_string(),
                message: message.to_string(),
            }
        }
    }
}

fn mentions_policy(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["nsfw", "safety", "content policy", "moderation", "flagged"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl From<toml::de::Error> for AtelierError {
    fn from(err: toml::de::Error) -> Self {
        AtelierError::TomlParseError(err.to_string())
    }
}

impl From<toml::ser::Error> for AtelierError {
    fn from(err: toml::ser::Error) -> Self {
        AtelierError::TomlSerError(err.to_string())
    }
}

impl From<serde_json::Error> for AtelierError {
    fn from(err: serde_json::Error) -> Self {
        AtelierError::JsonError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            AtelierError::from_status("replicate", 429, "").class(),
            ErrorClass::RateLimited
        );
        assert_eq!(
            AtelierError::from_status("replicate", 422, "NSFW content detected").class(),
            ErrorClass::ContentPolicy
        );
        assert_eq!(
            AtelierError::from_status("replicate", 422, "width must be <= 1440").class(),
            ErrorClass::ParameterRejected
        );
        assert_eq!(
            AtelierError::from_status("openrouter", 503, "overloaded").class(),
            ErrorClass::Provider
        );
        assert_eq!(
            AtelierError::from_status("openrouter", 401, "bad key").class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_upstream_failure_classification() {
        assert_eq!(
            AtelierError::from_upstream_failure("replicate", "NSFW content detected").class(),
            ErrorClass::ContentPolicy
        );
        assert_eq!(
            AtelierError::from_upstream_failure("replicate", "CUDA out of memory").class(),
            ErrorClass::Provider
        );
    }

    #[test]
    fn test_invariant_errors_propagate() {
        let budget = AtelierError::BudgetExceeded {
            requested: 4.0,
            remaining: 2.0,
        };
        assert!(budget.must_propagate());
        assert_eq!(budget.class(), ErrorClass::Fatal);
        assert!(AtelierError::Storage("disk full".into()).must_propagate());
        assert!(!AtelierError::Transient("reset".into()).must_propagate());
    }

    #[test]
    fn test_requeueable_errors() {
        let stopped = AtelierError::GenerationFailed {
            asset: "payroll_icon".into(),
            attempts: Vec::new(),
            fatal: true,
        };
        let exhausted = AtelierError::GenerationFailed {
            asset: "payroll_icon".into(),
            attempts: Vec::new(),
            fatal: false,
        };
        assert!(!stopped.is_requeueable());
        assert!(exhausted.is_requeueable());
        assert!(AtelierError::Transient("reset".into()).is_requeueable());
        assert!(!AtelierError::Config("401 from replicate".into()).is_requeueable());
        assert!(!AtelierError::Storage("disk full".into()).is_requeueable());
    }

    #[test]
    fn test_generation_failed_message_counts_attempts() {
        let err = AtelierError::GenerationFailed {
            asset: "legal_icon".into(),
            attempts: vec![AttemptRecord::success(1, None, "mock")],
            fatal: false,
        };
        assert_eq!(
            err.to_string(),
            "Generation failed for 'legal_icon' after 1 attempts"
        );
    }
}
