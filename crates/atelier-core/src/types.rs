//! Status enums and shared records
//!
//! Every status column in the asset database is one of these sum types.
//! Each has a stable lowercase string form used both by serde and by the
//! SQLite layer.

use crate::error::{AtelierError, ErrorClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// UTC wall-clock timestamp
pub type Timestamp = DateTime<Utc>;

/// Current UTC time
pub fn now() -> Timestamp {
    Utc::now()
}

/// Implements `as_str`, `Display` and `FromStr` from one variant/string table.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form, as stored in the database
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AtelierError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AtelierError::ParseError(format!(
                        "invalid {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// The kind of visual asset being generated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    /// Square page icon
    #[default]
    Icon,
    /// Wide page cover/banner
    Cover,
}

string_enum!(AssetType { Icon => "icon", Cover => "cover" });

/// Lifecycle of an asset record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cached,
}

string_enum!(AssetStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cached => "cached",
});

impl AssetStatus {
    /// Whether a record in this state can satisfy a cache lookup.
    ///
    /// `Processing` records reach the table only through a cache store that
    /// is waiting on human approval; their file already exists.
    pub fn is_cache_hit(&self) -> bool {
        matches!(
            self,
            AssetStatus::Completed | AssetStatus::Cached | AssetStatus::Processing
        )
    }
}

/// Lifecycle of a billable transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    RolledBack,
}

string_enum!(TransactionStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    RolledBack => "rolled_back",
});

/// Run checkpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Resumed,
}

string_enum!(CheckpointStatus {
    Started => "started",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Resumed => "resumed",
});

impl CheckpointStatus {
    /// A run in a terminal state has nothing left to resume
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Completed)
    }
}

/// Lifecycle of a queued generation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

string_enum!(GenerationStatus {
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// Queue priority band. Declaration order is dequeue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

string_enum!(Priority {
    Critical => "critical",
    High => "high",
    Normal => "normal",
    Low => "low",
    Background => "background",
});

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Recovery strategy tried after a failed generation attempt.
///
/// Declaration order is the escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    ImmediateRetry,
    SimplifiedPrompt,
    AlternativeModel,
    AdjustedParameters,
    DelayedRetry,
    GenericFallback,
    SkipAsset,
}

string_enum!(RetryStrategy {
    ImmediateRetry => "immediate_retry",
    SimplifiedPrompt => "simplified_prompt",
    AlternativeModel => "alternative_model",
    AdjustedParameters => "adjusted_parameters",
    DelayedRetry => "delayed_retry",
    GenericFallback => "generic_fallback",
    SkipAsset => "skip_asset",
});

impl RetryStrategy {
    /// The full escalation ladder, in order
    pub const LADDER: [RetryStrategy; 7] = [
        RetryStrategy::ImmediateRetry,
        RetryStrategy::SimplifiedPrompt,
        RetryStrategy::AlternativeModel,
        RetryStrategy::AdjustedParameters,
        RetryStrategy::DelayedRetry,
        RetryStrategy::GenericFallback,
        RetryStrategy::SkipAsset,
    ];

    /// Whether this strategy can plausibly fix a failure of the given class
    pub fn applies_to(&self, class: ErrorClass) -> bool {
        use ErrorClass::*;
        match self {
            RetryStrategy::ImmediateRetry => matches!(class, Transient),
            RetryStrategy::SimplifiedPrompt => matches!(class, ContentPolicy | Provider),
            RetryStrategy::AlternativeModel => class != Fatal,
            RetryStrategy::AdjustedParameters => matches!(class, ParameterRejected | Provider),
            RetryStrategy::DelayedRetry => matches!(class, RateLimited | Transient),
            RetryStrategy::GenericFallback => class != Fatal,
            RetryStrategy::SkipAsset => true,
        }
    }
}

/// Human review state of a single approval item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    Timeout,
}

string_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Modified => "modified",
    Timeout => "timeout",
});

impl ApprovalStatus {
    /// Decided or timed out
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// State of an approval batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Resolved,
    Timeout,
}

string_enum!(BatchStatus {
    Pending => "pending",
    Resolved => "resolved",
    Timeout => "timeout",
});

/// One entry in a task's retry history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Strategy in effect (`None` for the first attempt)
    pub strategy: Option<RetryStrategy>,
    /// Upstream service the attempt targeted
    pub service: String,
    /// Error message if the attempt failed
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub class: Option<ErrorClass>,
    /// The breaker was open so no call was issued
    #[serde(default)]
    pub short_circuited: bool,
    pub at: Timestamp,
}

impl AttemptRecord {
    pub fn success(attempt: u32, strategy: Option<RetryStrategy>, service: &str) -> Self {
        Self {
            attempt,
            strategy,
            service: service.to_string(),
            error: None,
            class: None,
            short_circuited: false,
            at: now(),
        }
    }

    pub fn failure(
        attempt: u32,
        strategy: Option<RetryStrategy>,
        service: &str,
        error: &AtelierError,
    ) -> Self {
        Self {
            attempt,
            strategy,
            service: service.to_string(),
            error: Some(error.to_string()),
            class: Some(error.class()),
            short_circuited: false,
            at: now(),
        }
    }

    pub fn short_circuit(attempt: u32, strategy: Option<RetryStrategy>, service: &str) -> Self {
        Self {
            attempt,
            strategy,
            service: service.to_string(),
            error: Some(format!("circuit open for {}", service)),
            class: Some(ErrorClass::Provider),
            short_circuited: true,
            at: now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
