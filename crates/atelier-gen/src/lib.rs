//! Atelier Gen - the asset generation engine
//!
//! A run takes a list of asset requests through a bounded worker pool:
//! each task asks several language models for competing image prompts,
//! scores them, renders the winner through an image provider and stores the
//! result in the content-addressed cache. Every paid call is reserved
//! against the budget first, every upstream is guarded by a circuit breaker,
//! and progress is checkpointed so a crashed run resumes without paying
//! twice.

pub mod approval;
pub mod cancel;
pub mod circuit;
pub mod config;
pub mod engine;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod provider;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scoring;
pub mod style;
pub mod transaction;

pub use approval::{ApprovalGate, ApprovalItem, BatchOutcome, Decision};
pub use cancel::CancellationToken;
pub use circuit::{CircuitBreaker, CircuitRegistry, CircuitState, Outcome};
pub use config::AtelierConfig;
pub use engine::{Engine, TaskOutcome};
pub use manifest::{EntryStatus, ReportEntry, RunManifest, RunReport};
pub use orchestrator::{CompetitionContext, OpenRouterOrchestrator, PromptCompetition, PromptVariant};
pub use progress::{ProgressTracker, RunProgress};
pub use provider::{ImageProvider, ImageRequest, ModelClient, ModelRequest};
pub use queue::{AssetRequest, GenerationQueue, GenerationTask};
pub use rate_limit::RateLimiter;
pub use retry::{AttemptPlan, RetryPolicy, RetryRequest, SmartRetryManager};
pub use scoring::{CompetitiveEvaluation, CriteriaWeights, QualityScorer};
pub use style::StyleGuide;
pub use transaction::{BudgetSummary, TransactionManager};
