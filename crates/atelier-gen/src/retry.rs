//! Smart retry manager
//!
//! A failed attempt is classified and the manager walks a fixed escalation
//! ladder, skipping strategies that cannot help with that class of error:
//!
//! ```text
//! immediate_retry -> simplified_prompt -> alternative_model -> adjusted_parameters
//!     -> delayed_retry -> generic_fallback -> skip_asset
//! ```
//!
//! The cursor only moves forward, so a task makes at most one attempt per
//! strategy and the sequence for a given series of failures is always the
//! same. Before each call the target service's circuit breaker is asked; an
//! open breaker is recorded as a short-circuited attempt and the walk moves
//! on without waiting.

use crate::cancel::CancellationToken;
use crate::circuit::{CircuitRegistry, Outcome};
use crate::config::RetryConfig;
use crate::provider::{service_key, FallbackPrompt};
use atelier_core::{AssetType, AtelierError, AttemptRecord, ErrorClass, Result, RetryStrategy};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Backoff settings for `delayed_retry`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter, 0.25 = +/-25%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before attempt number `attempt + 1`. An upstream `Retry-After`
    /// wins over the computed value; both are capped at `max_delay`.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay);
        if self.jitter <= 0.0 {
            return raw;
        }
        let factor = 1.0 + self.jitter * rand::rng().random_range(-1.0..=1.0);
        raw.mul_f64(factor.max(0.0)).min(self.max_delay)
    }
}

/// What the retry loop is trying to produce
#[derive(Debug, Clone)]
pub struct RetryRequest {
    /// Label for errors and logs (usually the asset name)
    pub asset: String,
    pub prompt: String,
    pub asset_type: AssetType,
    /// Provider prefix for breaker keys, e.g. "replicate"
    pub provider: String,
    pub model: String,
    /// Models tried by `alternative_model`, in order
    pub alternatives: Vec<String>,
    /// Strategies this caller cannot use
    pub disabled: Vec<RetryStrategy>,
}

impl RetryRequest {
    pub fn new(asset: &str, prompt: &str, asset_type: AssetType, provider: &str, model: &str) -> Self {
        Self {
            asset: asset.to_string(),
            prompt: prompt.to_string(),
            asset_type,
            provider: provider.to_string(),
            model: model.to_string(),
            alternatives: Vec::new(),
            disabled: Vec::new(),
        }
    }

    pub fn with_alternatives(mut self, models: &[String]) -> Self {
        self.alternatives = models
            .iter()
            .filter(|m| **m != self.model)
            .cloned()
            .collect();
        self
    }

    pub fn without(mut self, strategy: RetryStrategy) -> Self {
        self.disabled.push(strategy);
        self
    }
}

/// Everything an attempt function needs to make one call
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptPlan {
    /// 1-based
    pub attempt: u32,
    /// `None` on the first attempt
    pub strategy: Option<RetryStrategy>,
    /// Breaker key, `provider:model`
    pub service: String,
    pub model: String,
    pub prompt: String,
    /// Use conservative parameters
    pub adjust_params: bool,
}

/// State of one task's retry loop
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub strategy: Option<RetryStrategy>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub history: Vec<AttemptRecord>,
}

impl RetryContext {
    /// Attempts beyond the first
    pub fn retry_count(&self) -> u32 {
        self.attempt_count.saturating_sub(1)
    }
}

/// A successful value plus the path that produced it
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub context: RetryContext,
}

pub struct SmartRetryManager {
    breakers: Arc<CircuitRegistry>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl SmartRetryManager {
    pub fn new(breakers: Arc<CircuitRegistry>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            breakers,
            policy,
            cancel,
        }
    }

    /// Run `attempt_fn` until it succeeds or the ladder is exhausted.
    ///
    /// Budget, storage and cancellation errors are returned as-is. A fatal
    /// error or an exhausted ladder yields `GenerationFailed` carrying every
    /// attempt made.
    pub fn execute<T, F>(&self, request: &RetryRequest, mut attempt_fn: F) -> Result<Retried<T>>
    where
        F: FnMut(&AttemptPlan) -> Result<T>,
    {
        let mut ctx = RetryContext::default();
        let mut plan = AttemptPlan {
            attempt: 0,
            strategy: None,
            service: service_key(&request.provider, &request.model),
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            adjust_params: false,
        };
        let mut cursor = 0usize;
        let mut tried_models = vec![request.model.clone()];
        // An open breaker on the very first attempt is treated as a provider failure
        let mut last_class = ErrorClass::Provider;

        loop {
            self.cancel.check()?;
            ctx.attempt_count += 1;
            plan.attempt = ctx.attempt_count;
            ctx.strategy = plan.strategy;

            let breaker = self.breakers.get(&plan.service);
            let mut retry_after = None;
            let short_circuited = !breaker.allow();

            if short_circuited {
                tracing::debug!(
                    asset = %request.asset,
                    service = %plan.service,
                    strategy = ?plan.strategy,
                    "circuit open, skipping call"
                );
                ctx.history
                    .push(AttemptRecord::short_circuit(plan.attempt, plan.strategy, &plan.service));
                ctx.last_error = Some(format!("circuit open for {}", plan.service));
            } else {
                match attempt_fn(&plan) {
                    Ok(value) => {
                        breaker.record(Outcome::Success);
                        ctx.history
                            .push(AttemptRecord::success(plan.attempt, plan.strategy, &plan.service));
                        if plan.attempt > 1 {
                            tracing::info!(
                                asset = %request.asset,
                                attempts = plan.attempt,
                                strategy = ?plan.strategy,
                                "recovered after retry"
                            );
                        }
                        return Ok(Retried { value, context: ctx });
                    }
                    Err(err) if err.must_propagate() => {
                        breaker.abandon();
                        return Err(err);
                    }
                    Err(err) => {
                        let class = err.class();
                        breaker.record(if counts_against_service(class) {
                            Outcome::Failure
                        } else {
                            Outcome::Success
                        });
                        tracing::debug!(
                            asset = %request.asset,
                            service = %plan.service,
                            strategy = ?plan.strategy,
                            class = %class,
                            error = %err,
                            "attempt failed"
                        );
                        ctx.history
                            .push(AttemptRecord::failure(plan.attempt, plan.strategy, &plan.service, &err));
                        ctx.last_error = Some(err.to_string());

                        if class == ErrorClass::Fatal {
                            tracing::warn!(asset = %request.asset, error = %err, "non-retryable failure");
                            return Err(AtelierError::GenerationFailed {
                                asset: request.asset.clone(),
                                attempts: ctx.history,
                                fatal: true,
                            });
                        }
                        if let AtelierError::RateLimited { retry_after: hint, .. } = &err {
                            retry_after = *hint;
                        }
                        last_class = class;
                    }
                }
            }

            self.cancel.check()?;

            // Advance the cursor to the next strategy that can help
            let mut alternative = None;
            let next = loop {
                let Some(&strategy) = RetryStrategy::LADDER.get(cursor) else {
                    break RetryStrategy::SkipAsset;
                };
                cursor += 1;
                if strategy == RetryStrategy::SkipAsset {
                    break strategy;
                }
                if request.disabled.contains(&strategy) || !strategy.applies_to(last_class) {
                    continue;
                }
                if strategy == RetryStrategy::AlternativeModel {
                    alternative = self.pick_alternative(request, &tried_models);
                    if alternative.is_none() {
                        continue;
                    }
                }
                break strategy;
            };

            if next == RetryStrategy::SkipAsset {
                ctx.strategy = Some(RetryStrategy::SkipAsset);
                tracing::warn!(
                    asset = %request.asset,
                    attempts = ctx.attempt_count,
                    last_error = ctx.last_error.as_deref().unwrap_or(""),
                    "retry strategies exhausted, skipping asset"
                );
                return Err(AtelierError::GenerationFailed {
                    asset: request.asset.clone(),
                    attempts: ctx.history,
                    fatal: false,
                });
            }

            plan.strategy = Some(next);
            match next {
                RetryStrategy::SimplifiedPrompt => plan.prompt = simplify_prompt(&plan.prompt),
                RetryStrategy::AlternativeModel => {
                    if let Some(model) = alternative {
                        plan.service = service_key(&request.provider, &model);
                        tried_models.push(model.clone());
                        plan.model = model;
                    }
                }
                RetryStrategy::AdjustedParameters => plan.adjust_params = true,
                RetryStrategy::DelayedRetry => {
                    if !short_circuited {
                        let delay = self.policy.backoff(ctx.attempt_count, retry_after);
                        tracing::debug!(asset = %request.asset, delay_ms = delay.as_millis() as u64, "backing off");
                        self.cancel.sleep(delay)?;
                    }
                }
                RetryStrategy::GenericFallback => {
                    plan.prompt = request.asset_type.fallback_prompt(&request.asset);
                    plan.adjust_params = false;
                }
                RetryStrategy::ImmediateRetry | RetryStrategy::SkipAsset => {}
            }
        }
    }

    /// First untried alternative whose breaker isn't open
    fn pick_alternative(&self, request: &RetryRequest, tried: &[String]) -> Option<String> {
        request
            .alternatives
            .iter()
            .filter(|model| !tried.contains(*model))
            .find(|model| {
                let breaker = self.breakers.get(&service_key(&request.provider, model));
                breaker.state() != crate::circuit::CircuitState::Open
            })
            .cloned()
    }
}

/// Errors that say something about the upstream's health. A refusal on
/// content or parameters means the service answered.
fn counts_against_service(class: ErrorClass) -> bool {
    matches!(
        class,
        ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::Provider
    )
}

/// Reduce a prompt to its leading clause, at most twelve words
pub fn simplify_prompt(prompt: &str) -> String {
    let lead = prompt
        .split(|c| matches!(c, '.' | ';' | ',' | ':' | '\n'))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| prompt.trim());
    let words: Vec<&str> = lead.split_whitespace().take(12).collect();
    format!("{}, simple clean illustration", words.join(" "))
}

/// Storage failures get exactly one more try; a second failure is returned
pub fn retry_storage_once<T>(operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(AtelierError::Storage(message)) => {
            tracing::warn!(operation, error = %message, "storage error, retrying once");
            op()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::config::CircuitBreakerConfig;
    use crate::providers::mock::MockFailure;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    fn manager_with(breakers: Arc<CircuitRegistry>) -> SmartRetryManager {
        SmartRetryManager::new(breakers, fast_policy(), CancellationToken::new())
    }

    fn manager() -> SmartRetryManager {
        manager_with(Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 100,
            window_secs: 60,
            cooldown_secs: 60,
        })))
    }

    fn request() -> RetryRequest {
        RetryRequest::new(
            "legal_icon",
            "Legal Documents icon, a neat stack of papers with a seal, warm light",
            AssetType::Icon,
            "mock",
            "flux-schnell",
        )
        .with_alternatives(&["sdxl".to_string()])
    }

    /// Drive the manager with a scripted sequence of failures, then succeed
    fn run_script(
        mgr: &SmartRetryManager,
        req: &RetryRequest,
        script: &[MockFailure],
    ) -> (Result<Retried<u32>>, Vec<AttemptPlan>) {
        let failures = RefCell::new(script.iter().copied().collect::<VecDeque<_>>());
        let plans = RefCell::new(Vec::new());
        let result = mgr.execute(req, |plan| {
            plans.borrow_mut().push(plan.clone());
            match failures.borrow_mut().pop_front() {
                Some(failure) => Err(failure.into_error(&plan.service)),
                None => Ok(plan.attempt),
            }
        });
        (result, plans.into_inner())
    }

    #[test]
    fn test_first_attempt_success() {
        let (result, plans) = run_script(&manager(), &request(), &[]);
        let retried = result.unwrap();
        assert_eq!(retried.value, 1);
        assert_eq!(retried.context.retry_count(), 0);
        assert_eq!(plans[0].strategy, None);
        assert_eq!(retried.context.history.len(), 1);
        assert!(retried.context.history[0].succeeded());
    }

    #[test]
    fn test_escalation_order_is_deterministic() {
        let script = [
            MockFailure::Transient,
            MockFailure::ContentPolicy,
            MockFailure::Provider,
            MockFailure::ParameterRejected,
            MockFailure::RateLimited,
            MockFailure::ContentPolicy,
            MockFailure::Provider,
        ];

        for _ in 0..3 {
            let (result, plans) = run_script(&manager(), &request(), &script);
            let strategies: Vec<_> = plans.iter().map(|p| p.strategy).collect();
            assert_eq!(
                strategies,
                vec![
                    None,
                    Some(RetryStrategy::ImmediateRetry),
                    Some(RetryStrategy::SimplifiedPrompt),
                    Some(RetryStrategy::AlternativeModel),
                    Some(RetryStrategy::AdjustedParameters),
                    Some(RetryStrategy::DelayedRetry),
                    Some(RetryStrategy::GenericFallback),
                ]
            );
            match result {
                Err(AtelierError::GenerationFailed { asset, attempts, .. }) => {
                    assert_eq!(asset, "legal_icon");
                    assert_eq!(attempts.len(), 7);
                    assert!(attempts.iter().all(|a| !a.succeeded()));
                }
                other => panic!("expected GenerationFailed, got {:?}", other.map(|r| r.value)),
            }
        }
    }

    #[test]
    fn test_strategies_transform_the_plan() {
        let script = [
            MockFailure::ContentPolicy,
            MockFailure::Provider,
            MockFailure::ParameterRejected,
        ];
        let (result, plans) = run_script(&manager(), &request(), &script);
        assert!(result.is_ok());

        assert_eq!(plans[1].strategy, Some(RetryStrategy::SimplifiedPrompt));
        assert_eq!(
            plans[1].prompt,
            "Legal Documents icon, simple clean illustration"
        );
        assert_eq!(plans[2].strategy, Some(RetryStrategy::AlternativeModel));
        assert_eq!(plans[2].model, "sdxl");
        assert_eq!(plans[2].service, "mock:sdxl");
        assert_eq!(plans[3].strategy, Some(RetryStrategy::AdjustedParameters));
        assert!(plans[3].adjust_params);
    }

    #[test]
    fn test_inapplicable_strategies_are_skipped() {
        // A rate limit can only be helped by switching model or waiting
        let (result, plans) = run_script(
            &manager(),
            &request(),
            &[MockFailure::RateLimited, MockFailure::RateLimited],
        );
        assert!(result.is_ok());
        assert_eq!(plans[1].strategy, Some(RetryStrategy::AlternativeModel));
        assert_eq!(plans[2].strategy, Some(RetryStrategy::DelayedRetry));
    }

    #[test]
    fn test_generic_fallback_uses_canned_prompt() {
        let req = request().without(RetryStrategy::AlternativeModel);
        let (result, plans) = run_script(
            &manager(),
            &req,
            &[MockFailure::ContentPolicy, MockFailure::ContentPolicy],
        );
        assert!(result.is_ok());
        assert_eq!(plans[2].strategy, Some(RetryStrategy::GenericFallback));
        assert!(plans[2].prompt.contains("legal_icon"));
        assert!(plans[2].prompt.contains("no text"));
    }

    #[test]
    fn test_fatal_error_stops_immediately() {
        let (result, plans) = run_script(&manager(), &request(), &[MockFailure::Auth]);
        assert_eq!(plans.len(), 1);
        match result {
            Err(AtelierError::GenerationFailed { attempts, .. }) => assert_eq!(attempts.len(), 1),
            other => panic!("expected GenerationFailed, got {:?}", other.map(|r| r.value)),
        }
    }

    #[test]
    fn test_budget_error_propagates_unchanged() {
        let calls = RefCell::new(0);
        let result: Result<Retried<()>> = manager().execute(&request(), |_| {
            *calls.borrow_mut() += 1;
            Err(AtelierError::BudgetExceeded {
                requested: 4.0,
                remaining: 2.0,
            })
        });
        assert!(matches!(result, Err(AtelierError::BudgetExceeded { .. })));
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn test_open_breaker_short_circuits_to_alternative() {
        let breakers = Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            window_secs: 60,
            cooldown_secs: 3600,
        }));
        breakers.get("mock:flux-schnell").record(Outcome::Failure);
        assert_eq!(breakers.get("mock:flux-schnell").state(), CircuitState::Open);

        let mgr = manager_with(breakers);
        let (result, plans) = run_script(&mgr, &request(), &[]);
        let retried = result.unwrap();

        // Only the alternative model was actually called
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].model, "sdxl");
        let history = &retried.context.history;
        assert_eq!(history.len(), 3);
        assert!(history[0].short_circuited);
        assert!(history[1].short_circuited);
        assert_eq!(history[1].strategy, Some(RetryStrategy::SimplifiedPrompt));
        assert_eq!(history[2].strategy, Some(RetryStrategy::AlternativeModel));
        assert!(history[2].succeeded());
    }

    #[test]
    fn test_failures_feed_the_breaker() {
        let breakers = Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            window_secs: 60,
            cooldown_secs: 3600,
        }));
        let mgr = manager_with(breakers.clone());
        let req = request().without(RetryStrategy::AlternativeModel);
        let (result, plans) = run_script(
            &mgr,
            &req,
            &[MockFailure::Transient, MockFailure::Transient, MockFailure::Transient],
        );

        // Two transient failures open the breaker; later strategies short-circuit
        assert_eq!(breakers.get("mock:flux-schnell").state(), CircuitState::Open);
        assert_eq!(plans.len(), 2);
        assert!(matches!(result, Err(AtelierError::GenerationFailed { .. })));
    }

    #[test]
    fn test_cancellation_before_escalation() {
        let cancel = CancellationToken::new();
        let mgr = SmartRetryManager::new(
            Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default())),
            fast_policy(),
            cancel.clone(),
        );
        let result: Result<Retried<()>> = mgr.execute(&request(), |plan| {
            cancel.cancel();
            Err(MockFailure::Transient.into_error(&plan.service))
        });
        assert!(matches!(result, Err(AtelierError::Cancelled)));
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.25,
        };
        for attempt in 1..10 {
            let delay = policy.backoff(attempt, None);
            assert!(delay <= Duration::from_millis(1000));
        }
        let first = policy.backoff(1, None);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        assert_eq!(
            policy.backoff(3, Some(Duration::from_secs(60))),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_simplify_prompt() {
        assert_eq!(
            simplify_prompt("  Roadmap cover: winding road; sunrise"),
            "Roadmap cover, simple clean illustration"
        );
        let long = "one two three four five six seven eight nine ten eleven twelve thirteen";
        assert_eq!(
            simplify_prompt(long),
            "one two three four five six seven eight nine ten eleven twelve, simple clean illustration"
        );
    }

    #[test]
    fn test_retry_storage_once() {
        let mut calls = 0;
        let result = retry_storage_once("write", || {
            calls += 1;
            if calls == 1 {
                Err(AtelierError::Storage("locked".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);

        let mut calls = 0;
        let result: Result<()> = retry_storage_once("write", || {
            calls += 1;
            Err(AtelierError::Storage("disk full".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
