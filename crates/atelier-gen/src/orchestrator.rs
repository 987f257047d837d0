//! Competitive prompt generation
//!
//! Every configured text model is asked, in parallel, to write an image
//! prompt for the same asset. Each model call runs inside its own retry loop
//! behind its own circuit breaker and takes a token from the shared rate
//! limiter before going out. Some models failing is fine; the competition
//! only fails when none of them produced a variant.

use crate::cancel::CancellationToken;
use crate::circuit::CircuitRegistry;
use crate::config::CompetitionConfig;
use crate::provider::{service_key, FallbackPrompt, ModelClient, ModelRequest};
use crate::rate_limit::RateLimiter;
use crate::retry::{AttemptPlan, RetryPolicy, RetryRequest, SmartRetryManager};
use crate::scoring::{CompetitiveEvaluation, QualityScorer};
use crate::style::StyleGuide;
use atelier_core::{AssetType, AtelierError, AttemptRecord, Result, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const DEFAULT_SYSTEM_PROMPT: &str = "You write prompts for image generation models. \
Prompts are concrete and visual, one or two sentences, and never ask for text in the image.";

/// What the competing models are told about the asset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetitionContext {
    pub asset_name: String,
    pub description: String,
    pub asset_type: AssetType,
    #[serde(default)]
    pub style_keywords: Vec<String>,
    #[serde(default)]
    pub brand_keywords: Vec<String>,
    #[serde(default)]
    pub mood: Vec<String>,
    #[serde(default)]
    pub avoid: Vec<String>,
}

impl CompetitionContext {
    pub fn new(asset_name: &str, description: &str, asset_type: AssetType) -> Self {
        Self {
            asset_name: asset_name.to_string(),
            description: description.to_string(),
            asset_type,
            ..Default::default()
        }
    }

    pub fn with_style(mut self, style: &StyleGuide) -> Self {
        self.style_keywords = style.keywords.clone();
        self.brand_keywords = style.brand.keywords.clone();
        self.mood = style.brand.mood.clone();
        self.avoid = style.brand.avoid.clone();
        self
    }

    /// The user message sent to each model, describing the asset with
    /// `description` (which a retry may have simplified)
    pub fn instruction_for(&self, description: &str) -> String {
        let (width, height) = self.asset_type.dimensions();
        let shape = match self.asset_type {
            AssetType::Icon => "square icon",
            AssetType::Cover => "wide page cover banner",
        };
        let mut lines = vec![
            "Write one prompt for an image generation model.".to_string(),
            format!("Asset: {}", self.asset_name),
            format!("Format: {} ({}x{})", shape, width, height),
            format!("Description: {}", description),
        ];
        if !self.style_keywords.is_empty() {
            lines.push(format!("Style: {}", self.style_keywords.join(", ")));
        }
        if !self.brand_keywords.is_empty() {
            lines.push(format!("Brand: {}", self.brand_keywords.join(", ")));
        }
        if !self.mood.is_empty() {
            lines.push(format!("Mood: {}", self.mood.join(", ")));
        }
        if !self.avoid.is_empty() {
            lines.push(format!("Avoid: {}", self.avoid.join(", ")));
        }
        lines.push(
            "Respond with JSON only: {\"prompt\": \"...\", \"rationale\": \"...\"}".to_string(),
        );
        lines.join("\n")
    }
}

/// One model's candidate prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVariant {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub rationale: Option<String>,
    /// Model output as received
    pub raw_response: String,
    pub cost: f64,
    /// 0 for the first variant to come back
    pub arrival: u32,
}

/// All variants produced for one asset, plus the scorer's verdict once resolved
#[derive(Debug, Clone, Serialize)]
pub struct PromptCompetition {
    pub asset_id: String,
    pub context: CompetitionContext,
    /// In arrival order
    pub variants: Vec<PromptVariant>,
    /// Models that produced nothing, with their last error
    pub failures: Vec<(String, String)>,
    /// Best first, filled by `resolve`
    pub evaluations: Vec<CompetitiveEvaluation>,
}

impl PromptCompetition {
    /// Score the variants and pick the winner
    pub fn resolve(&mut self, scorer: &QualityScorer) -> Option<&CompetitiveEvaluation> {
        self.evaluations = QualityScorer::ranking(scorer.evaluate(self));
        self.evaluations.first()
    }

    pub fn winner(&self) -> Option<&PromptVariant> {
        self.evaluations.first().map(|e| &e.variant)
    }

    /// Spend across every successful model call
    pub fn total_cost(&self) -> f64 {
        self.variants.iter().map(|v| v.cost).sum()
    }
}

pub struct OpenRouterOrchestrator {
    client: Arc<dyn ModelClient>,
    config: CompetitionConfig,
    breakers: Arc<CircuitRegistry>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl OpenRouterOrchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        config: CompetitionConfig,
        breakers: Arc<CircuitRegistry>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            breakers,
            limiter,
            policy,
            cancel,
        }
    }

    pub fn models(&self) -> &[String] {
        &self.config.models
    }

    /// Ask every model for a variant, in parallel
    pub fn generate_competition(&self, context: &CompetitionContext) -> Result<PromptCompetition> {
        if self.config.models.is_empty() {
            return Err(AtelierError::Config("no competition models configured".to_string()));
        }
        self.cancel.check()?;

        let arrivals = AtomicU32::new(0);
        let results: Vec<(String, Result<PromptVariant>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .config
                .models
                .iter()
                .map(|model| {
                    let arrivals = &arrivals;
                    let handle = scope.spawn(move || self.run_model(model, context, arrivals));
                    (model.clone(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(model, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(AtelierError::Provider {
                            service: service_key(self.client.name(), &model),
                            message: "model worker panicked".to_string(),
                        })
                    });
                    (model, result)
                })
                .collect()
        });

        // Results that arrive after cancellation are discarded
        self.cancel.check()?;

        let mut variants = Vec::new();
        let mut failures = Vec::new();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        // Every model stopped on a non-retryable answer
        let mut all_fatal = true;
        for (model, result) in results {
            match result {
                Ok(variant) => variants.push(variant),
                Err(err) if err.must_propagate() => return Err(err),
                Err(err) => {
                    tracing::warn!(asset = %context.asset_name, model = %model, error = %err, "model dropped out of competition");
                    if let AtelierError::GenerationFailed { attempts: history, .. } = &err {
                        attempts.extend(history.iter().cloned());
                    }
                    all_fatal &= !err.is_requeueable();
                    failures.push((model, err.to_string()));
                }
            }
        }

        if variants.is_empty() {
            return Err(AtelierError::GenerationFailed {
                asset: context.asset_name.clone(),
                attempts,
                fatal: all_fatal,
            });
        }
        variants.sort_by_key(|v| v.arrival);

        tracing::info!(
            asset = %context.asset_name,
            variants = variants.len(),
            failed = failures.len(),
            "competition complete"
        );
        Ok(PromptCompetition {
            asset_id: context.asset_name.clone(),
            context: context.clone(),
            variants,
            failures,
            evaluations: Vec::new(),
        })
    }

    fn run_model(&self, model: &str, context: &CompetitionContext, arrivals: &AtomicU32) -> Result<PromptVariant> {
        let manager = SmartRetryManager::new(self.breakers.clone(), self.policy.clone(), self.cancel.clone());
        // The retry loop rewrites the description; other models are already competing
        let request = RetryRequest::new(
            &context.asset_name,
            &context.description,
            context.asset_type,
            self.client.name(),
            model,
        )
        .without(RetryStrategy::AlternativeModel)
        .without(RetryStrategy::GenericFallback);

        let retried = manager.execute(&request, |plan| self.attempt(plan, context))?;
        let mut variant = retried.value;
        variant.arrival = arrivals.fetch_add(1, Ordering::SeqCst);
        Ok(variant)
    }

    fn attempt(&self, plan: &AttemptPlan, context: &CompetitionContext) -> Result<PromptVariant> {
        self.limiter.acquire_cancellable(&self.cancel)?;

        let temperature = if plan.adjust_params {
            (self.config.temperature * 0.5).max(0.1)
        } else {
            self.config.temperature
        };
        let request = ModelRequest {
            model: plan.model.clone(),
            system: Some(
                self.config
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            ),
            prompt: context.instruction_for(&plan.prompt),
            temperature,
            max_tokens: self.config.max_tokens,
        };
        let response = self.client.complete(&request)?;
        let (prompt, rationale) = parse_variant_text(&plan.service, &response.text)?;

        Ok(PromptVariant {
            model: plan.model.clone(),
            prompt,
            rationale,
            raw_response: response.raw,
            cost: response.cost,
            arrival: 0,
        })
    }
}

#[derive(Deserialize)]
struct VariantJson {
    prompt: String,
    #[serde(default)]
    rationale: Option<String>,
}

/// Pull `{prompt, rationale}` out of a model reply. JSON may be bare, fenced
/// or embedded in prose; anything else is taken as the prompt itself.
pub fn parse_variant_text(service: &str, text: &str) -> Result<(String, Option<String>)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AtelierError::Provider {
            service: service.to_string(),
            message: "empty completion".to_string(),
        });
    }

    let candidates = [
        Some(trimmed),
        fenced_block(trimmed),
        trimmed
            .find('{')
            .zip(trimmed.rfind('}'))
            .filter(|(start, end)| start < end)
            .map(|(start, end)| &trimmed[start..=end]),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(parsed) = serde_json::from_str::<VariantJson>(candidate) {
            let prompt = parsed.prompt.trim().to_string();
            if prompt.is_empty() {
                break;
            }
            let rationale = parsed
                .rationale
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty());
            return Ok((prompt, rationale));
        }
    }

    let raw = trimmed.trim_matches(|c| c == '"' || c == '`').trim();
    if raw.is_empty() || raw.starts_with('{') {
        return Err(AtelierError::Provider {
            service: service.to_string(),
            message: "completion did not contain a prompt".to_string(),
        });
    }
    Ok((raw.to_string(), None))
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::providers::mock::{MockFailure, MockModelClient};
    use std::time::Duration;

    fn config(models: &[&str]) -> CompetitionConfig {
        CompetitionConfig {
            models: models.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    fn orchestrator(client: Arc<MockModelClient>, models: &[&str]) -> OpenRouterOrchestrator {
        OpenRouterOrchestrator::new(
            client,
            config(models),
            Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(RateLimiter::unlimited()),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: 0.0,
            },
            CancellationToken::new(),
        )
    }

    fn context() -> CompetitionContext {
        CompetitionContext::new("Legal Documents", "Legal Documents icon", AssetType::Icon)
    }

    #[test]
    fn test_instruction_carries_context() {
        let style = StyleGuide {
            name: "calm".to_string(),
            keywords: vec!["watercolor".to_string()],
            ..Default::default()
        };
        let text = context().with_style(&style).instruction_for("a stack of papers");
        assert!(text.contains("Asset: Legal Documents"));
        assert!(text.contains("Description: a stack of papers"));
        assert!(text.contains("Style: watercolor"));
        assert!(text.contains("512x512"));
        assert!(!text.contains("Mood:"));
    }

    #[test]
    fn test_competition_collects_every_model() {
        let client = Arc::new(MockModelClient::new());
        let orch = orchestrator(client.clone(), &["model-a", "model-b", "model-c"]);
        let competition = orch.generate_competition(&context()).unwrap();

        assert_eq!(competition.variants.len(), 3);
        assert!(competition.failures.is_empty());
        let arrivals: Vec<u32> = competition.variants.iter().map(|v| v.arrival).collect();
        assert_eq!(arrivals, vec![0, 1, 2]);
        assert!(competition
            .variants
            .iter()
            .all(|v| v.prompt.contains("Legal Documents icon")));
        assert_eq!(client.call_count(), 3);
    }

    #[test]
    fn test_partial_failure_is_tolerated() {
        let client = Arc::new(MockModelClient::new());
        client.fail_model("model-b", &[MockFailure::Auth]);
        let orch = orchestrator(client, &["model-a", "model-b"]);

        let competition = orch.generate_competition(&context()).unwrap();
        assert_eq!(competition.variants.len(), 1);
        assert_eq!(competition.variants[0].model, "model-a");
        assert_eq!(competition.failures.len(), 1);
        assert_eq!(competition.failures[0].0, "model-b");
    }

    #[test]
    fn test_transient_failure_recovers_within_model() {
        let client = Arc::new(MockModelClient::new());
        client.fail_model("model-a", &[MockFailure::Transient]);
        let orch = orchestrator(client.clone(), &["model-a"]);

        let competition = orch.generate_competition(&context()).unwrap();
        assert_eq!(competition.variants.len(), 1);
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn test_zero_variants_is_generation_failed() {
        let client = Arc::new(MockModelClient::new());
        client.fail_model("model-a", &[MockFailure::Auth]);
        client.fail_model("model-b", &[MockFailure::Auth]);
        let orch = orchestrator(client, &["model-a", "model-b"]);

        match orch.generate_competition(&context()) {
            Err(AtelierError::GenerationFailed { asset, attempts, fatal }) => {
                assert_eq!(asset, "Legal Documents");
                assert_eq!(attempts.len(), 2);
                assert!(fatal, "bad credentials on every model should not be re-run");
            }
            other => panic!("expected GenerationFailed, got {:?}", other.map(|c| c.variants.len())),
        }
    }

    #[test]
    fn test_resolve_picks_a_winner() {
        let client = Arc::new(MockModelClient::new());
        client.respond_with("vague", "something nice");
        let orch = orchestrator(client, &["vague", "model-a"]);

        let mut competition = orch.generate_competition(&context()).unwrap();
        let winner_model = competition
            .resolve(&QualityScorer::default())
            .map(|e| e.variant.model.clone());
        assert_eq!(winner_model.as_deref(), Some("model-a"));
        assert_eq!(competition.evaluations.len(), 2);
        assert_eq!(competition.winner().map(|v| v.model.as_str()), Some("model-a"));
        assert!(competition.total_cost() > 0.0);
    }

    #[test]
    fn test_cancelled_competition_discards_results() {
        let client = Arc::new(MockModelClient::new());
        let orch = orchestrator(client, &["model-a"]);
        orch.cancel.cancel();
        assert!(matches!(
            orch.generate_competition(&context()),
            Err(AtelierError::Cancelled)
        ));
    }

    #[test]
    fn test_parse_variant_text() {
        let (prompt, rationale) =
            parse_variant_text("s", r#"{"prompt": "a seal on papers", "rationale": "clear"}"#).unwrap();
        assert_eq!(prompt, "a seal on papers");
        assert_eq!(rationale.as_deref(), Some("clear"));

        let fenced = "Here you go:\n```json\n{\"prompt\": \"road at dawn\"}\n```";
        assert_eq!(parse_variant_text("s", fenced).unwrap().0, "road at dawn");

        let embedded = "Sure! {\"prompt\": \"folder icon\"} hope it helps";
        assert_eq!(parse_variant_text("s", embedded).unwrap().0, "folder icon");

        let raw = "\"A calm folder icon\"";
        assert_eq!(
            parse_variant_text("s", raw).unwrap(),
            ("A calm folder icon".to_string(), None)
        );

        assert!(matches!(
            parse_variant_text("s", "   "),
            Err(AtelierError::Provider { .. })
        ));
        assert!(parse_variant_text("s", "{\"prompt\": \"\"}").is_err());
    }
}
