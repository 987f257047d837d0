//! Layered configuration system
//!
//! Config is loaded with three layers of precedence (highest wins):
//! 1. Environment variables: `ATELIER_{PROVIDER}_API_KEY`, `ATELIER_BUDGET_CEILING`
//! 2. Project-local: `.atelier/config.toml`
//! 3. Global: `~/.atelier/config.toml`
//!
//! Provider entries merge field by field; every other section present in a
//! higher layer replaces the lower one wholesale.

use crate::scoring::CriteriaWeights;
use atelier_core::{AssetType, AtelierError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Provider-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-call deadline
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Model used when a request doesn't name one
    #[serde(default)]
    pub model: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Worker pool and queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    /// Global outbound request ceiling shared by every worker
    pub requests_per_second: f64,
    pub burst: u32,
    /// Queue-level attempts per task (each attempt walks the full retry ladder)
    pub max_attempts: u32,
    /// Pull tasks in batches grouped by target model
    pub batch_mode: bool,
    pub batch_size: usize,
    /// Delay before a failed task becomes eligible again
    pub requeue_backoff_ms: u64,
    pub image_provider: String,
    pub model_client: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            requests_per_second: 2.0,
            burst: 2,
            max_attempts: 3,
            batch_mode: false,
            batch_size: 4,
            requeue_backoff_ms: 2000,
            image_provider: "replicate".to_string(),
            model_client: "openrouter".to_string(),
        }
    }
}

/// Spending limits and per-asset estimates in USD
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub ceiling: f64,
    pub icon: f64,
    pub cover: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            ceiling: 10.0,
            icon: 0.003,
            cover: 0.04,
        }
    }
}

impl BudgetConfig {
    /// Estimated cost of rendering one asset of the given type
    pub fn estimate(&self, asset_type: AssetType) -> f64 {
        match asset_type {
            AssetType::Icon => self.icon,
            AssetType::Cover => self.cover,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Failures older than this no longer count toward the threshold
    pub window_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fractional jitter applied to backoff delays (0.25 = +/-25%)
    pub jitter: f64,
    /// Image models tried by the alternative_model strategy, in order
    pub fallback_models: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.25,
            fallback_models: vec![
                "black-forest-labs/flux-dev".to_string(),
                "stability-ai/sdxl".to_string(),
            ],
        }
    }
}

/// Prompt competition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompetitionConfig {
    pub models: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for CompetitionConfig {
    fn default() -> Self {
        Self {
            models: vec![
                "anthropic/claude-3.5-sonnet".to_string(),
                "openai/gpt-4o-mini".to_string(),
                "google/gemini-flash-1.5".to_string(),
            ],
            system_prompt: None,
            temperature: 0.8,
            max_tokens: 400,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: CriteriaWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Hold generated assets for human sign-off
    pub required: bool,
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            required: false,
            timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub asset_dir: PathBuf,
    /// Where providers write files before they enter the store
    pub scratch_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(".atelier/assets.db"),
            asset_dir: PathBuf::from(".atelier/assets"),
            scratch_dir: PathBuf::from(".atelier/scratch"),
        }
    }
}

/// Top-level config file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtelierConfigFile {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub competition: Option<CompetitionConfig>,
    #[serde(default)]
    pub scoring: Option<ScoringConfig>,
    #[serde(default)]
    pub approval: Option<ApprovalConfig>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    /// Default style guide name
    #[serde(default)]
    pub style: Option<String>,
}

/// Resolved configuration with environment variable overrides applied
#[derive(Debug, Clone, Default)]
pub struct AtelierConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub engine: EngineConfig,
    pub budget: BudgetConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub competition: CompetitionConfig,
    pub scoring: ScoringConfig,
    pub approval: ApprovalConfig,
    pub storage: StorageConfig,
    pub style: Option<String>,
}

const ENV_PROVIDERS: [&str; 2] = ["openrouter", "replicate"];

impl AtelierConfig {
    /// Load config with layered precedence: global < project < env vars
    pub fn load() -> Result<Self> {
        let mut config = AtelierConfigFile::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let global = Self::load_file(&global_path)?;
                Self::merge_into(&mut config, global);
            }
        }

        let local_path = PathBuf::from(".atelier/config.toml");
        if local_path.exists() {
            let local = Self::load_file(&local_path)?;
            Self::merge_into(&mut config, local);
        }

        Self::apply_env_overrides(&mut config)?;
        Self::resolve(config)
    }

    /// Load config from a specific file path only (for testing)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Self::resolve(config)
    }

    /// Parse config from a TOML string without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: AtelierConfigFile = toml::from_str(content)?;
        Self::resolve(file)
    }

    pub fn api_key(&self, provider_name: &str) -> Option<&str> {
        self.providers
            .get(provider_name)
            .and_then(|p| p.api_key.as_deref())
    }

    pub fn api_url(&self, provider_name: &str) -> Option<&str> {
        self.providers
            .get(provider_name)
            .and_then(|p| p.api_url.as_deref())
    }

    pub fn is_enabled(&self, provider_name: &str) -> bool {
        self.providers
            .get(provider_name)
            .map(|p| p.enabled)
            .unwrap_or(true)
    }

    /// Per-call timeout for a provider, falling back to the competition timeout
    pub fn timeout(&self, provider_name: &str) -> Duration {
        let secs = self
            .providers
            .get(provider_name)
            .and_then(|p| p.timeout_secs)
            .unwrap_or(self.competition.timeout_secs);
        Duration::from_secs(secs.max(1))
    }

    /// Model override configured for a provider
    pub fn provider_model(&self, provider_name: &str) -> Option<&str> {
        self.providers
            .get(provider_name)
            .and_then(|p| p.model.as_deref())
    }

    pub fn default_style(&self) -> Option<&str> {
        self.style.as_deref()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent == 0 {
            return Err(AtelierError::Config(
                "engine.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.engine.batch_size == 0 {
            return Err(AtelierError::Config(
                "engine.batch_size must be at least 1".to_string(),
            ));
        }
        if self.budget.ceiling.is_nan() || self.budget.ceiling < 0.0 {
            return Err(AtelierError::Config(format!(
                "budget.ceiling must be non-negative, got {}",
                self.budget.ceiling
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AtelierError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.competition.models.is_empty() {
            return Err(AtelierError::Config(
                "competition.models must name at least one model".to_string(),
            ));
        }
        self.scoring.weights.validate()
    }

    fn resolve(file: AtelierConfigFile) -> Result<Self> {
        let config = AtelierConfig {
            providers: file.providers,
            engine: file.engine.unwrap_or_default(),
            budget: file.budget.unwrap_or_default(),
            circuit_breaker: file.circuit_breaker.unwrap_or_default(),
            retry: file.retry.unwrap_or_default(),
            competition: file.competition.unwrap_or_default(),
            scoring: file.scoring.unwrap_or_default(),
            approval: file.approval.unwrap_or_default(),
            storage: file.storage.unwrap_or_default(),
            style: file.style,
        };
        config.validate()?;
        Ok(config)
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".atelier").join("config.toml"))
    }

    fn load_file(path: &Path) -> Result<AtelierConfigFile> {
        let content = std::fs::read_to_string(path)?;
        let config: AtelierConfigFile = toml::from_str(&content).map_err(|e| {
            AtelierError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    fn merge_into(base: &mut AtelierConfigFile, overlay: AtelierConfigFile) {
        for (name, provider) in overlay.providers {
            let entry = base.providers.entry(name).or_default();
            if provider.api_key.is_some() {
                entry.api_key = provider.api_key;
            }
            if provider.api_url.is_some() {
                entry.api_url = provider.api_url;
            }
            if provider.timeout_secs.is_some() {
                entry.timeout_secs = provider.timeout_secs;
            }
            if provider.model.is_some() {
                entry.model = provider.model;
            }
            entry.enabled = provider.enabled;
        }

        if overlay.engine.is_some() {
            base.engine = overlay.engine;
        }
        if overlay.budget.is_some() {
            base.budget = overlay.budget;
        }
        if overlay.circuit_breaker.is_some() {
            base.circuit_breaker = overlay.circuit_breaker;
        }
        if overlay.retry.is_some() {
            base.retry = overlay.retry;
        }
        if overlay.competition.is_some() {
            base.competition = overlay.competition;
        }
        if overlay.scoring.is_some() {
            base.scoring = overlay.scoring;
        }
        if overlay.approval.is_some() {
            base.approval = overlay.approval;
        }
        if overlay.storage.is_some() {
            base.storage = overlay.storage;
        }
        if overlay.style.is_some() {
            base.style = overlay.style;
        }
    }

    fn apply_env_overrides(config: &mut AtelierConfigFile) -> Result<()> {
        for name in &ENV_PROVIDERS {
            let env_key = format!("ATELIER_{}_API_KEY", name.to_uppercase());
            if let Ok(key) = std::env::var(&env_key) {
                let entry = config.providers.entry(name.to_string()).or_default();
                entry.api_key = Some(key);
            }
        }

        if let Ok(raw) = std::env::var("ATELIER_BUDGET_CEILING") {
            let ceiling: f64 = raw.trim().parse().map_err(|_| {
                AtelierError::Config(format!("ATELIER_BUDGET_CEILING is not a number: {}", raw))
            })?;
            config.budget.get_or_insert_with(BudgetConfig::default).ceiling = ceiling;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_config(content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("atelier_config_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_config_from_file() {
        let config_str = r#"
style = "calm_office"

[providers.openrouter]
api_url = "https://openrouter.example.com/api/v1"
enabled = true
timeout_secs = 20

[providers.replicate]
enabled = false

[engine]
max_concurrent = 5
requests_per_second = 4.0

[budget]
ceiling = 25.0
"#;
        let path = temp_config(config_str);
        let config = AtelierConfig::load_from_file(&path).unwrap();

        assert!(config.is_enabled("openrouter"));
        assert!(!config.is_enabled("replicate"));
        assert_eq!(config.default_style(), Some("calm_office"));
        assert_eq!(
            config.api_url("openrouter"),
            Some("https://openrouter.example.com/api/v1")
        );
        assert_eq!(config.timeout("openrouter"), Duration::from_secs(20));
        assert_eq!(config.engine.max_concurrent, 5);
        // Unset keys inside a present section keep their defaults
        assert_eq!(config.engine.batch_size, 4);
        assert_eq!(config.budget.icon, 0.003);

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_env_var_override() {
        let config_str = r#"
[providers.replicate]
api_key = "file-key"
"#;
        let path = temp_config(config_str);

        std::env::set_var("ATELIER_REPLICATE_API_KEY", "env-key-override");
        let config = AtelierConfig::load_from_file(&path).unwrap();
        assert_eq!(config.api_key("replicate"), Some("env-key-override"));

        std::env::remove_var("ATELIER_REPLICATE_API_KEY");
        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_defaults() {
        let config = AtelierConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.max_concurrent, 3);
        assert_eq!(config.engine.requests_per_second, 2.0);
        assert_eq!(config.budget.ceiling, 10.0);
        assert_eq!(config.budget.estimate(AssetType::Cover), 0.04);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!(!config.approval.required);
        assert_eq!(config.storage.database, PathBuf::from(".atelier/assets.db"));
        assert_eq!(config.competition.models.len(), 3);
    }

    #[test]
    fn test_overlay_replaces_sections() {
        let mut base: AtelierConfigFile = toml::from_str(
            r#"
[providers.openrouter]
api_key = "global-key"

[budget]
ceiling = 5.0
"#,
        )
        .unwrap();
        let overlay: AtelierConfigFile = toml::from_str(
            r#"
[providers.openrouter]
api_url = "https://local.example.com"

[approval]
required = true
"#,
        )
        .unwrap();

        AtelierConfig::merge_into(&mut base, overlay);
        let config = AtelierConfig::resolve(base).unwrap();

        assert_eq!(config.api_key("openrouter"), Some("global-key"));
        assert_eq!(config.api_url("openrouter"), Some("https://local.example.com"));
        assert_eq!(config.budget.ceiling, 5.0);
        assert!(config.approval.required);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = AtelierConfig::from_toml_str("[engine]\nmax_concurrent = 0\n").unwrap_err();
        assert!(matches!(err, AtelierError::Config(_)));

        let err = AtelierConfig::from_toml_str("[competition]\nmodels = []\n").unwrap_err();
        assert!(matches!(err, AtelierError::Config(_)));
    }

    #[test]
    fn test_missing_provider_returns_none() {
        let config = AtelierConfig::default();
        assert_eq!(config.api_key("nonexistent"), None);
        assert!(config.is_enabled("nonexistent"));
    }
}
