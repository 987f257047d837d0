//! Upstream adapter traits and request/result types
//!
//! Two seams: a `ModelClient` turns a text prompt into text (the competing
//! prompt writers), an `ImageProvider` turns an image prompt into a file on
//! disk. Provider quirks stay behind these traits.

use atelier_core::{AssetType, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A single chat-style completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// What a model returned
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub model: String,
    /// Assistant message content
    pub text: String,
    /// Full response body, kept for audit
    pub raw: String,
    /// Cost in USD reported by the upstream (0 when unknown)
    pub cost: f64,
    pub latency: Duration,
}

/// Parameters sent to an image model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub guidance: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}

impl ImageParams {
    /// Default parameters for an asset type
    pub fn for_asset_type(asset_type: AssetType) -> Self {
        let (width, height) = asset_type.dimensions();
        Self {
            width,
            height,
            steps: Some(28),
            guidance: Some(3.5),
            seed: None,
            negative_prompt: None,
        }
    }

    /// A more conservative variant used after a parameter rejection:
    /// dimensions clamped to 1024 and snapped to multiples of 64, fewer
    /// steps, provider-default guidance.
    pub fn adjusted(&self) -> Self {
        fn clamp(v: u32) -> u32 {
            (v.min(1024) / 64).max(1) * 64
        }
        Self {
            width: clamp(self.width),
            height: clamp(self.height),
            steps: self.steps.map(|s| (s / 2).max(4)),
            guidance: None,
            seed: self.seed,
            negative_prompt: None,
        }
    }

    /// Aspect ratio string in lowest terms, e.g. "5:2"
    pub fn aspect_ratio(&self) -> String {
        fn gcd(a: u32, b: u32) -> u32 {
            if b == 0 {
                a
            } else {
                gcd(b, a % b)
            }
        }
        let g = gcd(self.width, self.height).max(1);
        format!("{}:{}", self.width / g, self.height / g)
    }
}

/// Canned prompts used by the generic fallback strategy
pub trait FallbackPrompt {
    fn dimensions(&self) -> (u32, u32);
    fn fallback_prompt(&self, subject: &str) -> String;
}

impl FallbackPrompt for AssetType {
    fn dimensions(&self) -> (u32, u32) {
        match self {
            AssetType::Icon => (512, 512),
            AssetType::Cover => (1500, 600),
        }
    }

    fn fallback_prompt(&self, subject: &str) -> String {
        let subject = subject.trim();
        match self {
            AssetType::Icon => format!(
                "A simple flat vector icon representing {}, single centered symbol, \
                 soft neutral colors, plain white background, no text",
                subject
            ),
            AssetType::Cover => format!(
                "A calm abstract wide banner illustration evoking {}, soft gradient, \
                 gentle shapes, generous negative space, no text",
                subject
            ),
        }
    }
}

/// A request to render one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    /// Asset name, used for file naming
    pub name: String,
    pub prompt: String,
    pub asset_type: AssetType,
    pub model: String,
    pub params: ImageParams,
}

/// A rendered image waiting to enter the store
#[derive(Debug, Clone)]
pub struct ImageOutput {
    pub file_path: PathBuf,
    /// Where the upstream served the image from
    pub url: Option<String>,
    pub cost: f64,
    pub model: String,
    pub duration_secs: f64,
}

/// Status returned by a provider health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Available,
    Unavailable(String),
    NoApiKey,
}

/// A text model reachable over some API (OpenRouter, mock)
pub trait ModelClient: Send + Sync {
    /// Provider name (e.g. "openrouter", "mock")
    fn name(&self) -> &str;

    fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;

    fn health_check(&self) -> Result<ProviderStatus>;
}

/// An image generation backend (Replicate, mock)
pub trait ImageProvider: Send + Sync {
    /// Provider name (e.g. "replicate", "mock")
    fn name(&self) -> &str;

    /// Model used when a request doesn't name one
    fn default_model(&self) -> &str;

    /// Render the image into `output_dir`. Blocks until the file exists.
    fn generate(&self, request: &ImageRequest, output_dir: &Path) -> Result<ImageOutput>;

    fn health_check(&self) -> Result<ProviderStatus>;
}

/// Breaker/service key for a provider+model pair
pub fn service_key(provider: &str, model: &str) -> String {
    format!("{}:{}", provider, model)
}

/// File-system safe version of an asset name
pub fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let stem = stem.trim_matches('_');
    if stem.is_empty() {
        "asset".to_string()
    } else {
        stem.to_lowercase()
    }
}
