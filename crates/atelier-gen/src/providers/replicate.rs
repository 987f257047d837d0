//! Replicate image generation provider
//!
//! Creates a prediction with `Prefer: wait` so short jobs come back
//! finished in the first response; anything still running is polled until
//! the per-call deadline, then the output image is downloaded.

use super::{build_agent, download_bytes, read_body, transport_error};
use crate::config::AtelierConfig;
use crate::provider::*;
use atelier_core::{AtelierError, Result};
use std::path::Path;
use std::time::{Duration, Instant};

const DEFAULT_REPLICATE_URL: &str = "https://api.replicate.com/v1";
const DEFAULT_MODEL: &str = "black-forest-labs/flux-schnell";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Replicate provider for icon and cover rendering
pub struct ReplicateProvider {
    api_key: String,
    api_url: String,
    model: String,
    timeout: Duration,
    agent: ureq::Agent,
}

/// Where a prediction stands
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionState {
    Succeeded { output_url: String },
    Pending { poll_url: Option<String> },
    Failed { message: String },
}

impl ReplicateProvider {
    pub fn from_config(config: &AtelierConfig) -> Result<Self> {
        let api_key = config
            .api_key("replicate")
            .ok_or_else(|| {
                AtelierError::Config(
                    "Replicate API key not configured. Set ATELIER_REPLICATE_API_KEY or add to .atelier/config.toml"
                        .to_string(),
                )
            })?
            .to_string();

        let api_url = config
            .api_url("replicate")
            .unwrap_or(DEFAULT_REPLICATE_URL)
            .trim_end_matches('/')
            .to_string();
        let model = config
            .provider_model("replicate")
            .unwrap_or(DEFAULT_MODEL)
            .to_string();
        let timeout = config.timeout("replicate");

        Ok(Self {
            api_key,
            api_url,
            model,
            timeout,
            agent: build_agent(timeout),
        })
    }

    fn create_prediction(&self, service: &str, request: &ImageRequest) -> Result<serde_json::Value> {
        let url = format!("{}/models/{}/predictions", self.api_url, request.model);
        let payload = serde_json::json!({ "input": build_input(request) });

        let response = self
            .agent
            .post(&url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "wait")
            .send_json(&payload)
            .map_err(|e| transport_error(service, e))?;

        let body = read_body(service, response)?;
        parse_json(service, &body)
    }

    fn poll(&self, service: &str, poll_url: &str) -> Result<serde_json::Value> {
        let response = self
            .agent
            .get(poll_url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .call()
            .map_err(|e| transport_error(service, e))?;
        let body = read_body(service, response)?;
        parse_json(service, &body)
    }

    /// Drive a prediction to a terminal state within the per-call deadline
    fn wait_for_output(&self, service: &str, request: &ImageRequest) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let mut prediction = self.create_prediction(service, request)?;

        loop {
            match parse_prediction(&prediction) {
                PredictionState::Succeeded { output_url } => return Ok(output_url),
                PredictionState::Failed { message } => {
                    return Err(AtelierError::from_upstream_failure(service, &message))
                }
                PredictionState::Pending { poll_url } => {
                    let poll_url = poll_url.ok_or_else(|| AtelierError::Provider {
                        service: service.to_string(),
                        message: "Pending prediction without a poll URL".to_string(),
                    })?;
                    if Instant::now() + POLL_INTERVAL > deadline {
                        return Err(AtelierError::Timeout(format!(
                            "{} prediction still running after {}s",
                            service,
                            self.timeout.as_secs()
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                    prediction = self.poll(service, &poll_url)?;
                }
            }
        }
    }
}

impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn generate(&self, request: &ImageRequest, output_dir: &Path) -> Result<ImageOutput> {
        let start = Instant::now();
        let service = service_key("replicate", &request.model);

        std::fs::create_dir_all(output_dir)?;

        let output_url = self.wait_for_output(&service, request)?;
        let bytes = download_bytes(&self.agent, &service, &output_url)?;

        let output_path = output_dir.join(format!(
            "{}_{}.{}",
            file_stem(&request.name),
            &uuid::Uuid::new_v4().simple().to_string()[..8],
            extension_for(&output_url)
        ));
        std::fs::write(&output_path, &bytes)?;

        let cost = model_price(&request.model);
        tracing::debug!(model = %request.model, cost, bytes = bytes.len(), "image downloaded");

        Ok(ImageOutput {
            file_path: output_path,
            url: Some(output_url),
            cost,
            model: request.model.clone(),
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    fn health_check(&self) -> Result<ProviderStatus> {
        if self.api_key.is_empty() {
            return Ok(ProviderStatus::NoApiKey);
        }
        Ok(ProviderStatus::Available)
    }
}

fn build_input(request: &ImageRequest) -> serde_json::Value {
    let params = &request.params;
    let mut input = serde_json::json!({
        "prompt": request.prompt,
        "width": params.width,
        "height": params.height,
        "aspect_ratio": params.aspect_ratio(),
        "output_format": "png",
        "num_outputs": 1
    });
    if let Some(steps) = params.steps {
        input["num_inference_steps"] = serde_json::json!(steps);
    }
    if let Some(guidance) = params.guidance {
        input["guidance"] = serde_json::json!(guidance);
    }
    if let Some(seed) = params.seed {
        input["seed"] = serde_json::json!(seed);
    }
    if let Some(ref negative) = params.negative_prompt {
        input["negative_prompt"] = serde_json::json!(negative);
    }
    input
}

fn parse_json(service: &str, body: &str) -> Result<serde_json::Value> {
    serde_json::from_str(body).map_err(|e| AtelierError::Provider {
        service: service.to_string(),
        message: format!("Invalid JSON: {}", e),
    })
}

/// Interpret a prediction object
pub fn parse_prediction(prediction: &serde_json::Value) -> PredictionState {
    let status = prediction
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("starting");

    match status {
        "succeeded" => {
            let output = prediction.get("output");
            let url = output
                .and_then(|o| o.as_str())
                .or_else(|| {
                    output
                        .and_then(|o| o.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|u| u.as_str())
                })
                .map(|s| s.to_string());
            match url {
                Some(output_url) => PredictionState::Succeeded { output_url },
                None => PredictionState::Failed {
                    message: "Prediction succeeded without output".to_string(),
                },
            }
        }
        "failed" => PredictionState::Failed {
            message: prediction
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("prediction failed")
                .to_string(),
        },
        "canceled" => PredictionState::Failed {
            message: "prediction canceled upstream".to_string(),
        },
        _ => PredictionState::Pending {
            poll_url: prediction
                .get("urls")
                .and_then(|u| u.get("get"))
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        },
    }
}

/// Flat per-image price for known models, in USD
pub fn model_price(model: &str) -> f64 {
    match model {
        "black-forest-labs/flux-schnell" => 0.003,
        "black-forest-labs/flux-dev" => 0.025,
        "black-forest-labs/flux-1.1-pro" | "black-forest-labs/flux-pro" => 0.04,
        "stability-ai/sdxl" => 0.004,
        _ => 0.01,
    }
}

fn extension_for(url: &str) -> &'static str {
    let path = url.split('?').next().unwrap_or(url).to_lowercase();
    if path.ends_with(".webp") {
        "webp"
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "jpg"
    } else {
        "png"
    }
}
