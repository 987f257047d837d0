//! OpenRouter chat completions client
//!
//! One endpoint fronts many vendors' models, which is what lets the prompt
//! competition fan out across models with a single key.

use super::{build_agent, read_body, transport_error};
use crate::config::AtelierConfig;
use crate::provider::{ModelClient, ModelRequest, ModelResponse, ProviderStatus};
use atelier_core::{AtelierError, Result};
use std::time::Instant;

const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterClient {
    api_key: String,
    api_url: String,
    agent: ureq::Agent,
}

impl OpenRouterClient {
    pub fn from_config(config: &AtelierConfig) -> Result<Self> {
        let api_key = config
            .api_key("openrouter")
            .ok_or_else(|| {
                AtelierError::Config(
                    "OpenRouter API key not configured. Set ATELIER_OPENROUTER_API_KEY or add to .atelier/config.toml"
                        .to_string(),
                )
            })?
            .to_string();

        let api_url = config
            .api_url("openrouter")
            .unwrap_or(DEFAULT_OPENROUTER_URL)
            .to_string();

        Ok(Self {
            api_key,
            api_url,
            agent: build_agent(config.timeout("openrouter")),
        })
    }
}

impl ModelClient for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let service = format!("openrouter:{}", request.model);
        let start = Instant::now();

        let payload = build_payload(request);
        let response = self
            .agent
            .post(&self.api_url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "atelier")
            .send_json(&payload)
            .map_err(|e| transport_error(&service, e))?;

        let body = read_body(&service, response)?;
        let (text, cost) = parse_chat_response(&service, &body)?;

        tracing::debug!(model = %request.model, cost, "completion received");
        Ok(ModelResponse {
            model: request.model.clone(),
            text,
            raw: body,
            cost,
            latency: start.elapsed(),
        })
    }

    fn health_check(&self) -> Result<ProviderStatus> {
        if self.api_key.is_empty() {
            return Ok(ProviderStatus::NoApiKey);
        }
        Ok(ProviderStatus::Available)
    }
}

fn build_payload(request: &ModelRequest) -> serde_json::Value {
    let mut messages = Vec::new();
    if let Some(ref system) = request.system {
        messages.push(serde_json::json!({ "role": "system", "content": system }));
    }
    messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

    serde_json::json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "usage": { "include": true }
    })
}

/// Extract the assistant text and reported cost from a completion body.
///
/// OpenRouter reports some upstream failures inside a 200 response as an
/// `error` object; those are classified by their embedded code.
pub fn parse_chat_response(service: &str, body: &str) -> Result<(String, f64)> {
    let response: serde_json::Value = serde_json::from_str(body).map_err(|e| AtelierError::Provider {
        service: service.to_string(),
        message: format!("Invalid JSON: {}", e),
    })?;

    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(|c| c.as_u64()).unwrap_or(500) as u16;
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(AtelierError::from_status(service, code, message));
    }

    let choice = response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| AtelierError::Provider {
            service: service.to_string(),
            message: "No choices in response".to_string(),
        })?;

    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("content_filter") {
        return Err(AtelierError::ContentPolicy {
            service: service.to_string(),
            message: "completion stopped by content filter".to_string(),
        });
    }

    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(AtelierError::Provider {
            service: service.to_string(),
            message: "Empty completion".to_string(),
        });
    }

    let cost = response
        .get("usage")
        .and_then(|u| u.get("cost"))
        .and_then(|c| c.as_f64())
        .unwrap_or(0.0);

    Ok((text.to_string(), cost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::ErrorClass;

    #[test]
    fn test_parse_chat_response() {
        let json = r#"{
            "id": "gen-123",
            "model": "openai/gpt-4o-mini",
            "choices": [
                {
                    "finish_reason": "stop",
                    "message": { "role": "assistant", "content": "  {\"prompt\": \"a scale\"}  " }
                }
            ],
            "usage": { "prompt_tokens": 120, "completion_tokens": 40, "cost": 0.00021 }
        }"#;

        let (text, cost) = parse_chat_response("openrouter:gpt", json).unwrap();
        assert_eq!(text, "{\"prompt\": \"a scale\"}");
        assert!((cost - 0.00021).abs() < 1e-12);
    }

    #[test]
    fn test_parse_embedded_error() {
        let json = r#"{"error": {"code": 429, "message": "Rate limit exceeded"}}"#;
        let err = parse_chat_response("openrouter:gpt", json).unwrap_err();
        assert_eq!(err.class(), ErrorClass::RateLimited);
    }

    #[test]
    fn test_parse_content_filter() {
        let json = r#"{"choices": [{"finish_reason": "content_filter", "message": {"content": ""}}]}"#;
        let err = parse_chat_response("openrouter:gpt", json).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ContentPolicy);
    }

    #[test]
    fn test_parse_empty_completion_is_retryable() {
        let json = r#"{"choices": [{"message": {"content": "   "}}]}"#;
        let err = parse_chat_response("openrouter:gpt", json).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Provider);
    }

    #[test]
    fn test_payload_includes_system_prompt() {
        let request = ModelRequest {
            model: "openai/gpt-4o-mini".to_string(),
            system: Some("You write image prompts.".to_string()),
            prompt: "Legal Documents icon".to_string(),
            temperature: 0.7,
            max_tokens: 300,
        };
        let payload = build_payload(&request);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(payload["usage"]["include"], true);
    }
}
