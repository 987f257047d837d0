//! Provider registry
//!
//! Maps provider names to concrete implementations and holds the HTTP
//! plumbing the real adapters share.

pub mod mock;
pub mod openrouter;
pub mod replicate;

use crate::config::AtelierConfig;
use crate::provider::{ImageProvider, ModelClient};
use atelier_core::{AtelierError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Create a text model client by name with configuration
pub fn create_model_client(name: &str, config: &AtelierConfig) -> Result<Arc<dyn ModelClient>> {
    ensure_enabled(name, config)?;
    match name {
        "mock" => Ok(Arc::new(mock::MockModelClient::new())),
        "openrouter" => Ok(Arc::new(openrouter::OpenRouterClient::from_config(config)?)),
        _ => Err(AtelierError::Config(format!(
            "Unknown model client '{}'. Available: {}",
            name,
            available_model_clients().join(", ")
        ))),
    }
}

/// Create an image provider by name with configuration
pub fn create_image_provider(name: &str, config: &AtelierConfig) -> Result<Arc<dyn ImageProvider>> {
    ensure_enabled(name, config)?;
    match name {
        "mock" => Ok(Arc::new(mock::MockImageProvider::new())),
        "replicate" => Ok(Arc::new(replicate::ReplicateProvider::from_config(config)?)),
        _ => Err(AtelierError::Config(format!(
            "Unknown image provider '{}'. Available: {}",
            name,
            available_image_providers().join(", ")
        ))),
    }
}

pub fn available_model_clients() -> Vec<&'static str> {
    vec!["mock", "openrouter"]
}

pub fn available_image_providers() -> Vec<&'static str> {
    vec!["mock", "replicate"]
}

fn ensure_enabled(name: &str, config: &AtelierConfig) -> Result<()> {
    if config.is_enabled(name) {
        Ok(())
    } else {
        Err(AtelierError::Config(format!(
            "Provider '{}' is disabled in config",
            name
        )))
    }
}

pub(crate) type HttpResponse = ureq::http::Response<ureq::Body>;

/// Agent that hands back 4xx/5xx responses so their bodies can be classified
pub(crate) fn build_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    config.into()
}

/// Map a transport-level failure onto the error taxonomy
pub(crate) fn transport_error(service: &str, e: ureq::Error) -> AtelierError {
    match e {
        ureq::Error::Timeout(_) => AtelierError::Transient(format!("{} timed out", service)),
        ureq::Error::Io(_) | ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => {
            AtelierError::Transient(format!("{}: {}", service, e))
        }
        ureq::Error::StatusCode(code) => AtelierError::from_status(service, code, ""),
        other => AtelierError::Provider {
            service: service.to_string(),
            message: other.to_string(),
        },
    }
}

/// Read a response body, turning error statuses into classified errors
pub(crate) fn read_body(service: &str, mut response: HttpResponse) -> Result<String> {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| transport_error(service, e))?;

    if status >= 400 {
        let mut err = AtelierError::from_status(service, status, &body);
        if let AtelierError::RateLimited {
            retry_after: ref mut slot,
            ..
        } = err
        {
            *slot = retry_after;
        }
        return Err(err);
    }
    Ok(body)
}

/// Download a binary payload
pub(crate) fn download_bytes(agent: &ureq::Agent, service: &str, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| transport_error(service, e))?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(AtelierError::from_status(service, status, "download failed"));
    }
    let mut reader = response.into_body().into_reader();
    let mut bytes = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut bytes)
        .map_err(|e| AtelierError::Transient(format!("{}: failed to read image data: {}", service, e)))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_providers() {
        let config = AtelierConfig::default();
        let client = create_model_client("mock", &config).unwrap();
        assert_eq!(client.name(), "mock");
        let images = create_image_provider("mock", &config).unwrap();
        assert_eq!(images.name(), "mock");
    }

    #[test]
    fn test_unknown_provider() {
        let config = AtelierConfig::default();
        let err = create_image_provider("dall-e", &config).err().unwrap();
        assert!(err.to_string().contains("Available: mock, replicate"));
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        std::env::remove_var("ATELIER_OPENROUTER_API_KEY");
        let config = AtelierConfig::default();
        let err = create_model_client("openrouter", &config).err().unwrap();
        assert!(matches!(err, AtelierError::Config(_)));
    }

    #[test]
    fn test_disabled_provider_rejected() {
        let config = AtelierConfig::from_toml_str("[providers.mock]\nenabled = false\n").unwrap();
        assert!(create_image_provider("mock", &config).is_err());
    }
}
