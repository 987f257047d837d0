//! Mock providers for testing
//!
//! `MockModelClient` answers with deterministic prompt variants and
//! `MockImageProvider` writes solid-color PNGs, both without network calls.
//! Either can be scripted to fail a given number of times in a given way.

use crate::provider::*;
use atelier_core::{AtelierError, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A failure a mock can be scripted to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Transient,
    RateLimited,
    ContentPolicy,
    ParameterRejected,
    Provider,
    /// Rejected credentials; never retried
    Auth,
}

impl MockFailure {
    pub fn into_error(self, service: &str) -> AtelierError {
        let service = service.to_string();
        match self {
            MockFailure::Transient => AtelierError::Transient(format!("{}: connection reset", service)),
            MockFailure::RateLimited => AtelierError::RateLimited {
                service,
                message: "HTTP 429".to_string(),
                retry_after: None,
            },
            MockFailure::ContentPolicy => AtelierError::ContentPolicy {
                service,
                message: "flagged by safety filter".to_string(),
            },
            MockFailure::ParameterRejected => AtelierError::ParameterRejected {
                service,
                message: "width must be <= 1024".to_string(),
            },
            MockFailure::Provider => AtelierError::Provider {
                service,
                message: "HTTP 503: overloaded".to_string(),
            },
            MockFailure::Auth => AtelierError::Config(format!("{} rejected credentials", service)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const STYLES: [&str; 4] = [
    "minimal flat vector",
    "soft watercolor",
    "clean isometric",
    "warm hand-drawn",
];
const MOODS: [&str; 4] = [
    "calm and trustworthy",
    "warm and inviting",
    "confident and focused",
    "hopeful and gentle",
];

/// A text model that writes prompt variants locally
#[derive(Default)]
pub struct MockModelClient {
    calls: AtomicUsize,
    failures: Mutex<HashMap<String, VecDeque<MockFailure>>>,
    responses: Mutex<HashMap<String, String>>,
    delays: Mutex<HashMap<String, Duration>>,
    cost_per_call: f64,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self {
            cost_per_call: 0.0005,
            ..Default::default()
        }
    }

    /// Fail the next calls to `model` with these errors, in order
    pub fn fail_model(&self, model: &str, failures: &[MockFailure]) {
        lock(&self.failures)
            .entry(model.to_string())
            .or_default()
            .extend(failures.iter().copied());
    }

    /// Answer every call to `model` with this exact text
    pub fn respond_with(&self, model: &str, text: &str) {
        lock(&self.responses).insert(model.to_string(), text.to_string());
    }

    /// Delay every call to `model`
    pub fn delay_model(&self, model: &str, delay: Duration) {
        lock(&self.delays).insert(model.to_string(), delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelClient for MockModelClient {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let start = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = lock(&self.delays).get(&request.model).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let failure = lock(&self.failures)
            .get_mut(&request.model)
            .and_then(|queue| queue.pop_front());
        if let Some(failure) = failure {
            return Err(failure.into_error(&service_key("mock", &request.model)));
        }

        let text = match lock(&self.responses).get(&request.model) {
            Some(text) => text.clone(),
            None => variant_for(&request.model, &request.prompt),
        };

        Ok(ModelResponse {
            model: request.model.clone(),
            raw: serde_json::json!({ "model": request.model, "content": text }).to_string(),
            text,
            cost: self.cost_per_call,
            latency: start.elapsed(),
        })
    }

    fn health_check(&self) -> Result<ProviderStatus> {
        Ok(ProviderStatus::Available)
    }
}

/// A deterministic JSON variant built from the subject line of the instruction
fn variant_for(model: &str, instruction: &str) -> String {
    let subject = instruction
        .lines()
        .find_map(|line| line.trim().strip_prefix("Description:"))
        .map(str::trim)
        .unwrap_or_else(|| instruction.trim());

    let seed = model.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    let style = STYLES[seed % STYLES.len()];
    let mood = MOODS[(seed / 7) % MOODS.len()];

    serde_json::json!({
        "prompt": format!(
            "{} illustration of {}, {} mood, centered composition, soft lighting, muted palette",
            style, subject, mood
        ),
        "rationale": format!("{} keeps the subject readable at small sizes", style),
    })
    .to_string()
}

/// An image provider that writes placeholder PNGs locally
pub struct MockImageProvider {
    model: String,
    cost_per_image: f64,
    calls: AtomicUsize,
    failures: Mutex<VecDeque<MockFailure>>,
    requests: Mutex<Vec<ImageRequest>>,
    delay: Option<Duration>,
}

impl Default for MockImageProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockImageProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-image".to_string(),
            cost_per_image: 0.003,
            calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_image = cost;
        self
    }

    /// Sleep inside every call, to make concurrent callers overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next calls with these errors, in order
    pub fn fail_next(&self, failures: &[MockFailure]) {
        lock(&self.failures).extend(failures.iter().copied());
    }

    /// Number of upstream calls made (including failed ones)
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<ImageRequest> {
        lock(&self.requests).clone()
    }
}

impl ImageProvider for MockImageProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn generate(&self, request: &ImageRequest, output_dir: &Path) -> Result<ImageOutput> {
        let start = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let failure = lock(&self.failures).pop_front();
        if let Some(failure) = failure {
            return Err(failure.into_error(&service_key("mock", &request.model)));
        }

        std::fs::create_dir_all(output_dir)?;
        let output_path = generate_solid_png(
            output_dir,
            &request.name,
            &request.prompt,
            request.params.width,
            request.params.height,
        )?;

        Ok(ImageOutput {
            file_path: output_path,
            url: None,
            cost: self.cost_per_image,
            model: request.model.clone(),
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    fn health_check(&self) -> Result<ProviderStatus> {
        Ok(ProviderStatus::Available)
    }
}

/// Generate a solid-color PNG whose color is derived from the prompt
fn generate_solid_png(
    output_dir: &Path,
    name: &str,
    prompt: &str,
    width: u32,
    height: u32,
) -> Result<PathBuf> {
    let hash_val = prompt
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    let r = ((hash_val >> 16) & 0xFF) as u8;
    let g = ((hash_val >> 8) & 0xFF) as u8;
    let b = (hash_val & 0xFF) as u8;

    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([r, g, b, 255]));

    // Unique per call: concurrent workers share the scratch directory
    let path = output_dir.join(format!(
        "{}_{}.png",
        file_stem(name),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    ));
    img.save(&path)
        .map_err(|e| AtelierError::Provider {
            service: "mock".to_string(),
            message: format!("Failed to save PNG: {}", e),
        })?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{AssetType, ErrorClass};

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("atelier_mock_{}_{}", label, uuid::Uuid::new_v4()))
    }

    fn icon_request(name: &str) -> ImageRequest {
        ImageRequest {
            name: name.to_string(),
            prompt: format!("{} icon", name),
            asset_type: AssetType::Icon,
            model: "mock-image".to_string(),
            params: ImageParams {
                width: 32,
                height: 32,
                ..ImageParams::for_asset_type(AssetType::Icon)
            },
        }
    }

    #[test]
    fn test_mock_provider_health() {
        let provider = MockImageProvider::new();
        assert_eq!(provider.health_check().unwrap(), ProviderStatus::Available);
        assert_eq!(provider.default_model(), "mock-image");
    }

    #[test]
    fn test_mock_generate_png() {
        let dir = temp_dir("png");
        let provider = MockImageProvider::new().with_cost(0.5);

        let output = provider.generate(&icon_request("Legal Documents"), &dir).unwrap();
        assert!(output.file_path.exists());
        assert_eq!(output.cost, 0.5);

        let img = image::open(&output.file_path).unwrap();
        assert_eq!(img.width(), 32);
        assert_eq!(img.height(), 32);
        assert_eq!(provider.call_count(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_mock_scripted_failures() {
        let dir = temp_dir("fail");
        let provider = MockImageProvider::new();
        provider.fail_next(&[MockFailure::RateLimited, MockFailure::ContentPolicy]);

        let first = provider.generate(&icon_request("a"), &dir).unwrap_err();
        assert_eq!(first.class(), ErrorClass::RateLimited);
        let second = provider.generate(&icon_request("a"), &dir).unwrap_err();
        assert_eq!(second.class(), ErrorClass::ContentPolicy);
        assert!(provider.generate(&icon_request("a"), &dir).is_ok());
        assert_eq!(provider.call_count(), 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_mock_model_variants_differ_by_model() {
        let client = MockModelClient::new();
        let request = |model: &str| ModelRequest {
            model: model.to_string(),
            system: None,
            prompt: "Asset: legal\nDescription: Legal Documents icon".to_string(),
            temperature: 0.8,
            max_tokens: 200,
        };

        let a = client.complete(&request("openai/gpt-4o-mini")).unwrap();
        let b = client.complete(&request("openai/gpt-4o-mini")).unwrap();
        assert_eq!(a.text, b.text);
        assert!(a.text.contains("Legal Documents icon"));

        let parsed: serde_json::Value = serde_json::from_str(&a.text).unwrap();
        assert!(parsed["prompt"].as_str().is_some());
    }

    #[test]
    fn test_mock_model_failures_are_per_model() {
        let client = MockModelClient::new();
        client.fail_model("bad/model", &[MockFailure::Provider]);

        let request = |model: &str| ModelRequest {
            model: model.to_string(),
            system: None,
            prompt: "Description: roadmap cover".to_string(),
            temperature: 0.8,
            max_tokens: 200,
        };
        assert!(client.complete(&request("good/model")).is_ok());
        assert!(client.complete(&request("bad/model")).is_err());
        assert!(client.complete(&request("bad/model")).is_ok());
        assert_eq!(client.call_count(), 3);
    }
}
