//! Shared setup for the engine integration tests

#![allow(dead_code)]

use atelier_gen::providers::mock::{MockImageProvider, MockModelClient};
use atelier_gen::{AtelierConfig, Engine};
use atelier_store::AssetDatabase;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub fn temp_root(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("atelier_{}_{}", label, uuid::Uuid::new_v4()))
}

/// Fast, network-free settings rooted in `root`
pub fn config(root: &Path) -> AtelierConfig {
    let mut config = AtelierConfig::default();
    config.engine.max_concurrent = 3;
    config.engine.requests_per_second = 0.0;
    config.engine.max_attempts = 1;
    config.engine.requeue_backoff_ms = 10;
    config.engine.image_provider = "mock".to_string();
    config.engine.model_client = "mock".to_string();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = 0.0;
    config.retry.fallback_models.clear();
    config.competition.models = vec!["model-a".to_string(), "model-b".to_string()];
    config.storage.database = root.join("assets.db");
    config.storage.asset_dir = root.join("assets");
    config.storage.scratch_dir = root.join("scratch");
    config
}

/// An engine on the file database named by the config
pub fn engine(config: AtelierConfig, image: Arc<MockImageProvider>) -> Engine {
    let db = AssetDatabase::open(&config.storage.database).unwrap();
    Engine::new(config, db, Arc::new(MockModelClient::new()), image)
        .unwrap()
        .with_approval_poll_interval(Duration::from_millis(20))
}
