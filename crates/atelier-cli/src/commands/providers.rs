//! Provider listing and health checks

use super::load_config;
use anyhow::Result;
use atelier_gen::provider::ProviderStatus;
use atelier_gen::providers::{
    available_image_providers, available_model_clients, create_image_provider, create_model_client,
};

pub fn run() -> Result<()> {
    let config = load_config()?;

    println!("Model clients (prompt competition):");
    for name in available_model_clients() {
        let marker = if name == config.engine.model_client { "*" } else { " " };
        let status = create_model_client(name, &config).and_then(|client| client.health_check());
        println!("  {} {:<12} {}", marker, name, describe(status));
    }

    println!("\nImage providers:");
    for name in available_image_providers() {
        let marker = if name == config.engine.image_provider { "*" } else { " " };
        let status = create_image_provider(name, &config).and_then(|provider| provider.health_check());
        println!("  {} {:<12} {}", marker, name, describe(status));
    }

    println!("\nCompetition models: {}", config.competition.models.join(", "));
    Ok(())
}

fn describe(status: atelier_core::Result<ProviderStatus>) -> String {
    match status {
        Ok(ProviderStatus::Available) => "available".to_string(),
        Ok(ProviderStatus::NoApiKey) => "no API key configured".to_string(),
        Ok(ProviderStatus::Unavailable(reason)) => format!("unavailable: {}", reason),
        Err(e) => format!("error: {}", e),
    }
}
