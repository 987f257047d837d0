//! CLI command implementations

pub mod approval;
pub mod budget;
pub mod cache;
pub mod generate;
pub mod providers;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use atelier_gen::{AtelierConfig, CancellationToken, Engine, RunReport, StyleGuide};
use atelier_store::AssetDatabase;
use std::path::Path;

pub(crate) fn load_config() -> Result<AtelierConfig> {
    let config = AtelierConfig::load().map_err(|e| anyhow::anyhow!("{}", e))?;
    tracing::debug!(
        database = %config.storage.database.display(),
        image_provider = %config.engine.image_provider,
        model_client = %config.engine.model_client,
        "configuration loaded"
    );
    Ok(config)
}

pub(crate) fn open_database(config: &AtelierConfig) -> Result<AssetDatabase> {
    AssetDatabase::open(&config.storage.database).with_context(|| {
        format!("Could not open asset database {}", config.storage.database.display())
    })
}

/// Resolve a style by name, falling back to the configured default
pub(crate) fn load_style(config: &AtelierConfig, name: Option<&str>) -> Result<Option<StyleGuide>> {
    match name.or(config.default_style()) {
        Some(name) => {
            let style = StyleGuide::find(name).map_err(|e| anyhow::anyhow!("{}", e))?;
            Ok(Some(style))
        }
        None => Ok(None),
    }
}

pub(crate) fn build_engine(config: AtelierConfig, style: Option<StyleGuide>, no_wait: bool) -> Result<Engine> {
    let mut engine = Engine::from_config(config).map_err(|e| anyhow::anyhow!("{}", e))?;
    if let Some(style) = style {
        println!("Style: {}", style.name);
        engine = engine.with_style(style);
    }
    engine.set_await_approvals(!no_wait);
    cancel_on_interrupt(engine.cancellation_token())?;
    Ok(engine)
}

/// First Ctrl-C stops the run after in-flight calls settle, so their spend
/// and checkpoints are recorded. A second one exits at once.
fn cancel_on_interrupt(token: CancellationToken) -> Result<()> {
    ctrlc::set_handler(move || {
        if !interrupt(&token) {
            std::process::exit(130);
        }
    })
    .context("Could not install the Ctrl-C handler")
}

/// Returns false when the run was already cancelled and the process should exit
fn interrupt(token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    eprintln!("\nInterrupted, finishing in-flight work. Press Ctrl-C again to quit now.");
    token.cancel();
    true
}

/// Print the run summary, save it if asked, and fail the command when the
/// run did not produce every asset.
pub(crate) fn finish_report(report: &RunReport, path: Option<&str>) -> Result<()> {
    report.print_summary();

    if let Some(path) = path {
        report
            .save(Path::new(path))
            .with_context(|| format!("Could not write report to {}", path))?;
        println!("\nReport written to {}", path);
    }

    if report.count(atelier_gen::EntryStatus::AwaitingApproval) > 0 {
        println!("\nReview pending assets with `atelier approval list`.");
    }

    if !report.is_success() {
        println!("Retry the remaining assets with `atelier resume {}`.", report.run_id);
        anyhow::bail!("Run {} finished with failures", report.run_id);
    }
    Ok(())
}
