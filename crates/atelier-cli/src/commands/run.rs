//! Manifest runs and resuming interrupted runs

use super::{build_engine, finish_report, load_config, load_style, open_database};
use anyhow::{Context, Result};
use atelier_gen::{ProgressTracker, RunManifest, RunProgress, StyleGuide};
use std::path::Path;

pub fn run_manifest(path: &str, style: Option<&str>, report_path: Option<&str>, no_wait: bool) -> Result<()> {
    let manifest = RunManifest::load(Path::new(path))
        .with_context(|| format!("Could not load manifest {}", path))?;
    if manifest.assets.is_empty() {
        println!("Manifest {} lists no assets.", path);
        return Ok(());
    }

    let config = load_config()?;
    let style = load_style(&config, style.or(manifest.style.as_deref()))?;
    let engine = build_engine(config, style, no_wait)?;

    println!("Running {} asset(s) from {}", manifest.assets.len(), path);
    let report = engine.run(&manifest.assets)?;
    finish_report(&report, report_path)
}

pub fn resume(run_id: &str, report_path: Option<&str>, no_wait: bool) -> Result<()> {
    let config = load_config()?;

    // The run must be resumed with the style its prompts were resolved with
    let progress = {
        let tracker = ProgressTracker::new(open_database(&config)?);
        let checkpoint = tracker
            .latest(run_id)?
            .ok_or_else(|| anyhow::anyhow!("No run '{}' found (see `atelier status`)", run_id))?;
        RunProgress::from_checkpoint(&checkpoint)?
    };
    let style = match progress.style.as_deref() {
        Some(name) => Some(StyleGuide::find(name).map_err(|e| anyhow::anyhow!("{}", e))?),
        None => None,
    };
    let engine = build_engine(config, style, no_wait)?;

    println!(
        "Resuming {}: {} of {} asset(s) already done",
        run_id,
        progress.completed.len(),
        progress.total
    );
    let report = engine.resume(run_id)?;
    finish_report(&report, report_path)
}
