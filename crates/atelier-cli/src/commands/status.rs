//! Run status

use super::{load_config, open_database};
use anyhow::Result;
use atelier_gen::{ProgressTracker, RunProgress};

pub fn run(run_id: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let tracker = ProgressTracker::new(open_database(&config)?);

    match run_id {
        Some(run_id) => show_run(&tracker, run_id),
        None => list_runs(&tracker),
    }
}

fn list_runs(tracker: &ProgressTracker) -> Result<()> {
    let runs = tracker.runs()?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!("{} run(s):\n", runs.len());
    for cp in &runs {
        let progress = RunProgress::from_checkpoint(cp).unwrap_or_default();
        println!(
            "  {:<44} {:<12} {}/{} done, {} failed  {}",
            cp.id,
            cp.status,
            progress.completed.len(),
            progress.total,
            progress.failed.len(),
            cp.timestamp.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn show_run(tracker: &ProgressTracker, run_id: &str) -> Result<()> {
    let cp = tracker
        .latest(run_id)?
        .ok_or_else(|| anyhow::anyhow!("No run '{}' found", run_id))?;
    let progress = RunProgress::from_checkpoint(&cp)?;

    println!("Run: {}", cp.id);
    println!("  Status: {}", cp.status);
    println!("  Updated: {}", cp.timestamp.to_rfc3339());
    println!("  Position: {}", cp.position);
    println!("  Completed: {}/{}", progress.completed.len(), progress.total);
    println!("  Remaining: {}", progress.remaining());
    if let Some(ref style) = progress.style {
        println!("  Style: {}", style);
    }
    if let Some(ref batch) = progress.approval_batch {
        println!("  Approval batch: {}", batch);
    }

    if !progress.failed.is_empty() {
        println!("\n  Failures:");
        for (fingerprint, error) in &progress.failed {
            println!("    {}  {}", &fingerprint[..fingerprint.len().min(12)], error);
        }
    }

    if !progress.requests.is_empty() {
        println!("\n  Assets:");
        for request in &progress.requests {
            println!("    {:<32} {:<6} {}", request.name, request.asset_type, request.prompt);
        }
    }
    Ok(())
}
