//! Reviewer commands

use super::{load_config, open_database};
use anyhow::Result;
use atelier_gen::{ApprovalGate, ApprovalItem, Decision};
use clap::Subcommand;

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List items waiting for review
    List {
        /// Show every item of one batch instead
        #[arg(long)]
        batch: Option<String>,
    },

    /// Record a decision for an item
    Decide {
        /// Approval item ID
        item_id: String,

        /// approve, reject or modify
        decision: String,

        /// Who is deciding
        #[arg(long, default_value = "reviewer")]
        actor: String,

        /// Reviewer notes (describe the edits for `modify`)
        #[arg(long)]
        notes: Option<String>,
    },

    /// Show the decision log of an item
    History {
        /// Approval item ID
        item_id: String,
    },
}

pub fn run(cmd: ApprovalCommands) -> Result<()> {
    let config = load_config()?;
    let gate = ApprovalGate::new(open_database(&config)?);

    match cmd {
        ApprovalCommands::List { batch } => run_list(&gate, batch.as_deref()),
        ApprovalCommands::Decide {
            item_id,
            decision,
            actor,
            notes,
        } => run_decide(&gate, &item_id, &decision, &actor, notes.as_deref()),
        ApprovalCommands::History { item_id } => run_history(&gate, &item_id),
    }
}

fn run_list(gate: &ApprovalGate, batch: Option<&str>) -> Result<()> {
    let items = match batch {
        Some(batch_id) => {
            println!("Batch {}: {}", batch_id, gate.batch_status(batch_id)?);
            gate.batch(batch_id)?
        }
        None => gate.pending_items()?,
    };

    if items.is_empty() {
        println!("Nothing waiting for review.");
        return Ok(());
    }

    println!("{} item(s):\n", items.len());
    for item in &items {
        print_item(item);
    }
    Ok(())
}

fn print_item(item: &ApprovalItem) {
    println!("  {}  {:<32} {:<9}", item.id, item.asset_name, item.status);
    if let Some(ref by) = item.decided_by {
        println!("      decided by {}", by);
    }
    if let Some(ref notes) = item.notes {
        println!("      notes: {}", notes);
    }
}

fn run_decide(gate: &ApprovalGate, item_id: &str, decision: &str, actor: &str, notes: Option<&str>) -> Result<()> {
    let decision: Decision = decision.parse()?;
    if decision == Decision::Modify && notes.is_none() {
        anyhow::bail!("`modify` needs --notes describing the edits");
    }

    let item = gate.decide(item_id, decision, actor, notes)?;
    println!("Item {} for '{}' is now {}.", item.id, item.asset_name, item.status);

    if let Some(asset_id) = item.asset_id {
        if let Some(status) = gate.settle_asset(asset_id, item.status)? {
            println!("  Asset {} marked {}", asset_id, status);
        }
    }
    Ok(())
}

fn run_history(gate: &ApprovalGate, item_id: &str) -> Result<()> {
    let item = gate
        .item(item_id)?
        .ok_or_else(|| anyhow::anyhow!("No approval item '{}'", item_id))?;
    println!("Item {} ({})", item.id, item.asset_name);
    println!("  Batch: {}", item.batch_id);
    println!("  Status: {}", item.status);

    let history = gate.history(item_id)?;
    if history.is_empty() {
        println!("  No decisions yet.");
        return Ok(());
    }
    for row in &history {
        println!(
            "  {}  {:<9} by {}{}",
            row.decided_at.format("%Y-%m-%d %H:%M:%S"),
            row.decision,
            row.actor,
            row.notes.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
        );
    }
    Ok(())
}
