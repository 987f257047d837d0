//! Spend against the budget ceiling

use super::{load_config, open_database};
use anyhow::Result;
use atelier_gen::TransactionManager;

pub fn run() -> Result<()> {
    let config = load_config()?;
    let manager = TransactionManager::new(open_database(&config)?, config.budget.ceiling)?;
    let summary = manager.summary()?;

    println!("Budget");
    println!("  Ceiling:   ${:.4}", summary.ceiling);
    println!("  Committed: ${:.4}", summary.committed);
    println!("  Reserved:  ${:.4}", summary.reserved);
    println!("  Remaining: ${:.4}", summary.remaining);

    if !summary.counts.is_empty() {
        println!("\nTransactions:");
        for (status, count) in &summary.counts {
            println!("  {:<12} {}", status, count);
        }
    }

    println!(
        "\nEstimates: icon ${:.4}, cover ${:.4}",
        config.budget.icon, config.budget.cover
    );
    Ok(())
}
