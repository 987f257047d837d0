//! Run manifests and run reports
//!
//! A manifest is the TOML list of assets a run should produce. The report
//! is what came out: one entry per requested asset with its final status,
//! file and attributed cost, for auditing and for the CLI summary.

use crate::queue::AssetRequest;
use atelier_core::{now, AssetType, AtelierError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Assets to generate in one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunManifest {
    /// Style guide applied to every asset
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub assets: Vec<AssetRequest>,
}

impl RunManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| {
            AtelierError::Config(format!("Failed to parse manifest {}: {}", path.display(), e))
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let manifest: RunManifest =
            toml::from_str(content).map_err(|e| AtelierError::TomlParseError(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AtelierError::TomlSerError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Names must be present and unique, prompts non-empty
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for asset in &self.assets {
            if asset.name.trim().is_empty() {
                return Err(AtelierError::Config("manifest asset without a name".to_string()));
            }
            if asset.prompt.trim().is_empty() {
                return Err(AtelierError::Config(format!(
                    "manifest asset '{}' has an empty prompt",
                    asset.name
                )));
            }
            if !seen.insert(asset.name.as_str()) {
                return Err(AtelierError::Config(format!(
                    "manifest lists asset '{}' twice",
                    asset.name
                )));
            }
        }
        Ok(())
    }
}

/// Final state of one requested asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Generated and paid for in this run
    Generated,
    /// Served from the cache, or joined another caller's generation
    Cached,
    /// Stored, waiting for a reviewer
    AwaitingApproval,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub asset_type: AssetType,
    pub status: EntryStatus,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Cost this run paid for the asset
    pub cost: f64,
    #[serde(default)]
    pub error: Option<String>,
    /// Upstream attempts made for the asset
    #[serde(default)]
    pub attempts: usize,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: Timestamp,
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    #[serde(default)]
    pub approval_batch: Option<String>,
    #[serde(default)]
    pub entries: Vec<ReportEntry>,
}

impl RunReport {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at: now(),
            finished_at: None,
            approval_batch: None,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(now());
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn total_cost(&self) -> f64 {
        self.entries.iter().map(|e| e.cost).sum()
    }

    /// Every requested asset ended up usable or in review
    pub fn is_success(&self) -> bool {
        self.count(EntryStatus::Failed) == 0 && self.count(EntryStatus::Rejected) == 0
    }

    pub fn entry(&self, name: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| AtelierError::JsonError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn print_summary(&self) {
        println!();
        println!("Run {}", self.run_id);
        println!("  Generated:         {}", self.count(EntryStatus::Generated));
        println!("  Cached:            {}", self.count(EntryStatus::Cached));
        println!("  Awaiting approval: {}", self.count(EntryStatus::AwaitingApproval));
        println!("  Rejected:          {}", self.count(EntryStatus::Rejected));
        println!("  Failed:            {}", self.count(EntryStatus::Failed));
        println!("  Spend:             ${:.4}", self.total_cost());
        if let Some(ref batch) = self.approval_batch {
            println!("  Approval batch:    {}", batch);
        }

        let failures: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .collect();
        if !failures.is_empty() {
            println!();
            println!("Failed assets:");
            for entry in failures {
                println!(
                    "  {} ({} attempts): {}",
                    entry.name,
                    entry.attempts,
                    entry.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
}
