//! Row types owned by the asset database

use atelier_core::{
    now, ApprovalStatus, AssetStatus, AssetType, CheckpointStatus, Fingerprint, Timestamp,
    TransactionStatus,
};
use serde::{Deserialize, Serialize};

/// A generated (or failed) visual asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Row id; 0 until the record has been stored
    pub id: i64,
    pub asset_type: AssetType,
    /// Prompt text as requested
    pub prompt: String,
    /// Hex fingerprint over (asset_type, resolved prompt)
    pub prompt_hash: String,
    /// Local file in the content-addressed store
    #[serde(default)]
    pub file_path: Option<String>,
    /// Upstream URL the image was downloaded from
    #[serde(default)]
    pub url: Option<String>,
    /// Cost in USD actually paid for this asset
    pub cost: f64,
    pub status: AssetStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl AssetRecord {
    /// A fresh pending record for a prompt
    pub fn new(asset_type: AssetType, prompt: &str) -> Self {
        let ts = now();
        Self {
            id: 0,
            asset_type,
            prompt: prompt.to_string(),
            prompt_hash: Fingerprint::compute(asset_type, prompt).to_hex(),
            file_path: None,
            url: None,
            cost: 0.0,
            status: AssetStatus::Pending,
            error_message: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    /// A failed record carrying the terminal error message
    pub fn failed(asset_type: AssetType, prompt: &str, error: &str) -> Self {
        let mut record = Self::new(asset_type, prompt);
        record.status = AssetStatus::Failed;
        record.error_message = Some(error.to_string());
        record
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        Fingerprint::from_hex(&self.prompt_hash)
    }
}

/// A billable upstream call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub timestamp: Timestamp,
    pub asset_type: AssetType,
    /// Reserved estimate while pending; actual cost once finalized
    pub cost: f64,
    pub status: TransactionStatus,
    pub prompt: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

/// Durable marker of a run's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The run id; one active checkpoint per run
    pub id: String,
    pub status: CheckpointStatus,
    /// Number of task boundaries crossed
    pub position: u64,
    pub metadata: serde_json::Value,
    pub timestamp: Timestamp,
}

/// Persisted approval item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalItemRow {
    pub id: String,
    pub batch_id: String,
    pub asset_name: String,
    #[serde(default)]
    pub asset_id: Option<i64>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<Timestamp>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: Timestamp,
}

/// One entry of the append-only decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecisionRow {
    pub item_id: String,
    pub decision: ApprovalStatus,
    pub actor: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub decided_at: Timestamp,
}
