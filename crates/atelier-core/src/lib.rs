//! Atelier Core - Foundational types for the atelier asset engine
//!
//! This crate provides the types every other atelier crate depends on:
//! - `Fingerprint` - SHA-256 cache/dedup key over (asset type, prompt)
//! - `TaskId` - Process-unique generation task identifiers
//! - Status enums for assets, transactions, checkpoints, tasks and approvals
//! - The error taxonomy, its retry classification, and the Result alias

mod error;
mod hash;
mod id;
mod types;

pub use error::{AtelierError, ErrorClass, Result};
pub use hash::Fingerprint;
pub use id::TaskId;
pub use types::{
    now, ApprovalStatus, AssetStatus, AssetType, AttemptRecord, BatchStatus, CheckpointStatus,
    GenerationStatus, Priority, RetryStrategy, Timestamp, TransactionStatus,
};
