//! Atelier Store - durable records and the generation cache
//!
//! `AssetDatabase` is the single owner of asset, transaction, checkpoint and
//! approval rows (SQLite, one connection behind a mutex). `AssetCache` sits on
//! top of it, deduplicating generations by prompt fingerprint and keeping the
//! content-addressed image files in step with their records.

mod cache;
mod database;
mod records;

pub use cache::{AssetCache, CacheOutcome, CacheSource, GeneratedAsset};
pub use database::{AssetDatabase, AssetKey, AssetUpdate};
pub use records::{ApprovalDecisionRow, ApprovalItemRow, AssetRecord, Checkpoint, Transaction};
