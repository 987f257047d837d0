//! Cost ledger guarding the budget ceiling
//!
//! `begin` reserves an estimate and `commit` swaps the reservation for the
//! actual cost. Both happen inside one critical section over the ledger, so
//! concurrent callers can never jointly pass the check and overspend.
//! Committed spend counts every call that was paid for, including calls
//! whose asset failed later, and is rebuilt from the database at startup.

use crate::retry::retry_storage_once;
use atelier_core::{now, AssetType, AtelierError, Result, TransactionStatus};
use atelier_store::{AssetDatabase, Transaction};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Slack for float comparison against the ceiling
const EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
struct Ledger {
    committed: f64,
    reserved: f64,
    /// Open transaction id -> reserved estimate
    open: HashMap<String, f64>,
}

/// Budget state at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSummary {
    pub ceiling: f64,
    pub committed: f64,
    pub reserved: f64,
    pub remaining: f64,
    /// Persisted transactions per status
    pub counts: BTreeMap<String, usize>,
}

pub struct TransactionManager {
    db: AssetDatabase,
    ceiling: f64,
    ledger: Mutex<Ledger>,
}

impl TransactionManager {
    /// Load committed spend from the database. Transactions left pending by
    /// a crashed process never completed and are rolled back.
    pub fn new(db: AssetDatabase, ceiling: f64) -> Result<Self> {
        let committed = db.sum_spent_costs()?;

        for mut tx in db.list_transactions()? {
            if tx.status == TransactionStatus::Pending {
                tx.status = TransactionStatus::RolledBack;
                tx.error = Some("interrupted before completion".to_string());
                db.record_transaction(&tx)?;
                tracing::info!(transaction = %tx.id, "rolled back interrupted transaction");
            }
        }

        tracing::debug!(ceiling, committed, "budget ledger loaded");
        Ok(Self {
            db,
            ceiling,
            ledger: Mutex::new(Ledger {
                committed,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// Ceiling minus committed spend and open reservations
    pub fn remaining(&self) -> f64 {
        let ledger = self.lock();
        (self.ceiling - ledger.committed - ledger.reserved).max(0.0)
    }

    pub fn committed(&self) -> f64 {
        self.lock().committed
    }

    /// Reserve `estimated_cost` and open a pending transaction
    pub fn begin(&self, asset_type: AssetType, estimated_cost: f64, prompt: &str) -> Result<Transaction> {
        let estimated_cost = estimated_cost.max(0.0);
        let mut ledger = self.lock();

        let remaining = self.ceiling - ledger.committed - ledger.reserved;
        if estimated_cost > remaining + EPSILON {
            tracing::warn!(
                requested = estimated_cost,
                remaining = remaining.max(0.0),
                "budget exceeded"
            );
            return Err(AtelierError::BudgetExceeded {
                requested: estimated_cost,
                remaining: remaining.max(0.0),
            });
        }

        let tx = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now(),
            asset_type,
            cost: estimated_cost,
            status: TransactionStatus::Pending,
            prompt: prompt.to_string(),
            error: None,
            retry_count: 0,
        };
        retry_storage_once("record transaction", || self.db.record_transaction(&tx))?;

        ledger.reserved += estimated_cost;
        ledger.open.insert(tx.id.clone(), estimated_cost);
        tracing::debug!(transaction = %tx.id, estimated_cost, "transaction opened");
        Ok(tx)
    }

    /// Finalize with the actual cost. If the actual cost would push committed
    /// spend past the ceiling the transaction is recorded as failed (the
    /// money is still counted as spent) and `BudgetExceeded` is returned.
    /// When the success row cannot be written the transaction stays open,
    /// and the caller must `fail` or `rollback` it.
    pub fn commit(&self, mut tx: Transaction, actual_cost: f64) -> Result<Transaction> {
        let actual_cost = actual_cost.max(0.0);
        let mut ledger = self.lock();
        let estimate = Self::release(&mut ledger, &tx)?;

        if ledger.committed + actual_cost > self.ceiling + EPSILON {
            let remaining = (self.ceiling - ledger.committed - ledger.reserved).max(0.0);
            tx.status = TransactionStatus::Failed;
            tx.cost = actual_cost;
            tx.error = Some(format!(
                "actual cost ${:.4} exceeds remaining budget ${:.4}",
                actual_cost, remaining
            ));
            ledger.committed += actual_cost;
            retry_storage_once("record transaction", || self.db.record_transaction(&tx))?;
            return Err(AtelierError::BudgetExceeded {
                requested: actual_cost,
                remaining,
            });
        }

        tx.status = TransactionStatus::Success;
        tx.cost = actual_cost;
        tx.error = None;
        if let Err(e) = retry_storage_once("record transaction", || self.db.record_transaction(&tx)) {
            // Not durable, so not committed; put the reservation back for rollback
            ledger.reserved += estimate;
            ledger.open.insert(tx.id.clone(), estimate);
            return Err(e);
        }
        ledger.committed += actual_cost;

        tracing::info!(
            transaction = %tx.id,
            estimate,
            cost = actual_cost,
            committed = ledger.committed,
            "transaction committed"
        );
        Ok(tx)
    }

    /// Release the reservation of a call that never completed
    pub fn rollback(&self, mut tx: Transaction, reason: &str) -> Result<Transaction> {
        let mut ledger = self.lock();
        Self::release(&mut ledger, &tx)?;
        tx.status = TransactionStatus::RolledBack;
        tx.cost = 0.0;
        tx.error = Some(reason.to_string());
        retry_storage_once("record transaction", || self.db.record_transaction(&tx))?;
        tracing::debug!(transaction = %tx.id, reason, "transaction rolled back");
        Ok(tx)
    }

    /// Finalize a call whose asset failed. `spent` is what the upstream
    /// calls cost anyway and is counted against the budget.
    pub fn fail(&self, mut tx: Transaction, error: &str, spent: f64) -> Result<Transaction> {
        let spent = spent.max(0.0);
        let mut ledger = self.lock();
        Self::release(&mut ledger, &tx)?;
        ledger.committed += spent;
        tx.status = TransactionStatus::Failed;
        tx.cost = spent;
        tx.error = Some(error.to_string());
        retry_storage_once("record transaction", || self.db.record_transaction(&tx))?;
        tracing::debug!(transaction = %tx.id, spent, error, "transaction failed");
        Ok(tx)
    }

    /// Whether a transaction still holds a reservation
    pub fn is_open(&self, id: &str) -> bool {
        self.lock().open.contains_key(id)
    }

    fn release(ledger: &mut Ledger, tx: &Transaction) -> Result<f64> {
        let estimate = ledger.open.remove(&tx.id).ok_or_else(|| {
            AtelierError::InvalidState(format!("transaction {} is not open", tx.id))
        })?;
        ledger.reserved = (ledger.reserved - estimate).max(0.0);
        Ok(estimate)
    }

    pub fn summary(&self) -> Result<BudgetSummary> {
        let mut counts = BTreeMap::new();
        for tx in self.db.list_transactions()? {
            *counts.entry(tx.status.to_string()).or_insert(0) += 1;
        }
        let ledger = self.lock();
        Ok(BudgetSummary {
            ceiling: self.ceiling,
            committed: ledger.committed,
            reserved: ledger.reserved,
            remaining: (self.ceiling - ledger.committed - ledger.reserved).max(0.0),
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn manager(ceiling: f64) -> TransactionManager {
        TransactionManager::new(AssetDatabase::open_in_memory().unwrap(), ceiling).unwrap()
    }

    #[test]
    fn test_begin_and_commit() {
        let tm = manager(1.0);
        let tx = tm.begin(AssetType::Icon, 0.3, "legal icon").unwrap();
        assert!((tm.remaining() - 0.7).abs() < 1e-9);

        let tx = tm.commit(tx, 0.25).unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
        assert!((tm.committed() - 0.25).abs() < 1e-9);
        assert!((tm.remaining() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_begin_rejects_over_budget() {
        let tm = manager(1.0);
        let _tx = tm.begin(AssetType::Cover, 0.8, "roadmap").unwrap();
        let err = tm.begin(AssetType::Cover, 0.3, "roadmap 2").unwrap_err();
        match err {
            AtelierError::BudgetExceeded { requested, remaining } => {
                assert_eq!(requested, 0.3);
                assert!((remaining - 0.2).abs() < 1e-9);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_rollback_releases_reservation() {
        let tm = manager(1.0);
        let tx = tm.begin(AssetType::Cover, 0.9, "roadmap").unwrap();
        let tx = tm.rollback(tx, "provider never answered").unwrap();
        assert_eq!(tx.status, TransactionStatus::RolledBack);
        assert!((tm.remaining() - 1.0).abs() < 1e-9);
        assert!(tm.begin(AssetType::Cover, 0.9, "roadmap").is_ok());
    }

    #[test]
    fn test_commit_over_ceiling_fails() {
        let tm = manager(1.0);
        let tx = tm.begin(AssetType::Cover, 0.5, "roadmap").unwrap();
        let id = tx.id.clone();
        let err = tm.commit(tx, 1.5).unwrap_err();
        assert!(matches!(err, AtelierError::BudgetExceeded { .. }));
        // Paid for regardless, so it counts and nothing is left to spend
        assert!((tm.committed() - 1.5).abs() < 1e-9);
        assert_eq!(tm.remaining(), 0.0);
        assert!(tm.begin(AssetType::Icon, 0.01, "icon").is_err());

        let stored = tm.db.get_transaction(&id).unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
    }

    #[test]
    fn test_failed_call_still_counts_spend() {
        let tm = manager(1.0);
        let tx = tm.begin(AssetType::Icon, 0.3, "payroll icon").unwrap();
        let tx = tm.fail(tx, "image provider refused credentials", 0.001).unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.cost, 0.001);

        let summary = tm.summary().unwrap();
        assert!((summary.committed - 0.001).abs() < 1e-9);
        assert_eq!(summary.reserved, 0.0);
        assert!(!tm.is_open(&tx.id));
    }

    #[test]
    fn test_double_commit_is_invalid() {
        let tm = manager(1.0);
        let tx = tm.begin(AssetType::Icon, 0.1, "icon").unwrap();
        let committed = tm.commit(tx, 0.1).unwrap();
        assert!(matches!(
            tm.commit(committed, 0.1),
            Err(AtelierError::InvalidState(_))
        ));
    }

    #[test]
    fn test_concurrent_begins_never_overspend() {
        let tm = Arc::new(manager(10.0));
        let barrier = Arc::new(Barrier::new(3));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let tm = tm.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let tx = tm.begin(AssetType::Cover, 4.0, &format!("cover {}", i))?;
                    tm.commit(tx, 4.0)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let over = results
            .iter()
            .filter(|r| matches!(r, Err(AtelierError::BudgetExceeded { .. })))
            .count();

        assert_eq!(ok, 2);
        assert_eq!(over, 1);
        assert!(tm.committed() <= 10.0);
    }

    #[test]
    fn test_budget_survives_restart() {
        let path = std::env::temp_dir()
            .join(format!("atelier_tx_test_{}", uuid::Uuid::new_v4()))
            .join("assets.db");

        {
            let tm = TransactionManager::new(AssetDatabase::open(&path).unwrap(), 5.0).unwrap();
            let tx = tm.begin(AssetType::Cover, 2.0, "a").unwrap();
            tm.commit(tx, 2.0).unwrap();
            let tx = tm.begin(AssetType::Icon, 0.5, "c").unwrap();
            tm.fail(tx, "image rejected", 0.25).unwrap();
            // Left pending, as if the process died mid-call
            tm.begin(AssetType::Cover, 1.0, "b").unwrap();
        }

        let tm = TransactionManager::new(AssetDatabase::open(&path).unwrap(), 5.0).unwrap();
        assert!((tm.committed() - 2.25).abs() < 1e-9);
        assert!((tm.remaining() - 2.75).abs() < 1e-9);

        let summary = tm.summary().unwrap();
        assert_eq!(summary.counts.get("success"), Some(&1));
        assert_eq!(summary.counts.get("failed"), Some(&1));
        assert_eq!(summary.counts.get("rolled_back"), Some(&1));

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
