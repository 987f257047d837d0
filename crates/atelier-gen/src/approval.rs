//! Human sign-off for generated assets
//!
//! Items are grouped into batches (one per run). A reviewer decides each
//! item exactly once through `decide`; the database keeps every decision as
//! an append-only log. `await_batch` polls until the whole batch is decided
//! or its deadline passes, at which point the undecided items time out and
//! so does the batch. Batches are independent: one timing out never holds
//! up another.

use crate::cancel::CancellationToken;
use atelier_core::{now, ApprovalStatus, AssetStatus, AtelierError, BatchStatus, Result};
use atelier_store::{ApprovalDecisionRow, ApprovalItemRow, AssetDatabase, AssetUpdate};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

pub type ApprovalItem = ApprovalItemRow;

/// Actor recorded for decisions the gate makes itself
pub const SYSTEM_ACTOR: &str = "system";

/// Error message stored on a rejected asset
pub const REJECTED_MESSAGE: &str = "rejected by reviewer";

/// A reviewer's verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    /// Accepted with edits (described in the notes)
    Modify,
}

impl Decision {
    pub fn status(&self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
            Decision::Modify => ApprovalStatus::Modified,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Reject => write!(f, "reject"),
            Decision::Modify => write!(f, "modify"),
        }
    }
}

impl FromStr for Decision {
    type Err = AtelierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            "modify" | "modified" => Ok(Decision::Modify),
            other => Err(AtelierError::ParseError(format!(
                "unknown decision '{}' (expected approve, reject or modify)",
                other
            ))),
        }
    }
}

/// How a batch ended
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every item was decided by a reviewer
    Resolved(Vec<ApprovalItem>),
    /// At least one item ran out of time; decided items keep their decisions
    Timeout(Vec<ApprovalItem>),
}

impl BatchOutcome {
    pub fn status(&self) -> BatchStatus {
        match self {
            BatchOutcome::Resolved(_) => BatchStatus::Resolved,
            BatchOutcome::Timeout(_) => BatchStatus::Timeout,
        }
    }

    pub fn items(&self) -> &[ApprovalItem] {
        match self {
            BatchOutcome::Resolved(items) | BatchOutcome::Timeout(items) => items,
        }
    }
}

pub struct ApprovalGate {
    db: AssetDatabase,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl ApprovalGate {
    pub fn new(db: AssetDatabase) -> Self {
        Self {
            db,
            poll_interval: Duration::from_millis(500),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Stop waiting in `await_batch` when this token is cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn new_batch_id() -> String {
        format!("batch-{}", uuid::Uuid::new_v4())
    }

    /// Queue an asset for review
    pub fn submit(&self, batch_id: &str, asset_name: &str, asset_id: Option<i64>) -> Result<ApprovalItem> {
        let item = ApprovalItemRow {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            asset_name: asset_name.to_string(),
            asset_id,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            notes: None,
            created_at: now(),
        };
        self.db.insert_approval_item(&item)?;
        tracing::info!(batch = batch_id, item = %item.id, asset = asset_name, "submitted for approval");
        Ok(item)
    }

    /// Record a reviewer's decision. Deciding an item twice is an error;
    /// the first decision stands.
    pub fn decide(&self, item_id: &str, decision: Decision, actor: &str, notes: Option<&str>) -> Result<ApprovalItem> {
        self.record(item_id, decision.status(), actor, notes)
    }

    fn record(&self, item_id: &str, status: ApprovalStatus, actor: &str, notes: Option<&str>) -> Result<ApprovalItem> {
        let current = self
            .db
            .get_approval_item(item_id)?
            .ok_or_else(|| AtelierError::NotFound(format!("approval item {}", item_id)))?;

        let row = ApprovalDecisionRow {
            item_id: item_id.to_string(),
            decision: status,
            actor: actor.to_string(),
            notes: notes.map(str::to_string),
            decided_at: now(),
        };
        if !self.db.append_approval_decision(&row)? {
            return Err(AtelierError::InvalidState(format!(
                "approval item {} was already {}",
                item_id, current.status
            )));
        }
        tracing::info!(item = item_id, asset = %current.asset_name, decision = %status, actor, "approval decided");

        self.db
            .get_approval_item(item_id)?
            .ok_or_else(|| AtelierError::NotFound(format!("approval item {}", item_id)))
    }

    /// Wait until every item of the batch is decided, or `timeout` passes.
    /// On timeout the undecided items are marked `timeout`.
    pub fn await_batch(&self, batch_id: &str, timeout: Duration) -> Result<BatchOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let items = self.batch(batch_id)?;
            if items.is_empty() {
                return Err(AtelierError::NotFound(format!("approval batch {}", batch_id)));
            }
            if items.iter().all(|i| i.status.is_terminal()) {
                return Ok(classify(items));
            }

            let now = Instant::now();
            if now >= deadline {
                return self.expire(batch_id, items);
            }
            let wait = self.poll_interval.min(deadline - now);
            self.cancel.sleep(wait)?;
        }
    }

    fn expire(&self, batch_id: &str, items: Vec<ApprovalItem>) -> Result<BatchOutcome> {
        let mut expired = 0;
        for item in items.iter().filter(|i| i.status == ApprovalStatus::Pending) {
            let row = ApprovalDecisionRow {
                item_id: item.id.clone(),
                decision: ApprovalStatus::Timeout,
                actor: SYSTEM_ACTOR.to_string(),
                notes: Some("no decision before the batch deadline".to_string()),
                decided_at: now(),
            };
            // A reviewer may have decided in the meantime; their decision stands
            if self.db.append_approval_decision(&row)? {
                expired += 1;
            }
        }
        tracing::warn!(batch = batch_id, expired, "approval batch timed out");
        Ok(classify(self.batch(batch_id)?))
    }

    /// Close a pending item without a reviewer decision. Returns false when
    /// a reviewer got there first.
    pub fn withdraw(&self, item_id: &str, reason: &str) -> Result<bool> {
        let row = ApprovalDecisionRow {
            item_id: item_id.to_string(),
            decision: ApprovalStatus::Timeout,
            actor: SYSTEM_ACTOR.to_string(),
            notes: Some(reason.to_string()),
            decided_at: now(),
        };
        self.db.append_approval_decision(&row)
    }

    /// Carry a decision over to the stored asset: approved and modified
    /// assets become `completed`, rejected ones `failed`. Returns the new
    /// asset status, or `None` when the decision leaves the asset waiting.
    pub fn settle_asset(&self, asset_id: i64, decision: ApprovalStatus) -> Result<Option<AssetStatus>> {
        let (status, fields) = match decision {
            ApprovalStatus::Approved | ApprovalStatus::Modified => (
                AssetStatus::Completed,
                AssetUpdate {
                    clear_error: true,
                    ..Default::default()
                },
            ),
            ApprovalStatus::Rejected => (AssetStatus::Failed, AssetUpdate::error(REJECTED_MESSAGE)),
            ApprovalStatus::Pending | ApprovalStatus::Timeout => return Ok(None),
        };
        self.db.update_status(asset_id, status, fields)?;
        tracing::debug!(asset_id, status = %status, "asset settled by review");
        Ok(Some(status))
    }

    /// Items of a batch, in submission order
    pub fn batch(&self, batch_id: &str) -> Result<Vec<ApprovalItem>> {
        self.db.list_batch_items(batch_id)
    }

    /// Status derived from the batch's items
    pub fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let items = self.batch(batch_id)?;
        if items.is_empty() {
            return Err(AtelierError::NotFound(format!("approval batch {}", batch_id)));
        }
        if items.iter().all(|i| i.status.is_terminal()) {
            Ok(classify(items).status())
        } else {
            Ok(BatchStatus::Pending)
        }
    }

    pub fn item(&self, item_id: &str) -> Result<Option<ApprovalItem>> {
        self.db.get_approval_item(item_id)
    }

    /// Items across all batches still waiting for a reviewer
    pub fn pending_items(&self) -> Result<Vec<ApprovalItem>> {
        self.db.list_approval_items(Some(ApprovalStatus::Pending))
    }

    /// Decision log for one item, oldest first
    pub fn history(&self, item_id: &str) -> Result<Vec<ApprovalDecisionRow>> {
        self.db.approval_decisions(item_id)
    }
}

fn classify(items: Vec<ApprovalItem>) -> BatchOutcome {
    if items.iter().any(|i| i.status == ApprovalStatus::Timeout) {
        BatchOutcome::Timeout(items)
    } else {
        BatchOutcome::Resolved(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gate() -> ApprovalGate {
        ApprovalGate::new(AssetDatabase::open_in_memory().unwrap())
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_submit_and_decide() {
        let gate = gate();
        let batch = ApprovalGate::new_batch_id();
        let item = gate.submit(&batch, "legal_icon", Some(7)).unwrap();
        assert_eq!(item.status, ApprovalStatus::Pending);
        assert_eq!(gate.pending_items().unwrap().len(), 1);

        let decided = gate
            .decide(&item.id, Decision::Modify, "dana", Some("warmer palette"))
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Modified);
        assert_eq!(decided.decided_by.as_deref(), Some("dana"));
        assert_eq!(decided.notes.as_deref(), Some("warmer palette"));
        assert!(gate.pending_items().unwrap().is_empty());
    }

    #[test]
    fn test_settle_asset_follows_decision() {
        let db = AssetDatabase::open_in_memory().unwrap();
        let gate = ApprovalGate::new(db.clone());
        let mut record = atelier_store::AssetRecord::new(atelier_core::AssetType::Icon, "Payroll icon");
        record.status = AssetStatus::Processing;
        let id = db.put(&record).unwrap();

        assert_eq!(gate.settle_asset(id, ApprovalStatus::Timeout).unwrap(), None);
        assert_eq!(
            gate.settle_asset(id, ApprovalStatus::Rejected).unwrap(),
            Some(AssetStatus::Failed)
        );
        let stored = db.get(id).unwrap().unwrap();
        assert_eq!(stored.status, AssetStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(REJECTED_MESSAGE));
    }

    #[test]
    fn test_second_decision_is_rejected() {
        let gate = gate();
        let item = gate.submit("b1", "cover", None).unwrap();
        gate.decide(&item.id, Decision::Approve, "dana", None).unwrap();

        let err = gate.decide(&item.id, Decision::Reject, "sam", None).unwrap_err();
        assert!(matches!(err, AtelierError::InvalidState(_)));

        let history = gate.history(&item.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, ApprovalStatus::Approved);
        assert_eq!(gate.item(&item.id).unwrap().unwrap().status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_unknown_item_is_not_found() {
        assert!(matches!(
            gate().decide("missing", Decision::Approve, "dana", None),
            Err(AtelierError::NotFound(_))
        ));
    }

    #[test]
    fn test_batch_resolves_when_all_decided() {
        let gate = Arc::new(gate());
        let a = gate.submit("b1", "a", None).unwrap();
        let b = gate.submit("b1", "b", None).unwrap();

        let reviewer = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                gate.decide(&a.id, Decision::Approve, "dana", None).unwrap();
                gate.decide(&b.id, Decision::Reject, "dana", Some("off brand")).unwrap();
            })
        };

        let outcome = gate.await_batch("b1", Duration::from_secs(5)).unwrap();
        reviewer.join().unwrap();
        assert_eq!(outcome.status(), BatchStatus::Resolved);
        let statuses: Vec<_> = outcome.items().iter().map(|i| i.status).collect();
        assert_eq!(statuses, vec![ApprovalStatus::Approved, ApprovalStatus::Rejected]);
    }

    #[test]
    fn test_batch_times_out_and_keeps_decisions() {
        let gate = gate();
        let a = gate.submit("b1", "a", None).unwrap();
        let b = gate.submit("b1", "b", None).unwrap();
        let c = gate.submit("b1", "c", None).unwrap();
        gate.decide(&a.id, Decision::Approve, "dana", None).unwrap();
        gate.decide(&b.id, Decision::Reject, "dana", None).unwrap();

        let outcome = gate.await_batch("b1", Duration::from_millis(30)).unwrap();
        assert_eq!(outcome.status(), BatchStatus::Timeout);
        assert_eq!(gate.batch_status("b1").unwrap(), BatchStatus::Timeout);

        let items = outcome.items();
        assert_eq!(items[0].status, ApprovalStatus::Approved);
        assert_eq!(items[1].status, ApprovalStatus::Rejected);
        assert_eq!(items[2].id, c.id);
        assert_eq!(items[2].status, ApprovalStatus::Timeout);
        assert_eq!(items[2].decided_by.as_deref(), Some(SYSTEM_ACTOR));
    }

    #[test]
    fn test_batches_are_independent() {
        let gate = gate();
        gate.submit("slow", "x", None).unwrap();
        let fast = gate.submit("fast", "y", None).unwrap();
        gate.decide(&fast.id, Decision::Approve, "dana", None).unwrap();

        assert_eq!(gate.batch_status("slow").unwrap(), BatchStatus::Pending);
        let outcome = gate.await_batch("fast", Duration::from_millis(10)).unwrap();
        assert_eq!(outcome.status(), BatchStatus::Resolved);
        assert_eq!(gate.batch_status("slow").unwrap(), BatchStatus::Pending);
    }

    #[test]
    fn test_cancelled_wait() {
        let cancel = CancellationToken::new();
        let gate = gate().with_cancellation(cancel.clone());
        gate.submit("b1", "a", None).unwrap();
        cancel.cancel();
        assert!(matches!(
            gate.await_batch("b1", Duration::from_secs(5)),
            Err(AtelierError::Cancelled)
        ));
    }

    #[test]
    fn test_decision_parsing() {
        assert_eq!("approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("Rejected".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("maybe".parse::<Decision>().is_err());
    }
}
