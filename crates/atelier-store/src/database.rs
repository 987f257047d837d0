//! SQLite-backed record store for assets, transactions, checkpoints and approvals
//!
//! One connection guarded by a mutex gives a single writer per row; every
//! multi-statement write runs inside an SQLite transaction so readers never
//! observe half of an update.

use crate::records::{ApprovalDecisionRow, ApprovalItemRow, AssetRecord, Checkpoint, Transaction};
use atelier_core::{
    now, ApprovalStatus, AssetStatus, AtelierError, Fingerprint, Result, TransactionStatus,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// How to address an asset row
#[derive(Debug, Clone, Copy)]
pub enum AssetKey<'a> {
    Id(i64),
    Hash(&'a str),
}

impl From<i64> for AssetKey<'_> {
    fn from(id: i64) -> Self {
        AssetKey::Id(id)
    }
}

/// Optional field changes applied alongside a status update
#[derive(Debug, Clone, Default)]
pub struct AssetUpdate {
    pub file_path: Option<String>,
    pub url: Option<String>,
    pub cost: Option<f64>,
    pub error_message: Option<String>,
    /// Clear any previous error message
    pub clear_error: bool,
}

impl AssetUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Durable store for every record the engine owns.
#[derive(Clone)]
pub struct AssetDatabase {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    /// Calls left to fail with a storage error
    #[cfg(test)]
    faults: Arc<std::sync::atomic::AtomicUsize>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_type TEXT NOT NULL,
    prompt TEXT NOT NULL,
    prompt_hash TEXT NOT NULL UNIQUE,
    file_path TEXT,
    url TEXT,
    cost REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assets_status ON assets(status);
CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    asset_type TEXT NOT NULL,
    cost REAL NOT NULL,
    status TEXT NOT NULL,
    prompt TEXT NOT NULL,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);
CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    position INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS approval_items (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL,
    asset_name TEXT NOT NULL,
    asset_id INTEGER,
    status TEXT NOT NULL,
    decided_by TEXT,
    decided_at TEXT,
    notes TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_approval_items_batch ON approval_items(batch_id);
CREATE TABLE IF NOT EXISTS approval_decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL REFERENCES approval_items(id),
    decision TEXT NOT NULL,
    actor TEXT NOT NULL,
    notes TEXT,
    decided_at TEXT NOT NULL
);
";

const ASSET_COLUMNS: &str = "id, asset_type, prompt, prompt_hash, file_path, url, cost, status, \
                             error_message, created_at, updated_at";

impl AssetDatabase {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )
        .map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        tracing::debug!(path = %path.display(), "opened asset database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            #[cfg(test)]
            faults: Arc::default(),
        })
    }

    /// An in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            #[cfg(test)]
            faults: Arc::default(),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Make the next `calls` database calls fail with a storage error
    #[cfg(test)]
    pub(crate) fn fail_next(&self, calls: usize) {
        self.faults.store(calls, std::sync::atomic::Ordering::SeqCst);
    }

    /// Lock the connection. A poisoned lock still holds a usable connection.
    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R>,
    {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .faults
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AtelierError::Storage("injected fault".to_string()));
            }
        }
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard).map_err(storage)
    }

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    /// Insert a record, or overwrite the row with the same prompt hash.
    /// Returns the row id.
    pub fn put(&self, record: &AssetRecord) -> Result<i64> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO assets (asset_type, prompt, prompt_hash, file_path, url, cost, status, \
                                     error_message, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(prompt_hash) DO UPDATE SET \
                     file_path = excluded.file_path, \
                     url = excluded.url, \
                     cost = excluded.cost, \
                     status = excluded.status, \
                     error_message = excluded.error_message, \
                     updated_at = excluded.updated_at",
                params![
                    record.asset_type.as_str(),
                    record.prompt,
                    record.prompt_hash,
                    record.file_path,
                    record.url,
                    record.cost,
                    record.status.as_str(),
                    record.error_message,
                    record.created_at,
                    now(),
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM assets WHERE prompt_hash = ?1",
                params![record.prompt_hash],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Fetch a record by id or prompt hash
    pub fn get<'a>(&self, key: impl Into<AssetKey<'a>>) -> Result<Option<AssetRecord>> {
        let key = key.into();
        self.with_conn(|conn| match key {
            AssetKey::Id(id) => conn
                .query_row(
                    &format!("SELECT {} FROM assets WHERE id = ?1", ASSET_COLUMNS),
                    params![id],
                    asset_from_row,
                )
                .optional(),
            AssetKey::Hash(hash) => conn
                .query_row(
                    &format!("SELECT {} FROM assets WHERE prompt_hash = ?1", ASSET_COLUMNS),
                    params![hash],
                    asset_from_row,
                )
                .optional(),
        })
    }

    /// Fetch a record by fingerprint
    pub fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<AssetRecord>> {
        let hex = fingerprint.to_hex();
        self.get(AssetKey::Hash(&hex))
    }

    /// Move a record to a new status, applying any provided field changes
    pub fn update_status(&self, id: i64, status: AssetStatus, fields: AssetUpdate) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE assets SET \
                     status = ?2, \
                     file_path = COALESCE(?3, file_path), \
                     url = COALESCE(?4, url), \
                     cost = COALESCE(?5, cost), \
                     error_message = CASE WHEN ?6 THEN NULL ELSE COALESCE(?7, error_message) END, \
                     updated_at = ?8 \
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    fields.file_path,
                    fields.url,
                    fields.cost,
                    fields.clear_error,
                    fields.error_message,
                    now(),
                ],
            )
        })?;
        if changed == 0 {
            return Err(AtelierError::NotFound(format!("asset {}", id)));
        }
        Ok(())
    }

    /// Delete a record. Returns whether a row was removed.
    pub fn delete_asset(&self, id: i64) -> Result<bool> {
        let changed =
            self.with_conn(|conn| conn.execute("DELETE FROM assets WHERE id = ?1", params![id]))?;
        Ok(changed > 0)
    }

    /// List records, optionally filtered by status, oldest first
    pub fn list_assets(&self, status: Option<AssetStatus>) -> Result<Vec<AssetRecord>> {
        self.with_conn(|conn| {
            let mut records = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM assets WHERE status = ?1 ORDER BY id",
                        ASSET_COLUMNS
                    ))?;
                    for row in stmt.query_map(params![status.as_str()], asset_from_row)? {
                        records.push(row?);
                    }
                }
                None => {
                    let mut stmt =
                        conn.prepare(&format!("SELECT {} FROM assets ORDER BY id", ASSET_COLUMNS))?;
                    for row in stmt.query_map([], asset_from_row)? {
                        records.push(row?);
                    }
                }
            }
            Ok(records)
        })
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Insert a transaction or replace it by id
    pub fn record_transaction(&self, tx: &Transaction) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transactions (id, timestamp, asset_type, cost, status, prompt, error, retry_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(id) DO UPDATE SET \
                     cost = excluded.cost, \
                     status = excluded.status, \
                     error = excluded.error, \
                     retry_count = excluded.retry_count",
                params![
                    tx.id,
                    tx.timestamp,
                    tx.asset_type.as_str(),
                    tx.cost,
                    tx.status.as_str(),
                    tx.prompt,
                    tx.error,
                    tx.retry_count,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, timestamp, asset_type, cost, status, prompt, error, retry_count \
                 FROM transactions WHERE id = ?1",
                params![id],
                transaction_from_row,
            )
            .optional()
        })
    }

    /// All transactions, oldest first
    pub fn list_transactions(&self) -> Result<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, asset_type, cost, status, prompt, error, retry_count \
                 FROM transactions ORDER BY timestamp, id",
            )?;
            let rows = stmt.query_map([], transaction_from_row)?;
            rows.collect()
        })
    }

    /// Money actually spent: costs of `success` and `failed` transactions.
    /// Pending rows hold estimates and rolled-back rows never reached an
    /// upstream, so neither counts.
    pub fn sum_spent_costs(&self) -> Result<f64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM transactions WHERE status IN (?1, ?2)",
                params![TransactionStatus::Success.as_str(), TransactionStatus::Failed.as_str()],
                |row| row.get(0),
            )
        })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Write the run's checkpoint, replacing the previous one
    pub fn write_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints (id, status, position, metadata, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO UPDATE SET \
                     status = excluded.status, \
                     position = excluded.position, \
                     metadata = excluded.metadata, \
                     timestamp = excluded.timestamp",
                params![
                    cp.id,
                    cp.status.as_str(),
                    cp.position as i64,
                    cp.metadata,
                    cp.timestamp,
                ],
            )?;
            Ok(())
        })
    }

    pub fn read_latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, status, position, metadata, timestamp FROM checkpoints WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok(Checkpoint {
                        id: row.get(0)?,
                        status: parse_column(row, 1)?,
                        position: row.get::<_, i64>(2)?.max(0) as u64,
                        metadata: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    /// All checkpoints, most recent first
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, position, metadata, timestamp FROM checkpoints \
                 ORDER BY timestamp DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Checkpoint {
                    id: row.get(0)?,
                    status: parse_column(row, 1)?,
                    position: row.get::<_, i64>(2)?.max(0) as u64,
                    metadata: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    pub fn insert_approval_item(&self, item: &ApprovalItemRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO approval_items (id, batch_id, asset_name, asset_id, status, decided_by, \
                                             decided_at, notes, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    item.id,
                    item.batch_id,
                    item.asset_name,
                    item.asset_id,
                    item.status.as_str(),
                    item.decided_by,
                    item.decided_at,
                    item.notes,
                    item.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Record a terminal decision for a pending item.
    ///
    /// The item row only moves out of `pending` once; the decision log is
    /// append-only. Returns `false` when the item was already terminal.
    pub fn append_approval_decision(&self, decision: &ApprovalDecisionRow) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE approval_items SET status = ?2, decided_by = ?3, decided_at = ?4, notes = ?5 \
                 WHERE id = ?1 AND status = ?6",
                params![
                    decision.item_id,
                    decision.decision.as_str(),
                    decision.actor,
                    decision.decided_at,
                    decision.notes,
                    ApprovalStatus::Pending.as_str(),
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO approval_decisions (item_id, decision, actor, notes, decided_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    decision.item_id,
                    decision.decision.as_str(),
                    decision.actor,
                    decision.notes,
                    decision.decided_at,
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn list_approval_items(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalItemRow>> {
        let filter = status.map(|s| s.as_str());
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, batch_id, asset_name, asset_id, status, decided_by, decided_at, notes, created_at \
                 FROM approval_items WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map(params![filter], approval_item_from_row)?;
            rows.collect()
        })
    }

    pub fn get_approval_item(&self, id: &str) -> Result<Option<ApprovalItemRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, batch_id, asset_name, asset_id, status, decided_by, decided_at, notes, created_at \
                 FROM approval_items WHERE id = ?1",
                params![id],
                approval_item_from_row,
            )
            .optional()
        })
    }

    /// Items belonging to one batch, in submission order
    pub fn list_batch_items(&self, batch_id: &str) -> Result<Vec<ApprovalItemRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, batch_id, asset_name, asset_id, status, decided_by, decided_at, notes, created_at \
                 FROM approval_items WHERE batch_id = ?1 ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map(params![batch_id], approval_item_from_row)?;
            rows.collect()
        })
    }

    pub fn approval_decisions(&self, item_id: &str) -> Result<Vec<ApprovalDecisionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, decision, actor, notes, decided_at FROM approval_decisions \
                 WHERE item_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![item_id], |row| {
                Ok(ApprovalDecisionRow {
                    item_id: row.get(0)?,
                    decision: parse_column(row, 1)?,
                    actor: row.get(2)?,
                    notes: row.get(3)?,
                    decided_at: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }
}

fn storage(err: rusqlite::Error) -> AtelierError {
    AtelierError::Storage(err.to_string())
}

/// Read a TEXT column into one of the core status enums
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = AtelierError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: AtelierError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        id: row.get(0)?,
        asset_type: parse_column(row, 1)?,
        prompt: row.get(2)?,
        prompt_hash: row.get(3)?,
        file_path: row.get(4)?,
        url: row.get(5)?,
        cost: row.get(6)?,
        status: parse_column(row, 7)?,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        asset_type: parse_column(row, 2)?,
        cost: row.get(3)?,
        status: parse_column(row, 4)?,
        prompt: row.get(5)?,
        error: row.get(6)?,
        retry_count: row.get(7)?,
    })
}

fn approval_item_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalItemRow> {
    Ok(ApprovalItemRow {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        asset_name: row.get(2)?,
        asset_id: row.get(3)?,
        status: parse_column(row, 4)?,
        decided_by: row.get(5)?,
        decided_at: row.get(6)?,
        notes: row.get(7)?,
        created_at: row.get(8)?,
    })
}
