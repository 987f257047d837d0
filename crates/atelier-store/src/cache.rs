//! Fingerprint-keyed generation cache
//!
//! Files live at `<root>/<first-2-hex>/<fingerprint>.<ext>`. A record is
//! only written after its file is in place, and a file is only made visible
//! by an atomic rename, so a reader can never observe a record whose file is
//! half-written.
//!
//! `get_or_generate` additionally guarantees at most one concurrent
//! generation per fingerprint: later callers join the first caller's flight
//! and receive its record with zero attributed cost.

use crate::database::AssetDatabase;
use crate::records::AssetRecord;
use atelier_core::{now, AssetStatus, AssetType, AtelierError, Fingerprint, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Output of a paid generation, handed to the cache for storage
#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    /// Scratch file written by the provider; moved into the store
    pub file_path: PathBuf,
    pub url: Option<String>,
    pub cost: f64,
    /// Status the stored record starts in
    pub status: AssetStatus,
}

impl GeneratedAsset {
    pub fn new(file_path: impl Into<PathBuf>, cost: f64) -> Self {
        Self {
            file_path: file_path.into(),
            url: None,
            cost,
            status: AssetStatus::Completed,
        }
    }
}

/// Where a cache answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// An existing record with its file on disk
    Hit,
    /// This caller paid for the generation
    Generated,
    /// Another caller was already generating the same fingerprint
    Joined,
}

/// Result of `AssetCache::get_or_generate`
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub record: AssetRecord,
    /// Cost charged to this caller (zero unless `source == Generated`)
    pub attributed_cost: f64,
    pub source: CacheSource,
}

type FlightResult = std::result::Result<AssetRecord, String>;

/// A generation in progress that other callers can wait on
struct InFlight {
    result: Mutex<Option<FlightResult>>,
    ready: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, result: FlightResult) {
        let mut slot = lock(&self.result);
        if slot.is_none() {
            *slot = Some(result);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> FlightResult {
        let mut slot = lock(&self.result);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Publishes a failure if the leader unwinds without publishing, so
/// followers are never left waiting.
struct FlightGuard<'a> {
    cache: &'a AssetCache,
    key: Fingerprint,
    flight: Arc<InFlight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight
            .publish(Err("generation aborted before completion".to_string()));
        lock(&self.cache.in_flight).remove(&self.key);
    }
}

/// Prompt-hash deduplication layer over `AssetDatabase`
pub struct AssetCache {
    db: AssetDatabase,
    root: PathBuf,
    in_flight: Mutex<HashMap<Fingerprint, Arc<InFlight>>>,
}

impl AssetCache {
    /// Create a cache storing files under `root`
    pub fn new<P: AsRef<Path>>(db: AssetDatabase, root: P) -> Self {
        Self {
            db,
            root: root.as_ref().to_path_buf(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &AssetDatabase {
        &self.db
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up a usable record for a prompt.
    ///
    /// A record whose file has gone missing is invalidated and reported as
    /// a miss.
    pub fn lookup(&self, prompt: &str, asset_type: AssetType) -> Result<Option<AssetRecord>> {
        let key = Fingerprint::compute(asset_type, prompt);
        self.lookup_fingerprint(&key)
    }

    /// Storage errors on the read or the invalidation are retried once.
    pub fn lookup_fingerprint(&self, key: &Fingerprint) -> Result<Option<AssetRecord>> {
        let Some(record) = retry_once("cache lookup", key, || self.db.get_by_fingerprint(key))? else {
            return Ok(None);
        };
        if !record.status.is_cache_hit() {
            return Ok(None);
        }
        let file_present = record
            .file_path
            .as_deref()
            .map(|p| Path::new(p).is_file())
            .unwrap_or(false);
        if !file_present {
            tracing::warn!(
                fingerprint = %key,
                file = ?record.file_path,
                "cached asset file missing, invalidating record"
            );
            retry_once("invalidate record", key, || self.db.delete_asset(record.id))?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Store a generated file for a prompt as a completed record
    pub fn store(
        &self,
        prompt: &str,
        asset_type: AssetType,
        file_path: &Path,
        cost: f64,
    ) -> Result<AssetRecord> {
        let generated = GeneratedAsset::new(file_path, cost);
        self.store_generated(prompt, asset_type, &generated)
    }

    /// Move a generated file into the store and write its record.
    ///
    /// The file is placed first (replacing any stale file for the same
    /// fingerprint); if the record write fails the placed file is removed
    /// again so neither half is observable alone.
    pub fn store_generated(
        &self,
        prompt: &str,
        asset_type: AssetType,
        generated: &GeneratedAsset,
    ) -> Result<AssetRecord> {
        let key = Fingerprint::compute(asset_type, prompt);
        let dest = self.path_for(&key, &generated.file_path);
        if generated.file_path != dest {
            place_file(&generated.file_path, &dest)?;
            fs::remove_file(&generated.file_path).ok();
        }

        let mut record = AssetRecord::new(asset_type, prompt);
        record.file_path = Some(dest.to_string_lossy().to_string());
        record.url = generated.url.clone();
        record.cost = generated.cost;
        record.status = generated.status;

        match retry_once("asset write", &key, || self.db.put(&record)) {
            Ok(id) => {
                record.id = id;
                tracing::debug!(fingerprint = %key, id, cost = record.cost, "stored asset");
                Ok(record)
            }
            Err(e) => {
                fs::remove_file(&dest).ok();
                Err(e)
            }
        }
    }

    /// Return the cached asset for a prompt, generating it at most once.
    ///
    /// Concurrent callers with the same fingerprint wait for the first
    /// caller's result instead of issuing their own paid call.
    pub fn get_or_generate<F>(
        &self,
        prompt: &str,
        asset_type: AssetType,
        generate: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Result<GeneratedAsset>,
    {
        let key = Fingerprint::compute(asset_type, prompt);

        let (flight, leader) = {
            let mut table = lock(&self.in_flight);
            match table.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let flight = Arc::new(InFlight::new());
                    table.insert(key, flight.clone());
                    (flight, true)
                }
            }
        };

        if !leader {
            tracing::debug!(fingerprint = %key, "joining in-flight generation");
            return match flight.wait() {
                Ok(record) => Ok(CacheOutcome {
                    record,
                    attributed_cost: 0.0,
                    source: CacheSource::Joined,
                }),
                Err(message) => Err(AtelierError::SharedGenerationFailed {
                    fingerprint: key.to_string(),
                    message,
                }),
            };
        }

        let guard = FlightGuard {
            cache: self,
            key,
            flight,
        };

        let outcome = self.lookup_fingerprint(&key).and_then(|hit| match hit {
            Some(record) => Ok(CacheOutcome {
                record,
                attributed_cost: 0.0,
                source: CacheSource::Hit,
            }),
            None => {
                let generated = generate()?;
                let record = self.store_generated(prompt, asset_type, &generated)?;
                Ok(CacheOutcome {
                    attributed_cost: generated.cost,
                    record,
                    source: CacheSource::Generated,
                })
            }
        });

        guard.flight.publish(
            outcome
                .as_ref()
                .map(|o| o.record.clone())
                .map_err(|e| e.to_string()),
        );
        drop(guard);
        outcome
    }

    /// Invalidate a record so the next lookup misses
    pub fn invalidate(&self, record: &AssetRecord) -> Result<()> {
        self.db.delete_asset(record.id)?;
        Ok(())
    }

    /// Sweep every usable record and invalidate those whose file is gone.
    /// Returns the number of records invalidated.
    pub fn verify_all(&self) -> Result<usize> {
        let mut invalidated = 0;
        for record in self.db.list_assets(None)? {
            if !record.status.is_cache_hit() {
                continue;
            }
            let present = record
                .file_path
                .as_deref()
                .map(|p| Path::new(p).is_file())
                .unwrap_or(false);
            if !present {
                self.db.delete_asset(record.id)?;
                invalidated += 1;
            }
        }
        if invalidated > 0 {
            tracing::info!(invalidated, "cache sweep removed stale records");
        }
        Ok(invalidated)
    }

    /// Import an existing file as a zero-cost `cached` record
    pub fn register_existing(
        &self,
        prompt: &str,
        asset_type: AssetType,
        source: &Path,
    ) -> Result<AssetRecord> {
        if !source.is_file() {
            return Err(AtelierError::NotFound(source.display().to_string()));
        }
        let key = Fingerprint::compute(asset_type, prompt);
        let dest = self.path_for(&key, source);
        if !dest.exists() {
            let tmp = dest.with_extension("import.tmp");
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, &tmp)?;
            fs::rename(&tmp, &dest)?;
        }
        let mut record = AssetRecord::new(asset_type, prompt);
        record.file_path = Some(dest.to_string_lossy().to_string());
        record.status = AssetStatus::Cached;
        record.id = self.db.put(&record)?;
        Ok(record)
    }

    /// Number of generations currently in flight
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Build the storage path for a fingerprint with extension from source
    fn path_for(&self, key: &Fingerprint, source: &Path) -> PathBuf {
        let hex = key.to_hex();
        let prefix = &hex[..2];
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png");
        self.root.join(prefix).join(format!("{}.{}", hex, ext))
    }
}

/// Copy `source` next to `dest` and rename it into place
fn place_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension(format!("{}.tmp", now().timestamp_nanos_opt().unwrap_or(0)));
    fs::copy(source, &tmp)?;
    if let Err(e) = fs::rename(&tmp, dest) {
        fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run a database call, repeating it once on a storage error
fn retry_once<T>(operation: &str, key: &Fingerprint, mut call: impl FnMut() -> Result<T>) -> Result<T> {
    match call() {
        Err(AtelierError::Storage(message)) => {
            tracing::warn!(operation, fingerprint = %key, error = %message, "storage error, retrying once");
            call()
        }
        other => other,
    }
}
