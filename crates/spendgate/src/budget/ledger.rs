//! Durable spend ledger.
//!
//! The ledger persists a single [`BudgetRecord`] as JSON:
//!
//! ```text
//! {"spent": 0.15, "calls": 1}
//! ```
//!
//! Every mutation runs load → mutate → persist while holding a mutex keyed by
//! the store's canonical path, so every handle on the same file in one process
//! shares it and no update is lost. Writes go to a uniquely named temp file in
//! the same directory and are renamed into place.
//!
//! Only [`BudgetLedger::load`] forgives a corrupt store. The write path refuses
//! to overwrite one with [`Error::Corrupt`]; [`BudgetLedger::reset`] is the
//! explicit way to start over.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::budget::pricing::ModelCostTable;
use crate::error::{Error, Result};

/// Persisted spend state for the current budget period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetRecord {
    /// Accumulated cost in USD. Never negative.
    pub spent: f64,
    /// Number of recorded calls.
    pub calls: u64,
}

impl BudgetRecord {
    /// `budget - spent`. Negative when over budget.
    pub fn remaining(&self, budget: f64) -> f64 {
        budget - self.spent
    }

    /// Format as a short summary string.
    pub fn summary(&self, budget: f64) -> String {
        format!(
            "spent: ${:.4} over {} call(s), remaining: ${:.4} of ${:.2}",
            self.spent,
            self.calls,
            self.remaining(budget),
            budget,
        )
    }

    fn is_valid(&self) -> bool {
        self.spent.is_finite() && self.spent >= 0.0
    }
}

/// Mutex for the store at `path`, shared by every ledger opened on it.
fn store_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    Arc::clone(locks.entry(lock_key(path)).or_default())
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// rest, so different spellings of one store share a key before the file
/// exists.
fn lock_key(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = absolute.as_path();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// Ledger backed by a JSON file, shared across tasks as `Arc<BudgetLedger>`.
///
/// Separate handles on the same path are safe too: they share one lock.
#[derive(Debug)]
pub struct BudgetLedger {
    path: PathBuf,
    default_budget: f64,
    costs: Arc<ModelCostTable>,
    lock: Arc<Mutex<()>>,
}

impl BudgetLedger {
    pub fn new(path: impl Into<PathBuf>, default_budget: f64, costs: Arc<ModelCostTable>) -> Self {
        let path = path.into();
        let lock = store_lock(&path);
        Self {
            path,
            default_budget,
            costs,
            lock,
        }
    }

    /// Path of the backing JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_budget(&self) -> f64 {
        self.default_budget
    }

    pub fn costs(&self) -> &ModelCostTable {
        &self.costs
    }

    /// Current record. A missing, unreadable or corrupt store reads as zero.
    pub fn load(&self) -> BudgetRecord {
        match self.try_load() {
            Ok(record) => record,
            Err(e) => {
                warn!("Treating budget store as empty: {e}");
                BudgetRecord::default()
            }
        }
    }

    /// Current record, without forgiving anything but a missing store.
    pub fn try_load(&self) -> Result<BudgetRecord> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_record()
    }

    /// Charge `tokens_used` on `model` and persist the updated record.
    ///
    /// Returns the record after the update and the cost of this call. Unknown
    /// models fail before anything is read or written. A corrupt store is an
    /// error here and is left on disk untouched.
    pub fn record_usage(&self, tokens_used: u64, model: &str) -> Result<(BudgetRecord, f64)> {
        let cost = self.costs.cost_for(tokens_used, model)?;

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.read_record()?;
        record.spent += cost;
        record.calls += 1;
        self.persist(&record)?;

        debug!(
            model,
            tokens_used,
            cost,
            spent = record.spent,
            calls = record.calls,
            "Recorded usage"
        );
        Ok((record, cost))
    }

    /// `budget - spent`, unclamped.
    pub fn remaining(&self, budget: f64) -> f64 {
        self.load().remaining(budget)
    }

    /// [`remaining`](Self::remaining) against the configured default budget.
    pub fn remaining_default(&self) -> f64 {
        self.remaining(self.default_budget)
    }

    /// Start a new budget period by persisting a zero record. Also clears a
    /// corrupt store.
    pub fn reset(&self) -> Result<BudgetRecord> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let record = BudgetRecord::default();
        self.persist(&record)?;
        info!("Budget period reset at {}", self.path.display());
        Ok(record)
    }

    /// Read the store without taking the lock. Only a missing file reads as
    /// zero.
    fn read_record(&self) -> Result<BudgetRecord> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BudgetRecord::default());
            }
            Err(e) => return Err(Error::persistence(&self.path, e)),
        };

        let corrupt = |reason: String| Error::Corrupt {
            path: self.path.clone(),
            reason,
        };
        match serde_json::from_str::<BudgetRecord>(&json) {
            Ok(record) if record.is_valid() => Ok(record),
            Ok(record) => Err(corrupt(format!("invalid spend {}", record.spent))),
            Err(e) => Err(corrupt(e.to_string())),
        }
    }

    /// Atomic write: serialize to a fresh temp file, then rename into place.
    fn persist(&self, record: &BudgetRecord) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| Error::persistence(&dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Config(format!("invalid ledger path {}", self.path.display())))?;
        let json = serde_json::to_string_pretty(record)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| Error::persistence(&dir, e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| Error::persistence(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::persistence(&self.path, e.error))?;
        Ok(())
    }
}
