//! Durable state: per-chain cursors, cached analyses, delivery marks.
//!
//! Each record is a single JSON file under the data directory:
//!
//!   cursors/{chain_id}.json                       → Cursor
//!   analyses/{fingerprint}.json                   → Analysis
//!   marks/{chain}_{proposal}_{subscriber}.json    → DeliveryMark
//!
//! Writes replace the file atomically (temp file + rename) so readers never
//! observe a torn record. Delivery marks are append-only and inserted with
//! `create_new`, giving the compare-and-insert primitive the delivery gate's
//! double-check relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::analyzer::Analysis;
use crate::chain::Fingerprint;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The record exists but cannot be decoded. For cursors this is fatal
    /// for the owning chain's watcher task.
    #[error("corrupt record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `value` as JSON to `path` atomically: serialize to a sibling temp
/// file, then rename over the target.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(value))
}

/// Keep IDs filesystem-safe: anything outside [A-Za-z0-9._-] becomes '-'.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Per-chain watermark: the highest proposal ID ever observed and the set
/// of non-terminal proposal IDs still being re-polled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub highest_seen: u64,
    #[serde(default)]
    pub tracked: BTreeSet<u64>,
}

#[derive(Clone)]
pub struct CursorStore {
    dir: PathBuf,
}

impl CursorStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("cursors");
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(Self { dir })
    }

    fn path(&self, chain_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(chain_id)))
    }

    /// `Ok(None)` means no cursor yet; `Err(Corrupt)` halts the chain's
    /// watcher until the cursor file is repaired.
    pub fn load(&self, chain_id: &str) -> Result<Option<Cursor>, StoreError> {
        read_json(&self.path(chain_id))
    }

    pub fn save(&self, chain_id: &str, cursor: &Cursor) -> Result<(), StoreError> {
        write_atomic(&self.path(chain_id), cursor)?;
        debug!(
            chain = chain_id,
            highest_seen = cursor.highest_seen,
            tracked = cursor.tracked.len(),
            "cursor persisted"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct AnalysisStore {
    dir: PathBuf,
}

impl AnalysisStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("analyses");
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(Self { dir })
    }

    fn path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.to_hex()))
    }

    pub fn load(&self, fingerprint: Fingerprint) -> Result<Option<Analysis>, StoreError> {
        // A corrupt analysis record is not worth halting anything over:
        // treat it as absent and let the next compute overwrite it.
        match read_json(&self.path(fingerprint)) {
            Ok(v) => Ok(v),
            Err(StoreError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "discarding corrupt analysis record");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, analysis: &Analysis) -> Result<(), StoreError> {
        write_atomic(&self.path(analysis.fingerprint), analysis)
    }

    /// Delete analyses created before `cutoff`. Returns how many were removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let analysis: Option<Analysis> = match read_json(&path) {
                Ok(v) => v,
                Err(_) => {
                    // Unreadable entries age out with everything else.
                    fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                    removed += 1;
                    continue;
                }
            };
            if let Some(analysis) = analysis {
                if analysis.created_at < cutoff {
                    fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Idempotency record proving an advice was accepted by the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMark {
    pub chain_id: String,
    pub proposal_id: u64,
    pub subscriber_id: String,
    pub sent_at: DateTime<Utc>,
    /// Provider message identifier, opaque.
    pub message_id: String,
}

#[derive(Clone)]
pub struct DeliveryLedger {
    dir: PathBuf,
}

impl DeliveryLedger {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("marks");
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(Self { dir })
    }

    fn path(&self, chain_id: &str, proposal_id: u64, subscriber_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.json",
            sanitize(chain_id),
            proposal_id,
            sanitize(subscriber_id)
        ))
    }

    pub fn probe(
        &self,
        chain_id: &str,
        proposal_id: u64,
        subscriber_id: &str,
    ) -> Result<Option<DeliveryMark>, StoreError> {
        read_json(&self.path(chain_id, proposal_id, subscriber_id))
    }

    /// Compare-and-insert: creates the mark only if no mark exists for the
    /// key. Returns `false` (and leaves the existing record untouched) when
    /// another writer got there first. Marks are never updated.
    pub fn try_insert(&self, mark: &DeliveryMark) -> Result<bool, StoreError> {
        let path = self.path(&mark.chain_id, mark.proposal_id, &mark.subscriber_id);
        let json = serde_json::to_vec_pretty(mark).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            source: e,
        })?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(&json).map_err(|e| io_err(&path, e))?;
                file.sync_all().map_err(|e| io_err(&path, e))?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}
