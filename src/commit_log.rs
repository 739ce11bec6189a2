//! Durable decision log
//!
//! Persists the `trans_id -> status` map that both roles recover from.
//! The whole map is reconciled in one atomic snapshot write: rows absent
//! from the snapshot are removed, rows present are inserted or updated.

use crate::types::{TransId, TxnStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Log file magic number ("PACT")
const LOG_MAGIC: u32 = 0x5041_4354;

/// Log format version
const LOG_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LogSnapshot {
    magic: u32,
    version: u32,
    /// Statuses keyed by transaction id, in their short string form
    entries: BTreeMap<TransId, String>,
}

impl LogSnapshot {
    fn new(entries: BTreeMap<TransId, String>) -> Self {
        LogSnapshot {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            entries,
        }
    }

    fn is_valid(&self) -> bool {
        self.magic == LOG_MAGIC && self.version == LOG_VERSION
    }
}

/// Durable `trans_id -> status` table backed by a single snapshot file
pub struct CommitLog {
    path: PathBuf,
}

impl CommitLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CommitLog {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty log file if none exists yet. Idempotent.
    pub fn initialize(&self) -> io::Result<()> {
        if !self.path.exists() {
            self.write_all(&BTreeMap::new())?;
        }
        Ok(())
    }

    /// Atomically reconcile the persistent contents to match `entries`.
    ///
    /// The snapshot is written to a sibling temp file, fsynced, then
    /// renamed over the log path; the rename is the commit point, so no
    /// partial update is observable even on crash.
    pub fn write_all(&self, entries: &BTreeMap<TransId, TxnStatus>) -> io::Result<()> {
        let entries = entries
            .iter()
            .map(|(&id, status)| (id, status.as_str().to_string()))
            .collect();

        let snapshot = LogSnapshot::new(entries);
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
    }

    /// Load the full contents. A missing file reads as an empty map.
    pub fn read_all(&self) -> io::Result<BTreeMap<TransId, TxnStatus>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }

        let snapshot: LogSnapshot = bincode::deserialize(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if !snapshot.is_valid() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid log header",
            ));
        }

        let mut entries = BTreeMap::new();
        for (id, status) in snapshot.entries {
            let status = status
                .parse::<TxnStatus>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            entries.insert(id, status);
        }
        Ok(entries)
    }
}
