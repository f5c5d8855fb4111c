//! File-backed position snapshot.

use super::StoreError;
use crate::ledger::segment;
use keel_domain::PositionRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything the store persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub version: u32,
    /// Last ledger sequence number accounted for by a successful full reconciliation.
    #[serde(default)]
    pub checkpoint_seq: Option<u64>,
    #[serde(default)]
    pub positions: BTreeMap<String, PositionRecord>,
}

impl Default for PositionSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            checkpoint_seq: None,
            positions: BTreeMap::new(),
        }
    }
}

/// Repository for the position snapshot file.
#[derive(Debug, Clone)]
pub struct PositionRepository {
    path: PathBuf,
}

impl PositionRepository {
    /// Creates a new PositionRepository for the given file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot; a missing file is an empty snapshot.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or decoded.
    pub fn load(&self) -> Result<PositionSnapshot, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No position snapshot, starting empty");
                return Ok(PositionSnapshot::default());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: PositionSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    /// Atomically replaces the snapshot file.
    ///
    /// Writes a temp file next to the target, fsyncs it, renames it over the
    /// target and fsyncs the directory.
    ///
    /// # Errors
    /// Returns an error if any filesystem step fails; the previous file is left intact.
    pub fn save(&self, snapshot: &PositionSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            segment::sync_dir(dir)?;
        }
        debug!(
            path = %self.path.display(),
            positions = snapshot.positions.len(),
            checkpoint_seq = ?snapshot.checkpoint_seq,
            "Position snapshot saved"
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
