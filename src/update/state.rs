//! Pending-update persistence.
//!
//! A downloaded-but-not-installed artifact is recorded in
//! `pending-update.json` under the data directory so it survives a restart.
//! Nothing else is persisted: no check timestamps and no preferences.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// A downloaded artifact waiting to be installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub artifact_path: PathBuf,
    pub target_version: String,
    pub downloaded_at: DateTime<Utc>,
    /// URL the artifact was finally fetched from.
    #[serde(default)]
    pub source_url: String,
}

impl PendingUpdate {
    pub fn new(
        artifact_path: PathBuf,
        target_version: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            artifact_path,
            target_version: target_version.into(),
            downloaded_at: Utc::now(),
            source_url: source_url.into(),
        }
    }

    /// `true` if the artifact is still on disk and non-empty.
    pub fn artifact_present(&self) -> bool {
        std::fs::metadata(&self.artifact_path).is_ok_and(|m| m.is_file() && m.len() > 0)
    }
}

/// Reads and writes the pending-update record.
#[derive(Debug, Clone)]
pub struct PendingUpdateStore {
    path: PathBuf,
}

impl PendingUpdateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at [`crate::app_dirs::pending_update_file`].
    pub fn default_location() -> Self {
        Self::new(crate::app_dirs::pending_update_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. A missing file is `None`; so is a corrupt one, which
    /// is logged and left for the next [`save`](Self::save) to overwrite.
    ///
    /// # Errors
    ///
    /// [`UpdateError::State`] if the file exists but cannot be read.
    pub fn load(&self) -> Result<Option<PendingUpdate>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(UpdateError::State(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(pending) => Ok(Some(pending)),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "ignoring corrupt pending-update record"
                );
                Ok(None)
            }
        }
    }

    /// Persist `pending`, replacing any previous record atomically.
    ///
    /// # Errors
    ///
    /// [`UpdateError::State`] if the directory or file cannot be written.
    pub fn save(&self, pending: &PendingUpdate) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::State(format!(
                    "cannot create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(pending)
            .map_err(|e| UpdateError::State(format!("cannot serialize pending update: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| {
            UpdateError::State(format!("cannot write {}: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            UpdateError::State(format!("cannot replace {}: {e}", self.path.display()))
        })?;
        Ok(())
    }

    /// Remove the record. Missing is fine.
    ///
    /// # Errors
    ///
    /// [`UpdateError::State`] if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpdateError::State(format!(
                "cannot remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}
