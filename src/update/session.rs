//! Update session state machine.
//!
//! `Idle → Checking → {NoUpdate | UpdateAvailable} → Downloading →
//! Downloaded → Installing → {RelaunchPending | Failed}`. `Failed` is
//! reachable from every in-flight state and returns to `Idle` on reset.
//! While an operation is in flight every other operation is rejected with
//! [`UpdateError::Busy`]; nothing is queued.

use crate::error::{Result, UpdateError};
use crate::update::release::AvailableUpdate;
use crate::update::state::PendingUpdate;

/// Where the session is.
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Checking,
    NoUpdate { current_version: String },
    UpdateAvailable(Box<AvailableUpdate>),
    Downloading { version: String },
    Downloaded(PendingUpdate),
    Installing { version: String },
    /// Install succeeded; the host is expected to exit.
    RelaunchPending { version: String },
    Failed { message: String },
}

impl SessionState {
    /// Short state name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::NoUpdate { .. } => "no-update",
            Self::UpdateAvailable(_) => "update-available",
            Self::Downloading { .. } => "downloading",
            Self::Downloaded(_) => "downloaded",
            Self::Installing { .. } => "installing",
            Self::RelaunchPending { .. } => "relaunch-pending",
            Self::Failed { .. } => "failed",
        }
    }

    /// An operation is running.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Checking | Self::Downloading { .. } | Self::Installing { .. }
        )
    }

    /// States a new check (or reset) may leave without further action.
    fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::NoUpdate { .. } | Self::UpdateAvailable(_) | Self::Failed { .. }
        )
    }

    fn reject(&self, operation: &'static str) -> UpdateError {
        if self.is_in_flight() {
            UpdateError::Busy {
                current: self.name().to_owned(),
            }
        } else {
            UpdateError::InvalidState {
                operation,
                current: self.name().to_owned(),
            }
        }
    }

    /// Enter `Checking`. Settled states are reset implicitly.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] while in flight, [`UpdateError::InvalidState`]
    /// from `Downloaded` or `RelaunchPending`.
    pub fn begin_check(&mut self) -> Result<()> {
        if !self.is_settled() {
            return Err(self.reject("check"));
        }
        *self = Self::Checking;
        Ok(())
    }

    /// Enter `Downloading`, handing out the update that was offered.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] while in flight, otherwise
    /// [`UpdateError::InvalidState`] unless an update is available.
    pub fn begin_download(&mut self) -> Result<AvailableUpdate> {
        let Self::UpdateAvailable(update) = self else {
            return Err(self.reject("download"));
        };
        let update = (**update).clone();
        *self = Self::Downloading {
            version: update.version.clone(),
        };
        Ok(update)
    }

    /// Leave the current state for `Installing`.
    ///
    /// Returns the in-memory pending update when there is one; from `Idle`
    /// or `Failed` the caller loads it from durable storage instead.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] while in flight, [`UpdateError::InvalidState`]
    /// from any other state.
    pub fn begin_install(&mut self) -> Result<Option<PendingUpdate>> {
        let pending = match self {
            Self::Downloaded(pending) => Some(pending.clone()),
            Self::Idle | Self::Failed { .. } => None,
            _ => return Err(self.reject("install")),
        };
        *self = Self::Installing {
            version: pending
                .as_ref()
                .map(|p| p.target_version.clone())
                .unwrap_or_default(),
        };
        Ok(pending)
    }

    /// Record the version being installed once it is known.
    pub fn set_installing(&mut self, version: &str) {
        if let Self::Installing { version: v } = self {
            version.clone_into(v);
        }
    }

    /// Return to `Idle`.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] while in flight, [`UpdateError::InvalidState`]
    /// from `Downloaded` (abandon instead) or `RelaunchPending`.
    pub fn reset(&mut self) -> Result<()> {
        if !self.is_settled() {
            return Err(self.reject("reset"));
        }
        *self = Self::Idle;
        Ok(())
    }

    /// Check that discarding the pending update is allowed here.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] while in flight, [`UpdateError::InvalidState`]
    /// from `RelaunchPending`.
    pub fn ensure_can_abandon(&self) -> Result<()> {
        if self.is_in_flight() || matches!(self, Self::RelaunchPending { .. }) {
            return Err(self.reject("abandon"));
        }
        Ok(())
    }

    /// Mark an in-flight operation as failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        *self = Self::Failed {
            message: message.into(),
        };
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdateAvailable(u) => write!(f, "update available: {}", u.version),
            Self::Downloading { version } => write!(f, "downloading {version}"),
            Self::Downloaded(p) => write!(
                f,
                "{} downloaded to {}",
                p.target_version,
                p.artifact_path.display()
            ),
            Self::Installing { version } => write!(f, "installing {version}"),
            Self::RelaunchPending { version } => write!(f, "{version} installed, relaunch pending"),
            Self::NoUpdate { current_version } => write!(f, "up to date ({current_version})"),
            Self::Failed { message } => write!(f, "failed: {message}"),
            Self::Idle | Self::Checking => f.write_str(self.name()),
        }
    }
}
