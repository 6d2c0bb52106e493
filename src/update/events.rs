//! Status events published by the coordinator for the host application.

use std::path::PathBuf;

use crate::update::install::InstallStage;

/// What the updater is doing "right now".
///
/// Delivered over a `tokio::sync::broadcast` channel; slow receivers may
/// miss intermediate `Downloading` events but never block the updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// A release check started.
    Checking,
    UpdateAvailable {
        version: String,
        /// The release is older than the installed version.
        is_downgrade: bool,
        notes: String,
    },
    NotAvailable,
    /// Throttled download progress. `percent` is `None` when the server did
    /// not report a length.
    Downloading { percent: Option<u8>, bytes_received: u64 },
    Downloaded { path: PathBuf },
    Installing { stage: InstallStage, percent: u8 },
    /// Install finished; the relaunch helper (if any) takes over once the
    /// host exits.
    Installed { relaunch_scheduled: bool },
    /// User-facing failure message, including the manual-download hint.
    Error { message: String },
}

impl std::fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checking => write!(f, "checking for updates"),
            Self::UpdateAvailable {
                version,
                is_downgrade: true,
                ..
            } => write!(f, "version {version} available (downgrade)"),
            Self::UpdateAvailable { version, .. } => write!(f, "version {version} available"),
            Self::NotAvailable => write!(f, "already up to date"),
            Self::Downloading {
                percent: Some(p), ..
            } => write!(f, "downloading: {p}%"),
            Self::Downloading { bytes_received, .. } => {
                write!(f, "downloading: {bytes_received} bytes")
            }
            Self::Downloaded { path } => write!(f, "downloaded {}", path.display()),
            Self::Installing { stage, percent } => write!(f, "installing: {stage} ({percent}%)"),
            Self::Installed {
                relaunch_scheduled: true,
            } => write!(f, "installed; relaunching"),
            Self::Installed { .. } => write!(f, "installed"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn display_marks_downgrades() {
        let event = UpdateEvent::UpdateAvailable {
            version: "2.0.0".to_owned(),
            is_downgrade: true,
            notes: String::new(),
        };
        assert_eq!(event.to_string(), "version 2.0.0 available (downgrade)");
    }

    #[test]
    fn display_download_progress() {
        let known = UpdateEvent::Downloading {
            percent: Some(42),
            bytes_received: 420,
        };
        assert_eq!(known.to_string(), "downloading: 42%");
        let unknown = UpdateEvent::Downloading {
            percent: None,
            bytes_received: 420,
        };
        assert_eq!(unknown.to_string(), "downloading: 420 bytes");
    }

    #[test]
    fn display_install_stage() {
        let event = UpdateEvent::Installing {
            stage: InstallStage::Backup,
            percent: 40,
        };
        assert_eq!(event.to_string(), "installing: backup (40%)");
    }
}
