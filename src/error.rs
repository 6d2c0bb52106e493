//! Error types for the self-update engine.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) that is
//! included in the Display output and accessible via [`UpdateError::code()`].
//! Hosts should branch on codes rather than parsing messages.

use std::path::PathBuf;

use crate::update::install::InstallStage;

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// Transport failure: connect error, timeout, interrupted body.
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    /// The release index answered with a non-2xx status.
    pub const REMOTE_ERROR: &str = "REMOTE_ERROR";
    /// The release index body could not be parsed.
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    /// The release has no assets at all.
    pub const EMPTY_RELEASE: &str = "EMPTY_RELEASE";
    /// No asset matches the running platform.
    pub const NO_COMPATIBLE_ASSET: &str = "NO_COMPATIBLE_ASSET";
    /// Every candidate download URL failed.
    pub const DOWNLOAD_EXHAUSTED: &str = "DOWNLOAD_EXHAUSTED";
    /// The downloaded artifact failed structure validation.
    pub const INVALID_ARTIFACT: &str = "INVALID_ARTIFACT";
    /// The artifact format cannot be installed on this platform.
    pub const UNSUPPORTED_FORMAT: &str = "UNSUPPORTED_FORMAT";
    /// No application bundle was found inside the artifact.
    pub const NO_BUNDLE_FOUND: &str = "NO_BUNDLE_FOUND";
    /// The bundle inside the artifact is structurally wrong.
    pub const INVALID_BUNDLE: &str = "INVALID_BUNDLE";
    /// A pipeline stage failed before the live install was touched.
    pub const INSTALL_FAILED: &str = "INSTALL_FAILED";
    /// Replacing the live install failed; the previous install was restored.
    pub const REPLACE_FAILED: &str = "REPLACE_FAILED";
    /// Replacing failed and the previous install could not be restored.
    pub const ROLLBACK_FAILED: &str = "ROLLBACK_FAILED";
    /// The relaunch helper could not be started.
    pub const RELAUNCH_FAILED: &str = "RELAUNCH_FAILED";
    /// Another update operation is already running.
    pub const BUSY: &str = "BUSY";
    /// The operation is not valid in the current session state.
    pub const INVALID_STATE: &str = "INVALID_STATE";
    /// No downloaded update is waiting to be installed.
    pub const NO_PENDING_UPDATE: &str = "NO_PENDING_UPDATE";
    /// The operation was cancelled by the caller.
    pub const CANCELLED: &str = "CANCELLED";
    /// Invalid configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
    /// The durable state file could not be read or written.
    pub const STATE_ERROR: &str = "STATE_ERROR";
    /// Local filesystem failure.
    pub const IO_ERROR: &str = "IO_ERROR";
}

/// Errors produced by the update engine.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("[{}] {}", error_codes::NETWORK_ERROR, .0)]
    Network(String),

    #[error("[{}] release index returned HTTP {status}", error_codes::REMOTE_ERROR)]
    Remote { status: u16 },

    #[error("[{}] {}", error_codes::PARSE_ERROR, .0)]
    Parse(String),

    #[error("[{}] release {version} has no assets", error_codes::EMPTY_RELEASE)]
    EmptyRelease { version: String },

    #[error(
        "[{}] release {version} has no asset for {platform}",
        error_codes::NO_COMPATIBLE_ASSET
    )]
    NoCompatibleAsset { version: String, platform: String },

    /// Every candidate failed; `attempts` lists one line per candidate.
    #[error(
        "[{}] all {} download candidates failed; last error: {last_error}",
        error_codes::DOWNLOAD_EXHAUSTED,
        .attempts.len()
    )]
    DownloadExhausted {
        attempts: Vec<String>,
        last_error: String,
    },

    #[error("[{}] {}: {reason}", error_codes::INVALID_ARTIFACT, .path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("[{}] {}", error_codes::UNSUPPORTED_FORMAT, .0)]
    UnsupportedFormat(String),

    #[error(
        "[{}] no application bundle found in {}",
        error_codes::NO_BUNDLE_FOUND,
        .searched.display()
    )]
    NoBundleFound { searched: PathBuf },

    #[error("[{}] {}: {reason}", error_codes::INVALID_BUNDLE, .path.display())]
    InvalidBundle { path: PathBuf, reason: String },

    /// A stage failed with the live install untouched (or already restored).
    #[error("[{}] {stage}: {reason}", error_codes::INSTALL_FAILED)]
    InstallStage { stage: InstallStage, reason: String },

    #[error(
        "[{}] {stage}: {reason} (previous version restored)",
        error_codes::REPLACE_FAILED
    )]
    ReplaceFailed { stage: InstallStage, reason: String },

    #[error(
        "[{}] {stage}: {reason}; restoring the previous version also failed: {rollback_error}",
        error_codes::ROLLBACK_FAILED
    )]
    RollbackFailed {
        stage: InstallStage,
        reason: String,
        rollback_error: String,
        backup: Option<PathBuf>,
    },

    #[error("[{}] {}", error_codes::RELAUNCH_FAILED, .0)]
    RelaunchFailed(String),

    #[error("[{}] an update operation is already in progress ({current})", error_codes::BUSY)]
    Busy { current: String },

    #[error("[{}] cannot {operation} while {current}", error_codes::INVALID_STATE)]
    InvalidState {
        operation: &'static str,
        current: String,
    },

    #[error("[{}] no downloaded update is pending", error_codes::NO_PENDING_UPDATE)]
    NoPendingUpdate,

    #[error("[{}] {}", error_codes::CANCELLED, .0)]
    Cancelled(String),

    #[error("[{}] {}", error_codes::CONFIG_INVALID, .0)]
    Config(String),

    #[error("[{}] {}", error_codes::STATE_ERROR, .0)]
    State(String),

    #[error("[{}] {}", error_codes::IO_ERROR, .0)]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => error_codes::NETWORK_ERROR,
            Self::Remote { .. } => error_codes::REMOTE_ERROR,
            Self::Parse(_) => error_codes::PARSE_ERROR,
            Self::EmptyRelease { .. } => error_codes::EMPTY_RELEASE,
            Self::NoCompatibleAsset { .. } => error_codes::NO_COMPATIBLE_ASSET,
            Self::DownloadExhausted { .. } => error_codes::DOWNLOAD_EXHAUSTED,
            Self::InvalidArtifact { .. } => error_codes::INVALID_ARTIFACT,
            Self::UnsupportedFormat(_) => error_codes::UNSUPPORTED_FORMAT,
            Self::NoBundleFound { .. } => error_codes::NO_BUNDLE_FOUND,
            Self::InvalidBundle { .. } => error_codes::INVALID_BUNDLE,
            Self::InstallStage { .. } => error_codes::INSTALL_FAILED,
            Self::ReplaceFailed { .. } => error_codes::REPLACE_FAILED,
            Self::RollbackFailed { .. } => error_codes::ROLLBACK_FAILED,
            Self::RelaunchFailed(_) => error_codes::RELAUNCH_FAILED,
            Self::Busy { .. } => error_codes::BUSY,
            Self::InvalidState { .. } => error_codes::INVALID_STATE,
            Self::NoPendingUpdate => error_codes::NO_PENDING_UPDATE,
            Self::Cancelled(_) => error_codes::CANCELLED,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::State(_) => error_codes::STATE_ERROR,
            Self::Io(_) => error_codes::IO_ERROR,
        }
    }

    /// Returns `true` for failures that end an operation (as opposed to a
    /// request rejected up front because of the session state).
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::Busy { .. } | Self::InvalidState { .. } | Self::NoPendingUpdate
        )
    }

    /// Returns `true` when the live installation may be missing or damaged
    /// and the user must reinstall by hand.
    pub fn requires_manual_reinstall(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// User-facing message, with the manual-download fallback appended for
    /// terminal failures when a release page is known.
    pub fn user_message(&self, release_page: Option<&str>) -> String {
        let mut message = match self {
            Self::RollbackFailed { backup, .. } => {
                let backup_hint = backup
                    .as_ref()
                    .map(|b| {
                        format!(" A copy of the previous version may remain at {}.", b.display())
                    })
                    .unwrap_or_default();
                format!(
                    "The update failed and the application could not be restored. \
                     Please reinstall it manually.{backup_hint} ({self})"
                )
            }
            Self::Busy { .. } => "An update is already in progress.".to_owned(),
            Self::Cancelled(_) => "The update was cancelled.".to_owned(),
            other => format!("The update could not be completed: {other}"),
        };
        if self.is_terminal() && !matches!(self, Self::Cancelled(_)) {
            if let Some(page) = release_page {
                message.push_str(&format!(
                    " You can download and install the latest release manually from {page}"
                ));
            }
        }
        message
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
