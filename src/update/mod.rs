//! Self-update engine.
//!
//! [`UpdateCoordinator`] drives three components: [`ReleaseResolver`] asks
//! the release index what the latest release is, [`ArtifactDownloader`]
//! fetches the artifact for this platform, and [`InstallationEngine`]
//! swaps it into place and schedules a relaunch. Only the pending-update
//! record survives a restart.

pub mod coordinator;
pub mod download;
pub mod events;
pub mod install;
pub mod platform;
pub mod release;
pub mod session;
pub mod state;
pub mod version;

pub use coordinator::{UpdateCoordinator, download_candidates};
pub use download::{ArtifactDownloader, DownloadCandidate, DownloadedArtifact};
pub use events::UpdateEvent;
pub use install::{
    ArtifactFormat, InstallReport, InstallStage, InstallWarning, InstallationEngine,
    InstallationPlan, RelaunchOutcome,
};
pub use platform::{Os, Platform};
pub use release::{
    AssetRef, AssetSelection, AvailableUpdate, ReleaseManifest, ReleaseResolver,
    UpdateAvailability,
};
pub use session::SessionState;
pub use state::{PendingUpdate, PendingUpdateStore};
