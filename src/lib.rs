//! Updraft: self-update engine for desktop applications.
//!
//! Finds the latest release on a GitHub-style release index, downloads the
//! artifact for the running platform with redirect and format fallback,
//! and replaces the installed application in place with rollback on
//! failure, then hands off to a detached helper that relaunches it.
//!
//! # Architecture
//!
//! - **Release resolution**: [`update::release`] fetches and parses the
//!   manifest, compares versions and picks the platform asset
//! - **Download**: [`update::download`] streams candidates in order into a
//!   temp file that is renamed into place only when complete
//! - **Install**: [`update::install`] runs the staged pipeline
//!   (open, validate, quiesce, backup, replace, repair, touch, close,
//!   relaunch)
//! - **Coordination**: [`update::coordinator`] owns the session state
//!   machine, the durable pending-update record and the event stream

pub mod app_dirs;
pub mod config;
pub mod error;
pub mod progress;
pub mod update;

pub use config::UpdaterConfig;
pub use error::{Result, UpdateError};
pub use progress::ProgressCallback;
pub use update::{SessionState, UpdateAvailability, UpdateCoordinator, UpdateEvent};
