//! Update coordinator: check, download, install, relaunch.
//!
//! Owns the session state machine, the durable pending-update record and
//! the event channel. Every public operation is async, takes a
//! [`CancellationToken`], and is mutually exclusive with the others; a call
//! made while another is in flight fails with [`UpdateError::Busy`]. The
//! session mutex is never held across an `.await`.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::progress;
use crate::update::download::{ArtifactDownloader, DownloadCandidate};
use crate::update::events::UpdateEvent;
use crate::update::install::bundle::derive_install_path;
use crate::update::install::{
    InstallReport, InstallStage, InstallationEngine, InstallationPlan, RelaunchOutcome,
    validate_artifact,
};
use crate::update::platform::Platform;
use crate::update::release::{
    AssetSelection, AvailableUpdate, ReleaseResolver, UpdateAvailability, evaluate,
};
use crate::update::session::SessionState;
use crate::update::state::{PendingUpdate, PendingUpdateStore};

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Drives one update session at a time.
pub struct UpdateCoordinator {
    config: UpdaterConfig,
    platform: Platform,
    resolver: ReleaseResolver,
    downloader: ArtifactDownloader,
    engine: InstallationEngine,
    store: PendingUpdateStore,
    session: Mutex<SessionState>,
    /// Release page from the most recent manifest, for error messages.
    release_page: Mutex<Option<String>>,
    events: broadcast::Sender<UpdateEvent>,
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("platform", &self.platform)
            .field("state", &self.status().name())
            .field("store", &self.store.path())
            .finish_non_exhaustive()
    }
}

impl UpdateCoordinator {
    /// Coordinator for the running platform.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Config`] for invalid configuration or an unsupported
    /// platform.
    pub fn new(config: UpdaterConfig) -> Result<Self> {
        let platform = Platform::current().ok_or_else(|| {
            UpdateError::Config(format!(
                "self-update is not supported on {}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
        })?;
        Self::with_platform(config, platform)
    }

    /// Coordinator for an explicit platform.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Config`] for invalid configuration.
    pub fn with_platform(config: UpdaterConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        let resolver = ReleaseResolver::new(&config.release)?;
        let downloader = ArtifactDownloader::new(&config.download, &config.release.user_agent)?;
        let engine = InstallationEngine::new(&config.app, &config.install, platform);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            release_page: Mutex::new(config.release.release_page.clone()),
            config,
            platform,
            resolver,
            downloader,
            engine,
            store: PendingUpdateStore::default_location(),
            session: Mutex::new(SessionState::Idle),
            events,
        })
    }

    /// Keep the pending-update record somewhere else.
    pub fn with_state_store(mut self, store: PendingUpdateStore) -> Self {
        self.store = store;
        self
    }

    /// Replace the installation engine.
    pub fn with_engine(mut self, engine: InstallationEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Snapshot of the session state.
    pub fn status(&self) -> SessionState {
        lock(&self.session).clone()
    }

    /// New receiver for the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// The durable pending-update record, if any.
    ///
    /// # Errors
    ///
    /// [`UpdateError::State`] if the record cannot be read.
    pub fn pending_update(&self) -> Result<Option<PendingUpdate>> {
        self.store.load()
    }

    /// Ask the release index for the latest release.
    ///
    /// Never starts a download. Settled states (`NoUpdate`,
    /// `UpdateAvailable`, `Failed`) are reset implicitly.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] while another operation runs; otherwise the
    /// resolver's errors, including [`UpdateError::NoCompatibleAsset`]
    /// when a release exists but nothing matches this platform.
    pub async fn check(&self, cancel: &CancellationToken) -> Result<UpdateAvailability> {
        lock(&self.session).begin_check()?;
        let flight = Flight::new(&self.session);
        self.emit(UpdateEvent::Checking);
        tracing::info!(
            current = %self.config.app.current_version,
            platform = %self.platform,
            "checking for updates"
        );

        let result = match self.resolver.fetch_latest(cancel).await {
            Ok(manifest) => {
                if let Some(page) = &manifest.release_page {
                    *lock(&self.release_page) = Some(page.clone());
                }
                evaluate(manifest, &self.config.app.current_version, &self.platform)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(UpdateAvailability::NoUpdate { current_version }) => {
                tracing::info!(version = %current_version, "already up to date");
                flight.settle(SessionState::NoUpdate {
                    current_version: current_version.clone(),
                });
                self.emit(UpdateEvent::NotAvailable);
                Ok(UpdateAvailability::NoUpdate { current_version })
            }
            Ok(UpdateAvailability::Available(update)) => {
                tracing::info!(
                    version = %update.version,
                    downgrade = update.is_downgrade,
                    asset = %update.asset.filename,
                    "update available"
                );
                flight.settle(SessionState::UpdateAvailable(Box::new(update.clone())));
                self.emit(UpdateEvent::UpdateAvailable {
                    version: update.version.clone(),
                    is_downgrade: update.is_downgrade,
                    notes: update.notes.clone(),
                });
                Ok(UpdateAvailability::Available(update))
            }
            Err(e) => Err(self.settle_error(flight, e, SessionState::Idle)),
        }
    }

    /// Download the update offered by the last [`check`](Self::check) and
    /// record it durably.
    ///
    /// # Errors
    ///
    /// [`UpdateError::InvalidState`] unless an update is available,
    /// [`UpdateError::DownloadExhausted`] when every candidate fails,
    /// [`UpdateError::Cancelled`] (the update stays available),
    /// [`UpdateError::State`] if the record cannot be written.
    pub async fn download_update(&self, cancel: &CancellationToken) -> Result<PendingUpdate> {
        let update = lock(&self.session).begin_download()?;
        let flight = Flight::new(&self.session);

        let candidates = download_candidates(&update, &self.platform, &self.config.app.name);
        let dest_dir = self.config.download.resolved_download_dir();
        tracing::info!(
            version = %update.version,
            candidates = candidates.len(),
            dest = %dest_dir.display(),
            "downloading update"
        );

        let events = self.events.clone();
        let mut on_progress = move |received: u64, total: Option<u64>| {
            let _ = events.send(UpdateEvent::Downloading {
                percent: progress::percent(received, total),
                bytes_received: received,
            });
        };

        let artifact = match self
            .downloader
            .download(&candidates, &dest_dir, &mut on_progress, cancel)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                return Err(self.settle_error(
                    flight,
                    e,
                    SessionState::UpdateAvailable(Box::new(update)),
                ));
            }
        };

        let pending = PendingUpdate::new(
            artifact.path.clone(),
            update.version.clone(),
            artifact.candidate.url.clone(),
        );
        let superseded = self.store.load().ok().flatten();
        if let Err(e) = self.store.save(&pending) {
            return Err(self.settle_error(flight, e, SessionState::Idle));
        }
        if let Some(old) = superseded.filter(|old| old.artifact_path != pending.artifact_path) {
            match std::fs::remove_file(&old.artifact_path) {
                Ok(()) => tracing::debug!(
                    path = %old.artifact_path.display(),
                    "removed superseded download"
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %old.artifact_path.display(),
                    error = %e,
                    "cannot remove superseded download"
                ),
            }
        }

        tracing::info!(
            path = %pending.artifact_path.display(),
            bytes = artifact.bytes,
            "update downloaded"
        );
        flight.settle(SessionState::Downloaded(pending.clone()));
        self.emit(UpdateEvent::Downloaded {
            path: pending.artifact_path.clone(),
        });
        Ok(pending)
    }

    /// Install the pending update and schedule the relaunch.
    ///
    /// The pending update comes from the session or, after a restart, from
    /// durable storage. On success the record and the artifact are removed
    /// and the host should exit soon so the relaunch helper can start the
    /// new version. On failure the record is kept so the install can be
    /// retried without downloading again.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NoPendingUpdate`] when nothing was downloaded,
    /// [`UpdateError::InvalidArtifact`] when the recorded file is gone or
    /// damaged (the record is dropped), and the installation engine's
    /// errors.
    pub async fn install_and_relaunch(&self, cancel: &CancellationToken) -> Result<InstallReport> {
        let in_memory = lock(&self.session).begin_install()?;
        let flight = Flight::new(&self.session);

        let pending = match in_memory {
            Some(pending) => pending,
            None => match self.store.load() {
                Ok(Some(pending)) => pending,
                Ok(None) => {
                    return Err(self.settle_error(
                        flight,
                        UpdateError::NoPendingUpdate,
                        SessionState::Idle,
                    ));
                }
                Err(e) => return Err(self.settle_error(flight, e, SessionState::Idle)),
            },
        };
        lock(&self.session).set_installing(&pending.target_version);

        let plan = match self.prepare_install(&pending).await {
            Ok(plan) => plan,
            Err(e) => {
                let restore = if matches!(e, UpdateError::InvalidArtifact { .. }) {
                    self.discard_record();
                    SessionState::Idle
                } else {
                    SessionState::Downloaded(pending)
                };
                return Err(self.settle_error(flight, e, restore));
            }
        };

        let events = self.events.clone();
        let mut on_status = move |stage: InstallStage, percent: u8| {
            let _ = events.send(UpdateEvent::Installing { stage, percent });
        };

        let report = match self.engine.install(&plan, &mut on_status, cancel).await {
            Ok(report) => report,
            Err(e) => {
                return Err(self.settle_error(flight, e, SessionState::Downloaded(pending)));
            }
        };

        self.discard_record();
        if let Err(e) = std::fs::remove_file(&pending.artifact_path) {
            tracing::debug!(error = %e, "downloaded artifact not removed");
        }

        let relaunch_scheduled = matches!(report.relaunch, RelaunchOutcome::Scheduled(_));
        if let RelaunchOutcome::Failed(reason) = &report.relaunch {
            tracing::warn!(%reason, "installed, but the application must be started manually");
        }
        tracing::info!(
            version = %pending.target_version,
            warnings = report.warnings.len(),
            relaunch_scheduled,
            "update installed"
        );
        flight.settle(SessionState::RelaunchPending {
            version: pending.target_version.clone(),
        });
        self.emit(UpdateEvent::Installed { relaunch_scheduled });
        Ok(report)
    }

    /// Pick up a download left by a previous process.
    ///
    /// Only acts on an idle session. A record whose artifact is missing or
    /// empty is dropped.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] / [`UpdateError::InvalidState`] when the
    /// session is not idle, [`UpdateError::State`] if the record cannot be
    /// read.
    pub fn recover(&self) -> Result<Option<PendingUpdate>> {
        let mut session = lock(&self.session);
        if !matches!(*session, SessionState::Idle) {
            return Err(if session.is_in_flight() {
                UpdateError::Busy {
                    current: session.name().to_owned(),
                }
            } else {
                UpdateError::InvalidState {
                    operation: "recover",
                    current: session.name().to_owned(),
                }
            });
        }

        let Some(pending) = self.store.load()? else {
            return Ok(None);
        };
        if !pending.artifact_present() {
            tracing::warn!(
                path = %pending.artifact_path.display(),
                "pending update artifact missing or empty; dropping record"
            );
            self.store.clear()?;
            return Ok(None);
        }

        tracing::info!(
            version = %pending.target_version,
            path = %pending.artifact_path.display(),
            "recovered pending update"
        );
        *session = SessionState::Downloaded(pending.clone());
        drop(session);
        self.emit(UpdateEvent::Downloaded {
            path: pending.artifact_path.clone(),
        });
        Ok(Some(pending))
    }

    /// Delete the pending update (record and artifact) and go idle.
    ///
    /// Returns the discarded update, if there was one.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Busy`] while an operation runs,
    /// [`UpdateError::State`] if the record cannot be removed.
    pub fn abandon_pending(&self) -> Result<Option<PendingUpdate>> {
        let mut session = lock(&self.session);
        session.ensure_can_abandon()?;

        let pending = match &*session {
            SessionState::Downloaded(pending) => Some(pending.clone()),
            _ => self.store.load()?,
        };
        if let Some(pending) = &pending {
            match std::fs::remove_file(&pending.artifact_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %pending.artifact_path.display(),
                    error = %e,
                    "cannot remove abandoned artifact"
                ),
            }
            tracing::info!(version = %pending.target_version, "pending update abandoned");
        }
        self.store.clear()?;
        *session = SessionState::Idle;
        Ok(pending)
    }

    /// Return a settled session to `Idle`.
    ///
    /// # Errors
    ///
    /// See [`SessionState::reset`].
    pub fn reset(&self) -> Result<()> {
        lock(&self.session).reset()
    }

    /// Where the update will be installed.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Config`] when `app.install_path` is unset and no safe
    /// location can be derived from the running executable.
    pub fn install_target(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.app.install_path {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        derive_install_path(&exe, &self.config.app, self.platform.os)
    }

    async fn prepare_install(&self, pending: &PendingUpdate) -> Result<InstallationPlan> {
        if !pending.artifact_present() {
            return Err(UpdateError::InvalidArtifact {
                path: pending.artifact_path.clone(),
                reason: "file is missing or empty".to_owned(),
            });
        }

        let target = self.install_target()?;
        let plan = InstallationPlan::new(
            pending.artifact_path.clone(),
            target,
            &self.config.install.resolved_work_dir(),
            &self.config.install.backup_suffix,
        )?;

        let (path, format) = (plan.artifact_path.clone(), plan.format);
        tokio::task::spawn_blocking(move || validate_artifact(&path, format))
            .await
            .map_err(|e| UpdateError::InstallStage {
                stage: InstallStage::OpenContainer,
                reason: format!("validation task failed: {e}"),
            })??;
        Ok(plan)
    }

    fn discard_record(&self) {
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "cannot remove pending-update record");
        }
    }

    /// Log `error`, publish it, and leave the session in the right state:
    /// `restore` for cancellations and "nothing to do" errors, `Failed`
    /// for everything else.
    fn settle_error(
        &self,
        flight: Flight<'_>,
        error: UpdateError,
        restore: SessionState,
    ) -> UpdateError {
        let release_page = lock(&self.release_page).clone();
        let message = error.user_message(release_page.as_deref());

        if error.is_terminal() && !matches!(error, UpdateError::Cancelled(_)) {
            tracing::error!(code = error.code(), error = %error, "update operation failed");
            flight.settle(SessionState::Failed {
                message: message.clone(),
            });
        } else {
            tracing::info!(code = error.code(), error = %error, "update operation stopped");
            flight.settle(restore);
        }
        self.emit(UpdateEvent::Error { message });
        error
    }

    fn emit(&self, event: UpdateEvent) {
        tracing::debug!(%event, "update event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Ordered download candidates for `update`.
///
/// Every installable asset from the manifest comes first, best match
/// first. Then come the conventional artifact names for the platform,
/// resolved against the chosen asset's URL, so a format that was not
/// listed (or whose link is stale) is still tried. Duplicate URLs are
/// dropped.
pub fn download_candidates(
    update: &AvailableUpdate,
    platform: &Platform,
    app_name: &str,
) -> Vec<DownloadCandidate> {
    let mut candidates: Vec<DownloadCandidate> = Vec::new();
    let mut push = |candidate: DownloadCandidate| {
        if !candidates.iter().any(|c| c.url == candidate.url) {
            candidates.push(candidate);
        }
    };

    push(
        DownloadCandidate::new(&update.asset.download_url, &update.asset.filename)
            .with_expected_size(update.asset.size_bytes),
    );
    for asset in AssetSelection::build(&update.manifest, platform).ranked {
        push(
            DownloadCandidate::new(&asset.download_url, &asset.filename)
                .with_expected_size(asset.size_bytes),
        );
    }

    match url::Url::parse(&update.asset.download_url) {
        Ok(base) => {
            for name in platform.artifact_names(app_name, &update.version) {
                match base.join(&name) {
                    Ok(url) => push(DownloadCandidate::new(url.as_str(), name)),
                    Err(e) => tracing::debug!(%name, error = %e, "cannot build fallback URL"),
                }
            }
        }
        Err(e) => tracing::debug!(
            url = %update.asset.download_url,
            error = %e,
            "asset URL not parseable; no synthesized fallbacks"
        ),
    }

    candidates
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the session failed if an in-flight operation is dropped before
/// it settles.
struct Flight<'a> {
    session: &'a Mutex<SessionState>,
    settled: bool,
}

impl<'a> Flight<'a> {
    fn new(session: &'a Mutex<SessionState>) -> Self {
        Self {
            session,
            settled: false,
        }
    }

    fn settle(mut self, next: SessionState) {
        *lock(self.session) = next;
        self.settled = true;
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut session = lock(self.session);
        if session.is_in_flight() {
            tracing::warn!(state = session.name(), "update operation dropped before completion");
            session.fail("operation interrupted");
        }
    }
}
