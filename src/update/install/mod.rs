//! Installation pipeline: unpack, back up, replace, repair, relaunch.
//!
//! Stages run strictly in order and none is retried. Stages 1–4 never touch
//! the live install, so failing there is safe. From stage 5 on the old
//! install is gone; any failure in stages 5–6 restores the backup taken in
//! stage 4 before the error is returned. Cancellation is honoured up to the
//! start of stage 5; after that the install runs to completion and a
//! pending cancellation only suppresses the relaunch.

pub mod bundle;
pub mod container;
pub mod fsops;
pub mod relaunch;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, InstallConfig};
use crate::error::{Result, UpdateError};
use crate::update::platform::Platform;

pub use bundle::BundleLayout;
pub use container::validate_artifact;
pub use relaunch::RelaunchHandle;

/// Archive flavours handled by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

/// How an artifact is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// Extracted into a work directory.
    Archive(ArchiveKind),
    /// Mounted at a temporary mount point (macOS `.dmg`).
    DiskImage,
}

impl ArtifactFormat {
    /// Detect the format from a file name's extension.
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Archive(ArchiveKind::Zip))
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::Archive(ArchiveKind::TarGz))
        } else if lower.ends_with(".dmg") {
            Some(Self::DiskImage)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Archive(ArchiveKind::Zip) => write!(f, "zip archive"),
            Self::Archive(ArchiveKind::TarGz) => write!(f, "tar.gz archive"),
            Self::DiskImage => write!(f, "disk image"),
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallStage {
    OpenContainer,
    ValidateBundle,
    Quiesce,
    Backup,
    Replace,
    RepairPermissions,
    Touch,
    CloseContainer,
    ScheduleRelaunch,
}

impl InstallStage {
    /// Overall progress reported when the stage begins.
    pub fn percent(self) -> u8 {
        match self {
            Self::OpenContainer => 5,
            Self::ValidateBundle => 20,
            Self::Quiesce => 30,
            Self::Backup => 40,
            Self::Replace => 60,
            Self::RepairPermissions => 80,
            Self::Touch => 85,
            Self::CloseContainer => 90,
            Self::ScheduleRelaunch => 100,
        }
    }
}

impl std::fmt::Display for InstallStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::OpenContainer => "open container",
            Self::ValidateBundle => "validate bundle",
            Self::Quiesce => "quiesce running instances",
            Self::Backup => "backup",
            Self::Replace => "remove and replace",
            Self::RepairPermissions => "repair permissions",
            Self::Touch => "touch",
            Self::CloseContainer => "close container",
            Self::ScheduleRelaunch => "schedule relaunch",
        };
        f.write_str(name)
    }
}

/// Everything the engine needs to install one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationPlan {
    pub artifact_path: PathBuf,
    pub target_app_path: PathBuf,
    /// Only written when something exists at `target_app_path`. Never
    /// deleted by the engine.
    pub backup_path: PathBuf,
    pub work_dir: PathBuf,
    pub format: ArtifactFormat,
}

impl InstallationPlan {
    /// Build a plan, detecting the format from the artifact name and
    /// choosing a backup path next to the target that does not exist yet.
    ///
    /// # Errors
    ///
    /// [`UpdateError::UnsupportedFormat`] for unrecognised artifacts and
    /// [`UpdateError::Config`] for a target without a file name.
    pub fn new(
        artifact_path: PathBuf,
        target_app_path: PathBuf,
        work_root: &Path,
        backup_suffix: &str,
    ) -> Result<Self> {
        let artifact_name = artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let format = ArtifactFormat::from_filename(&artifact_name).ok_or_else(|| {
            UpdateError::UnsupportedFormat(format!("unrecognised artifact {artifact_name:?}"))
        })?;

        let target_name = target_app_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UpdateError::Config(format!(
                    "install path {} has no file name",
                    target_app_path.display()
                ))
            })?;
        let mut backup_path =
            target_app_path.with_file_name(format!("{target_name}{backup_suffix}"));
        if backup_path.exists() {
            let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
            backup_path =
                target_app_path.with_file_name(format!("{target_name}{backup_suffix}-{stamp}"));
        }

        let work_dir = work_root.join(format!("install-{}", uuid::Uuid::new_v4().simple()));

        Ok(Self {
            artifact_path,
            target_app_path,
            backup_path,
            work_dir,
            format,
        })
    }
}

/// Non-fatal problems collected during an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallWarning {
    /// No backup was taken; rollback was not available.
    BackupFailed(String),
    QuiesceFailed(String),
    QuarantineNotCleared(String),
    TouchFailed(String),
    ContainerCleanup(String),
}

impl std::fmt::Display for InstallWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackupFailed(m) => write!(f, "backup failed, rollback unavailable: {m}"),
            Self::QuiesceFailed(m) => write!(f, "could not stop other instances: {m}"),
            Self::QuarantineNotCleared(m) => write!(f, "quarantine attribute not cleared: {m}"),
            Self::TouchFailed(m) => write!(f, "modification time not updated: {m}"),
            Self::ContainerCleanup(m) => write!(f, "cleanup incomplete: {m}"),
        }
    }
}

/// What happened at the relaunch stage.
#[derive(Debug, Clone)]
pub enum RelaunchOutcome {
    Scheduled(RelaunchHandle),
    /// Relaunch turned off in configuration.
    Disabled,
    /// A cancellation arrived during the non-cancellable stages.
    SkippedAfterCancel,
    /// The helper could not be started; the user must launch the app.
    Failed(String),
}

/// Result of a completed install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub installed_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub warnings: Vec<InstallWarning>,
    pub relaunch: RelaunchOutcome,
}

/// Observer callback: `(stage, percent)`.
pub type StatusCallback<'a> = dyn FnMut(InstallStage, u8) + Send + 'a;

/// Copies the new bundle into place during stage 5.
pub type CopyFn = fn(&Path, &Path) -> io::Result<()>;

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub quiesce_other_instances: bool,
    pub quiesce_grace: Duration,
    pub relaunch: bool,
    pub relaunch_delay: Duration,
}

impl From<&InstallConfig> for EngineOptions {
    fn from(config: &InstallConfig) -> Self {
        Self {
            quiesce_other_instances: config.quiesce_other_instances,
            quiesce_grace: Duration::from_secs(3),
            relaunch: config.relaunch,
            relaunch_delay: Duration::from_secs(config.relaunch_delay_secs),
        }
    }
}

/// Platform-aware installer.
#[derive(Debug, Clone)]
pub struct InstallationEngine {
    platform: Platform,
    layout: BundleLayout,
    app_name: String,
    options: EngineOptions,
    copier: CopyFn,
}

impl InstallationEngine {
    pub fn new(app: &AppConfig, install: &InstallConfig, platform: Platform) -> Self {
        Self {
            layout: BundleLayout::new(app, &platform),
            platform,
            app_name: app.name.clone(),
            options: EngineOptions::from(install),
            copier: fsops::copy_tree,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the stage-5 copy routine (fault injection in tests).
    pub fn with_copier(mut self, copier: CopyFn) -> Self {
        self.copier = copier;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Run the full pipeline for `plan`.
    ///
    /// # Errors
    ///
    /// Stages 1–4: [`UpdateError::NoBundleFound`],
    /// [`UpdateError::InvalidBundle`], [`UpdateError::InstallStage`],
    /// [`UpdateError::UnsupportedFormat`] or [`UpdateError::Cancelled`],
    /// with the live install untouched. Stages 5–6:
    /// [`UpdateError::ReplaceFailed`] after a successful rollback, or
    /// [`UpdateError::RollbackFailed`] when the previous version could not
    /// be restored.
    pub async fn install(
        &self,
        plan: &InstallationPlan,
        on_status: &mut StatusCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<InstallReport> {
        tracing::info!(
            artifact = %plan.artifact_path.display(),
            target = %plan.target_app_path.display(),
            format = %plan.format,
            "starting install"
        );

        check_cancelled(cancel, InstallStage::OpenContainer)?;
        report(on_status, InstallStage::OpenContainer);
        let opened = container::open(plan, &self.platform).await?;

        let mut warnings = Vec::new();
        let outcome = self
            .run_stages(plan, opened.root(), on_status, cancel, &mut warnings)
            .await;

        report(on_status, InstallStage::CloseContainer);
        warnings.extend(
            opened
                .close()
                .await
                .into_iter()
                .map(InstallWarning::ContainerCleanup),
        );

        let backup_path = outcome?;

        let relaunch = if !self.options.relaunch {
            RelaunchOutcome::Disabled
        } else if cancel.is_cancelled() {
            tracing::warn!("cancellation requested during install; relaunch skipped");
            RelaunchOutcome::SkippedAfterCancel
        } else {
            report(on_status, InstallStage::ScheduleRelaunch);
            let executable = self.layout.executable_path(&plan.target_app_path);
            match relaunch::schedule(
                &plan.target_app_path,
                &executable,
                &self.app_name,
                &self.platform,
                self.options.relaunch_delay,
            ) {
                Ok(handle) => RelaunchOutcome::Scheduled(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "relaunch could not be scheduled");
                    RelaunchOutcome::Failed(e.to_string())
                }
            }
        };

        for warning in &warnings {
            tracing::warn!(%warning, "install warning");
        }
        tracing::info!(target = %plan.target_app_path.display(), "install complete");

        Ok(InstallReport {
            installed_path: plan.target_app_path.clone(),
            backup_path,
            warnings,
            relaunch,
        })
    }

    /// Stages 1 (locate) through 7. Returns the backup path, if one was
    /// taken.
    async fn run_stages(
        &self,
        plan: &InstallationPlan,
        root: &Path,
        on_status: &mut StatusCallback<'_>,
        cancel: &CancellationToken,
        warnings: &mut Vec<InstallWarning>,
    ) -> Result<Option<PathBuf>> {
        let layout = self.layout.clone();
        let search_root = root.to_owned();
        let bundle =
            blocking(InstallStage::OpenContainer, move || layout.find(&search_root)).await??;
        tracing::debug!(bundle = %bundle.display(), "bundle located");

        check_cancelled(cancel, InstallStage::ValidateBundle)?;
        report(on_status, InstallStage::ValidateBundle);
        let layout = self.layout.clone();
        let candidate = bundle.clone();
        blocking(InstallStage::ValidateBundle, move || layout.validate(&candidate)).await??;

        check_cancelled(cancel, InstallStage::Quiesce)?;
        report(on_status, InstallStage::Quiesce);
        if self.options.quiesce_other_instances {
            match fsops::quiesce_other_instances(
                &self.layout.executable_name,
                self.options.quiesce_grace,
            )
            .await
            {
                Ok(count) => tracing::info!(count, "asked other instances to exit"),
                Err(e) => warnings.push(InstallWarning::QuiesceFailed(e)),
            }
        }

        check_cancelled(cancel, InstallStage::Backup)?;
        report(on_status, InstallStage::Backup);
        let target = plan.target_app_path.clone();
        let prior_install = tokio::fs::symlink_metadata(&target).await.is_ok();
        let backup = if prior_install {
            let (from, to) = (target.clone(), plan.backup_path.clone());
            let copied = blocking(InstallStage::Backup, move || fsops::copy_tree(&from, &to))
                .await
                .and_then(|r| r.map_err(UpdateError::from));
            match copied {
                Ok(()) => {
                    tracing::info!(
                        backup = %plan.backup_path.display(),
                        "previous version backed up"
                    );
                    Some(plan.backup_path.clone())
                }
                Err(e) => {
                    tracing::warn!(error = %e, "backup failed; continuing without rollback");
                    let _ = fsops::remove_path(&plan.backup_path);
                    warnings.push(InstallWarning::BackupFailed(e.to_string()));
                    None
                }
            }
        } else {
            tracing::info!(target = %target.display(), "no previous install; skipping backup");
            None
        };

        // Last cancellation point. Stages 5-7 always run to completion.
        check_cancelled(cancel, InstallStage::Replace)?;

        report(on_status, InstallStage::Replace);
        let copier = self.copier;
        let (source, dest) = (bundle.clone(), target.clone());
        let replaced = blocking(InstallStage::Replace, move || {
            fsops::replace_path(&source, &dest, copier)
        })
        .await
        .map_err(|e| e.to_string())
        .and_then(|r| r);
        if let Err(reason) = replaced {
            return Err(self
                .rollback(InstallStage::Replace, reason, &target, prior_install, backup.as_deref())
                .await);
        }

        report(on_status, InstallStage::RepairPermissions);
        let executable = self.layout.executable_path(&target);
        let dest = target.clone();
        let repaired = blocking(InstallStage::RepairPermissions, move || {
            fsops::normalize_permissions(&dest, &executable)
        })
        .await
        .map_err(|e| e.to_string())
        .and_then(|r| r.map_err(|e| e.to_string()));
        if let Err(reason) = repaired {
            return Err(self
                .rollback(
                    InstallStage::RepairPermissions,
                    format!("cannot normalize permissions: {reason}"),
                    &target,
                    prior_install,
                    backup.as_deref(),
                )
                .await);
        }
        if let Err(e) = fsops::clear_quarantine(&target).await {
            warnings.push(InstallWarning::QuarantineNotCleared(e));
        }

        report(on_status, InstallStage::Touch);
        let dest = target.clone();
        match blocking(InstallStage::Touch, move || fsops::touch(&dest)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warnings.push(InstallWarning::TouchFailed(e.to_string())),
            Err(e) => warnings.push(InstallWarning::TouchFailed(e.to_string())),
        }

        // Files still held by the running process stay until the next update.
        let _ = fsops::remove_path(&fsops::parking_dir(&target));

        Ok(backup)
    }

    /// Put the previous version back after a failure in stage 5 or later.
    async fn rollback(
        &self,
        stage: InstallStage,
        reason: String,
        target: &Path,
        prior_install: bool,
        backup: Option<&Path>,
    ) -> UpdateError {
        tracing::error!(%stage, %reason, "install failed after removal; rolling back");

        match backup {
            Some(backup) => {
                let (from, to) = (backup.to_owned(), target.to_owned());
                let restored = blocking(stage, move || fsops::restore_from_backup(&from, &to))
                    .await
                    .and_then(|r| r.map_err(UpdateError::from));
                match restored {
                    Ok(()) => {
                        tracing::info!(target = %target.display(), "previous version restored");
                        UpdateError::ReplaceFailed { stage, reason }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "rollback failed");
                        UpdateError::RollbackFailed {
                            stage,
                            reason,
                            rollback_error: e.to_string(),
                            backup: Some(backup.to_owned()),
                        }
                    }
                }
            }
            None if !prior_install => {
                // Nothing was installed before; leave nothing behind.
                if let Err(e) = fsops::remove_path(target) {
                    tracing::warn!(error = %e, "cannot remove partial install");
                }
                UpdateError::ReplaceFailed { stage, reason }
            }
            None => UpdateError::RollbackFailed {
                stage,
                reason,
                rollback_error: "no backup of the previous version was taken".to_owned(),
                backup: None,
            },
        }
    }
}

fn report(on_status: &mut StatusCallback<'_>, stage: InstallStage) {
    tracing::debug!(%stage, "install stage");
    on_status(stage, stage.percent());
}

fn check_cancelled(cancel: &CancellationToken, next: InstallStage) -> Result<()> {
    if cancel.is_cancelled() {
        tracing::info!(stage = %next, "install cancelled");
        return Err(UpdateError::Cancelled(format!("install cancelled before {next}")));
    }
    Ok(())
}

async fn blocking<T, F>(stage: InstallStage, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UpdateError::InstallStage {
            stage,
            reason: format!("worker task failed: {e}"),
        })
}
