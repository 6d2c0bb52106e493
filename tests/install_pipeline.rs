//! Installation pipeline tests.
//!
//! Each test builds a real artifact (tar.gz or zip) in a temp directory and
//! runs the full pipeline against a fake install location. Quiescing is off
//! and relaunch is off unless a test is about relaunch.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use updraft::UpdateError;
use updraft::config::{AppConfig, InstallConfig};
use updraft::update::install::EngineOptions;
use updraft::update::{
    InstallStage, InstallWarning, InstallationEngine, InstallationPlan, Platform,
    RelaunchOutcome,
};

// ────────────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────────────

fn write_tar_gz(path: &Path, entries: &[(&str, &[u8], u32)]) {
    let file = File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

fn engine(platform: Platform, relaunch: bool) -> InstallationEngine {
    let app = AppConfig {
        name: "App".to_owned(),
        executable_name: "app".to_owned(),
        ..AppConfig::default()
    };
    InstallationEngine::new(&app, &InstallConfig::default(), platform).with_options(
        EngineOptions {
            quiesce_other_instances: false,
            quiesce_grace: Duration::from_millis(10),
            relaunch,
            relaunch_delay: Duration::from_secs(1),
        },
    )
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    target: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("apps")).unwrap();
        Self {
            target: root.join("apps").join("App"),
            root,
            _dir: dir,
        }
    }

    /// An existing install with the old executable and a file only the old
    /// version ships.
    fn with_previous_install(self) -> Self {
        std::fs::create_dir_all(&self.target).unwrap();
        std::fs::write(self.target.join("app"), b"old").unwrap();
        std::fs::write(self.target.join("old-only.txt"), b"legacy").unwrap();
        self
    }

    fn linux_tarball(&self) -> PathBuf {
        let artifact = self.root.join("App-2.0.0-linux.tar.gz");
        write_tar_gz(
            &artifact,
            &[
                ("App-2.0.0/app", b"new", 0o755),
                ("App-2.0.0/lib/data.txt", b"payload", 0o600),
            ],
        );
        artifact
    }

    fn plan(&self, artifact: PathBuf) -> InstallationPlan {
        InstallationPlan::new(artifact, self.target.clone(), &self.root.join("work"), ".backup")
            .unwrap()
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn fail_midway(_source: &Path, target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;
    std::fs::write(target.join("partial"), b"half")?;
    Err(io::Error::other("disk full"))
}

/// Fails like [`fail_midway`] after destroying the backup taken in stage 4.
fn fail_and_lose_backup(source: &Path, target: &Path) -> io::Result<()> {
    let name = target.file_name().unwrap().to_string_lossy();
    std::fs::remove_dir_all(target.with_file_name(format!("{name}.backup")))?;
    fail_midway(source, target)
}

/// Points the backup beneath a regular file so stage 4 cannot create it.
fn unwritable_backup(fx: &Fixture, plan: &mut InstallationPlan) {
    let blocker = fx.root.join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    plan.backup_path = blocker.join("App.backup");
}

// ────────────────────────────────────────────────────────────────────────────
// Successful installs
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tarball_replaces_previous_install_and_keeps_backup() {
    let fx = Fixture::new().with_previous_install();
    let plan = fx.plan(fx.linux_tarball());

    let mut stages = Vec::new();
    let mut on_status = |stage: InstallStage, percent: u8| stages.push((stage, percent));
    let report = engine(Platform::linux("x64"), false)
        .install(&plan, &mut on_status, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read(&fx.target.join("app")), "new");
    assert_eq!(read(&fx.target.join("lib/data.txt")), "payload");
    assert!(!fx.target.join("old-only.txt").exists());

    let backup = report.backup_path.clone().unwrap();
    assert_eq!(backup, fx.root.join("apps/App.backup"));
    assert_eq!(read(&backup.join("app")), "old");
    assert_eq!(read(&backup.join("old-only.txt")), "legacy");

    // xattr may complain on macOS hosts; nothing else should.
    assert!(
        report
            .warnings
            .iter()
            .all(|w| matches!(w, InstallWarning::QuarantineNotCleared(_))),
        "{:?}",
        report.warnings
    );
    assert!(matches!(report.relaunch, RelaunchOutcome::Disabled));
    assert!(!plan.work_dir.exists(), "work directory cleaned up");
    assert!(!fx.root.join("apps/App.updraft-old").exists());

    let order: Vec<InstallStage> = stages.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        order,
        vec![
            InstallStage::OpenContainer,
            InstallStage::ValidateBundle,
            InstallStage::Quiesce,
            InstallStage::Backup,
            InstallStage::Replace,
            InstallStage::RepairPermissions,
            InstallStage::Touch,
            InstallStage::CloseContainer,
        ]
    );
    assert!(stages.windows(2).all(|w| w[0].1 < w[1].1));
}

#[cfg(unix)]
#[tokio::test]
async fn permissions_are_normalized() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    let artifact = fx.root.join("App-2.0.0-linux.tar.gz");
    write_tar_gz(
        &artifact,
        &[
            ("App/app", b"new", 0o600),
            ("App/README", b"docs", 0o600),
        ],
    );
    let plan = fx.plan(artifact);
    engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap();

    let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode(&fx.target.join("app")) & 0o755, 0o755);
    assert_eq!(mode(&fx.target.join("README")) & 0o644, 0o644);
    assert_eq!(mode(&fx.target) & 0o755, 0o755);
}

#[tokio::test]
async fn first_install_takes_no_backup() {
    let fx = Fixture::new();
    let plan = fx.plan(fx.linux_tarball());

    let report = engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read(&fx.target.join("app")), "new");
    assert!(report.backup_path.is_none());
    assert!(!plan.backup_path.exists());
}

#[tokio::test]
async fn zip_with_executable_at_root() {
    let fx = Fixture::new().with_previous_install();
    let artifact = fx.root.join("App-2.0.0-linux.zip");
    write_zip(&artifact, &[("app", b"new"), ("share/icon.png", b"png")]);
    let plan = fx.plan(artifact);

    engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read(&fx.target.join("app")), "new");
    assert_eq!(read(&fx.target.join("share/icon.png")), "png");
}

#[tokio::test]
async fn mac_bundle_from_zip() {
    let fx = Fixture::new();
    let target = fx.root.join("apps/App.app");
    let artifact = fx.root.join("App-2.0.0-mac.zip");
    write_zip(
        &artifact,
        &[
            ("__MACOSX/App.app/Contents/MacOS/app", b"resource fork"),
            ("App.app/Contents/Info.plist", b"<plist/>"),
            ("App.app/Contents/MacOS/app", b"new"),
        ],
    );
    let plan =
        InstallationPlan::new(artifact, target.clone(), &fx.root.join("work"), ".backup").unwrap();

    engine(Platform::macos("arm64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read(&target.join("Contents/MacOS/app")), "new");
    assert!(target.join("Contents/Info.plist").is_file());
}

#[tokio::test]
async fn existing_backup_is_never_overwritten() {
    let fx = Fixture::new().with_previous_install();
    let stale = fx.root.join("apps/App.backup");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("app"), b"ancient").unwrap();

    let plan = fx.plan(fx.linux_tarball());
    let report = engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read(&stale.join("app")), "ancient");
    let backup = report.backup_path.unwrap();
    assert_ne!(backup, stale);
    assert_eq!(read(&backup.join("app")), "old");
}

// ────────────────────────────────────────────────────────────────────────────
// Failures before the live install is touched
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn archive_without_bundle_leaves_install_untouched() {
    let fx = Fixture::new().with_previous_install();
    let artifact = fx.root.join("App-2.0.0-linux.tar.gz");
    write_tar_gz(&artifact, &[("docs/README", b"nothing to see", 0o644)]);
    let plan = fx.plan(artifact);

    let err = engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::NoBundleFound { .. }), "{err}");
    assert_eq!(read(&fx.target.join("app")), "old");
    assert!(fx.target.join("old-only.txt").exists());
    assert!(!plan.backup_path.exists());
    assert!(!plan.work_dir.exists());
}

#[tokio::test]
async fn incomplete_mac_bundle_is_rejected() {
    let fx = Fixture::new();
    let target = fx.root.join("apps/App.app");
    std::fs::create_dir_all(target.join("Contents/MacOS")).unwrap();
    std::fs::write(target.join("Contents/MacOS/app"), b"old").unwrap();

    let artifact = fx.root.join("App-2.0.0-mac.zip");
    write_zip(&artifact, &[("App.app/Contents/Info.plist", b"<plist/>")]);
    let plan =
        InstallationPlan::new(artifact, target.clone(), &fx.root.join("work"), ".backup").unwrap();

    let err = engine(Platform::macos("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::InvalidBundle { .. }), "{err}");
    assert_eq!(read(&target.join("Contents/MacOS/app")), "old");
}

#[tokio::test]
async fn disk_image_is_unsupported_off_macos() {
    let fx = Fixture::new();
    let artifact = fx.root.join("App-2.0.0.dmg");
    std::fs::write(&artifact, vec![0u8; 1024]).unwrap();
    let plan = fx.plan(artifact);

    let err = engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::UnsupportedFormat(_)), "{err}");
}

#[tokio::test]
async fn corrupt_archive_fails_at_open() {
    let fx = Fixture::new().with_previous_install();
    let artifact = fx.root.join("App-2.0.0-linux.zip");
    std::fs::write(&artifact, b"definitely not a zip").unwrap();
    let plan = fx.plan(artifact);

    let err = engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            UpdateError::InstallStage {
                stage: InstallStage::OpenContainer,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(read(&fx.target.join("app")), "old");
    assert!(!plan.work_dir.exists());
}

// ────────────────────────────────────────────────────────────────────────────
// Rollback
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_copy_restores_previous_version() {
    let fx = Fixture::new().with_previous_install();
    let plan = fx.plan(fx.linux_tarball());

    let err = engine(Platform::linux("x64"), false)
        .with_copier(fail_midway)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            UpdateError::ReplaceFailed {
                stage: InstallStage::Replace,
                ..
            }
        ),
        "{err}"
    );
    assert!(!err.requires_manual_reinstall());
    assert_eq!(read(&fx.target.join("app")), "old");
    assert_eq!(read(&fx.target.join("old-only.txt")), "legacy");
    assert!(!fx.target.join("partial").exists());
    // The backup stays for the user to clean up.
    assert!(plan.backup_path.join("app").exists());
    assert!(!plan.work_dir.exists());
}

#[tokio::test]
async fn failed_first_install_leaves_nothing_behind() {
    let fx = Fixture::new();
    let plan = fx.plan(fx.linux_tarball());

    let err = engine(Platform::linux("x64"), false)
        .with_copier(fail_midway)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::ReplaceFailed { .. }), "{err}");
    assert!(!fx.target.exists());
}

#[tokio::test]
async fn failed_backup_is_a_warning_when_replace_succeeds() {
    let fx = Fixture::new().with_previous_install();
    let mut plan = fx.plan(fx.linux_tarball());
    unwritable_backup(&fx, &mut plan);

    let report = engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.backup_path.is_none());
    assert!(
        report
            .warnings
            .iter()
            .any(|w| matches!(w, InstallWarning::BackupFailed(_))),
        "{:?}",
        report.warnings
    );
    assert_eq!(read(&fx.target.join("app")), "new");
}

#[tokio::test]
async fn failed_copy_without_backup_needs_manual_reinstall() {
    let fx = Fixture::new().with_previous_install();
    let mut plan = fx.plan(fx.linux_tarball());
    unwritable_backup(&fx, &mut plan);

    let err = engine(Platform::linux("x64"), false)
        .with_copier(fail_midway)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "ROLLBACK_FAILED");
    assert!(err.requires_manual_reinstall());
    assert!(
        matches!(
            err,
            UpdateError::RollbackFailed {
                stage: InstallStage::Replace,
                backup: None,
                ..
            }
        ),
        "{err}"
    );
}

#[tokio::test]
async fn failed_restore_reports_rollback_failure_with_backup() {
    let fx = Fixture::new().with_previous_install();
    let plan = fx.plan(fx.linux_tarball());

    let err = engine(Platform::linux("x64"), false)
        .with_copier(fail_and_lose_backup)
        .install(&plan, &mut |_, _| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "ROLLBACK_FAILED");
    assert!(err.requires_manual_reinstall());
    match err {
        UpdateError::RollbackFailed { backup, .. } => {
            assert_eq!(backup, Some(plan.backup_path.clone()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Cancellation
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let fx = Fixture::new().with_previous_install();
    let plan = fx.plan(fx.linux_tarball());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine(Platform::linux("x64"), false)
        .install(&plan, &mut |_, _| {}, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::Cancelled(_)));
    assert!(!plan.work_dir.exists());
    assert_eq!(read(&fx.target.join("app")), "old");
}

#[tokio::test]
async fn cancel_during_backup_stops_before_replace() {
    let fx = Fixture::new().with_previous_install();
    let plan = fx.plan(fx.linux_tarball());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut on_status = move |stage: InstallStage, _: u8| {
        if stage == InstallStage::Backup {
            trigger.cancel();
        }
    };

    let err = engine(Platform::linux("x64"), false)
        .install(&plan, &mut on_status, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::Cancelled(_)), "{err}");
    assert_eq!(read(&fx.target.join("app")), "old");
    assert!(!plan.work_dir.exists());
}

#[tokio::test]
async fn cancel_during_replace_completes_install_without_relaunch() {
    let fx = Fixture::new().with_previous_install();
    let plan = fx.plan(fx.linux_tarball());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut on_status = move |stage: InstallStage, _: u8| {
        if stage == InstallStage::Replace {
            trigger.cancel();
        }
    };

    let report = engine(Platform::linux("x64"), true)
        .install(&plan, &mut on_status, &cancel)
        .await
        .unwrap();

    assert_eq!(read(&fx.target.join("app")), "new");
    assert!(matches!(report.relaunch, RelaunchOutcome::SkippedAfterCancel));
}
