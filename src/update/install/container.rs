//! Artifact containers: archives extracted into a work directory, or disk
//! images mounted at a private mount point.

use std::io::Read;
use std::path::{Path, PathBuf};

use super::{ArchiveKind, ArtifactFormat, InstallStage, InstallationPlan};
use crate::error::{Result, UpdateError};
use crate::update::platform::Platform;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const UDIF_TRAILER_MAGIC: &[u8; 4] = b"koly";
const UDIF_TRAILER_LEN: u64 = 512;

/// Best-effort structural check of a downloaded artifact.
///
/// # Errors
///
/// Returns [`UpdateError::InvalidArtifact`] if the file is empty or does not
/// look like the claimed format.
pub fn validate_artifact(path: &Path, format: ArtifactFormat) -> Result<()> {
    let invalid = |reason: String| UpdateError::InvalidArtifact {
        path: path.to_owned(),
        reason,
    };

    let len = std::fs::metadata(path)
        .map_err(|e| invalid(format!("cannot stat: {e}")))?
        .len();
    if len == 0 {
        return Err(invalid("file is empty".to_owned()));
    }

    match format {
        ArtifactFormat::Archive(ArchiveKind::Zip) => {
            let file = std::fs::File::open(path)?;
            let archive = zip::ZipArchive::new(file)
                .map_err(|e| invalid(format!("not a zip archive: {e}")))?;
            if archive.len() == 0 {
                return Err(invalid("zip archive has no entries".to_owned()));
            }
        }
        ArtifactFormat::Archive(ArchiveKind::TarGz) => {
            let mut magic = [0u8; 2];
            std::fs::File::open(path)?
                .read_exact(&mut magic)
                .map_err(|e| invalid(format!("cannot read header: {e}")))?;
            if magic != GZIP_MAGIC {
                return Err(invalid("missing gzip header".to_owned()));
            }
        }
        ArtifactFormat::DiskImage => {
            if len < UDIF_TRAILER_LEN {
                return Err(invalid("too small to be a disk image".to_owned()));
            }
            use std::io::{Seek, SeekFrom};
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(len - UDIF_TRAILER_LEN))?;
            let mut magic = [0u8; 4];
            file.read_exact(&mut magic)?;
            if &magic != UDIF_TRAILER_MAGIC {
                return Err(invalid("missing disk image trailer".to_owned()));
            }
        }
    }
    Ok(())
}

/// An opened artifact whose contents are readable under [`root`](Self::root).
#[derive(Debug)]
pub struct OpenedContainer {
    root: PathBuf,
    work_dir: PathBuf,
    mount_point: Option<PathBuf>,
}

impl OpenedContainer {
    /// Directory holding the artifact contents.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unmount and remove the work directory. Never fails; problems are
    /// returned as warning text.
    pub async fn close(self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(mount_point) = &self.mount_point {
            if let Err(e) = detach_disk_image(mount_point).await {
                tracing::warn!(
                    mount = %mount_point.display(),
                    error = %e,
                    "cannot detach disk image"
                );
                warnings.push(format!("disk image left mounted at {}: {e}", mount_point.display()));
                // Removing a live mount point would recurse into the image.
                return warnings;
            }
        }

        match tokio::fs::remove_dir_all(&self.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    dir = %self.work_dir.display(),
                    error = %e,
                    "cannot remove work dir"
                );
                warnings.push(format!("cannot remove {}: {e}", self.work_dir.display()));
            }
        }
        warnings
    }
}

/// Extract or mount the plan's artifact into its work directory.
///
/// # Errors
///
/// [`UpdateError::UnsupportedFormat`] for disk images off macOS, and
/// [`UpdateError::InstallStage`] at [`InstallStage::OpenContainer`] if the
/// artifact cannot be unpacked or mounted.
pub async fn open(plan: &InstallationPlan, platform: &Platform) -> Result<OpenedContainer> {
    if !platform.supports(plan.format) {
        return Err(UpdateError::UnsupportedFormat(format!(
            "{} artifacts cannot be installed on {platform}",
            plan.format
        )));
    }

    let stage_err = |reason: String| UpdateError::InstallStage {
        stage: InstallStage::OpenContainer,
        reason,
    };

    tokio::fs::create_dir_all(&plan.work_dir)
        .await
        .map_err(|e| stage_err(format!("cannot create {}: {e}", plan.work_dir.display())))?;

    match plan.format {
        ArtifactFormat::Archive(kind) => {
            let root = plan.work_dir.join("contents");
            let archive = plan.artifact_path.clone();
            let dest = root.clone();
            let extracted =
                tokio::task::spawn_blocking(move || extract_archive(&archive, &dest, kind))
                    .await
                    .map_err(|e| stage_err(format!("extraction task failed: {e}")))?;

            let container = OpenedContainer {
                root,
                work_dir: plan.work_dir.clone(),
                mount_point: None,
            };
            if let Err(reason) = extracted {
                container.close().await;
                return Err(stage_err(reason));
            }
            tracing::info!(root = %container.root.display(), "artifact extracted");
            Ok(container)
        }
        ArtifactFormat::DiskImage => {
            let mount_point = plan.work_dir.join("mount");
            tokio::fs::create_dir_all(&mount_point)
                .await
                .map_err(|e| stage_err(format!("cannot create mount point: {e}")))?;

            if let Err(reason) = attach_disk_image(&plan.artifact_path, &mount_point).await {
                let _ = tokio::fs::remove_dir_all(&plan.work_dir).await;
                return Err(stage_err(reason));
            }
            tracing::info!(mount = %mount_point.display(), "disk image mounted");
            Ok(OpenedContainer {
                root: mount_point.clone(),
                work_dir: plan.work_dir.clone(),
                mount_point: Some(mount_point),
            })
        }
    }
}

fn extract_archive(
    archive: &Path,
    dest: &Path,
    kind: ArchiveKind,
) -> std::result::Result<(), String> {
    std::fs::create_dir_all(dest).map_err(|e| format!("cannot create {}: {e}", dest.display()))?;
    let file = std::fs::File::open(archive)
        .map_err(|e| format!("cannot open {}: {e}", archive.display()))?;

    match kind {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file).map_err(|e| format!("invalid zip: {e}"))?;
            zip.extract(dest).map_err(|e| format!("zip extraction failed: {e}"))
        }
        ArchiveKind::TarGz => {
            let decoder = flate2::read::GzDecoder::new(file);
            let mut tar = tar::Archive::new(decoder);
            tar.set_preserve_permissions(true);
            tar.unpack(dest).map_err(|e| format!("tar.gz extraction failed: {e}"))
        }
    }
}

async fn attach_disk_image(image: &Path, mount_point: &Path) -> std::result::Result<(), String> {
    let output = tokio::process::Command::new("hdiutil")
        .args(["attach", "-nobrowse", "-readonly", "-noautoopen", "-mountpoint"])
        .arg(mount_point)
        .arg(image)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| format!("cannot run hdiutil: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "hdiutil attach failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

async fn detach_disk_image(mount_point: &Path) -> std::result::Result<(), String> {
    let output = tokio::process::Command::new("hdiutil")
        .args(["detach", "-force"])
        .arg(mount_point)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| format!("cannot run hdiutil: {e}"))?;

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_owned());
    }
    Ok(())
}
