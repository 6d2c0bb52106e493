//! Filesystem and process primitives used by the install pipeline.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Copy `src` (file, directory, or symlink) to `dst`, recreating symlinks
/// rather than following them. `dst` must not exist.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        copy_symlink(src, dst)
    } else if file_type.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        std::fs::set_permissions(dst, meta.permissions())
    } else if file_type.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst).map(|_| ())
    } else {
        Err(io::Error::other(format!(
            "unsupported file type at {}",
            src.display()
        )))
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    // Windows symlinks need privileges; copy what they point at instead.
    let resolved = std::fs::canonicalize(src)?;
    copy_tree(&resolved, dst)
}

/// Remove a file, symlink, or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sibling of `target` that receives files which cannot be deleted in place.
///
/// On Windows a running executable, and any library it has loaded, refuses
/// deletion but may still be renamed within its volume.
pub fn parking_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{name}.updraft-old"))
}

/// Remove `target` like [`remove_path`], moving any file that cannot be
/// deleted into `parking` instead. Returns how many files were parked.
pub fn clear_target(target: &Path, parking: &Path) -> io::Result<usize> {
    clear_with(target, parking, &|path| std::fs::remove_file(path))
}

fn clear_with(
    path: &Path,
    parking: &Path,
    remove_file: &dyn Fn(&Path) -> io::Result<()>,
) -> io::Result<usize> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    if meta.is_dir() {
        let mut parked = 0;
        for entry in std::fs::read_dir(path)? {
            parked += clear_with(&entry?.path(), parking, remove_file)?;
        }
        std::fs::remove_dir(path)?;
        return Ok(parked);
    }

    match remove_file(path) {
        Ok(()) => Ok(0),
        Err(e) => {
            std::fs::create_dir_all(parking)?;
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            let parked = parking.join(format!("{}-{name}", uuid::Uuid::new_v4().simple()));
            std::fs::rename(path, &parked).map_err(|_| e)?;
            tracing::debug!(
                from = %path.display(),
                to = %parked.display(),
                "file in use; moved aside"
            );
            Ok(1)
        }
    }
}

/// Delete `target` and copy `source` into its place using `copy`.
///
/// Removal and copy run back to back to keep the window in which nothing is
/// installed as short as possible. Files still in use are parked in
/// [`parking_dir`]; leftovers from an earlier update are swept first. The
/// error message names which half failed.
pub fn replace_path<C>(source: &Path, target: &Path, copy: C) -> Result<(), String>
where
    C: Fn(&Path, &Path) -> io::Result<()>,
{
    let parking = parking_dir(target);
    if let Err(e) = remove_path(&parking) {
        tracing::debug!(dir = %parking.display(), error = %e, "earlier parked files not removed");
    }
    clear_target(target, &parking)
        .map_err(|e| format!("cannot remove {}: {e}", target.display()))?;
    copy(source, target)
        .map_err(|e| format!("cannot copy new version to {}: {e}", target.display()))
}

/// Put `backup` back at `target`, discarding whatever is at `target` now.
pub fn restore_from_backup(backup: &Path, target: &Path) -> io::Result<()> {
    clear_target(target, &parking_dir(target))?;
    copy_tree(backup, target)
}

/// Make directories traversable, files readable, and the main executable
/// runnable. Symlinks are left alone.
#[cfg(unix)]
pub fn normalize_permissions(root: &Path, executable: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::symlink_metadata(root)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mode = meta.permissions().mode() & 0o7777;
    let wanted = if meta.is_dir() {
        mode | 0o755
    } else if root == executable || mode & 0o111 != 0 {
        mode | 0o755
    } else {
        mode | 0o644
    };
    if wanted != mode {
        std::fs::set_permissions(root, std::fs::Permissions::from_mode(wanted))?;
    }

    if meta.is_dir() {
        for entry in std::fs::read_dir(root)? {
            normalize_permissions(&entry?.path(), executable)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn normalize_permissions(root: &Path, executable: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(root)?;
    let mut perms = meta.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(root, perms)?;
    }
    if meta.is_dir() {
        for entry in std::fs::read_dir(root)? {
            normalize_permissions(&entry?.path(), executable)?;
        }
    }
    Ok(())
}

/// Set the modification time of `path` to now.
pub fn touch(path: &Path) -> io::Result<()> {
    let file = if path.is_dir() {
        std::fs::File::open(path)?
    } else {
        std::fs::File::options().write(true).open(path)?
    };
    file.set_modified(SystemTime::now())
}

/// Strip the download quarantine marker so the relaunched app opens
/// without a Gatekeeper prompt. No-op off macOS.
pub async fn clear_quarantine(path: &Path) -> Result<(), String> {
    if !cfg!(target_os = "macos") {
        return Ok(());
    }
    let output = tokio::process::Command::new("xattr")
        .args(["-dr", "com.apple.quarantine"])
        .arg(path)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| format!("cannot run xattr: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_owned())
    }
}

/// Ask other running instances of `executable_name` to exit and wait up to
/// `grace` for them to go. Returns how many were signalled. This process is
/// never signalled.
pub async fn quiesce_other_instances(
    executable_name: &str,
    grace: Duration,
) -> Result<usize, String> {
    let own_pid = std::process::id();

    #[cfg(unix)]
    {
        let output = tokio::process::Command::new("pgrep")
            .arg("-x")
            .arg(executable_name)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| format!("cannot run pgrep: {e}"))?;

        // Exit status 1 means no matches.
        let pids: Vec<i32> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .filter(|pid: &i32| *pid as u32 != own_pid)
            .collect();

        for pid in &pids {
            // SAFETY: kill(2) with a plain pid and SIGTERM has no memory effects.
            let rc = unsafe { libc::kill(*pid, libc::SIGTERM) };
            if rc != 0 {
                tracing::debug!(pid, "SIGTERM failed; process may have exited");
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            // SAFETY: signal 0 only checks that the pid exists.
            let alive = pids.iter().any(|pid| unsafe { libc::kill(*pid, 0) } == 0);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(pids.len())
    }

    #[cfg(not(unix))]
    {
        let output = tokio::process::Command::new("taskkill")
            .args(["/IM", executable_name, "/FI"])
            .arg(format!("PID ne {own_pid}"))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| format!("cannot run taskkill: {e}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let signalled = stdout.lines().filter(|l| l.starts_with("SUCCESS")).count();
        tokio::time::sleep(grace.min(Duration::from_secs(1))).await;
        Ok(signalled)
    }
}
