//! Relaunch helper that outlives this process.
//!
//! The helper is a fixed script; everything it needs (delay, paths, app
//! name) is passed as arguments, never spliced into its text. It waits for
//! the updater to exit, then starts the new install, first from its known
//! path and then by searching for it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, UpdateError};
use crate::update::platform::{Os, Platform};

/// Arguments: `<delay-secs> <app-path> <executable-path> <app-name> <os-label>`.
const UNIX_HELPER: &str = r#"#!/bin/sh
sleep "$1"
APP="$2"
EXE="$3"
NAME="$4"
OS="$5"
rm -f "$0"

if [ "$OS" = "mac" ]; then
  if [ -d "$APP" ] && open "$APP"; then exit 0; fi
  if open -a "$NAME"; then exit 0; fi
  FOUND=$(mdfind "kMDItemFSName == '$NAME.app'" 2>/dev/null | head -n 1)
  if [ -n "$FOUND" ] && open "$FOUND"; then exit 0; fi
  exit 1
fi

if [ -x "$EXE" ]; then
  nohup "$EXE" >/dev/null 2>&1 &
  exit 0
fi
BIN=$(basename "$EXE")
FOUND=$(command -v "$BIN" 2>/dev/null)
if [ -z "$FOUND" ]; then
  FOUND=$(find "$(dirname "$APP")" /opt "$HOME/Applications" "$HOME/.local" -maxdepth 3 -type f -name "$BIN" -perm -u+x 2>/dev/null | head -n 1)
fi
if [ -n "$FOUND" ]; then
  nohup "$FOUND" >/dev/null 2>&1 &
  exit 0
fi
exit 1
"#;

/// Arguments: `<delay-secs> <app-path> <executable-path> <app-name>`.
const WINDOWS_HELPER: &str = "@echo off\r
rem timeout refuses redirected stdin; ping N+1 times waits N seconds\r
set /a PINGS=%1+1\r
timeout /t %1 /nobreak >nul 2>nul || ping -n %PINGS% 127.0.0.1 >nul\r
if exist \"%~3\" (\r
  start \"\" \"%~3\"\r
  goto done\r
)\r
where /q \"%~nx3\" && (\r
  start \"\" \"%~nx3\"\r
  goto done\r
)\r
exit /b 1\r
:done\r
del \"%~f0\"\r
";

/// A started relaunch helper.
#[derive(Debug, Clone)]
pub struct RelaunchHandle {
    pub helper_path: PathBuf,
    pub pid: u32,
}

/// Write the helper to the temp directory and start it detached, with no
/// inherited stdio.
///
/// # Errors
///
/// [`UpdateError::RelaunchFailed`] if the helper cannot be written or
/// spawned.
pub fn schedule(
    app_path: &Path,
    executable: &Path,
    app_name: &str,
    platform: &Platform,
    delay: Duration,
) -> Result<RelaunchHandle> {
    let id = uuid::Uuid::new_v4().simple().to_string();

    let (helper_path, script) = match platform.os {
        Os::Windows => (
            std::env::temp_dir().join(format!("updraft-relaunch-{id}.cmd")),
            WINDOWS_HELPER,
        ),
        Os::MacOs | Os::Linux => (
            std::env::temp_dir().join(format!("updraft-relaunch-{id}.sh")),
            UNIX_HELPER,
        ),
    };

    std::fs::write(&helper_path, script).map_err(|e| {
        UpdateError::RelaunchFailed(format!("cannot write {}: {e}", helper_path.display()))
    })?;
    make_executable(&helper_path).map_err(|e| {
        UpdateError::RelaunchFailed(format!(
            "cannot mark {} executable: {e}",
            helper_path.display()
        ))
    })?;

    let delay_arg = delay.as_secs().max(1).to_string();
    let mut command = helper_command(&helper_path, platform);
    command
        .arg(&delay_arg)
        .arg(app_path)
        .arg(executable)
        .arg(app_name);
    if platform.os != Os::Windows {
        command.arg(platform.label());
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    detach(&mut command);

    let child = command
        .spawn()
        .map_err(|e| UpdateError::RelaunchFailed(format!("cannot start relaunch helper: {e}")))?;
    let pid = child.id();
    // Not waited on: the helper must keep running after we exit.
    drop(child);

    tracing::info!(helper = %helper_path.display(), pid, "relaunch helper started");
    Ok(RelaunchHandle { helper_path, pid })
}

fn helper_command(helper: &Path, platform: &Platform) -> std::process::Command {
    match platform.os {
        Os::Windows => {
            let mut command = std::process::Command::new("cmd");
            command.arg("/C").arg(helper);
            command
        }
        Os::MacOs | Os::Linux => {
            let mut command = std::process::Command::new("/bin/sh");
            command.arg(helper);
            command
        }
    }
}

#[cfg(unix)]
fn detach(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut std::process::Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut std::process::Command) {}

fn make_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    let _ = path;
    Ok(())
}
