//! Locating and validating the application bundle inside a container.
//!
//! On macOS a bundle is an `*.app` directory with `Contents/MacOS/<exe>`.
//! Elsewhere it is the directory that directly holds the main executable.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::error::{Result, UpdateError};
use crate::update::platform::{Os, Platform};

/// Levels below the container root searched for a bundle.
pub const MAX_SEARCH_DEPTH: usize = 3;

/// Expected on-disk shape of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    pub os: Os,
    /// Preferred `.app` directory name on macOS.
    pub bundle_name: String,
    /// Main executable file name.
    pub executable_name: String,
}

impl BundleLayout {
    pub fn new(app: &AppConfig, platform: &Platform) -> Self {
        let mut executable_name = app.executable_name.clone();
        if platform.os == Os::Windows && !executable_name.to_ascii_lowercase().ends_with(".exe") {
            executable_name.push_str(".exe");
        }
        Self {
            os: platform.os,
            bundle_name: app.bundle_dir_name(),
            executable_name,
        }
    }

    /// Path of the main executable inside `bundle`.
    pub fn executable_path(&self, bundle: &Path) -> PathBuf {
        match self.os {
            Os::MacOs => bundle
                .join("Contents")
                .join("MacOS")
                .join(&self.executable_name),
            Os::Linux | Os::Windows => bundle.join(&self.executable_name),
        }
    }

    fn looks_like_bundle(&self, dir: &Path) -> bool {
        match self.os {
            Os::MacOs => is_app_dir_name(dir) && dir.join("Contents").is_dir(),
            Os::Linux | Os::Windows => dir.join(&self.executable_name).is_file(),
        }
    }

    /// Breadth-first search of `root` (depth 0) down to
    /// [`MAX_SEARCH_DEPTH`] for the bundle.
    ///
    /// On macOS a directory named exactly `bundle_name` wins over other
    /// `.app` directories at any depth. Symlinks are not followed and the
    /// search does not descend into bundles.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NoBundleFound`] if nothing matches.
    pub fn find(&self, root: &Path) -> Result<PathBuf> {
        let mut queue = VecDeque::from([(root.to_owned(), 0usize)]);
        let mut first_match: Option<PathBuf> = None;

        while let Some((dir, depth)) = queue.pop_front() {
            if self.looks_like_bundle(&dir) {
                if self.is_preferred(&dir) {
                    return Ok(dir);
                }
                if first_match.is_none() {
                    first_match = Some(dir);
                }
                continue;
            }
            if depth == MAX_SEARCH_DEPTH {
                continue;
            }

            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut children: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                .map(|e| e.path())
                .filter(|p| p.file_name().is_some_and(|n| n != "__MACOSX"))
                .collect();
            children.sort();
            queue.extend(children.into_iter().map(|c| (c, depth + 1)));
        }

        first_match.ok_or_else(|| UpdateError::NoBundleFound {
            searched: root.to_owned(),
        })
    }

    fn is_preferred(&self, dir: &Path) -> bool {
        match self.os {
            Os::MacOs => dir
                .file_name()
                .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(&self.bundle_name)),
            Os::Linux | Os::Windows => true,
        }
    }

    /// Confirm the bundle has its required directories and executable.
    ///
    /// # Errors
    ///
    /// [`UpdateError::InvalidBundle`] naming the first missing piece.
    pub fn validate(&self, bundle: &Path) -> Result<()> {
        let invalid = |reason: String| UpdateError::InvalidBundle {
            path: bundle.to_owned(),
            reason,
        };

        if !bundle.is_dir() {
            return Err(invalid("not a directory".to_owned()));
        }
        if self.os == Os::MacOs {
            for required in ["Contents", "Contents/MacOS"] {
                if !bundle.join(required).is_dir() {
                    return Err(invalid(format!("missing {required}/")));
                }
            }
        }

        let executable = self.executable_path(bundle);
        let is_file = std::fs::metadata(&executable).is_ok_and(|m| m.is_file());
        if !is_file {
            return Err(invalid(format!(
                "missing executable {}",
                executable
                    .strip_prefix(bundle)
                    .unwrap_or(&executable)
                    .display()
            )));
        }
        Ok(())
    }
}

fn is_app_dir_name(dir: &Path) -> bool {
    dir.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("app"))
}

/// Default install location derived from the running executable.
///
/// macOS: the enclosing `*.app` directory. Elsewhere: the executable's
/// directory, but only when that directory is named after the app, so a
/// binary living in a shared directory such as `/usr/bin` is never treated
/// as a whole-directory bundle.
///
/// # Errors
///
/// [`UpdateError::Config`] when no safe location can be derived.
pub fn derive_install_path(current_exe: &Path, app: &AppConfig, os: Os) -> Result<PathBuf> {
    match os {
        Os::MacOs => current_exe
            .ancestors()
            .find(|p| is_app_dir_name(p))
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                UpdateError::Config(format!(
                    "{} is not inside an .app bundle; set app.install_path",
                    current_exe.display()
                ))
            }),
        Os::Linux | Os::Windows => {
            let parent = current_exe.parent().ok_or_else(|| {
                UpdateError::Config("running executable has no parent directory".to_owned())
            })?;
            let named_after_app = parent
                .file_name()
                .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(&app.name));
            if named_after_app {
                Ok(parent.to_path_buf())
            } else {
                Err(UpdateError::Config(format!(
                    "cannot infer the install directory from {}; set app.install_path",
                    current_exe.display()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn app_config() -> AppConfig {
        AppConfig {
            name: "App".to_owned(),
            executable_name: "app".to_owned(),
            ..AppConfig::default()
        }
    }

    fn make_mac_bundle(root: &Path, name: &str) -> PathBuf {
        let bundle = root.join(name);
        std::fs::create_dir_all(bundle.join("Contents/MacOS")).unwrap();
        std::fs::write(bundle.join("Contents/MacOS/app"), b"exe").unwrap();
        bundle
    }

    #[test]
    fn finds_mac_bundle_within_depth() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let bundle = make_mac_bundle(&nested, "App.app");

        let layout = BundleLayout::new(&app_config(), &Platform::macos("arm64"));
        assert_eq!(layout.find(dir.path()).unwrap(), bundle);
        layout.validate(&bundle).unwrap();
    }

    #[test]
    fn bundle_deeper_than_limit_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        make_mac_bundle(&dir.path().join("a/b/c"), "App.app");

        let layout = BundleLayout::new(&app_config(), &Platform::macos("arm64"));
        assert!(matches!(
            layout.find(dir.path()),
            Err(UpdateError::NoBundleFound { .. })
        ));
    }

    #[test]
    fn preferred_name_wins_over_shallower_app() {
        let dir = tempfile::tempdir().unwrap();
        make_mac_bundle(dir.path(), "Helper.app");
        let wanted = make_mac_bundle(&dir.path().join("x"), "App.app");

        let layout = BundleLayout::new(&app_config(), &Platform::macos("x64"));
        assert_eq!(layout.find(dir.path()).unwrap(), wanted);
    }

    #[test]
    fn linux_bundle_is_directory_with_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("App-2.0.0");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("app"), b"exe").unwrap();

        let layout = BundleLayout::new(&app_config(), &Platform::linux("x64"));
        assert_eq!(layout.find(dir.path()).unwrap(), bundle);
    }

    #[test]
    fn linux_archive_with_executable_at_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app"), b"exe").unwrap();
        let layout = BundleLayout::new(&app_config(), &Platform::linux("x64"));
        assert_eq!(layout.find(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn validate_reports_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("App.app");
        std::fs::create_dir_all(bundle.join("Contents/MacOS")).unwrap();

        let layout = BundleLayout::new(&app_config(), &Platform::macos("arm64"));
        let err = layout.validate(&bundle).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidBundle { .. }));
        assert!(err.to_string().contains("Contents/MacOS/app"));
    }

    #[test]
    fn validate_reports_missing_macos_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("App.app");
        std::fs::create_dir_all(bundle.join("Contents")).unwrap();

        let layout = BundleLayout::new(&app_config(), &Platform::macos("arm64"));
        let err = layout.validate(&bundle).unwrap_err();
        assert!(err.to_string().contains("Contents/MacOS/"));
    }

    #[test]
    fn windows_executable_gets_exe_suffix() {
        let layout = BundleLayout::new(&app_config(), &Platform::windows("x64"));
        assert_eq!(layout.executable_name, "app.exe");
    }

    #[test]
    fn derive_install_path_on_mac_uses_app_ancestor() {
        let exe = Path::new("/Applications/App.app/Contents/MacOS/app");
        assert_eq!(
            derive_install_path(exe, &app_config(), Os::MacOs).unwrap(),
            PathBuf::from("/Applications/App.app")
        );
        assert!(
            derive_install_path(Path::new("/usr/local/bin/app"), &app_config(), Os::MacOs).is_err()
        );
    }

    #[test]
    fn derive_install_path_refuses_shared_directories() {
        assert!(derive_install_path(Path::new("/usr/bin/app"), &app_config(), Os::Linux).is_err());
        assert_eq!(
            derive_install_path(Path::new("/opt/App/app"), &app_config(), Os::Linux).unwrap(),
            PathBuf::from("/opt/App")
        );
    }
}
