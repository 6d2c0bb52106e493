//! Platform identification and artifact naming conventions.
//!
//! Maps `(std::env::consts::OS, std::env::consts::ARCH)` to the labels used
//! in release asset names, and provides the ordered asset-name patterns and
//! synthesized artifact filenames tried for each platform.

use crate::update::install::ArtifactFormat;

/// Operating systems the updater knows how to install on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    MacOs,
    Linux,
    Windows,
}

/// The running (or a simulated) platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    /// Architecture label as used in asset names (`"arm64"`, `"x64"`).
    pub arch: &'static str,
}

impl Platform {
    /// Platform this binary was built for, if supported.
    pub fn current() -> Option<Self> {
        let os = match std::env::consts::OS {
            "macos" => Os::MacOs,
            "linux" => Os::Linux,
            "windows" => Os::Windows,
            _ => return None,
        };
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "x86_64" => "x64",
            _ => return None,
        };
        Some(Self { os, arch })
    }

    pub fn macos(arch: &'static str) -> Self {
        Self {
            os: Os::MacOs,
            arch,
        }
    }

    pub fn linux(arch: &'static str) -> Self {
        Self {
            os: Os::Linux,
            arch,
        }
    }

    pub fn windows(arch: &'static str) -> Self {
        Self {
            os: Os::Windows,
            arch,
        }
    }

    /// Short platform label used in asset names.
    pub fn label(&self) -> &'static str {
        match self.os {
            Os::MacOs => "mac",
            Os::Linux => "linux",
            Os::Windows => "win",
        }
    }

    /// Whether an artifact of this format can be installed here.
    pub fn supports(&self, format: ArtifactFormat) -> bool {
        match format {
            ArtifactFormat::DiskImage => self.os == Os::MacOs,
            ArtifactFormat::Archive(_) => true,
        }
    }

    /// Ordered asset-name patterns (`*` wildcard) for `version`.
    ///
    /// Earlier patterns win when several assets match different patterns.
    pub fn asset_patterns(&self, version: &str) -> Vec<String> {
        let v = version;
        let arch = self.arch;
        match self.os {
            Os::MacOs => vec![
                format!("*-{v}-mac.*"),
                format!("*-{v}-{arch}-mac.*"),
                format!("*-{v}.dmg"),
                "*-mac.*".to_owned(),
                "*.dmg".to_owned(),
                format!("*darwin*{arch}*"),
                "*darwin*".to_owned(),
                "*macos*".to_owned(),
            ],
            Os::Linux => vec![
                format!("*-{v}-linux-{arch}.*"),
                format!("*-{v}-linux.*"),
                format!("*-linux-{arch}.*"),
                "*-linux.*".to_owned(),
                "*linux*".to_owned(),
            ],
            Os::Windows => vec![
                format!("*-{v}-win.*"),
                format!("*-{v}-win-{arch}.*"),
                "*-win.*".to_owned(),
                format!("*windows*{arch}*"),
                "*windows*".to_owned(),
            ],
        }
    }

    /// Filenames guessed for `app` at `version`, in priority order. Used as
    /// download fallbacks when the advertised asset is not reachable.
    pub fn artifact_names(&self, app: &str, version: &str) -> Vec<String> {
        let arch = self.arch;
        match self.os {
            Os::MacOs => vec![
                format!("{app}-{version}-mac.zip"),
                format!("{app}-{version}.dmg"),
                format!("{app}-{version}-{arch}-mac.zip"),
                format!("{app}-{version}-{arch}.dmg"),
            ],
            Os::Linux => vec![
                format!("{app}-{version}-linux.tar.gz"),
                format!("{app}-{version}-linux.zip"),
                format!("{app}-{version}-linux-{arch}.tar.gz"),
            ],
            Os::Windows => vec![
                format!("{app}-{version}-win.zip"),
                format!("{app}-{version}-win-{arch}.zip"),
            ],
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.label(), self.arch)
    }
}

/// Case-insensitive match of `name` against a pattern where `*` matches any
/// run of characters (including none).
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let name = name.to_ascii_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !name.starts_with(first) || name.len() < first.len() + last.len() {
        return false;
    }
    if !name[first.len()..].ends_with(last) {
        return false;
    }

    let mut rest = &name[first.len()..name.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(idx) => rest = &rest[idx + middle.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn current_platform_is_known_on_ci_targets() {
        if cfg!(any(target_os = "macos", target_os = "linux", target_os = "windows"))
            && cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
        {
            assert!(Platform::current().is_some());
        }
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches_pattern("*-mac.*", "App-2.0.0-mac.zip"));
        assert!(matches_pattern("*.dmg", "App-2.0.0.DMG"));
        assert!(matches_pattern("*darwin*", "app_darwin_arm64.tar.gz"));
        assert!(matches_pattern("*darwin*arm64*", "app-darwin-arm64.tar.gz"));
        assert!(!matches_pattern("*darwin*arm64*", "app-darwin-x64.tar.gz"));
        assert!(!matches_pattern("*-mac.*", "App-2.0.0-linux.zip"));
        assert!(matches_pattern("exact.zip", "exact.zip"));
        assert!(!matches_pattern("exact.zip", "exact.zip.blockmap"));
    }

    #[test]
    fn wildcard_does_not_overlap_prefix_and_suffix() {
        assert!(!matches_pattern("ab*ba", "aba"));
        assert!(matches_pattern("ab*ba", "abba"));
    }

    #[test]
    fn mac_patterns_put_version_specific_first() {
        let patterns = Platform::macos("arm64").asset_patterns("2.0.0");
        assert_eq!(patterns[0], "*-2.0.0-mac.*");
        let generic_mac = patterns.iter().position(|p| p == "*-mac.*").unwrap();
        let dmg = patterns.iter().position(|p| p == "*.dmg").unwrap();
        let darwin = patterns.iter().position(|p| p == "*darwin*").unwrap();
        assert!(generic_mac < dmg && dmg < darwin);
    }

    #[test]
    fn artifact_names_start_with_zip_then_dmg_on_mac() {
        let names = Platform::macos("x64").artifact_names("App", "2.0.0");
        assert_eq!(names[0], "App-2.0.0-mac.zip");
        assert_eq!(names[1], "App-2.0.0.dmg");
    }

    #[test]
    fn disk_images_only_supported_on_mac() {
        assert!(Platform::macos("arm64").supports(ArtifactFormat::DiskImage));
        assert!(!Platform::linux("x64").supports(ArtifactFormat::DiskImage));
    }

    #[test]
    fn display_combines_label_and_arch() {
        assert_eq!(Platform::linux("arm64").to_string(), "linux-arm64");
    }
}
