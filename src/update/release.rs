//! Release index client and platform asset selection.
//!
//! Queries a GitHub-style "latest release" endpoint, turns the response into
//! a [`ReleaseManifest`], and picks the asset for the running platform. The
//! resolver never retries; a failed check is reported and the host decides
//! whether to ask again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ReleaseConfig;
use crate::error::{Result, UpdateError};
use crate::update::install::ArtifactFormat;
use crate::update::platform::{Platform, matches_pattern};
use crate::update::version::{self, VersionChange};

/// One downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub filename: String,
    pub download_url: String,
    pub size_bytes: Option<u64>,
}

/// A release as described by the release index. Fetched fresh per check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseManifest {
    /// Normalized version (leading `v` stripped).
    pub version: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Release notes, possibly empty.
    pub notes: String,
    pub assets: Vec<AssetRef>,
    /// Human-facing release page, used for the manual-download hint.
    pub release_page: Option<String>,
}

/// Wire shape of a GitHub release.
#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: Option<String>,
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

impl ReleaseManifest {
    /// Parse a release index response body.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Parse`] for malformed JSON or a release with
    /// neither a tag nor a name.
    pub fn from_json(body: &str) -> Result<Self> {
        let raw: GithubRelease = serde_json::from_str(body)
            .map_err(|e| UpdateError::Parse(format!("invalid release document: {e}")))?;

        let tag = raw
            .tag_name
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| raw.name.as_deref().filter(|n| !n.trim().is_empty()))
            .ok_or_else(|| UpdateError::Parse("release has no tag_name or name".to_owned()))?;

        Ok(Self {
            version: version::normalize(tag).to_owned(),
            published_at: raw.published_at,
            notes: raw.body.unwrap_or_default(),
            assets: raw
                .assets
                .into_iter()
                .map(|a| AssetRef {
                    filename: a.name,
                    download_url: a.browser_download_url,
                    size_bytes: a.size.filter(|s| *s > 0),
                })
                .collect(),
            release_page: raw.html_url,
        })
    }
}

/// Candidate patterns for a platform and the assets they matched.
#[derive(Debug, Clone)]
pub struct AssetSelection {
    /// Patterns in priority order.
    pub candidate_filenames: Vec<String>,
    /// First-priority match, if any.
    pub chosen: Option<AssetRef>,
    /// Every installable match, best first. `chosen` is the head.
    pub ranked: Vec<AssetRef>,
}

impl AssetSelection {
    /// Rank `manifest.assets` for `platform` in a single pass.
    ///
    /// An asset's rank is the index of the first pattern it matches; ties
    /// keep manifest order. Assets in a format the platform cannot install
    /// (checksums, blockmaps, packages) are skipped.
    pub fn build(manifest: &ReleaseManifest, platform: &Platform) -> Self {
        let candidate_filenames = platform.asset_patterns(&manifest.version);

        let mut scored: Vec<(usize, usize, &AssetRef)> = Vec::new();
        for (position, asset) in manifest.assets.iter().enumerate() {
            let installable = ArtifactFormat::from_filename(&asset.filename)
                .is_some_and(|format| platform.supports(format));
            if !installable {
                continue;
            }
            if let Some(rank) = candidate_filenames
                .iter()
                .position(|pattern| matches_pattern(pattern, &asset.filename))
            {
                scored.push((rank, position, asset));
            }
        }
        scored.sort_by_key(|(rank, position, _)| (*rank, *position));

        let ranked: Vec<AssetRef> = scored.into_iter().map(|(_, _, a)| a.clone()).collect();
        Self {
            candidate_filenames,
            chosen: ranked.first().cloned(),
            ranked,
        }
    }
}

/// Pick the asset for `platform` from `manifest`.
///
/// # Errors
///
/// [`UpdateError::EmptyRelease`] when the release has no assets at all,
/// [`UpdateError::NoCompatibleAsset`] when none match the platform.
pub fn select_asset(manifest: &ReleaseManifest, platform: &Platform) -> Result<AssetRef> {
    if manifest.assets.is_empty() {
        return Err(UpdateError::EmptyRelease {
            version: manifest.version.clone(),
        });
    }
    AssetSelection::build(manifest, platform)
        .chosen
        .ok_or_else(|| UpdateError::NoCompatibleAsset {
            version: manifest.version.clone(),
            platform: platform.to_string(),
        })
}

/// A release that differs from the installed version.
#[derive(Debug, Clone)]
pub struct AvailableUpdate {
    pub version: String,
    pub current_version: String,
    /// Remote is older than the installed version.
    pub is_downgrade: bool,
    pub notes: String,
    pub asset: AssetRef,
    pub manifest: ReleaseManifest,
}

/// Outcome of comparing a manifest with the installed version.
#[derive(Debug, Clone)]
pub enum UpdateAvailability {
    NoUpdate { current_version: String },
    Available(AvailableUpdate),
}

/// Compare `manifest` against `current_version` and select the asset.
///
/// Equal versions short-circuit to [`UpdateAvailability::NoUpdate`] without
/// looking at assets. Both newer and older remote versions are offered.
///
/// # Errors
///
/// Propagates [`select_asset`] errors when an update would be offered.
pub fn evaluate(
    manifest: ReleaseManifest,
    current_version: &str,
    platform: &Platform,
) -> Result<UpdateAvailability> {
    let change = VersionChange::between(current_version, &manifest.version);
    if change == VersionChange::Same {
        return Ok(UpdateAvailability::NoUpdate {
            current_version: current_version.to_owned(),
        });
    }

    let asset = select_asset(&manifest, platform)?;
    Ok(UpdateAvailability::Available(AvailableUpdate {
        version: manifest.version.clone(),
        current_version: version::normalize(current_version).to_owned(),
        is_downgrade: change == VersionChange::Downgrade,
        notes: manifest.notes.clone(),
        asset,
        manifest,
    }))
}

/// HTTP client for the release index.
#[derive(Debug, Clone)]
pub struct ReleaseResolver {
    client: reqwest::Client,
    endpoint: String,
    accept: String,
    timeout_secs: u64,
}

impl ReleaseResolver {
    /// Build a resolver from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &ReleaseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|e| UpdateError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            accept: config.accept.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// Fetch the latest release manifest with a single GET.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Network`] on transport failure or timeout,
    /// [`UpdateError::Remote`] on a non-2xx status,
    /// [`UpdateError::Parse`] on a malformed body,
    /// [`UpdateError::Cancelled`] if `cancel` fires first.
    pub async fn fetch_latest(&self, cancel: &CancellationToken) -> Result<ReleaseManifest> {
        tracing::debug!(endpoint = %self.endpoint, "fetching release index");

        let request = async {
            let response = self
                .client
                .get(&self.endpoint)
                .header(reqwest::header::ACCEPT, &self.accept)
                .send()
                .await
                .map_err(|e| self.network_error(e))?;

            let status = response.status();
            if !status.is_success() {
                tracing::warn!(status = status.as_u16(), "release index returned an error");
                return Err(UpdateError::Remote {
                    status: status.as_u16(),
                });
            }

            let body = response.text().await.map_err(|e| self.network_error(e))?;
            ReleaseManifest::from_json(&body)
        };

        tokio::select! {
            () = cancel.cancelled() => {
                Err(UpdateError::Cancelled("update check cancelled".to_owned()))
            }
            result = request => {
                if let Ok(manifest) = &result {
                    tracing::info!(
                        version = %manifest.version,
                        assets = manifest.assets.len(),
                        "release index fetched"
                    );
                }
                result
            }
        }
    }

    fn network_error(&self, e: reqwest::Error) -> UpdateError {
        if e.is_timeout() {
            UpdateError::Network(format!(
                "release index timed out after {}s",
                self.timeout_secs
            ))
        } else {
            UpdateError::Network(format!("release index request failed: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn asset(name: &str) -> AssetRef {
        AssetRef {
            filename: name.to_owned(),
            download_url: format!("https://example.com/dl/{name}"),
            size_bytes: None,
        }
    }

    fn manifest(version: &str, names: &[&str]) -> ReleaseManifest {
        ReleaseManifest {
            version: version.to_owned(),
            published_at: None,
            notes: String::new(),
            assets: names.iter().map(|n| asset(n)).collect(),
            release_page: None,
        }
    }

    #[test]
    fn parses_github_release_json() {
        let body = r#"{
            "tag_name": "v2.0.0",
            "name": "Release 2.0.0",
            "body": "Bug fixes",
            "published_at": "2026-03-01T12:00:00Z",
            "html_url": "https://github.com/owner/app/releases/tag/v2.0.0",
            "assets": [
                {"name": "App-2.0.0-mac.zip", "browser_download_url": "https://x/a", "size": 1024}
            ]
        }"#;
        let m = ReleaseManifest::from_json(body).unwrap();
        assert_eq!(m.version, "2.0.0");
        assert_eq!(m.notes, "Bug fixes");
        assert!(m.published_at.is_some());
        assert_eq!(m.assets.len(), 1);
        assert_eq!(m.assets[0].size_bytes, Some(1024));
        assert_eq!(
            m.release_page.as_deref(),
            Some("https://github.com/owner/app/releases/tag/v2.0.0")
        );
    }

    #[test]
    fn falls_back_to_name_when_tag_missing() {
        let m = ReleaseManifest::from_json(r#"{"name": "v1.4", "assets": []}"#).unwrap();
        assert_eq!(m.version, "1.4");
        assert!(m.notes.is_empty());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = ReleaseManifest::from_json("{not json").unwrap_err();
        assert!(matches!(err, UpdateError::Parse(_)));
        let err = ReleaseManifest::from_json(r#"{"assets": []}"#).unwrap_err();
        assert!(matches!(err, UpdateError::Parse(_)));
    }

    #[test]
    fn pattern_priority_beats_manifest_order() {
        let m = manifest(
            "2.0.0",
            &["App-2.0.0-darwin.tar.gz", "App-2.0.0.dmg", "App-2.0.0-mac.zip"],
        );
        let chosen = select_asset(&m, &Platform::macos("arm64")).unwrap();
        assert_eq!(chosen.filename, "App-2.0.0-mac.zip");
    }

    #[test]
    fn selection_is_deterministic() {
        let m = manifest("2.0.0", &["b-mac.zip", "a-mac.zip", "App.dmg"]);
        let platform = Platform::macos("x64");
        let first = select_asset(&m, &platform).unwrap();
        for _ in 0..10 {
            assert_eq!(select_asset(&m, &platform).unwrap(), first);
        }
        // Same rank: manifest order decides.
        assert_eq!(first.filename, "b-mac.zip");
    }

    #[test]
    fn skips_uninstallable_formats() {
        let m = manifest(
            "2.0.0",
            &["App-2.0.0-mac.zip.blockmap", "latest-mac.yml", "App-2.0.0.dmg"],
        );
        let chosen = select_asset(&m, &Platform::macos("arm64")).unwrap();
        assert_eq!(chosen.filename, "App-2.0.0.dmg");
    }

    #[test]
    fn empty_release_is_distinct_from_no_match() {
        let platform = Platform::linux("x64");
        let empty = manifest("2.0.0", &[]);
        assert!(matches!(
            select_asset(&empty, &platform),
            Err(UpdateError::EmptyRelease { .. })
        ));

        let mac_only = manifest("2.0.0", &["App-2.0.0-mac.zip", "App-2.0.0.dmg"]);
        assert!(matches!(
            select_asset(&mac_only, &platform),
            Err(UpdateError::NoCompatibleAsset { .. })
        ));
    }

    #[test]
    fn dmg_not_offered_on_linux() {
        let m = manifest("2.0.0", &["App-2.0.0-linux.dmg", "App-2.0.0-linux.tar.gz"]);
        let chosen = select_asset(&m, &Platform::linux("x64")).unwrap();
        assert_eq!(chosen.filename, "App-2.0.0-linux.tar.gz");
    }

    #[test]
    fn ranked_lists_every_match_best_first() {
        let m = manifest("2.0.0", &["App.dmg", "App-2.0.0-mac.zip", "notes.txt"]);
        let selection = AssetSelection::build(&m, &Platform::macos("arm64"));
        let names: Vec<&str> = selection.ranked.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["App-2.0.0-mac.zip", "App.dmg"]);
        assert_eq!(selection.chosen.unwrap().filename, "App-2.0.0-mac.zip");
    }

    #[test]
    fn evaluate_upgrade() {
        let m = manifest("2.0.0", &["App-2.0.0-mac.zip"]);
        match evaluate(m, "1.9.9", &Platform::macos("arm64")).unwrap() {
            UpdateAvailability::Available(update) => {
                assert_eq!(update.version, "2.0.0");
                assert!(!update.is_downgrade);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn evaluate_same_version_ignores_assets() {
        let m = manifest("2.0.0", &[]);
        assert!(matches!(
            evaluate(m, "2.0", &Platform::macos("arm64")).unwrap(),
            UpdateAvailability::NoUpdate { .. }
        ));
    }

    #[test]
    fn evaluate_downgrade_is_flagged() {
        let m = manifest("2.0.0", &["App-2.0.0-mac.zip"]);
        match evaluate(m, "3.0.0", &Platform::macos("arm64")).unwrap() {
            UpdateAvailability::Available(update) => assert!(update.is_downgrade),
            other => panic!("expected downgrade, got {other:?}"),
        }
    }
}
