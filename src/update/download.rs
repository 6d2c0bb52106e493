//! Artifact downloads with manual redirects and candidate fallback.
//!
//! Candidates are tried strictly in order, one at a time. Redirects are
//! followed by hand so each hop counts against the per-URL cap; a 404/403,
//! an exceeded cap, a stalled transfer, or an empty/invalid file moves on
//! to the next candidate. Bytes are streamed into a hidden `.part` file in
//! the destination directory that is renamed into place only once complete,
//! so the final path never holds a partial file.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::{Result, UpdateError};
use crate::progress::{ProgressCallback, ProgressThrottle};
use crate::update::install::{ArtifactFormat, validate_artifact};

/// One URL to try, with the filename the artifact is saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCandidate {
    pub url: String,
    pub filename: String,
    /// Advertised size; a mismatch rejects the download.
    pub expected_size: Option<u64>,
}

impl DownloadCandidate {
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            expected_size: None,
        }
    }

    pub fn with_expected_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }
}

/// Lifecycle of a single download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// Bookkeeping for one candidate.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination_path: PathBuf,
    pub attempted_format: Option<ArtifactFormat>,
    pub redirect_count: u8,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    pub state: TaskState,
    /// Why the attempt failed, if it did.
    pub failure: Option<String>,
}

impl DownloadTask {
    fn new(candidate: &DownloadCandidate, destination_path: PathBuf) -> Self {
        Self {
            source_url: candidate.url.clone(),
            destination_path,
            attempted_format: ArtifactFormat::from_filename(&candidate.filename),
            redirect_count: 0,
            bytes_received: 0,
            total_bytes: candidate.expected_size,
            state: TaskState::Pending,
            failure: None,
        }
    }
}

/// A completed download.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub candidate: DownloadCandidate,
    pub bytes: u64,
    /// Every attempt made, in order, the last one successful.
    pub tasks: Vec<DownloadTask>,
}

/// Why a single attempt stopped.
enum AttemptError {
    /// Try the next candidate.
    Fallthrough(String),
    Cancelled,
    /// Local problem that no other candidate can fix.
    Fatal(UpdateError),
}

/// Removes a partial file on drop unless disarmed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(path = %self.path.display(), "removed partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "cannot remove partial download"
                ),
            }
        }
    }
}

/// Downloads release artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactDownloader {
    client: reqwest::Client,
    max_redirects: u8,
    inactivity_timeout: Duration,
    progress_interval: Duration,
}

impl ArtifactDownloader {
    /// Build a downloader. Automatic redirects are disabled.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &DownloadConfig, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_owned())
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| UpdateError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_redirects: config.max_redirects,
            inactivity_timeout: config.inactivity_timeout(),
            progress_interval: config.progress_interval(),
        })
    }

    /// Download the first reachable candidate into `dest_dir`.
    ///
    /// `on_progress` is throttled to one call per progress interval, plus a
    /// final call with `bytes_received == total_bytes`.
    ///
    /// # Errors
    ///
    /// [`UpdateError::DownloadExhausted`] when every candidate fails,
    /// [`UpdateError::Cancelled`] when `cancel` fires (no partial file is
    /// left behind), [`UpdateError::Io`] if `dest_dir` cannot be created.
    pub async fn download(
        &self,
        candidates: &[DownloadCandidate],
        dest_dir: &Path,
        on_progress: &mut ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut tasks = Vec::with_capacity(candidates.len());
        let mut attempts = Vec::new();
        let mut last_error = "no download candidates".to_owned();

        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled("download cancelled".to_owned()));
            }

            let Some(final_path) = safe_destination(dest_dir, &candidate.filename) else {
                let reason = format!("unusable filename {:?}", candidate.filename);
                attempts.push(format!("{}: {reason}", candidate.url));
                last_error = reason;
                continue;
            };

            let mut task = DownloadTask::new(candidate, final_path);
            tracing::info!(
                url = %candidate.url,
                file = %candidate.filename,
                "trying download candidate"
            );

            match self
                .attempt(candidate, &mut task, dest_dir, on_progress, cancel)
                .await
            {
                Ok(()) => {
                    task.state = TaskState::Succeeded;
                    let path = task.destination_path.clone();
                    let bytes = task.bytes_received;
                    tasks.push(task);
                    tracing::info!(path = %path.display(), bytes, "download complete");
                    return Ok(DownloadedArtifact {
                        path,
                        candidate: candidate.clone(),
                        bytes,
                        tasks,
                    });
                }
                Err(AttemptError::Cancelled) => {
                    tracing::info!(url = %candidate.url, "download cancelled");
                    return Err(UpdateError::Cancelled("download cancelled".to_owned()));
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Fallthrough(reason)) => {
                    tracing::warn!(url = %candidate.url, %reason, "download candidate failed");
                    task.state = TaskState::Failed;
                    task.failure = Some(reason.clone());
                    attempts.push(format!("{}: {reason}", candidate.url));
                    last_error = reason;
                    tasks.push(task);
                }
            }
        }

        Err(UpdateError::DownloadExhausted {
            attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        candidate: &DownloadCandidate,
        task: &mut DownloadTask,
        dest_dir: &Path,
        on_progress: &mut ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), AttemptError> {
        task.state = TaskState::InFlight;
        let response = self.follow_redirects(&candidate.url, task, cancel).await?;

        if let Some(len) = response.content_length().filter(|len| *len > 0) {
            task.total_bytes = Some(len);
        }

        let part_path = dest_dir.join(format!(
            ".{}.{}.part",
            candidate.filename,
            uuid::Uuid::new_v4().simple()
        ));
        let mut part = PartialFile::new(part_path.clone());
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;

        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = tokio::time::timeout(self.inactivity_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(AttemptError::Fallthrough(format!(
                        "no data received for {}s",
                        self.inactivity_timeout.as_secs()
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(AttemptError::Fallthrough(format!("transfer interrupted: {e}")));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Fatal(e.into()))?;
            task.bytes_received += chunk.len() as u64;

            if throttle.should_emit(Instant::now()) {
                on_progress(task.bytes_received, task.total_bytes);
            }
        }

        file.flush().await.map_err(|e| AttemptError::Fatal(e.into()))?;
        file.sync_all()
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;
        drop(file);

        if task.bytes_received == 0 {
            return Err(AttemptError::Fallthrough("downloaded file is empty".to_owned()));
        }
        if let Some(expected) = candidate.expected_size {
            if expected != task.bytes_received {
                return Err(AttemptError::Fallthrough(format!(
                    "size mismatch: expected {expected} bytes, received {}",
                    task.bytes_received
                )));
            }
        }

        if let Some(format) = task.attempted_format {
            let path = part_path.clone();
            let verdict = tokio::task::spawn_blocking(move || validate_artifact(&path, format))
                .await
                .map_err(|e| AttemptError::Fatal(UpdateError::Io(std::io::Error::other(e))))?;
            if let Err(e) = verdict {
                return Err(AttemptError::Fallthrough(e.to_string()));
            }
        }

        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        match tokio::fs::remove_file(&task.destination_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AttemptError::Fatal(e.into())),
        }
        tokio::fs::rename(&part_path, &task.destination_path)
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;
        part.disarm();

        throttle.force(Instant::now());
        on_progress(task.bytes_received, Some(task.bytes_received));
        Ok(())
    }

    /// GET `start`, following up to `max_redirects` redirects by hand.
    async fn follow_redirects(
        &self,
        start: &str,
        task: &mut DownloadTask,
        cancel: &CancellationToken,
    ) -> std::result::Result<reqwest::Response, AttemptError> {
        let mut url = url::Url::parse(start)
            .map_err(|e| AttemptError::Fallthrough(format!("invalid URL: {e}")))?;

        loop {
            let request = self.client.get(url.clone()).send();
            let send = tokio::time::timeout(self.inactivity_timeout, request);
            let response = tokio::select! {
                () = cancel.cancelled() => return Err(AttemptError::Cancelled),
                result = send => match result {
                    Err(_) => {
                        return Err(AttemptError::Fallthrough(format!(
                            "no response from {url} within {}s",
                            self.inactivity_timeout.as_secs()
                        )));
                    }
                    Ok(Err(e)) => {
                        return Err(AttemptError::Fallthrough(format!("request failed: {e}")));
                    }
                    Ok(Ok(response)) => response,
                },
            };

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        AttemptError::Fallthrough(format!("HTTP {status} without Location header"))
                    })?;
                if task.redirect_count >= self.max_redirects {
                    return Err(AttemptError::Fallthrough(format!(
                        "more than {} redirects",
                        self.max_redirects
                    )));
                }
                let next = url.join(location).map_err(|e| {
                    AttemptError::Fallthrough(format!("invalid redirect target {location:?}: {e}"))
                })?;
                task.redirect_count += 1;
                tracing::debug!(
                    from = %url,
                    to = %next,
                    hop = task.redirect_count,
                    "following redirect"
                );
                url = next;
                continue;
            }

            return match status.as_u16() {
                200 => Ok(response),
                404 | 403 => {
                    tracing::debug!(
                        %url,
                        status = status.as_u16(),
                        "artifact not published under this name"
                    );
                    Err(AttemptError::Fallthrough(format!("HTTP {}", status.as_u16())))
                }
                other => Err(AttemptError::Fallthrough(format!("unexpected HTTP {other}"))),
            };
        }
    }
}

/// `dest_dir/filename`, rejecting names that are not a single path component.
fn safe_destination(dest_dir: &Path, filename: &str) -> Option<PathBuf> {
    let name = Path::new(filename).file_name()?;
    if name != std::ffi::OsStr::new(filename) || filename.starts_with('.') {
        return None;
    }
    Some(dest_dir.join(name))
}
