use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::observability;
use crate::retry::{classify_http_status, classify_transport_error, ErrorClass, RetryPolicy};

const PARTIAL_SUFFIX: &str = "download";

#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub attempts: u32,
}

/// Verified bytes still parked next to their target. Dropping it discards them.
#[derive(Debug)]
pub struct StagedArtifact {
    partial: PartialFile,
    target: PathBuf,
    sha256: String,
    bytes: u64,
    attempts: u32,
}

impl StagedArtifact {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn staged_path(&self) -> &Path {
        &self.partial.path
    }

    pub fn promote(self) -> UpdateResult<DownloadedArtifact> {
        self.partial.promote(&self.target)?;
        Ok(DownloadedArtifact {
            path: self.target,
            sha256: self.sha256,
            bytes: self.bytes,
            attempts: self.attempts,
        })
    }
}

#[derive(Debug)]
struct AttemptError {
    class: ErrorClass,
    message: String,
}

impl AttemptError {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

// Removes the partial file unless it was promoted to its final path.
#[derive(Debug)]
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn promote(mut self, target: &Path) -> UpdateResult<()> {
        fs::rename(&self.path, target).map_err(|err| {
            UpdateError::local_io(
                format!(
                    "failed moving {} -> {}",
                    self.path.display(),
                    target.display()
                ),
                err,
            )
        })?;
        self.keep = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed removing partial download");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    policy: RetryPolicy,
}

impl Downloader {
    pub fn new(request_timeout: Duration, policy: RetryPolicy) -> UpdateResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| UpdateError::Network {
                url: String::new(),
                attempts: 0,
                message: format!("failed building http client: {err}"),
            })?;
        Ok(Self { client, policy })
    }

    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn fetch(
        &self,
        url: &str,
        target_dir: &Path,
        file_name: Option<&str>,
        expected_sha256: Option<&str>,
    ) -> UpdateResult<DownloadedArtifact> {
        self.download(url, target_dir, file_name, expected_sha256, self.policy)
            .await
    }

    pub async fn download(
        &self,
        url: &str,
        target_dir: &Path,
        file_name: Option<&str>,
        expected_sha256: Option<&str>,
        policy: RetryPolicy,
    ) -> UpdateResult<DownloadedArtifact> {
        self.stage(url, target_dir, file_name, expected_sha256, policy)
            .await?
            .promote()
    }

    /// Like `download`, but leaves the verified bytes in `{file}.download`
    /// until the caller promotes them.
    #[instrument(
        name = "downloader.stage",
        skip(self, target_dir, expected_sha256, policy),
        fields(url = %url)
    )]
    pub async fn stage(
        &self,
        url: &str,
        target_dir: &Path,
        file_name: Option<&str>,
        expected_sha256: Option<&str>,
        policy: RetryPolicy,
    ) -> UpdateResult<StagedArtifact> {
        let parsed = Url::parse(url).map_err(|_| UpdateError::InvalidUrl(url.to_string()))?;
        let last_segment = final_path_segment(&parsed)
            .ok_or_else(|| UpdateError::InvalidUrl(url.to_string()))?;
        let file_name = file_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(last_segment);

        fs::create_dir_all(target_dir)
            .map_err(|err| UpdateError::io_at("creating", target_dir, err))?;
        let target = target_dir.join(file_name);
        let partial_path = target_dir.join(format!("{file_name}.{PARTIAL_SUFFIX}"));

        let started = Instant::now();
        let total_attempts = policy.total_attempts();
        let mut last_error: Option<AttemptError> = None;

        for attempt in 0..total_attempts {
            let attempt_no = attempt + 1;
            let partial = PartialFile::new(partial_path.clone());
            match self.fetch_once(parsed.clone(), &partial.path).await {
                Ok((sha256, bytes)) => {
                    if let Some(expected) = expected_sha256 {
                        let expected = expected.trim().to_ascii_lowercase();
                        if expected != sha256 {
                            observability::record_download(
                                "checksum_mismatch",
                                attempt_no,
                                elapsed_ms(started),
                                0,
                            );
                            return Err(UpdateError::ChecksumMismatch {
                                url: url.to_string(),
                                expected,
                                actual: sha256,
                            });
                        }
                    }
                    debug!(
                        attempt = attempt_no,
                        bytes = bytes,
                        path = %partial.path.display(),
                        "artifact downloaded and verified"
                    );
                    observability::record_download("ok", attempt_no, elapsed_ms(started), bytes);
                    return Ok(StagedArtifact {
                        partial,
                        target,
                        sha256,
                        bytes,
                        attempts: attempt_no,
                    });
                }
                Err(FetchError::Io(err)) => return Err(err),
                Err(FetchError::Attempt(err)) => {
                    drop(partial);
                    let is_last_attempt = attempt_no >= total_attempts;
                    if err.class == ErrorClass::Permanent || is_last_attempt {
                        observability::record_download("error", attempt_no, elapsed_ms(started), 0);
                        return Err(UpdateError::Network {
                            url: url.to_string(),
                            attempts: attempt_no,
                            message: format!("{} error: {}", err.class, err.message),
                        });
                    }

                    let delay = policy.delay_before_retry(attempt);
                    warn!(
                        attempt = attempt_no,
                        total_attempts = total_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err.message,
                        "download transient failure, retrying"
                    );
                    last_error = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let message = last_error
            .map(|err| err.message)
            .unwrap_or_else(|| "unknown download failure".to_string());
        Err(UpdateError::Network {
            url: url.to_string(),
            attempts: total_attempts,
            message,
        })
    }

    async fn fetch_once(&self, url: Url, partial: &Path) -> Result<(String, u64), FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| {
                FetchError::Attempt(AttemptError {
                    class: classify_transport_error(&err),
                    message: err.to_string(),
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("http_status={}", status.as_u16());
            return Err(FetchError::Attempt(match classify_http_status(status.as_u16()) {
                ErrorClass::Transient => AttemptError::transient(message),
                ErrorClass::Permanent => AttemptError::permanent(message),
            }));
        }

        let mut file = fs::File::create(partial)
            .map_err(|err| FetchError::Io(UpdateError::io_at("creating", partial, err)))?;
        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        loop {
            let chunk = response.chunk().await.map_err(|err| {
                FetchError::Attempt(AttemptError::transient(format!(
                    "body read failed: {err}"
                )))
            })?;
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk)
                .map_err(|err| FetchError::Io(UpdateError::io_at("writing", partial, err)))?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
        }
        file.sync_all()
            .map_err(|err| FetchError::Io(UpdateError::io_at("syncing", partial, err)))?;

        Ok((format!("{:x}", hasher.finalize()), bytes))
    }
}

#[derive(Debug)]
enum FetchError {
    Attempt(AttemptError),
    Io(UpdateError),
}

fn final_path_segment(url: &Url) -> Option<&str> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub fn sha256_file(path: &Path) -> UpdateResult<String> {
    let mut file = fs::File::open(path).map_err(|err| UpdateError::io_at("opening", path, err))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|err| UpdateError::io_at("reading", path, err))?;
    Ok(format!("{:x}", hasher.finalize()))
}
