//! Resumable, integrity-checked archive download
//!
//! [`ArchiveDownloader::download`] fetches one monthly archive into the work
//! directory:
//!
//! 1. A HEAD probe reports range support, total size and any published
//!    SHA-256 / MD5 checksum.
//! 2. A `{period}.zip.part` file left by an earlier attempt is resumed with a
//!    `Range` request when the server supports it, otherwise discarded.
//! 3. Transient failures are retried with exponential backoff. A 416 restarts
//!    from zero, and a 200 answer to a range request replaces the partial
//!    bytes instead of being appended to them.
//! 4. The finished file is size-checked, hashed, compared against the
//!    published checksum in constant time and opened as a ZIP.
//! 5. Only then is it renamed to a unique final path. The returned
//!    [`Archive`] deletes that file when dropped.
//!
//! The `.part` file is kept after transient failures and cancellation so the
//! next call can resume; integrity failures delete it.

mod probe;
mod verify;

pub use probe::{plan_resume, ArchiveProbe, ContentRange, ExpectedChecksum, ResumePlan};
pub use verify::{digest_file, validate_zip, FileDigests};

use crate::config::HexstatConfig;
use crate::error::DownloadError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes read from the response before each write to disk
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Restarts from zero tolerated within one download call
const MAX_RESTARTS: u32 = 2;

// =============================================================================
// Types
// =============================================================================

/// A downloaded and validated archive
///
/// The file is removed when this value is dropped.
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    bytes: u64,
    checksum: String,
    source_url: String,
}

impl Archive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hex-encoded SHA-256 of the archive
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed archive {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove archive {}: {}", self.path.display(), e),
        }
    }
}

/// Download progress events
#[derive(Debug, Clone)]
pub enum DownloadProgress {
    Probed {
        total: Option<u64>,
        resumable: bool,
    },
    Resuming {
        offset: u64,
    },
    Restarting {
        reason: String,
    },
    Received {
        bytes: u64,
        total: Option<u64>,
    },
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Verified {
        bytes: u64,
    },
}

pub type DownloadProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Retry and timeout settings
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Failed transfer attempts tolerated before giving up
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for each further retry
    pub retry_base: Duration,
    pub probe_timeout: Duration,
    pub transfer_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base: Duration::from_millis(1500),
            probe_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(120),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl DownloadSettings {
    pub fn from_config(config: &HexstatConfig) -> Self {
        Self {
            max_attempts: config.download_attempts.max(1),
            retry_base: config.retry_base(),
            probe_timeout: config.probe_timeout(),
            transfer_timeout: config.transfer_timeout(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Delay before retry number `failures` (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(1u32 << exponent)
    }
}

/// Outcome of one HTTP transfer request
enum Transfer {
    /// The response body was fully written; carries the total size the
    /// response reported, if any
    Finished { total: Option<u64> },
    /// The partial file must be discarded and the transfer started over
    Restart(String),
}

// =============================================================================
// Downloader
// =============================================================================

pub struct ArchiveDownloader {
    work_dir: PathBuf,
    settings: DownloadSettings,
    probe_agent: ureq::Agent,
    transfer_agent: ureq::Agent,
    cancel: CancellationToken,
    progress: Option<DownloadProgressCallback>,
}

impl ArchiveDownloader {
    pub fn new(work_dir: impl Into<PathBuf>, settings: DownloadSettings) -> Self {
        let probe_agent = build_agent(settings.probe_timeout);
        let transfer_agent = build_agent(settings.transfer_timeout);
        Self {
            work_dir: work_dir.into(),
            settings,
            probe_agent,
            transfer_agent,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn from_config(config: &HexstatConfig) -> Self {
        Self::new(config.archive_dir(), DownloadSettings::from_config(config))
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, callback: DownloadProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Path of the partial file kept between attempts for a period
    pub fn part_path(&self, period: &str) -> PathBuf {
        self.work_dir.join(format!("{}.zip.part", period))
    }

    /// Download, verify and hand over the archive for one period
    pub fn download(&self, period: &str, url: &str) -> Result<Archive, DownloadError> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| DownloadError::io(&self.work_dir, e))?;
        self.check_cancelled()?;

        let part = self.part_path(period);
        let probe = match self.probe(period, url) {
            Ok(probe) => probe,
            Err(e) => {
                if e.is_not_found() {
                    remove_quietly(&part);
                }
                return Err(e);
            }
        };
        self.emit(DownloadProgress::Probed {
            total: probe.content_length,
            resumable: probe.accepts_ranges,
        });

        let mut expected = probe.checksum.clone();
        let mut total = probe.content_length;
        let mut failures = 0u32;
        let mut restarts = 0u32;

        loop {
            self.check_cancelled()?;

            let existing = file_len(&part)?;
            let offset = match plan_resume(existing, &probe) {
                ResumePlan::AlreadyComplete => {
                    info!("{}: partial file already complete ({} bytes)", period, existing);
                    break;
                }
                ResumePlan::Resume(offset) => {
                    info!("{}: resuming download at byte {}", period, offset);
                    self.emit(DownloadProgress::Resuming { offset });
                    offset
                }
                ResumePlan::Fresh => {
                    if existing > 0 {
                        info!(
                            "{}: discarding {} partial bytes, server cannot resume",
                            period, existing
                        );
                        remove_file(&part)?;
                    }
                    0
                }
            };

            let result = self.transfer(period, url, &part, offset, &mut expected);
            let err = match result {
                Ok(Transfer::Finished { total: reported }) => {
                    if total.is_none() {
                        total = reported;
                    }
                    let actual = file_len(&part)?;
                    match total {
                        Some(expected_len) if actual > expected_len => {
                            remove_quietly(&part);
                            return Err(DownloadError::SizeMismatch {
                                expected: expected_len,
                                actual,
                            });
                        }
                        Some(expected_len) if actual < expected_len => {
                            DownloadError::SizeMismatch {
                                expected: expected_len,
                                actual,
                            }
                        }
                        _ => break,
                    }
                }
                Ok(Transfer::Restart(reason)) => {
                    restarts += 1;
                    remove_file(&part)?;
                    if restarts > MAX_RESTARTS {
                        return Err(DownloadError::Transport(format!(
                            "gave up after {} restarts: {}",
                            MAX_RESTARTS, reason
                        )));
                    }
                    warn!("{}: restarting download from zero: {}", period, reason);
                    self.emit(DownloadProgress::Restarting { reason });
                    continue;
                }
                Err(e) => e,
            };

            // A short body can be resumed like a dropped connection.
            let retryable =
                err.is_transient() || matches!(err, DownloadError::SizeMismatch { .. });
            if err.is_not_found() {
                remove_quietly(&part);
            }
            if !retryable {
                return Err(err);
            }

            failures += 1;
            if failures >= self.settings.max_attempts {
                warn!(
                    "{}: giving up after {} failed attempts: {}",
                    period, failures, err
                );
                return Err(err);
            }
            let delay = self.settings.backoff(failures);
            warn!(
                "{}: attempt {} failed ({}), retrying in {:?}",
                period, failures, err, delay
            );
            self.emit(DownloadProgress::Retrying {
                attempt: failures,
                delay,
                error: err.to_string(),
            });
            self.sleep(delay)?;
        }

        self.finalize(period, url, &part, &expected)
    }

    fn probe(&self, period: &str, url: &str) -> Result<ArchiveProbe, DownloadError> {
        let response = match self.probe_agent.head(url).call() {
            Ok(response) => response,
            Err(e) => {
                let err = classify_ureq_error(e);
                if matches!(err, DownloadError::InvalidUrl(_)) {
                    return Err(err);
                }
                warn!("{}: metadata probe failed ({}), continuing without it", period, err);
                return Ok(ArchiveProbe::default());
            }
        };

        let status = response.status().as_u16();
        if status == 404 {
            return Err(DownloadError::ArchiveNotFound {
                period: period.to_string(),
            });
        }
        if !(200..300).contains(&status) {
            warn!(
                "{}: metadata probe returned HTTP {}, continuing without it",
                period, status
            );
            return Ok(ArchiveProbe::default());
        }

        let headers = header_pairs(response.headers());
        let probe = ArchiveProbe::from_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        debug!(
            "{}: probe reports ranges={} length={:?} sha256={} md5={}",
            period,
            probe.accepts_ranges,
            probe.content_length,
            probe.checksum.sha256.is_some(),
            probe.checksum.md5.is_some()
        );
        Ok(probe)
    }

    fn transfer(
        &self,
        period: &str,
        url: &str,
        part: &Path,
        offset: u64,
        expected: &mut ExpectedChecksum,
    ) -> Result<Transfer, DownloadError> {
        let mut request = self
            .transfer_agent
            .get(url)
            .header("Accept-Encoding", "identity");
        if offset > 0 {
            request = request.header("Range", format!("bytes={}-", offset));
        }
        let mut response = request.call().map_err(classify_ureq_error)?;

        let status = response.status().as_u16();
        let headers = header_pairs(response.headers());
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        let content_length = header("content-length").and_then(|v| v.trim().parse::<u64>().ok());

        let (append, reported_total) = match status {
            200 => {
                if offset > 0 {
                    warn!("{}: server ignored the range request, rewriting from zero", period);
                    self.emit(DownloadProgress::Restarting {
                        reason: "server ignored range request".to_string(),
                    });
                }
                // A full response describes the whole object, so its checksum
                // headers are usable.
                expected.merge(ExpectedChecksum::from_headers(
                    headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                ));
                (false, content_length.filter(|len| *len > 0))
            }
            206 => {
                let range = header("content-range").and_then(|v| ContentRange::parse(&v));
                match range {
                    Some(range) if range.start == offset => (
                        offset > 0,
                        range
                            .total
                            .or_else(|| content_length.map(|len| offset + len)),
                    ),
                    Some(range) => {
                        return Ok(Transfer::Restart(format!(
                            "server answered from byte {} instead of {}",
                            range.start, offset
                        )))
                    }
                    None => {
                        return Ok(Transfer::Restart(
                            "partial response without a usable Content-Range".to_string(),
                        ))
                    }
                }
            }
            416 if offset > 0 => {
                return Ok(Transfer::Restart("range not satisfiable".to_string()));
            }
            404 => {
                return Err(DownloadError::ArchiveNotFound {
                    period: period.to_string(),
                })
            }
            other => {
                return Err(DownloadError::UnexpectedStatus {
                    status: other,
                    url: url.to_string(),
                })
            }
        };

        let mut file = if append {
            OpenOptions::new()
                .append(true)
                .open(part)
                .map_err(|e| DownloadError::io(part, e))?
        } else {
            File::create(part).map_err(|e| DownloadError::io(part, e))?
        };

        let mut received = if append { offset } else { 0 };
        let mut reader = response.body_mut().as_reader();
        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];

        loop {
            self.check_cancelled()?;
            let n = read_chunk(&mut reader, &mut buf)
                .map_err(|e| DownloadError::Transport(format!("body read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| DownloadError::io(part, e))?;
            received += n as u64;
            self.emit(DownloadProgress::Received {
                bytes: received,
                total: reported_total,
            });
        }
        file.flush().map_err(|e| DownloadError::io(part, e))?;

        Ok(Transfer::Finished {
            total: reported_total,
        })
    }

    fn finalize(
        &self,
        period: &str,
        url: &str,
        part: &Path,
        expected: &ExpectedChecksum,
    ) -> Result<Archive, DownloadError> {
        let digests = digest_file(part).map_err(|e| DownloadError::io(part, e))?;

        if let Some(sha256) = &expected.sha256 {
            if !verify::digests_match(&digests.sha256, sha256) {
                remove_quietly(part);
                return Err(DownloadError::ChecksumMismatch { algorithm: "sha256" });
            }
            info!("{}: sha256 verified", period);
        } else if let Some(md5) = &expected.md5 {
            if !verify::digests_match(&digests.md5, md5) {
                remove_quietly(part);
                return Err(DownloadError::ChecksumMismatch { algorithm: "md5" });
            }
            info!("{}: md5 verified", period);
        } else {
            debug!("{}: no published checksum to compare against", period);
        }

        match validate_zip(part) {
            Ok(entries) => debug!("{}: archive holds {} entries", period, entries),
            Err(e) => {
                remove_quietly(part);
                return Err(DownloadError::CorruptArchive(e));
            }
        }

        let final_path = self
            .work_dir
            .join(format!("{}.{}.zip", period, uuid::Uuid::new_v4()));
        std::fs::rename(part, &final_path).map_err(|e| DownloadError::io(part, e))?;

        self.emit(DownloadProgress::Verified {
            bytes: digests.bytes,
        });
        info!(
            "{}: downloaded {} bytes from {}",
            period, digests.bytes, url
        );

        Ok(Archive {
            path: final_path,
            bytes: digests.bytes,
            checksum: digests.sha256_hex(),
            source_url: url.to_string(),
        })
    }

    fn check_cancelled(&self) -> Result<(), DownloadError> {
        if self.cancel.is_cancelled() {
            Err(DownloadError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn sleep(&self, delay: Duration) -> Result<(), DownloadError> {
        let step = Duration::from_millis(50);
        let mut remaining = delay;
        while !remaining.is_zero() {
            self.check_cancelled()?;
            let slice = remaining.min(step);
            std::thread::sleep(slice);
            remaining -= slice;
        }
        self.check_cancelled()
    }

    fn emit(&self, event: DownloadProgress) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    ureq::Agent::new_with_config(config)
}

fn classify_ureq_error(e: ureq::Error) -> DownloadError {
    match e {
        ureq::Error::BadUri(msg) => DownloadError::InvalidUrl(msg),
        other => DownloadError::Transport(other.to_string()),
    }
}

fn header_pairs(headers: &ureq::http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Fill as much of `buf` as the body provides before returning
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn file_len(path: &Path) -> Result<u64, DownloadError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

fn remove_file(path: &Path) -> Result<(), DownloadError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = remove_file(path) {
        warn!("{}", e);
    }
}

// =============================================================================
// Tests
// =============================================================================
