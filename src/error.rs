//! Error taxonomy for the ingestion pipeline
//!
//! Storage and configuration plumbing uses `anyhow` throughout the crate. The
//! types here exist where callers need to branch on the failure: the
//! orchestrator retries a `DownloadError` but waits on an `ArchiveNotFound`,
//! and an unreachable indexing backend is handled differently from bad input.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure of the hex indexing backend
#[derive(Debug, Error)]
pub enum IndexingError {
    /// The backend could not be reached or did not answer; retrying may help
    #[error("hex indexing backend unavailable: {0}")]
    Unavailable(String),

    /// The input or the backend's output was malformed; retrying will not help
    #[error("malformed hex indexing data: {0}")]
    Malformed(String),
}

impl IndexingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexingError::Unavailable(_))
    }
}

/// Failure while fetching or validating an archive
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Nothing has been published for the period yet (HTTP 404)
    #[error("no archive published for period {period}")]
    ArchiveNotFound { period: String },

    #[error("transport failure: {0}")]
    Transport(String),

    /// The archive URL could not be used at all; retrying will not help
    #[error("invalid archive URL: {0}")]
    InvalidUrl(String),

    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("{algorithm} checksum mismatch")]
    ChecksumMismatch { algorithm: &'static str },

    #[error("corrupt archive container: {0}")]
    CorruptArchive(String),

    #[error("download cancelled")]
    Cancelled,

    /// Displays only the file name of `path`
    #[error("I/O failure on {}: {source}", file_label(path))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DownloadError::ArchiveNotFound { .. })
    }

    /// Whether another attempt within the same download call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Transport(_) => true,
            DownloadError::UnexpectedStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Io {
            path: path.into(),
            source,
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<path>".to_string())
}

/// Failure of a single-period ingestion run
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Indexing(#[from] IndexingError),

    /// The downloaded archive could not be opened or read
    #[error("archive read failed: {0}")]
    Archive(String),

    #[error("storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("invalid period '{0}', expected YYYY-MM")]
    InvalidPeriod(String),

    #[error("ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Download(DownloadError::ArchiveNotFound { .. }) => {
                FailureKind::ArchiveNotFound
            }
            IngestError::Download(DownloadError::Cancelled) | IngestError::Cancelled => {
                FailureKind::Cancelled
            }
            IngestError::Download(_) => FailureKind::Download,
            IngestError::Indexing(_) => FailureKind::Indexing,
            IngestError::Archive(_) => FailureKind::Archive,
            IngestError::Storage(_) => FailureKind::Storage,
            IngestError::InvalidPeriod(_) => FailureKind::InvalidPeriod,
        }
    }

    /// Message safe to show outside the process (filesystem paths removed)
    pub fn public_message(&self) -> String {
        redact_paths(&self.to_string())
    }
}

/// Coarse failure classification persisted with a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ArchiveNotFound,
    Download,
    Indexing,
    Archive,
    Storage,
    InvalidPeriod,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ArchiveNotFound => "archive_not_found",
            FailureKind::Download => "download",
            FailureKind::Indexing => "indexing",
            FailureKind::Archive => "archive",
            FailureKind::Storage => "storage",
            FailureKind::InvalidPeriod => "invalid_period",
            FailureKind::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<FailureKind> {
        match s {
            "archive_not_found" => Some(FailureKind::ArchiveNotFound),
            "download" => Some(FailureKind::Download),
            "indexing" => Some(FailureKind::Indexing),
            "archive" => Some(FailureKind::Archive),
            "storage" => Some(FailureKind::Storage),
            "invalid_period" => Some(FailureKind::InvalidPeriod),
            "cancelled" => Some(FailureKind::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replace absolute filesystem paths in a message with `<path>`
///
/// A path starts at a word beginning with `/`, `~/` or a Windows drive prefix
/// such as `C:\`. It may contain spaces and runs to its closing quote when
/// quoted, otherwise to the next `: `, `, `, `; ` or ` (` or the end of the
/// message. Trailing punctuation is kept.
pub fn redact_paths(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;

    while !rest.is_empty() {
        let token_end = rest.find(' ').unwrap_or(rest.len());
        let token = &rest[..token_end];
        let lead_len = token
            .find(|c: char| !is_opening(c))
            .unwrap_or(token.len());

        if !looks_like_path(trim_trailing(&token[lead_len..])) {
            out.push_str(token);
            if token_end < rest.len() {
                out.push(' ');
                rest = &rest[token_end + 1..];
            } else {
                rest = "";
            }
            continue;
        }

        let lead = &token[..lead_len];
        let after = &rest[lead_len..];
        let quote = lead.chars().rev().find(|c| matches!(*c, '"' | '\'' | '`'));
        let extent = match quote {
            Some(q) => after.find(q).unwrap_or(after.len()),
            None => [": ", ", ", "; ", " ("]
                .iter()
                .filter_map(|delim| after.find(delim))
                .min()
                .unwrap_or(after.len()),
        };
        let body = &after[..extent];
        let kept = trim_trailing(body);

        out.push_str(lead);
        out.push_str("<path>");
        out.push_str(&body[kept.len()..]);
        rest = &after[extent..];
    }
    out
}

fn is_opening(c: char) -> bool {
    matches!(c, '"' | '\'' | '(' | '[' | '`')
}

fn trim_trailing(s: &str) -> &str {
    s.trim_end_matches(|c: char| matches!(c, '"' | '\'' | ')' | ']' | '`' | ':' | ',' | ';' | '.'))
}

fn looks_like_path(s: &str) -> bool {
    if s.starts_with("//") {
        // URL remnants such as "//host/x" after a scheme split
        return false;
    }
    if s.starts_with('/') && s.len() > 1 {
        return true;
    }
    if s.starts_with("~/") {
        return true;
    }
    let bytes = s.as_bytes();
    bytes.len() > 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}
