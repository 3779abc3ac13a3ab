//! Metadata probe results and resume planning

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

/// Headers that may carry a SHA-256 of the full object, in preference order
const SHA256_HEADERS: [&str; 3] = ["x-checksum-sha256", "x-amz-checksum-sha256", "x-sha256"];

/// Checksums published by the server for the full archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedChecksum {
    pub sha256: Option<[u8; 32]>,
    pub md5: Option<[u8; 16]>,
}

impl ExpectedChecksum {
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut sha256_candidates: Vec<(usize, [u8; 32])> = Vec::new();
        let mut md5 = None;

        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if let Some(rank) = SHA256_HEADERS.iter().position(|h| *h == name) {
                if let Some(digest) = decode_digest::<32>(value) {
                    sha256_candidates.push((rank, digest));
                }
            } else if name == "content-md5" {
                md5 = md5.or_else(|| decode_digest::<16>(value));
            }
        }

        sha256_candidates.sort_by_key(|(rank, _)| *rank);
        Self {
            sha256: sha256_candidates.first().map(|(_, d)| *d),
            md5,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sha256.is_none() && self.md5.is_none()
    }

    /// Fill in whatever `self` is missing from `other`
    pub fn merge(&mut self, other: ExpectedChecksum) {
        if self.sha256.is_none() {
            self.sha256 = other.sha256;
        }
        if self.md5.is_none() {
            self.md5 = other.md5;
        }
    }
}

/// What the HEAD probe learned about an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveProbe {
    pub accepts_ranges: bool,
    /// Total size in bytes; a reported length of zero is treated as unknown
    pub content_length: Option<u64>,
    pub checksum: ExpectedChecksum,
}

impl ArchiveProbe {
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)> + Clone,
    {
        let mut accepts_ranges = false;
        let mut content_length = None;

        for (name, value) in headers.clone() {
            match name.to_ascii_lowercase().as_str() {
                "accept-ranges" => {
                    accepts_ranges = value
                        .split(',')
                        .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"));
                }
                "content-length" => {
                    content_length = value.trim().parse::<u64>().ok().filter(|len| *len > 0);
                }
                _ => {}
            }
        }

        Self {
            accepts_ranges,
            content_length,
            checksum: ExpectedChecksum::from_headers(headers),
        }
    }
}

/// How the next transfer should start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResumePlan {
    /// Discard any partial bytes and request the whole archive
    Fresh,
    /// Request the remaining bytes from this offset
    Resume(u64),
    /// The partial file already holds every expected byte
    AlreadyComplete,
}

/// Decide whether a partial file left by an earlier attempt can be reused
pub fn plan_resume(existing_len: u64, probe: &ArchiveProbe) -> ResumePlan {
    if existing_len == 0 || !probe.accepts_ranges {
        return ResumePlan::Fresh;
    }
    match probe.content_length {
        Some(total) if existing_len > total => ResumePlan::Fresh,
        Some(total) if existing_len == total => ResumePlan::AlreadyComplete,
        _ => ResumePlan::Resume(existing_len),
    }
}

/// Parsed `Content-Range: bytes start-end/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = spec.split_once('/')?;
        let (start, end) = range.trim().split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self { start, end, total })
    }
}

/// Decode a digest published as hex or base64
fn decode_digest<const N: usize>(value: &str) -> Option<[u8; N]> {
    let value = value.trim().trim_matches('"');
    let bytes = if value.len() == N * 2 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(value).ok()?
    } else {
        STANDARD.decode(value).ok()?
    };
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO_SHA_HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const HELLO_SHA_B64: &str = "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=";
    // md5("hello world")
    const HELLO_MD5_B64: &str = "XrY7u+Ae7tCTyyK7j1rNww==";

    #[test]
    fn test_probe_from_headers() {
        let probe = ArchiveProbe::from_headers(vec![
            ("Accept-Ranges", "bytes"),
            ("Content-Length", "1048576"),
            ("X-Checksum-Sha256", HELLO_SHA_HEX),
            ("Content-MD5", HELLO_MD5_B64),
        ]);
        assert!(probe.accepts_ranges);
        assert_eq!(probe.content_length, Some(1048576));
        assert_eq!(
            hex::encode(probe.checksum.sha256.unwrap()),
            HELLO_SHA_HEX
        );
        assert!(probe.checksum.md5.is_some());
    }

    #[test]
    fn test_probe_defaults() {
        let probe = ArchiveProbe::from_headers(vec![
            ("accept-ranges", "none"),
            ("content-length", "0"),
            ("content-md5", "garbage"),
        ]);
        assert!(!probe.accepts_ranges);
        assert_eq!(probe.content_length, None);
        assert!(probe.checksum.is_empty());
    }

    #[test]
    fn test_base64_and_hex_sha256_agree() {
        let hex_form = ExpectedChecksum::from_headers(vec![("x-checksum-sha256", HELLO_SHA_HEX)]);
        let b64_form =
            ExpectedChecksum::from_headers(vec![("x-amz-checksum-sha256", HELLO_SHA_B64)]);
        assert_eq!(hex_form.sha256, b64_form.sha256);
        assert!(hex_form.sha256.is_some());
    }

    #[test]
    fn test_checksum_merge_keeps_existing() {
        let mut probe = ExpectedChecksum::from_headers(vec![("x-checksum-sha256", HELLO_SHA_HEX)]);
        probe.merge(ExpectedChecksum {
            sha256: Some([0u8; 32]),
            md5: Some([1u8; 16]),
        });
        assert_eq!(hex::encode(probe.sha256.unwrap()), HELLO_SHA_HEX);
        assert_eq!(probe.md5, Some([1u8; 16]));
    }

    #[test]
    fn test_plan_resume() {
        let resumable = ArchiveProbe {
            accepts_ranges: true,
            content_length: Some(100),
            checksum: ExpectedChecksum::default(),
        };
        assert_eq!(plan_resume(0, &resumable), ResumePlan::Fresh);
        assert_eq!(plan_resume(40, &resumable), ResumePlan::Resume(40));
        assert_eq!(plan_resume(100, &resumable), ResumePlan::AlreadyComplete);
        assert_eq!(plan_resume(150, &resumable), ResumePlan::Fresh);

        let no_ranges = ArchiveProbe {
            accepts_ranges: false,
            ..resumable.clone()
        };
        assert_eq!(plan_resume(40, &no_ranges), ResumePlan::Fresh);

        let unknown_size = ArchiveProbe {
            content_length: None,
            ..resumable
        };
        assert_eq!(plan_resume(40, &unknown_size), ResumePlan::Resume(40));
    }

    #[test]
    fn test_content_range_parse() {
        assert_eq!(
            ContentRange::parse("bytes 100-199/1000"),
            Some(ContentRange {
                start: 100,
                end: 199,
                total: Some(1000)
            })
        );
        assert_eq!(
            ContentRange::parse("bytes 0-9/*").map(|r| r.total),
            Some(None)
        );
        assert_eq!(ContentRange::parse("bytes */1000"), None);
        assert_eq!(ContentRange::parse("items 0-9/10"), None);
        assert_eq!(ContentRange::parse("bytes 9-0/10"), None);
    }
}
