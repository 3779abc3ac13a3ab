//! Integrity checks applied to a finished transfer

use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use subtle::ConstantTimeEq;

const READ_BUFFER: usize = 64 * 1024;

/// Digests of a file computed in a single pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub bytes: u64,
    pub sha256: [u8; 32],
    pub md5: [u8; 16],
}

impl FileDigests {
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

pub fn digest_file(path: &Path) -> std::io::Result<FileDigests> {
    let mut file = File::open(path)?;
    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut bytes = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        md5.update(&buf[..n]);
        bytes += n as u64;
    }

    Ok(FileDigests {
        bytes,
        sha256: sha256.finalize().into(),
        md5: md5.finalize().into(),
    })
}

/// Constant-time digest comparison
pub fn digests_match(actual: &[u8], expected: &[u8]) -> bool {
    bool::from(actual.ct_eq(expected))
}

/// Check the ZIP central directory and every entry header
///
/// Returns the number of entries.
pub fn validate_zip(path: &Path) -> Result<usize, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
    if archive.is_empty() {
        return Err("archive has no entries".to_string());
    }
    for i in 0..archive.len() {
        archive.by_index_raw(i).map_err(|e| e.to_string())?;
    }
    Ok(archive.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::zip_bytes;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn test_digest_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "hello.txt", b"hello world");
        let digests = digest_file(&path).unwrap();
        assert_eq!(digests.bytes, 11);
        assert_eq!(
            digests.sha256_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(hex::encode(digests.md5), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_digests_match() {
        assert!(digests_match(&[1, 2, 3], &[1, 2, 3]));
        assert!(!digests_match(&[1, 2, 3], &[1, 2, 4]));
        assert!(!digests_match(&[1, 2, 3], &[1, 2]));
    }

    #[test]
    fn test_validate_zip() {
        let dir = TempDir::new().unwrap();
        let good = write(
            &dir,
            "good.zip",
            &zip_bytes(&[("2024-01/2024-01-city-street.csv", "Month\n2024-01\n")]),
        );
        assert_eq!(validate_zip(&good).unwrap(), 1);

        let bad = write(&dir, "bad.zip", b"definitely not a zip archive");
        assert!(validate_zip(&bad).is_err());

        let mut truncated = zip_bytes(&[("a.csv", "Month\n2024-01\n")]);
        truncated.truncate(truncated.len() - 10);
        let truncated = write(&dir, "truncated.zip", &truncated);
        assert!(validate_zip(&truncated).is_err());

        let empty = write(&dir, "empty.zip", &zip_bytes(&[]));
        assert!(validate_zip(&empty).is_err());
    }
}
