use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Streaming SHA-256 of a whole file.
pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("read error on {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of at most the leading `max_bytes` of a file. Returns the digest
/// and the number of bytes actually hashed.
pub(crate) fn sha256_file_prefix(path: &Path, max_bytes: u64) -> Result<(String, u64)> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut remaining = max_bytes;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file
            .read(&mut buf[..want])
            .with_context(|| format!("read error on {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }
    Ok((hex::encode(hasher.finalize()), max_bytes - remaining))
}

/// Current time as unix seconds.
pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Filesystem-safe short form of a cache key for lock and directory names.
pub(crate) fn safe_key_fragment(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn prefix_hash_matches_full_hash_for_short_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"imgforge").unwrap();
        drop(f);

        let full = sha256_file(&path).unwrap();
        let (prefix, hashed) = sha256_file_prefix(&path, 1024).unwrap();
        assert_eq!(prefix, full);
        assert_eq!(hashed, 8);

        let (short, hashed) = sha256_file_prefix(&path, 3).unwrap();
        assert_ne!(short, full);
        assert_eq!(hashed, 3);
    }

    #[test]
    fn key_fragment_is_filesystem_safe() {
        let fragment = safe_key_fragment("sha256:ab/cd:ef");
        assert!(fragment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert!(fragment.len() <= 64);
    }
}
