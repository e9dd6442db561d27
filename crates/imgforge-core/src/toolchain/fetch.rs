//! Download, verification, and extraction of external builder archives.

use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use imgforge_domain::{CoreError, ErrorCode};

const USER_AGENT: &str = concat!("imgforge/", env!("CARGO_PKG_VERSION"));
const DOWNLOAD_ATTEMPTS: usize = 3;

/// Resolved upstream locations for one builder archive.
#[derive(Debug, Clone)]
pub struct BuilderUrls {
    pub archive_url: String,
    pub sha256sums_url: String,
    pub archive_filename: String,
}

/// Upstream layout: releases under `releases/<release>/targets/...`,
/// snapshots (release == "snapshot") under `snapshots/targets/...` with a
/// zstd archive instead of xz.
pub fn build_urls(base_url: &str, release: &str, target: &str, subtarget: &str) -> BuilderUrls {
    let (prefix, archive_filename) = if release.eq_ignore_ascii_case("snapshot") {
        (
            format!("{base_url}/snapshots/targets/{target}/{subtarget}"),
            format!("openwrt-imagebuilder-{target}-{subtarget}.Linux-x86_64.tar.zst"),
        )
    } else {
        (
            format!("{base_url}/releases/{release}/targets/{target}/{subtarget}"),
            format!("openwrt-imagebuilder-{release}-{target}-{subtarget}.Linux-x86_64.tar.xz"),
        )
    };
    BuilderUrls {
        archive_url: format!("{prefix}/{archive_filename}"),
        sha256sums_url: format!("{prefix}/sha256sums"),
        archive_filename,
    }
}

/// Finds the digest published for `filename` in a `sha256sums` document.
/// Tolerates comments, blank lines, and the `*` binary-mode marker.
pub fn parse_sha256sums(content: &str, filename: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((digest, name)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let name = name.trim().trim_start_matches('*');
        if name == filename {
            return Some(digest.to_ascii_lowercase());
        }
    }
    None
}

pub(super) fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("failed to build http client")
}

pub(super) fn fetch_checksums(
    client: &reqwest::blocking::Client,
    url: &str,
) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|err| {
            CoreError::new(
                ErrorCode::DownloadFailed,
                format!("failed to fetch checksums from {url}: {err}"),
            )
        })?;
    response.text().map_err(|err| {
        CoreError::new(
            ErrorCode::DownloadFailed,
            format!("failed to read checksums from {url}: {err}"),
        )
        .into()
    })
}

/// Streams `url` into `dest`, hashing as it goes. The expected digest, when
/// known, is enforced before the file is persisted.
pub(super) fn download_archive(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
) -> Result<(String, u64)> {
    let mut last_err = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match download_once(client, url, dest, expected_sha256) {
            Ok(done) => return Ok(done),
            Err(err) => {
                warn!(url, attempt, error = %err, "archive download attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}

fn download_once(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
) -> Result<(String, u64)> {
    let parent = dest
        .parent()
        .ok_or_else(|| CoreError::new(ErrorCode::Precondition, "archive path has no parent"))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut response = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|err| {
            CoreError::new(
                ErrorCode::DownloadFailed,
                format!("failed to fetch {url}: {err}"),
            )
        })?;

    let mut tmp = NamedTempFile::new_in(parent).context("failed to create download staging file")?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response.read(&mut buffer).map_err(|err| {
            CoreError::new(ErrorCode::DownloadFailed, format!("stream error for {url}: {err}"))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        tmp.write_all(&buffer[..read])
            .context("failed to write download staging file")?;
        written += read as u64;
    }

    let actual = hex::encode(hasher.finalize());
    if let Some(expected) = expected_sha256 {
        if actual != expected {
            return Err(CoreError::new(
                ErrorCode::DownloadFailed,
                format!("archive digest mismatch for {url}"),
            )
            .with_details(serde_json::json!({
                "expected": expected,
                "actual": actual,
            }))
            .into());
        }
    }

    tmp.persist(dest)
        .map_err(|err| anyhow::anyhow!("unable to persist archive download: {err}"))?;
    info!(url, bytes = written, sha256 = %actual, "archive downloaded");
    Ok((actual, written))
}

fn vet_entry_path(raw: &Path, archive: &Path) -> Result<()> {
    if raw.is_absolute() {
        return Err(CoreError::new(
            ErrorCode::Security,
            format!(
                "archive {} contains absolute entry {}",
                archive.display(),
                raw.display()
            ),
        )
        .into());
    }
    for component in raw.components() {
        if matches!(component, Component::ParentDir) {
            return Err(CoreError::new(
                ErrorCode::Security,
                format!(
                    "archive {} contains traversal entry {}",
                    archive.display(),
                    raw.display()
                ),
            )
            .into());
        }
    }
    Ok(())
}

/// Extracts a builder archive into `dest_dir` and returns the builder root.
/// gzip and plain tar are handled natively with per-entry vetting; xz and
/// zstd archives go through the system `tar` after a listing pass vets every
/// entry name.
pub(super) fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = fs::File::open(archive)
            .with_context(|| format!("failed to open {}", archive.display()))?;
        unpack_tar(Archive::new(GzDecoder::new(file)), archive, dest_dir)?;
    } else if name.ends_with(".tar") {
        let file = fs::File::open(archive)
            .with_context(|| format!("failed to open {}", archive.display()))?;
        unpack_tar(Archive::new(file), archive, dest_dir)?;
    } else if name.ends_with(".tar.xz") || name.ends_with(".tar.zst") {
        extract_with_system_tar(archive, dest_dir)?;
    } else {
        return Err(CoreError::new(
            ErrorCode::Validation,
            format!("unsupported archive format: {}", archive.display()),
        )
        .into());
    }

    Ok(find_builder_root(dest_dir))
}

fn unpack_tar<R: Read>(mut tar: Archive<R>, archive: &Path, dest_dir: &Path) -> Result<()> {
    for entry in tar.entries().context("failed to read archive entries")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let raw = entry.path().context("archive entry has an unreadable path")?;
        vet_entry_path(&raw, archive)?;
        if let Some(link) = entry.link_name().context("unreadable link target")? {
            // Absolute link targets would escape the extraction root once the
            // tree is used in place.
            if link.is_absolute() {
                return Err(CoreError::new(
                    ErrorCode::Security,
                    format!(
                        "archive {} entry {} links to absolute path {}",
                        archive.display(),
                        raw.display(),
                        link.display()
                    ),
                )
                .into());
            }
        }
        let unpacked = entry
            .unpack_in(dest_dir)
            .with_context(|| format!("failed to extract {}", archive.display()))?;
        if !unpacked {
            return Err(CoreError::new(
                ErrorCode::Security,
                format!("archive {} entry escaped the extraction root", archive.display()),
            )
            .into());
        }
    }
    Ok(())
}

fn extract_with_system_tar(archive: &Path, dest_dir: &Path) -> Result<()> {
    let listing = Command::new("tar")
        .arg("-tf")
        .arg(archive)
        .output()
        .context("failed to run tar -tf")?;
    if !listing.status.success() {
        return Err(CoreError::new(
            ErrorCode::DownloadFailed,
            format!(
                "tar listing failed for {}: {}",
                archive.display(),
                String::from_utf8_lossy(&listing.stderr).trim()
            ),
        )
        .into());
    }
    for line in String::from_utf8_lossy(&listing.stdout).lines() {
        if line.is_empty() {
            continue;
        }
        vet_entry_path(Path::new(line), archive)?;
    }

    debug!(archive = %archive.display(), dest = %dest_dir.display(), "extracting via system tar");
    let status = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest_dir)
        .status()
        .context("failed to run tar -xf")?;
    if !status.success() {
        return Err(CoreError::new(
            ErrorCode::DownloadFailed,
            format!("extraction failed for {}", archive.display()),
        )
        .into());
    }
    Ok(())
}

/// The archive normally contains a single top-level directory; fall back to
/// the extraction dir when the layout is flat.
fn find_builder_root(dest_dir: &Path) -> PathBuf {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dest_dir)
        .ok()
        .into_iter()
        .flatten()
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.path())
        .collect();
    dirs.sort();
    if let Some(root) = dirs.iter().find(|d| {
        d.file_name()
            .map(|n| n.to_string_lossy().contains("imagebuilder"))
            .unwrap_or(false)
    }) {
        return root.clone();
    }
    if dirs.len() == 1 {
        return dirs.remove(0);
    }
    dest_dir.to_path_buf()
}

/// A usable builder root carries the entry Makefile and the target/packages
/// trees.
pub fn validate_builder_root(root: &Path) -> bool {
    root.is_dir()
        && root.join("Makefile").is_file()
        && root.join("target").is_dir()
        && root.join("packages").is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_and_snapshot_urls_differ_in_layout() {
        let release = build_urls("https://mirror.example", "23.05.3", "ath79", "generic");
        assert_eq!(
            release.archive_url,
            "https://mirror.example/releases/23.05.3/targets/ath79/generic/openwrt-imagebuilder-23.05.3-ath79-generic.Linux-x86_64.tar.xz"
        );
        assert_eq!(
            release.sha256sums_url,
            "https://mirror.example/releases/23.05.3/targets/ath79/generic/sha256sums"
        );

        let snapshot = build_urls("https://mirror.example", "snapshot", "ath79", "generic");
        assert!(snapshot.archive_url.contains("/snapshots/targets/"));
        assert!(snapshot.archive_filename.ends_with(".tar.zst"));
    }

    #[test]
    fn sha256sums_parsing_handles_markers_and_comments() {
        let content = "\
# comment line
aabbcc *openwrt-imagebuilder-23.05.3-ath79-generic.Linux-x86_64.tar.xz
ddeeff other-file.bin
";
        assert_eq!(
            parse_sha256sums(content, "openwrt-imagebuilder-23.05.3-ath79-generic.Linux-x86_64.tar.xz"),
            Some("aabbcc".to_string())
        );
        assert_eq!(parse_sha256sums(content, "other-file.bin"), Some("ddeeff".into()));
        assert_eq!(parse_sha256sums(content, "missing.bin"), None);
    }

    #[test]
    fn traversal_entries_are_security_errors() {
        let archive = Path::new("/tmp/a.tar.gz");
        assert!(vet_entry_path(Path::new("ok/file"), archive).is_ok());
        let err = vet_entry_path(Path::new("../escape"), archive).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoreError>().unwrap().code,
            ErrorCode::Security
        );
        let err = vet_entry_path(Path::new("/abs/path"), archive).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoreError>().unwrap().code,
            ErrorCode::Security
        );
    }

    #[test]
    fn gzip_archive_round_trips_through_native_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let src_root = tmp.path().join("openwrt-imagebuilder-test");
        fs::create_dir_all(src_root.join("target")).unwrap();
        fs::create_dir_all(src_root.join("packages")).unwrap();
        fs::write(src_root.join("Makefile"), "all:\n").unwrap();

        let archive_path = tmp.path().join("builder.tar.gz");
        let file = fs::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all("openwrt-imagebuilder-test", &src_root)
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = tmp.path().join("extracted");
        let root = extract_archive(&archive_path, &dest).unwrap();
        assert!(root.file_name().unwrap().to_string_lossy().contains("imagebuilder"));
        assert!(validate_builder_root(&root));
    }

    #[test]
    fn unsupported_archive_format_is_a_validation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("builder.rar");
        fs::write(&archive, b"not an archive").unwrap();
        let err = extract_archive(&archive, &tmp.path().join("out")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoreError>().unwrap().code,
            ErrorCode::Validation
        );
    }
}
