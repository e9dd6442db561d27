//! Discovery and classification of builder outputs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use imgforge_domain::ArtifactKind;

use crate::util::sha256_file;

/// Files smaller than this are treated as stubs, not images.
const MIN_IMAGE_BYTES: u64 = 1024;

/// One discovered output before persistence.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredArtifact {
    pub filename: String,
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub kind: ArtifactKind,
    pub labels: Vec<String>,
}

/// Suffix-based classification. Conservative: anything ambiguous is `other`.
#[must_use]
pub fn classify(filename: &str) -> ArtifactKind {
    let name = filename.to_ascii_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| name.contains(p));

    if has(&["-sysupgrade.bin", "-sysupgrade.img.gz"]) {
        ArtifactKind::Sysupgrade
    } else if has(&["-initramfs-kernel.bin", "-initramfs.bin"]) {
        // Checked before factory: "-initramfs-kernel.bin" also matches the
        // factory patterns.
        ArtifactKind::Initramfs
    } else if has(&["-factory.bin", "-factory.img", "-kernel.bin"]) {
        // Bare kernel images install the factory way, so "-kernel.bin"
        // belongs to the factory set; the kernel kind is left to
        // uimage/vmlinux names.
        ArtifactKind::Factory
    } else if has(&["-kernel.bin", "-uimage", "-vmlinux"]) {
        ArtifactKind::Kernel
    } else if has(&["-rootfs.tar.gz", "-rootfs.squashfs", "-rootfs.ext4"]) {
        ArtifactKind::Rootfs
    } else if name.ends_with(".manifest") {
        ArtifactKind::Manifest
    } else {
        ArtifactKind::Other
    }
}

fn labels_for(kind: ArtifactKind) -> Vec<String> {
    match kind {
        ArtifactKind::Sysupgrade => vec!["for-flash".to_string()],
        ArtifactKind::Factory => vec!["for-factory-install".to_string()],
        _ => Vec::new(),
    }
}

fn wanted(path: &Path, size: u64) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".manifest") {
        return true;
    }
    let binary = [".bin", ".img", ".img.gz", ".tar", ".tar.gz", ".squashfs", ".ext4"]
        .iter()
        .any(|ext| name.ends_with(ext));
    binary && size >= MIN_IMAGE_BYTES
}

/// Walks a bin directory, fingerprinting every recognized output. Paths are
/// recorded relative to `relative_root` when the output sits under it.
pub fn discover(bin_dir: &Path, relative_root: &Path) -> Result<Vec<DiscoveredArtifact>> {
    if !bin_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(bin_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", bin_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata()?;
        if !wanted(entry.path(), meta.len()) {
            debug!(path = %entry.path().display(), "skipping non-artifact file");
            continue;
        }

        let filename = entry.file_name().to_string_lossy().into_owned();
        let kind = classify(&filename);
        let sha256 = sha256_file(entry.path())?;
        let relative_path = entry
            .path()
            .strip_prefix(relative_root)
            .unwrap_or_else(|_| Path::new(&filename))
            .to_string_lossy()
            .into_owned();

        found.push(DiscoveredArtifact {
            labels: labels_for(kind),
            filename,
            relative_path,
            size_bytes: meta.len(),
            sha256,
            kind,
        });
    }
    info!(count = found.len(), dir = %bin_dir.display(), "artifacts discovered");
    Ok(found)
}

/// Summary document written next to the outputs of a successful build.
#[derive(Debug, Serialize)]
pub struct BuildManifest<'a> {
    pub build_id: i64,
    pub profile_id: &'a str,
    pub cache_key: &'a str,
    pub inputs: &'a serde_json::Value,
    pub artifacts: &'a [DiscoveredArtifact],
}

pub fn write_manifest(manifest: &BuildManifest<'_>, path: &Path) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(manifest).context("manifest serialization")?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_the_documented_suffix_table() {
        assert_eq!(
            classify("openwrt-23.05.3-ath79-generic-tplink-squashfs-sysupgrade.bin"),
            ArtifactKind::Sysupgrade
        );
        assert_eq!(
            classify("openwrt-ath79-generic-tplink-initramfs-kernel.bin"),
            ArtifactKind::Initramfs
        );
        assert_eq!(
            classify("openwrt-ath79-generic-tplink-squashfs-factory.bin"),
            ArtifactKind::Factory
        );
        // Bare kernel images classify as factory installs.
        assert_eq!(
            classify("openwrt-ath79-generic-kernel.bin"),
            ArtifactKind::Factory
        );
        assert_eq!(classify("openwrt-ath79-generic-vmlinux"), ArtifactKind::Kernel);
        assert_eq!(classify("openwrt-ath79-generic-uimage"), ArtifactKind::Kernel);
        assert_eq!(
            classify("openwrt-ath79-generic-rootfs.squashfs"),
            ArtifactKind::Rootfs
        );
        assert_eq!(classify("openwrt-ath79-generic.manifest"), ArtifactKind::Manifest);
        assert_eq!(classify("sha256sums"), ArtifactKind::Other);
        assert_eq!(classify("config.buildinfo"), ArtifactKind::Other);
    }

    #[test]
    fn discovery_skips_stubs_and_hashes_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(bin.join("targets")).unwrap();

        let image = vec![0xA5u8; 4096];
        std::fs::write(bin.join("targets/fw-squashfs-sysupgrade.bin"), &image).unwrap();
        std::fs::write(bin.join("fw.manifest"), "kernel 6.1\n").unwrap();
        std::fs::write(bin.join("tiny-factory.bin"), b"too small").unwrap();
        std::fs::write(bin.join("notes.txt"), b"irrelevant").unwrap();

        let found = discover(&bin, tmp.path()).unwrap();
        assert_eq!(found.len(), 2);

        let sysupgrade = found
            .iter()
            .find(|a| a.kind == ArtifactKind::Sysupgrade)
            .unwrap();
        assert_eq!(sysupgrade.size_bytes, 4096);
        assert_eq!(sysupgrade.labels, vec!["for-flash"]);
        assert!(sysupgrade.relative_path.starts_with("bin/targets/"));
        assert_eq!(sysupgrade.sha256.len(), 64);

        assert!(found.iter().any(|a| a.kind == ArtifactKind::Manifest));
    }

    #[test]
    fn manifest_round_trips_as_json() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = vec![DiscoveredArtifact {
            filename: "fw-sysupgrade.bin".into(),
            relative_path: "x/fw-sysupgrade.bin".into(),
            size_bytes: 4096,
            sha256: "ab".repeat(32),
            kind: ArtifactKind::Sysupgrade,
            labels: vec!["for-flash".into()],
        }];
        let inputs = serde_json::json!({"schema_version": 1});
        let manifest = BuildManifest {
            build_id: 7,
            profile_id: "home.ap",
            cache_key: "sha256:00",
            inputs: &inputs,
            artifacts: &artifacts,
        };
        let path = tmp.path().join("manifest.json");
        write_manifest(&manifest, &path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["build_id"], 7);
        assert_eq!(parsed["artifacts"][0]["kind"], "sysupgrade");
    }
}
