//! Overlay staging: materialize a profile's file overlays into the directory
//! tree handed to the external builder, and hash that tree.
//!
//! Later overlays may overwrite earlier ones; that is the intended layering
//! policy, not an error.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use imgforge_domain::{CoreError, ErrorCode, Profile};

/// Stages overlay content under `workdir` and returns the staged path with
/// its content hash. The staging directory is exclusively owned by one build.
pub fn stage(profile: &Profile, workdir: &Path, base_path: &Path) -> Result<(PathBuf, String)> {
    let staging = workdir.join("files");
    fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;
    let staging = staging
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", staging.display()))?;
    let base = base_path
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", base_path.display()))?;

    if let Some(overlay_dir) = &profile.overlay_dir {
        let source = resolve_within(&base, Path::new(overlay_dir), "overlay_dir")?;
        if !source.is_dir() {
            return Err(CoreError::new(
                ErrorCode::Precondition,
                format!("overlay directory {} does not exist", source.display()),
            )
            .into());
        }
        copy_tree(&source, &staging)?;
    }

    for overlay in &profile.files {
        let source = resolve_within(&base, Path::new(&overlay.source), "overlay source")?;
        if !source.is_file() {
            return Err(CoreError::new(
                ErrorCode::Precondition,
                format!("overlay source {} does not exist", source.display()),
            )
            .into());
        }

        let dest = destination_in_staging(&staging, &overlay.destination)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(&source, &dest).with_context(|| {
            format!("failed to copy {} to {}", source.display(), dest.display())
        })?;

        if let Some(bits) = overlay.mode_bits()? {
            fs::set_permissions(&dest, fs::Permissions::from_mode(bits))
                .with_context(|| format!("failed to chmod {}", dest.display()))?;
        }
        apply_owner(overlay, &dest)?;
        debug!(
            source = %source.display(),
            dest = %dest.display(),
            "staged overlay file"
        );
    }

    let tree_hash = tree_hash(&staging)?;
    Ok((staging, tree_hash))
}

/// Resolves `relative` under `base` and refuses results that escape it.
fn resolve_within(base: &Path, relative: &Path, what: &str) -> Result<PathBuf> {
    let joined = if relative.is_absolute() {
        relative.to_path_buf()
    } else {
        base.join(relative)
    };
    let resolved = joined
        .canonicalize()
        .with_context(|| format!("{what} {} cannot be resolved", joined.display()))?;
    if !resolved.starts_with(base) {
        return Err(CoreError::new(
            ErrorCode::Precondition,
            format!(
                "{what} {} resolves outside {}",
                relative.display(),
                base.display()
            ),
        )
        .into());
    }
    Ok(resolved)
}

/// Maps an absolute in-image destination onto the staging root, refusing any
/// traversal component.
fn destination_in_staging(staging: &Path, destination: &str) -> Result<PathBuf> {
    let rel = destination.trim_start_matches('/');
    let rel_path = Path::new(rel);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(CoreError::new(
                    ErrorCode::Precondition,
                    format!("overlay destination '{destination}' escapes the staging root"),
                )
                .into());
            }
        }
    }
    Ok(staging.join(rel_path))
}

/// Recursive copy that preserves symlinks, refusing any link whose resolved
/// target escapes the source root.
fn copy_tree(source_root: &Path, dest_root: &Path) -> Result<()> {
    for entry in WalkDir::new(source_root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", source_root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(source_root)
            .expect("walkdir stays under its root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = dest_root.join(rel);

        if entry.path_is_symlink() {
            let resolved = entry.path().canonicalize().with_context(|| {
                format!("broken symlink {} in overlay", entry.path().display())
            })?;
            if !resolved.starts_with(source_root) {
                return Err(CoreError::new(
                    ErrorCode::Precondition,
                    format!(
                        "overlay symlink {} points outside the overlay directory",
                        entry.path().display()
                    ),
                )
                .into());
            }
            let target = fs::read_link(entry.path())?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)?;
            }
            std::os::unix::fs::symlink(&target, &dest).with_context(|| {
                format!("failed to recreate symlink at {}", dest.display())
            })?;
        } else if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("failed to create {}", dest.display()))?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), dest.display())
            })?;
        }
    }
    Ok(())
}

fn apply_owner(overlay: &imgforge_domain::FileOverlay, dest: &Path) -> Result<()> {
    let Some((user, group)) = overlay.owner_parts()? else {
        return Ok(());
    };
    // Numeric ids are applied directly; names are left for the image builder,
    // which runs the ownership pass inside the image root.
    let uid: Option<u32> = user.parse().ok();
    let gid: Option<u32> = group.as_deref().and_then(|g| g.parse().ok());
    if uid.is_none() && gid.is_none() {
        debug!(owner = ?overlay.owner, dest = %dest.display(), "named owner deferred to builder");
        return Ok(());
    }
    std::os::unix::fs::chown(dest, uid, gid).map_err(|err| {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            anyhow::Error::new(CoreError::new(
                ErrorCode::PermissionDenied,
                format!("cannot chown {}: {err}", dest.display()),
            ))
        } else {
            anyhow::Error::new(err).context(format!("failed to chown {}", dest.display()))
        }
    })
}

/// Deterministic hash of a staged tree: lexicographic walk hashing
/// `(relative_path, mode_bits, size, sha256(content))` per entry. Symlinks
/// contribute their textual target instead of resolved content.
pub fn tree_hash(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    if !root.exists() {
        return Ok(hex::encode(hasher.finalize()));
    }

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir stays under its root");
        if rel.as_os_str().is_empty() {
            continue;
        }

        if entry.path_is_symlink() {
            let target = fs::read_link(entry.path())?;
            let target = target.to_string_lossy();
            let meta = entry.path().symlink_metadata()?;
            push_record(
                &mut hasher,
                rel,
                meta.permissions().mode() & 0o7777,
                target.len() as u64,
                &Sha256::digest(format!("link:{target}").as_bytes()),
            );
        } else if entry.file_type().is_file() {
            let meta = entry.metadata()?;
            let content = fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            push_record(
                &mut hasher,
                rel,
                meta.permissions().mode() & 0o7777,
                meta.len(),
                &Sha256::digest(&content),
            );
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn push_record(hasher: &mut Sha256, rel: &Path, mode: u32, size: u64, content_digest: &[u8]) {
    hasher.update(rel.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(format!("{mode:o}").as_bytes());
    hasher.update(b"\0");
    hasher.update(size.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(content_digest);
    hasher.update(b"\0");
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgforge_domain::FileOverlay;

    fn profile_with(files: Vec<FileOverlay>, overlay_dir: Option<String>) -> Profile {
        serde_json::from_value(serde_json::json!({
            "profile_id": "stage.test",
            "name": "Stage",
            "device_id": "dev",
            "release": "23.05.3",
            "target": "ath79",
            "subtarget": "generic",
            "builder_profile": "generic",
            "files": files,
            "overlay_dir": overlay_dir
        }))
        .unwrap()
    }

    fn write(base: &Path, rel: &str, contents: &str) {
        let path = base.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn stages_files_with_mode_and_layering() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("project");
        write(&base, "overlay/etc/banner", "from-dir");
        write(&base, "files/banner", "from-file");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();

        let profile = profile_with(
            vec![FileOverlay {
                source: "files/banner".into(),
                destination: "/etc/banner".into(),
                mode: Some("0600".into()),
                owner: None,
            }],
            Some("overlay".into()),
        );

        let (staged, hash) = stage(&profile, &work, &base).unwrap();
        // The per-file overlay wins over the overlay directory entry.
        let banner = staged.join("etc/banner");
        assert_eq!(fs::read_to_string(&banner).unwrap(), "from-file");
        let mode = banner.metadata().unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn missing_source_is_a_precondition_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("project");
        fs::create_dir_all(&base).unwrap();
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();

        let profile = profile_with(
            vec![FileOverlay {
                source: "files/missing".into(),
                destination: "/etc/missing".into(),
                mode: None,
                owner: None,
            }],
            None,
        );
        let err = stage(&profile, &work, &base).unwrap_err();
        // A nonexistent source cannot be canonicalized; either way the error
        // chain must not report success.
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn traversal_destination_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("project");
        write(&base, "files/x", "x");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();

        let profile = profile_with(
            vec![FileOverlay {
                source: "files/x".into(),
                destination: "/../outside".into(),
                mode: None,
                owner: None,
            }],
            None,
        );
        let err = stage(&profile, &work, &base).unwrap_err();
        let core = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(core.code, ErrorCode::Precondition);
    }

    #[test]
    fn escaping_symlink_in_overlay_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("project");
        write(&base, "overlay/etc/keep", "ok");
        write(&base, "secret", "top");
        std::os::unix::fs::symlink(base.join("secret"), base.join("overlay/etc/leak")).unwrap();
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();

        let profile = profile_with(Vec::new(), Some("overlay".into()));
        let err = stage(&profile, &work, &base).unwrap_err();
        let core = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(core.code, ErrorCode::Precondition);
    }

    #[test]
    fn internal_symlinks_are_preserved_and_hashed_by_target() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("project");
        write(&base, "overlay/bin/tool", "#!/bin/sh\n");
        std::os::unix::fs::symlink("tool", base.join("overlay/bin/alias")).unwrap();
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();

        let profile = profile_with(Vec::new(), Some("overlay".into()));
        let (staged, hash_a) = stage(&profile, &work, &base).unwrap();
        assert!(staged.join("bin/alias").symlink_metadata().unwrap().is_symlink());

        // Retargeting the symlink changes the tree hash.
        fs::remove_file(staged.join("bin/alias")).unwrap();
        std::os::unix::fs::symlink("other", staged.join("bin/alias")).unwrap();
        let hash_b = tree_hash(&staged).unwrap();
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn tree_hash_is_stable_and_content_sensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        write(&root, "etc/config/network", "config interface lan\n");
        write(&root, "etc/banner", "hello\n");

        let first = tree_hash(&root).unwrap();
        assert_eq!(first, tree_hash(&root).unwrap());

        fs::write(root.join("etc/banner"), "changed\n").unwrap();
        assert_ne!(first, tree_hash(&root).unwrap());
    }
}
