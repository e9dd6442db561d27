//! Toolchain cache (C3): guarantees a ready builder instance per
//! `(release, target, subtarget)` and coordinates concurrent demand.
//!
//! At most one fetch per key runs across the process; waiters block on the
//! key lock and observe the winner's result through the store.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use imgforge_domain::{CoreError, ErrorCode, ToolchainState};

use crate::config::Settings;
use crate::lock::KeyLock;
use crate::store::{StateStore, ToolchainRecord};
use crate::util::now_unix;
use crate::CancelToken;

pub mod fetch;

pub use fetch::validate_builder_root;

/// Manager for cached builder instances.
#[derive(Debug, Clone)]
pub struct ToolchainCache {
    settings: Settings,
    store: StateStore,
}

/// Outcome of a prune pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub kept_in_use: Vec<String>,
    pub freed_bytes: u64,
}

/// Cache-wide summary for `toolchain info`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cache_dir: String,
    pub total_size_bytes: u64,
    pub instances: Vec<ToolchainRecord>,
}

impl ToolchainCache {
    pub fn new(settings: Settings, store: StateStore) -> Self {
        Self { settings, store }
    }

    fn key_dir(&self, release: &str, target: &str, subtarget: &str) -> PathBuf {
        self.settings
            .cache_dir
            .join(release)
            .join(target)
            .join(subtarget)
    }

    fn lock_name(release: &str, target: &str, subtarget: &str) -> String {
        format!("toolchain_{release}_{target}_{subtarget}").replace('/', "_")
    }

    /// Blocking ensure: returns a `ready` instance for the key, fetching and
    /// extracting it when absent. Concurrent callers for the same key
    /// coalesce on a per-key lock; a caller that observes `ready` up front
    /// returns without ever taking the lock.
    pub fn ensure(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
        cancel: &CancelToken,
    ) -> Result<ToolchainRecord> {
        if let Some(ready) = self.ready_instance(release, target, subtarget)? {
            self.store.touch_toolchain(ready.id)?;
            return Ok(ready);
        }

        if self.settings.offline {
            return Err(CoreError::new(
                ErrorCode::Precondition,
                format!(
                    "offline mode: toolchain {release}/{target}/{subtarget} is not cached"
                ),
            )
            .into());
        }
        if cancel.is_cancelled() {
            return Err(CoreError::new(ErrorCode::Cancelled, "toolchain ensure cancelled").into());
        }

        let _lock = KeyLock::acquire(
            &self.settings.locks_dir(),
            &Self::lock_name(release, target, subtarget),
        )?;

        // A concurrent winner may have fetched while this caller waited.
        if let Some(ready) = self.ready_instance(release, target, subtarget)? {
            self.store.touch_toolchain(ready.id)?;
            return Ok(ready);
        }

        self.fetch_under_lock(release, target, subtarget, cancel)
    }

    /// Returns the ready record for a key, verifying that the extracted root
    /// still exists. A ready record whose tree is gone is a detected
    /// cache conflict, not something to silently re-fetch.
    fn ready_instance(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
    ) -> Result<Option<ToolchainRecord>> {
        let Some(record) = self.store.toolchain_by_key(release, target, subtarget)? else {
            return Ok(None);
        };
        if record.state != ToolchainState::Ready {
            return Ok(None);
        }
        let root_ok = record
            .root_dir
            .as_deref()
            .is_some_and(|root| validate_builder_root(std::path::Path::new(root)));
        if !root_ok {
            return Err(CoreError::new(
                ErrorCode::CacheConflict,
                format!(
                    "toolchain {release}/{target}/{subtarget} is recorded ready but its tree is missing"
                ),
            )
            .into());
        }
        Ok(Some(record))
    }

    fn fetch_under_lock(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
        cancel: &CancelToken,
    ) -> Result<ToolchainRecord> {
        let urls = fetch::build_urls(&self.settings.base_url, release, target, subtarget);
        let record = self
            .store
            .begin_toolchain_fetch(release, target, subtarget, &urls.archive_url)?;
        info!(
            release,
            target, subtarget,
            url = %urls.archive_url,
            "fetching toolchain"
        );

        match self.download_and_extract(&urls, release, target, subtarget, cancel) {
            Ok((archive_path, root_dir, sha256, signature_verified)) => {
                self.store.mark_toolchain_ready(
                    record.id,
                    &archive_path,
                    &root_dir,
                    &sha256,
                    signature_verified,
                )?;
                self.store
                    .get_toolchain(record.id)?
                    .ok_or_else(|| {
                        CoreError::new(ErrorCode::NotFound, "toolchain vanished after fetch").into()
                    })
            }
            Err(err) => {
                warn!(release, target, subtarget, error = %err, "toolchain fetch failed");
                self.store
                    .set_toolchain_state(record.id, ToolchainState::Broken)?;
                Err(err)
            }
        }
    }

    fn download_and_extract(
        &self,
        urls: &fetch::BuilderUrls,
        release: &str,
        target: &str,
        subtarget: &str,
        cancel: &CancelToken,
    ) -> Result<(PathBuf, PathBuf, String, bool)> {
        let client = fetch::http_client(self.settings.download_timeout)?;
        let expected = match fetch::fetch_checksums(&client, &urls.sha256sums_url) {
            Ok(content) => {
                let parsed = fetch::parse_sha256sums(&content, &urls.archive_filename);
                if parsed.is_none() {
                    warn!(
                        file = %urls.archive_filename,
                        "no digest published for archive; proceeding unverified"
                    );
                }
                parsed
            }
            Err(err) => return Err(err),
        };

        if cancel.is_cancelled() {
            return Err(CoreError::new(ErrorCode::Cancelled, "toolchain fetch cancelled").into());
        }

        let key_dir = self.key_dir(release, target, subtarget);
        let archive_path = key_dir.join(&urls.archive_filename);
        let (sha256, _size) =
            fetch::download_archive(&client, &urls.archive_url, &archive_path, expected.as_deref())?;

        if cancel.is_cancelled() {
            return Err(CoreError::new(ErrorCode::Cancelled, "toolchain fetch cancelled").into());
        }

        let root_dir = fetch::extract_archive(&archive_path, &key_dir)?;
        if !validate_builder_root(&root_dir) {
            return Err(CoreError::new(
                ErrorCode::DownloadFailed,
                format!(
                    "extracted archive at {} is not a usable builder tree",
                    root_dir.display()
                ),
            )
            .into());
        }
        // Signature verification (the .asc next to sha256sums) is not wired
        // up; the flag records that only the digest was enforced.
        Ok((archive_path, root_dir, sha256, false))
    }

    pub fn list(&self) -> Result<Vec<ToolchainRecord>> {
        self.store.list_toolchains()
    }

    /// Removes instances in non-ready states, plus ready instances whose
    /// `last_used_at` is older than `unused_for_secs` when given. Instances
    /// referenced by a non-terminal build are never removed.
    pub fn prune(&self, unused_for_secs: Option<i64>) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let now = now_unix();
        for record in self.store.list_toolchains()? {
            let label = format!("{}/{}/{}", record.release, record.target, record.subtarget);
            let stale_ready = match (record.state, unused_for_secs) {
                (ToolchainState::Ready, Some(window)) => record
                    .last_used_at
                    .map(|used| now - used > window)
                    .unwrap_or(true),
                _ => false,
            };
            let candidate = record.state != ToolchainState::Ready || stale_ready;
            if !candidate {
                continue;
            }
            if self.store.toolchain_in_use(record.id)? {
                debug!(%label, "prune skipped: toolchain referenced by an active build");
                report.kept_in_use.push(label);
                continue;
            }
            let dir = self.key_dir(&record.release, &record.target, &record.subtarget);
            report.freed_bytes += dir_size(&dir);
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
            self.store.delete_toolchain(record.id)?;
            info!(%label, "pruned toolchain");
            report.removed.push(label);
        }
        Ok(report)
    }

    pub fn info(&self) -> Result<CacheInfo> {
        Ok(CacheInfo {
            cache_dir: self.settings.cache_dir.display().to_string(),
            total_size_bytes: dir_size(&self.settings.cache_dir),
            instances: self.store.list_toolchains()?,
        })
    }
}

fn dir_size(root: &std::path::Path) -> u64 {
    if !root.exists() {
        return 0;
    }
    walkdir::WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
