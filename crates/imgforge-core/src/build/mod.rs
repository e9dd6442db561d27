//! Build engine (C4): cache-aware `build_or_reuse` and bounded-parallel
//! batch builds.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use imgforge_domain::{
    BuildInputs, BuildOverrides, CoreError, ErrorBody, ErrorCode, Profile, ProfileFilter,
};

use crate::config::Settings;
use crate::lock::KeyLock;
use crate::store::{ArtifactRecord, BuildRecord, StateStore};
use crate::toolchain::ToolchainCache;
use crate::util::safe_key_fragment;
use crate::{overlay, CancelToken};

pub mod artifacts;
pub mod runner;

use runner::StopReason;

/// One build request as the facade receives it.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub profile_id: String,
    pub overrides: BuildOverrides,
    pub force_rebuild: bool,
    /// Keep the staging directory around after the build for debugging.
    pub keep_build_dir: bool,
}

/// Result of `build_or_reuse`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub build: BuildRecord,
    pub cache_hit: bool,
    pub artifacts: Vec<ArtifactRecord>,
}

/// What a batch build runs over: an explicit id list (admission order
/// preserved) or every profile matching a filter (id order).
#[derive(Debug, Clone)]
pub enum BatchSelection {
    Profiles(Vec<String>),
    Filter(ProfileFilter),
}

/// Batch failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    /// Stop admitting new builds after the first failure; running builds
    /// complete.
    FailFast,
    /// Run everything, aggregate per-profile results.
    BestEffort,
}

/// Per-profile entry in a batch report.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub profile_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<BuildOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// True when fail-fast stopped the item before it was admitted.
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub mode: BatchMode,
    pub items: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// The engine itself. Cheap to clone; worker threads clone it.
#[derive(Debug, Clone)]
pub struct BuildEngine {
    settings: Settings,
    store: StateStore,
    toolchains: ToolchainCache,
}

impl BuildEngine {
    pub fn new(settings: Settings, store: StateStore, toolchains: ToolchainCache) -> Self {
        Self {
            settings,
            store,
            toolchains,
        }
    }

    /// Cache-aware build. At most one external builder invocation runs per
    /// cache key across concurrent callers; waiters observe the winner's
    /// record as a cache hit.
    pub fn build_or_reuse(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
    ) -> Result<BuildOutcome> {
        let profile_record = self.store.require_profile(&request.profile_id)?;
        let profile = &profile_record.profile;

        // Profile defaults fill in unset request knobs.
        let force = request.force_rebuild
            || profile.build_defaults.rebuild_if_cached.unwrap_or(false);
        let mut overrides = request.overrides.clone();
        if profile.build_defaults.initramfs.unwrap_or(false) {
            overrides.initramfs = true;
        }

        let toolchain = self.toolchains.ensure(
            &profile.release,
            &profile.target,
            &profile.subtarget,
            cancel,
        )?;
        let archive_hash = toolchain.archive_sha256.clone().ok_or_else(|| {
            CoreError::new(
                ErrorCode::CacheConflict,
                "ready toolchain has no recorded archive hash",
            )
        })?;
        let builder_root = PathBuf::from(toolchain.root_dir.clone().ok_or_else(|| {
            CoreError::new(ErrorCode::CacheConflict, "ready toolchain has no root dir")
        })?);

        // Stage overlays before hashing; the tree hash is a snapshot input.
        let staging_keeper = tempfile::Builder::new()
            .prefix("imgforge-overlay-")
            .tempdir()
            .context("failed to create overlay staging directory")?;
        let (files_dir, overlay_hash) = if profile.has_overlay_content() {
            let base = std::env::current_dir().context("cannot resolve working directory")?;
            let (staged, hash) = overlay::stage(profile, staging_keeper.path(), &base)?;
            (Some(staged), Some(hash))
        } else {
            (None, None)
        };

        let inputs =
            BuildInputs::compose(profile, &archive_hash, overlay_hash.as_deref(), &overrides)?;
        let cache_key = inputs.cache_key()?;
        info!(profile = %profile.profile_id, %cache_key, "build admitted");

        let _lock = KeyLock::acquire(
            &self.settings.locks_dir(),
            &format!("build_{}", safe_key_fragment(&cache_key)),
        )?;

        if !force {
            if let Some(cached) = self.store.latest_succeeded_by_cache_key(&cache_key)? {
                info!(build = cached.id, %cache_key, "cache hit");
                let artifacts = self.store.artifacts_by_build(cached.id)?;
                return Ok(BuildOutcome {
                    build: cached,
                    cache_hit: true,
                    artifacts,
                });
            }
        }
        if cancel.is_cancelled() {
            return Err(CoreError::new(ErrorCode::Cancelled, "build cancelled before start").into());
        }

        let record = self.store.create_build(
            profile_record.id,
            &profile.profile_id,
            toolchain.id,
            &cache_key,
            &inputs.to_value(),
        )?;

        let outcome = self.execute(
            record.id,
            profile,
            &builder_root,
            &inputs,
            &overrides,
            files_dir.as_deref(),
            cancel,
        );

        if request.keep_build_dir {
            let kept = staging_keeper.keep();
            info!(path = %kept.display(), "staging directory kept");
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        build_id: i64,
        profile: &Profile,
        builder_root: &std::path::Path,
        inputs: &BuildInputs,
        overrides: &BuildOverrides,
        files_dir: Option<&std::path::Path>,
        cancel: &CancelToken,
    ) -> Result<BuildOutcome> {
        let build_dir = self
            .settings
            .cache_dir
            .join(&profile.release)
            .join(&profile.target)
            .join(&profile.subtarget)
            .join("builds")
            .join(&profile.profile_id)
            .join(build_id.to_string());
        fs::create_dir_all(&build_dir)
            .with_context(|| format!("failed to create {}", build_dir.display()))?;
        let log_path = build_dir.join("build.log");

        let bin_dir = match overrides
            .bin_dir
            .as_deref()
            .or(profile.image_options.bin_dir.as_deref())
        {
            Some(custom) => PathBuf::from(custom),
            None => self
                .settings
                .artifacts_dir
                .join(&profile.release)
                .join(&profile.target)
                .join(&profile.subtarget)
                .join(&profile.profile_id)
                .join(build_id.to_string()),
        };
        fs::create_dir_all(&bin_dir)
            .with_context(|| format!("failed to create {}", bin_dir.display()))?;

        self.store.mark_build_running(build_id, &build_dir, &log_path)?;

        let invocation = runner::compose_invocation(
            &self.settings.builder_program,
            builder_root,
            profile,
            inputs.effective_package_tokens(),
            files_dir,
            &bin_dir,
            overrides,
        );

        let report = match runner::run(
            &invocation,
            &log_path,
            self.settings.build_timeout,
            self.settings.term_grace,
            cancel,
        ) {
            Ok(report) => report,
            Err(err) => {
                self.store.mark_build_failed(
                    build_id,
                    ErrorCode::BuildFailed,
                    &format!("builder could not be started: {err:#}"),
                )?;
                return Err(err.context("builder could not be started"));
            }
        };

        if report.success() {
            let discovered = artifacts::discover(&bin_dir, &self.settings.artifacts_dir)?;
            let manifest = artifacts::BuildManifest {
                build_id,
                profile_id: &profile.profile_id,
                cache_key: &self.store.require_build(build_id)?.cache_key,
                inputs: &inputs.to_value(),
                artifacts: &discovered,
            };
            artifacts::write_manifest(&manifest, &build_dir.join("manifest.json"))?;

            let mut stored = Vec::new();
            for artifact in &discovered {
                stored.push(self.store.add_artifact(
                    build_id,
                    artifact.kind,
                    &artifact.filename,
                    &artifact.relative_path,
                    artifact.size_bytes,
                    &artifact.sha256,
                    &artifact.labels,
                )?);
            }
            self.store.mark_build_succeeded(build_id)?;
            info!(build = build_id, artifacts = stored.len(), "build succeeded");
            return Ok(BuildOutcome {
                build: self.store.require_build(build_id)?,
                cache_hit: false,
                artifacts: stored,
            });
        }

        let (code, message) = match report.stop_reason {
            StopReason::TimedOut => (
                ErrorCode::BuildTimeout,
                format!(
                    "build exceeded its {}s deadline",
                    self.settings.build_timeout.as_secs()
                ),
            ),
            StopReason::Cancelled => (ErrorCode::Cancelled, "build cancelled".to_string()),
            StopReason::Exited => (
                ErrorCode::BuildFailed,
                format!("builder exited with code {:?}", report.exit_code),
            ),
        };
        warn!(build = build_id, code = code.as_str(), "build failed");
        self.store.mark_build_failed(build_id, code, &message)?;
        Err(CoreError::new(code, message)
            .with_details(serde_json::json!({
                "build_id": build_id,
                "exit_code": report.exit_code,
                "log_tail": tail_excerpt(&report.tail),
            }))
            .with_log_path(&log_path)
            .into())
    }

    /// Builds a selection of profiles with FIFO admission into a bounded
    /// worker pool.
    pub fn build_batch(
        &self,
        selection: &BatchSelection,
        mode: BatchMode,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let profile_ids: Vec<String> = match selection {
            BatchSelection::Profiles(ids) => ids.clone(),
            BatchSelection::Filter(filter) => self
                .store
                .list_profiles(filter)?
                .into_iter()
                .map(|record| record.profile.profile_id)
                .collect(),
        };
        self.run_batch(&profile_ids, mode, cancel)
    }

    fn run_batch(
        &self,
        profile_ids: &[String],
        mode: BatchMode,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let queue: Arc<Mutex<VecDeque<(usize, String)>>> = Arc::new(Mutex::new(
            profile_ids
                .iter()
                .cloned()
                .enumerate()
                .collect::<VecDeque<_>>(),
        ));
        let stop_admission = CancelToken::new();
        let workers = self.settings.max_concurrent_builds.min(profile_ids.len().max(1));
        let (tx, rx) = mpsc::channel::<(usize, BatchItem)>();

        let mut handles = Vec::new();
        for _ in 0..workers {
            let engine = self.clone();
            let queue = Arc::clone(&queue);
            let stop_admission = stop_admission.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || {
                loop {
                    let next = {
                        let mut queue = queue.lock().expect("batch queue poisoned");
                        queue.pop_front()
                    };
                    let Some((index, profile_id)) = next else {
                        break;
                    };
                    if stop_admission.is_cancelled() || cancel.is_cancelled() {
                        let _ = tx.send((
                            index,
                            BatchItem {
                                profile_id,
                                outcome: None,
                                error: None,
                                skipped: true,
                            },
                        ));
                        continue;
                    }

                    let request = BuildRequest {
                        profile_id: profile_id.clone(),
                        ..BuildRequest::default()
                    };
                    let item = match engine.build_or_reuse(&request, &cancel) {
                        Ok(outcome) => BatchItem {
                            profile_id,
                            outcome: Some(outcome),
                            error: None,
                            skipped: false,
                        },
                        Err(err) => {
                            if mode == BatchMode::FailFast {
                                stop_admission.cancel();
                            }
                            BatchItem {
                                profile_id,
                                outcome: None,
                                error: Some(ErrorBody::from_anyhow(&err)),
                                skipped: false,
                            }
                        }
                    };
                    let _ = tx.send((index, item));
                }
            }));
        }
        drop(tx);

        let mut indexed: Vec<(usize, BatchItem)> = rx.into_iter().collect();
        for handle in handles {
            let _ = handle.join();
        }
        indexed.sort_by_key(|(index, _)| *index);

        let items: Vec<BatchItem> = indexed.into_iter().map(|(_, item)| item).collect();
        let succeeded = items.iter().filter(|i| i.outcome.is_some()).count();
        let failed = items.iter().filter(|i| i.error.is_some()).count();
        let skipped = items.iter().filter(|i| i.skipped).count();
        Ok(BatchReport {
            mode,
            items,
            succeeded,
            failed,
            skipped,
        })
    }
}

fn tail_excerpt(tail: &str) -> String {
    const EXCERPT: usize = 2048;
    if tail.len() <= EXCERPT {
        return tail.to_string();
    }
    let mut start = tail.len() - EXCERPT;
    while !tail.is_char_boundary(start) {
        start += 1;
    }
    tail[start..].to_string()
}
