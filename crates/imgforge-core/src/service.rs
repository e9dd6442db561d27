//! Facade over the engines: the callable surface adapters (CLI, HTTP, MCP)
//! are allowed to touch. Methods return serde-serializable structs with
//! stable field names; failures collapse to the coded error body.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use imgforge_domain::{Profile, ProfileFilter};

use crate::build::{
    BatchMode, BatchReport, BatchSelection, BuildEngine, BuildOutcome, BuildRequest,
};
use crate::config::Settings;
use crate::flash::{DeviceInspector, FlashEngine, FlashRequest, SysInspector};
use crate::store::{
    ArtifactRecord, BuildRecord, FlashRecord, ProfileRecord, StateStore, StoreInfo,
    ToolchainRecord,
};
use crate::toolchain::{CacheInfo, PruneReport, ToolchainCache};
use crate::CancelToken;

/// One build record with its artifacts, as `builds get` returns it.
#[derive(Debug, Clone, Serialize)]
pub struct BuildView {
    #[serde(flatten)]
    pub build: BuildRecord,
    pub artifacts: Vec<ArtifactRecord>,
}

/// Application service wiring settings, store, and engines together.
#[derive(Clone)]
pub struct ImgforgeService {
    settings: Settings,
    store: StateStore,
    toolchains: ToolchainCache,
    builds: BuildEngine,
    flash: FlashEngine,
}

impl ImgforgeService {
    /// Production construction: sqlite store, sysfs-backed device inspector.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_inspector(settings, Arc::new(SysInspector))
    }

    /// Construction seam for tests that substitute the device inspector.
    pub fn with_inspector(
        settings: Settings,
        inspector: Arc<dyn DeviceInspector>,
    ) -> Result<Self> {
        let store = StateStore::open(&settings.db_path)?;
        let toolchains = ToolchainCache::new(settings.clone(), store.clone());
        let builds = BuildEngine::new(settings.clone(), store.clone(), toolchains.clone());
        let flash = FlashEngine::new(settings.clone(), store.clone(), inspector);
        Ok(Self {
            settings,
            store,
            toolchains,
            builds,
            flash,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // -- profiles ------------------------------------------------------

    pub fn profile_list(&self, filter: &ProfileFilter) -> Result<Vec<ProfileRecord>> {
        self.store.list_profiles(filter)
    }

    pub fn profile_get(&self, profile_id: &str) -> Result<ProfileRecord> {
        self.store.require_profile(profile_id)
    }

    pub fn profile_upsert(&self, profile: &Profile) -> Result<ProfileRecord> {
        self.store.upsert_profile(profile)
    }

    pub fn profile_delete(&self, profile_id: &str) -> Result<bool> {
        self.store.delete_profile(profile_id)
    }

    pub fn profile_import(&self, document: &str) -> Result<ProfileRecord> {
        let profile = Profile::from_json(document)?;
        self.store.upsert_profile(&profile)
    }

    pub fn profile_export(&self, profile_id: &str) -> Result<String> {
        Ok(self.profile_get(profile_id)?.profile.to_json())
    }

    // -- toolchains ----------------------------------------------------

    pub fn toolchain_ensure(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
        cancel: &CancelToken,
    ) -> Result<ToolchainRecord> {
        self.toolchains.ensure(release, target, subtarget, cancel)
    }

    pub fn toolchain_list(&self) -> Result<Vec<ToolchainRecord>> {
        self.toolchains.list()
    }

    pub fn toolchain_prune(&self, unused_for_secs: Option<i64>) -> Result<PruneReport> {
        self.toolchains.prune(unused_for_secs)
    }

    pub fn toolchain_info(&self) -> Result<CacheInfo> {
        self.toolchains.info()
    }

    // -- builds --------------------------------------------------------

    pub fn build_or_reuse(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
    ) -> Result<BuildOutcome> {
        self.builds.build_or_reuse(request, cancel)
    }

    pub fn build_batch(
        &self,
        selection: &BatchSelection,
        mode: BatchMode,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        self.builds.build_batch(selection, mode, cancel)
    }

    pub fn build_list(
        &self,
        profile_id: Option<&str>,
        status: Option<imgforge_domain::BuildStatus>,
        limit: usize,
    ) -> Result<Vec<BuildRecord>> {
        self.store.list_builds(profile_id, status, limit)
    }

    pub fn build_get(&self, id: i64) -> Result<BuildView> {
        let build = self.store.require_build(id)?;
        let artifacts = self.store.artifacts_by_build(id)?;
        Ok(BuildView { build, artifacts })
    }

    pub fn build_artifacts(&self, build_id: i64) -> Result<Vec<ArtifactRecord>> {
        self.store.require_build(build_id)?;
        self.store.artifacts_by_build(build_id)
    }

    // -- flash ---------------------------------------------------------

    pub fn flash(&self, request: &FlashRequest, cancel: &CancelToken) -> Result<FlashRecord> {
        self.flash.flash(request, cancel)
    }

    pub fn flash_list(
        &self,
        status: Option<imgforge_domain::FlashStatus>,
        artifact_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<FlashRecord>> {
        self.flash.list(status, artifact_id, limit)
    }

    pub fn flash_get(&self, id: i64) -> Result<FlashRecord> {
        self.flash.get(id)?.ok_or_else(|| {
            imgforge_domain::CoreError::new(
                imgforge_domain::ErrorCode::NotFound,
                format!("flash {id} does not exist"),
            )
            .into()
        })
    }

    // -- misc ----------------------------------------------------------

    pub fn store_info(&self) -> Result<StoreInfo> {
        self.store.info()
    }
}
