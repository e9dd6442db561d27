//! Flash engine (C5): write one artifact to one explicitly named whole
//! device, with preflight vetting, optional wipe, synchronous writes, and
//! mandatory read-back verification.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use imgforge_domain::{
    CoreError, ErrorBody, ErrorCode, FlashStatus, VerifyMode, VerifyOutcome,
};

use crate::config::Settings;
use crate::store::{FlashRecord, NewFlash, StateStore};
use crate::util::sha256_file_prefix;
use crate::CancelToken;

pub mod device;
pub mod writer;

pub use device::{DeviceInspector, SysInspector};

/// What to flash: a recorded artifact or a raw image path.
#[derive(Debug, Clone)]
pub enum FlashSource {
    Artifact(i64),
    Image(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub source: FlashSource,
    pub device_path: String,
    pub verify_mode: VerifyMode,
    pub wipe: bool,
    pub dry_run: bool,
    pub force: bool,
}

/// Flash engine. Per-device-path serialization lives here; everything else
/// is straight-line preflight → write → verify.
#[derive(Clone)]
pub struct FlashEngine {
    settings: Settings,
    store: StateStore,
    inspector: Arc<dyn DeviceInspector>,
    device_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

struct ResolvedSource {
    image_path: PathBuf,
    artifact_id: Option<i64>,
    build_id: Option<i64>,
    image_size: u64,
}

impl FlashEngine {
    pub fn new(settings: Settings, store: StateStore, inspector: Arc<dyn DeviceInspector>) -> Self {
        Self {
            settings,
            store,
            inspector,
            device_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn device_lock(&self, device_path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().expect("device lock map poisoned");
        Arc::clone(
            locks
                .entry(device_path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Validates the source image and, for artifacts, checks the file on disk
    /// against the recorded metadata.
    fn resolve_source(&self, source: &FlashSource) -> Result<ResolvedSource> {
        match source {
            FlashSource::Image(path) => {
                let meta = fs::metadata(path).map_err(|_| {
                    CoreError::new(
                        ErrorCode::Precondition,
                        format!("image {} does not exist", path.display()),
                    )
                })?;
                Ok(ResolvedSource {
                    image_path: path.clone(),
                    artifact_id: None,
                    build_id: None,
                    image_size: meta.len(),
                })
            }
            FlashSource::Artifact(id) => {
                let artifact = self.store.require_artifact(*id)?;
                let path = self.settings.artifacts_dir.join(&artifact.relative_path);
                let meta = fs::metadata(&path).map_err(|_| {
                    CoreError::new(
                        ErrorCode::Precondition,
                        format!(
                            "artifact {} file is missing on disk: {}",
                            id,
                            path.display()
                        ),
                    )
                })?;
                if meta.len() != artifact.size_bytes {
                    return Err(CoreError::new(
                        ErrorCode::CacheConflict,
                        format!(
                            "artifact {id} size on disk ({}) disagrees with the record ({})",
                            meta.len(),
                            artifact.size_bytes
                        ),
                    )
                    .into());
                }
                let (actual, _) = sha256_file_prefix(&path, meta.len())?;
                if actual != artifact.sha256 {
                    return Err(CoreError::new(
                        ErrorCode::CacheConflict,
                        format!("artifact {id} content digest disagrees with the record"),
                    )
                    .into());
                }
                Ok(ResolvedSource {
                    image_path: path,
                    artifact_id: Some(artifact.id),
                    build_id: Some(artifact.build_id),
                    image_size: artifact.size_bytes,
                })
            }
        }
    }

    fn log_path_for(&self, flash_id: i64) -> PathBuf {
        self.settings
            .artifacts_dir
            .join("flash-logs")
            .join(format!("flash-{flash_id}.log"))
    }

    fn open_log(&self, flash_id: i64) -> Result<(PathBuf, File)> {
        let path = self.log_path_for(flash_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok((path, file))
    }

    /// The one public operation. A record is created before preflight and
    /// always reaches a terminal state.
    pub fn flash(&self, request: &FlashRequest, cancel: &CancelToken) -> Result<FlashRecord> {
        let source = self.resolve_source(&request.source)?;
        let probe = self
            .inspector
            .probe(Path::new(&request.device_path));

        let record = self.store.create_flash(&NewFlash {
            artifact_id: source.artifact_id,
            build_id: source.build_id,
            device_path: request.device_path.clone(),
            device_model: probe.model.clone(),
            device_serial: probe.serial.clone(),
            image_path: source.image_path.display().to_string(),
            verify_mode: request.verify_mode.label(),
            dry_run: request.dry_run,
        })?;

        match self.run_flash(request, &source, record.id, cancel) {
            Ok(record) => Ok(record),
            Err(err) => {
                let body = ErrorBody::from_anyhow(&err);
                let suspect = body.code == ErrorCode::FlashHashMismatch;
                let bytes = body
                    .details
                    .as_ref()
                    .and_then(|d| d.get("bytes_written"))
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0);
                let verify_result = if suspect {
                    Some(VerifyOutcome::Mismatch)
                } else {
                    None
                };
                if let Err(store_err) = self.store.finish_flash(
                    record.id,
                    FlashStatus::Failed,
                    bytes,
                    verify_result,
                    suspect,
                    Some((&body.code, &body.message)),
                ) {
                    error!(flash = record.id, error = %store_err, "failed to record flash failure");
                }
                Err(err)
            }
        }
    }

    fn run_flash(
        &self,
        request: &FlashRequest,
        source: &ResolvedSource,
        flash_id: i64,
        cancel: &CancelToken,
    ) -> Result<FlashRecord> {
        let (log_path, mut log) = self.open_log(flash_id)?;
        let verify_bytes = request.verify_mode.verify_bytes(source.image_size);
        writeln!(log, "# device: {}", request.device_path)?;
        writeln!(log, "# image: {} ({} bytes)", source.image_path.display(), source.image_size)?;
        writeln!(log, "# wipe: {}, dry_run: {}, force: {}", request.wipe, request.dry_run, request.force)?;
        writeln!(log, "# verify: {} ({} bytes)", request.verify_mode.label(), verify_bytes)?;

        // Preflight order is fixed: device shape first, then the force gate.
        device::validate_device(self.inspector.as_ref(), &request.device_path)?;

        if !request.force && !request.dry_run {
            return Err(CoreError::new(
                ErrorCode::Precondition,
                "refusing to write without force=true (pass dry_run=true to preview)",
            )
            .into());
        }

        if request.dry_run {
            writeln!(log, "# dry run: no bytes written")?;
            info!(
                flash = flash_id,
                device = %request.device_path,
                image = %source.image_path.display(),
                "dry-run flash planned"
            );
            self.store
                .mark_flash_running(flash_id, false, Some(&log_path))?;
            self.store.finish_flash(
                flash_id,
                FlashStatus::Succeeded,
                0,
                Some(VerifyOutcome::Skipped),
                false,
                None,
            )?;
            return self.require_flash(flash_id);
        }

        // Per-device serialization: one flash per device path at a time.
        let lock = self.device_lock(&request.device_path);
        let _guard = lock.lock().expect("device lock poisoned");

        self.store
            .mark_flash_running(flash_id, request.wipe, Some(&log_path))?;
        let deadline = Instant::now() + self.settings.flash_timeout;
        let device = Path::new(&request.device_path);

        // Source digest is recomputed from the file, never taken from stored
        // metadata.
        let (expected_hash, hashed) = sha256_file_prefix(&source.image_path, verify_bytes)?;
        writeln!(log, "# source sha256[0..{hashed}]: {expected_hash}")?;

        if request.wipe {
            let wiped = writer::wipe_prefix(
                device,
                self.settings.wipe_bytes,
                self.settings.io_chunk_bytes,
            )?;
            writeln!(log, "# wiped {wiped} bytes")?;
        }

        let mut bytes_written = 0u64;
        let write_result = writer::write_image(
            &source.image_path,
            device,
            self.settings.io_chunk_bytes,
            cancel,
            deadline,
            &mut bytes_written,
        );
        if let Err(err) = write_result {
            writeln!(log, "# write failed after {bytes_written} bytes: {err:#}")?;
            return Err(attach_bytes(err, bytes_written));
        }
        writeln!(log, "# wrote {bytes_written} bytes")?;

        let actual_hash =
            writer::read_back_hash(device, verify_bytes, self.settings.io_chunk_bytes)
                .map_err(|err| attach_bytes(err, bytes_written))?;
        writeln!(log, "# device sha256[0..{verify_bytes}]: {actual_hash}")?;

        if actual_hash != expected_hash {
            writeln!(log, "# VERIFICATION MISMATCH; device is suspect")?;
            warn!(
                flash = flash_id,
                device = %request.device_path,
                expected = %expected_hash,
                actual = %actual_hash,
                "flash verification mismatch; device flagged suspect"
            );
            return Err(CoreError::new(
                ErrorCode::FlashHashMismatch,
                format!(
                    "read-back digest does not match the source for {}",
                    request.device_path
                ),
            )
            .with_details(serde_json::json!({
                "expected": expected_hash,
                "actual": actual_hash,
                "verify_bytes": verify_bytes,
                "bytes_written": bytes_written,
            }))
            .with_log_path(&log_path)
            .into());
        }

        writeln!(log, "# verification passed")?;
        self.store.finish_flash(
            flash_id,
            FlashStatus::Succeeded,
            bytes_written,
            Some(VerifyOutcome::Match),
            false,
            None,
        )?;
        info!(flash = flash_id, bytes = bytes_written, "flash succeeded and verified");
        self.require_flash(flash_id)
    }

    fn require_flash(&self, id: i64) -> Result<FlashRecord> {
        self.store.get_flash(id)?.ok_or_else(|| {
            CoreError::new(ErrorCode::NotFound, format!("flash {id} does not exist")).into()
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<FlashRecord>> {
        self.store.get_flash(id)
    }

    pub fn list(
        &self,
        status: Option<FlashStatus>,
        artifact_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<FlashRecord>> {
        self.store.list_flashes(status, artifact_id, limit)
    }
}

/// Adds the bytes-written count to an error's structured details so the
/// terminal record reflects the actual stream count.
fn attach_bytes(err: anyhow::Error, bytes_written: u64) -> anyhow::Error {
    match err.downcast::<CoreError>() {
        Ok(core) => {
            let mut details = core
                .details
                .clone()
                .unwrap_or_else(|| serde_json::json!({}));
            if let Some(map) = details.as_object_mut() {
                map.insert("bytes_written".into(), serde_json::json!(bytes_written));
            }
            anyhow::Error::new(core.with_details(details))
        }
        Err(other) => other,
    }
}
