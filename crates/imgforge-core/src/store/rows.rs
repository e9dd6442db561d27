//! Row records and mapping helpers for the state store.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use imgforge_domain::{
    ArtifactKind, BuildStatus, ErrorCode, FlashStatus, Profile, ToolchainState, VerifyOutcome,
};

/// One stored profile plus row metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileRecord {
    pub id: i64,
    #[serde(flatten)]
    pub profile: Profile,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolchainRecord {
    pub id: i64,
    pub release: String,
    pub target: String,
    pub subtarget: String,
    pub url: Option<String>,
    pub archive_path: Option<String>,
    pub root_dir: Option<String>,
    pub archive_sha256: Option<String>,
    pub signature_verified: bool,
    pub state: ToolchainState,
    pub first_used_at: Option<i64>,
    pub last_used_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildRecord {
    pub id: i64,
    pub profile_row: i64,
    pub profile_id: String,
    pub toolchain_id: i64,
    pub cache_key: String,
    pub input_snapshot: serde_json::Value,
    pub status: BuildStatus,
    pub cache_hit: bool,
    pub requested_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub build_dir: Option<String>,
    pub log_path: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl BuildRecord {
    /// Wall-clock duration in seconds once the build is terminal.
    #[must_use]
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(finish)) => Some(finish - start),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub id: i64,
    pub build_id: i64,
    pub kind: ArtifactKind,
    pub filename: String,
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlashRecord {
    pub id: i64,
    pub artifact_id: Option<i64>,
    pub build_id: Option<i64>,
    pub device_path: String,
    pub device_model: Option<String>,
    pub device_serial: Option<String>,
    pub image_path: String,
    pub status: FlashStatus,
    pub wiped: bool,
    pub bytes_written: u64,
    pub verify_mode: String,
    pub verify_result: Option<VerifyOutcome>,
    pub dry_run: bool,
    pub suspect: bool,
    pub log_path: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// Fields of a flash record known before preflight.
#[derive(Debug, Clone)]
pub struct NewFlash {
    pub artifact_id: Option<i64>,
    pub build_id: Option<i64>,
    pub device_path: String,
    pub device_model: Option<String>,
    pub device_serial: Option<String>,
    pub image_path: String,
    pub verify_mode: String,
    pub dry_run: bool,
}

pub(super) const TOOLCHAIN_COLS: &str = "id, release, target, subtarget, url, archive_path, \
     root_dir, archive_sha256, signature_verified, state, first_used_at, last_used_at";

pub(super) const BUILD_COLS: &str = "id, profile_row, profile_id, toolchain_id, cache_key, \
     input_snapshot, status, cache_hit, requested_at, started_at, finished_at, build_dir, \
     log_path, error_code, error_message";

pub(super) const ARTIFACT_COLS: &str =
    "id, build_id, kind, filename, relative_path, size_bytes, sha256, labels";

pub(super) const FLASH_COLS: &str = "id, artifact_id, build_id, device_path, device_model, \
     device_serial, image_path, status, wiped, bytes_written, verify_mode, verify_result, \
     dry_run, suspect, log_path, error_code, error_message, created_at, finished_at";

fn column_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(super) fn map_profile_row(row: &Row<'_>) -> rusqlite::Result<ProfileRecord> {
    let document: String = row.get(1)?;
    let profile: Profile =
        serde_json::from_str(&document).map_err(|err| column_error(1, err))?;
    Ok(ProfileRecord {
        id: row.get(0)?,
        profile,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

pub(super) fn profile_by_id(
    conn: &Connection,
    profile_id: &str,
) -> anyhow::Result<Option<ProfileRecord>> {
    conn.query_row(
        "SELECT id, document, created_at, updated_at FROM profiles WHERE profile_id = ?1",
        params![profile_id],
        map_profile_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(super) fn map_toolchain_row(row: &Row<'_>) -> rusqlite::Result<ToolchainRecord> {
    let state: String = row.get(9)?;
    let state = ToolchainState::try_from(state.as_str()).map_err(|err| column_error(9, err))?;
    Ok(ToolchainRecord {
        id: row.get(0)?,
        release: row.get(1)?,
        target: row.get(2)?,
        subtarget: row.get(3)?,
        url: row.get(4)?,
        archive_path: row.get(5)?,
        root_dir: row.get(6)?,
        archive_sha256: row.get(7)?,
        signature_verified: row.get(8)?,
        state,
        first_used_at: row.get(10)?,
        last_used_at: row.get(11)?,
    })
}

pub(super) fn toolchain_by_key(
    conn: &Connection,
    release: &str,
    target: &str,
    subtarget: &str,
) -> anyhow::Result<Option<ToolchainRecord>> {
    conn.query_row(
        &format!(
            "SELECT {TOOLCHAIN_COLS} FROM toolchains
             WHERE release = ?1 AND target = ?2 AND subtarget = ?3"
        ),
        params![release, target, subtarget],
        map_toolchain_row,
    )
    .optional()
    .map_err(Into::into)
}

fn parse_error_code(raw: Option<String>, idx: usize) -> rusqlite::Result<Option<ErrorCode>> {
    raw.map(|code| {
        ErrorCode::try_from(code.as_str()).map_err(|err| {
            column_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })
    })
    .transpose()
}

pub(super) fn map_build_row(row: &Row<'_>) -> rusqlite::Result<BuildRecord> {
    let snapshot: String = row.get(5)?;
    let input_snapshot: serde_json::Value =
        serde_json::from_str(&snapshot).map_err(|err| column_error(5, err))?;
    let status: String = row.get(6)?;
    let status = BuildStatus::try_from(status.as_str()).map_err(|err| column_error(6, err))?;
    Ok(BuildRecord {
        id: row.get(0)?,
        profile_row: row.get(1)?,
        profile_id: row.get(2)?,
        toolchain_id: row.get(3)?,
        cache_key: row.get(4)?,
        input_snapshot,
        status,
        cache_hit: row.get(7)?,
        requested_at: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
        build_dir: row.get(11)?,
        log_path: row.get(12)?,
        error_code: parse_error_code(row.get(13)?, 13)?,
        error_message: row.get(14)?,
    })
}

pub(super) fn build_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<BuildRecord>> {
    conn.query_row(
        &format!("SELECT {BUILD_COLS} FROM builds WHERE id = ?1"),
        params![id],
        map_build_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(super) fn map_artifact_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    let kind: String = row.get(2)?;
    let kind = ArtifactKind::try_from(kind.as_str()).map_err(|err| column_error(2, err))?;
    let labels: String = row.get(7)?;
    let labels: Vec<String> =
        serde_json::from_str(&labels).map_err(|err| column_error(7, err))?;
    let size: i64 = row.get(5)?;
    Ok(ArtifactRecord {
        id: row.get(0)?,
        build_id: row.get(1)?,
        kind,
        filename: row.get(3)?,
        relative_path: row.get(4)?,
        size_bytes: size as u64,
        sha256: row.get(6)?,
        labels,
    })
}

pub(super) fn artifact_by_id(
    conn: &Connection,
    id: i64,
) -> anyhow::Result<Option<ArtifactRecord>> {
    conn.query_row(
        &format!("SELECT {ARTIFACT_COLS} FROM artifacts WHERE id = ?1"),
        params![id],
        map_artifact_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(super) fn map_flash_row(row: &Row<'_>) -> rusqlite::Result<FlashRecord> {
    let status: String = row.get(7)?;
    let status = FlashStatus::try_from(status.as_str()).map_err(|err| column_error(7, err))?;
    let verify_result: Option<String> = row.get(11)?;
    let verify_result = verify_result
        .map(|raw| VerifyOutcome::try_from(raw.as_str()).map_err(|err| column_error(11, err)))
        .transpose()?;
    let bytes: i64 = row.get(9)?;
    Ok(FlashRecord {
        id: row.get(0)?,
        artifact_id: row.get(1)?,
        build_id: row.get(2)?,
        device_path: row.get(3)?,
        device_model: row.get(4)?,
        device_serial: row.get(5)?,
        image_path: row.get(6)?,
        status,
        wiped: row.get(8)?,
        bytes_written: bytes as u64,
        verify_mode: row.get(10)?,
        verify_result,
        dry_run: row.get(12)?,
        suspect: row.get(13)?,
        log_path: row.get(14)?,
        error_code: parse_error_code(row.get(15)?, 15)?,
        error_message: row.get(16)?,
        created_at: row.get(17)?,
        finished_at: row.get(18)?,
    })
}

pub(super) fn flash_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<FlashRecord>> {
    conn.query_row(
        &format!("SELECT {FLASH_COLS} FROM flashes WHERE id = ?1"),
        params![id],
        map_flash_row,
    )
    .optional()
    .map_err(Into::into)
}
