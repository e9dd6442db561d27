//! Durable state store over sqlite: profiles, toolchains, builds, artifacts,
//! and flash records.
//!
//! Every call opens its own connection (WAL + busy timeout), state-changing
//! work runs inside immediate transactions, and terminal status transitions
//! are single guarded UPDATEs so a reader can never observe a torn status.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::debug;

use imgforge_domain::{
    ArtifactKind, BuildStatus, CoreError, ErrorCode, FlashStatus, Profile, ProfileFilter,
    ToolchainState, VerifyOutcome,
};

use crate::util::now_unix;

const SCHEMA_VERSION: u32 = 1;
const META_KEY_SCHEMA_VERSION: &str = "schema_version";

mod rows;

pub use rows::{
    ArtifactRecord, BuildRecord, FlashRecord, NewFlash, ProfileRecord, ToolchainRecord,
};

/// Handle to the sqlite state store. Cheap to clone; connections are opened
/// per operation.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Opens (creating if needed) the store at `path` and enforces the schema
    /// version.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = Self {
            path: path.to_path_buf(),
        };
        let mut conn = store.connection()?;
        store.init_schema(&conn)?;
        store.ensure_meta(&mut conn)?;
        debug!(db = %path.display(), "state store ready");
        Ok(store)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open state store at {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for state store")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys for state store")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for state store")?;
        Ok(conn)
    }

    fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start state store transaction")?;
        let result = f(&tx)?;
        tx.commit().context("failed to commit state store transaction")?;
        Ok(result)
    }

    fn init_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_id TEXT NOT NULL UNIQUE,
                release TEXT NOT NULL,
                target TEXT NOT NULL,
                subtarget TEXT NOT NULL,
                device_id TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_profiles_triple
                ON profiles(release, target, subtarget);
            CREATE TABLE IF NOT EXISTS toolchains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                release TEXT NOT NULL,
                target TEXT NOT NULL,
                subtarget TEXT NOT NULL,
                url TEXT,
                archive_path TEXT,
                root_dir TEXT,
                archive_sha256 TEXT,
                signature_verified INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                first_used_at INTEGER,
                last_used_at INTEGER,
                UNIQUE(release, target, subtarget)
            );
            CREATE TABLE IF NOT EXISTS builds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_row INTEGER NOT NULL REFERENCES profiles(id),
                profile_id TEXT NOT NULL,
                -- soft reference: pruning a toolchain must not erase or block
                -- terminal build history
                toolchain_id INTEGER NOT NULL,
                cache_key TEXT NOT NULL,
                input_snapshot TEXT NOT NULL,
                status TEXT NOT NULL,
                cache_hit INTEGER NOT NULL DEFAULT 0,
                requested_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                build_dir TEXT,
                log_path TEXT,
                error_code TEXT,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS ix_builds_cache_key ON builds(cache_key, status);
            CREATE INDEX IF NOT EXISTS ix_builds_profile ON builds(profile_id);
            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id INTEGER NOT NULL REFERENCES builds(id),
                kind TEXT NOT NULL,
                filename TEXT NOT NULL,
                relative_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '[]',
                UNIQUE(build_id, filename)
            );
            CREATE TABLE IF NOT EXISTS flashes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                artifact_id INTEGER REFERENCES artifacts(id),
                build_id INTEGER REFERENCES builds(id),
                device_path TEXT NOT NULL,
                device_model TEXT,
                device_serial TEXT,
                image_path TEXT NOT NULL,
                status TEXT NOT NULL,
                wiped INTEGER NOT NULL DEFAULT 0,
                bytes_written INTEGER NOT NULL DEFAULT 0,
                verify_mode TEXT NOT NULL,
                verify_result TEXT,
                dry_run INTEGER NOT NULL DEFAULT 0,
                suspect INTEGER NOT NULL DEFAULT 0,
                log_path TEXT,
                error_code TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS ix_flashes_status ON flashes(status);
            "#,
        )
        .context("failed to initialize state store schema")?;
        Ok(())
    }

    fn ensure_meta(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start meta transaction")?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        tx.commit()?;

        let found: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_KEY_SCHEMA_VERSION],
                |row| row.get(0),
            )
            .context("state store meta is missing the schema version")?;
        if found != SCHEMA_VERSION.to_string() {
            return Err(CoreError::new(
                ErrorCode::Precondition,
                format!(
                    "state store schema version mismatch: expected {SCHEMA_VERSION}, found {found}"
                ),
            )
            .into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Inserts or replaces the profile identified by `profile.profile_id`.
    /// Mutation produces a new document version; `updated_at` advances.
    pub fn upsert_profile(&self, profile: &Profile) -> Result<ProfileRecord> {
        profile.validate()?;
        let document = serde_json::to_string(profile).context("profile serialization")?;
        let now = now_unix();
        self.with_immediate_tx(|tx| {
            tx.execute(
                r#"
                INSERT INTO profiles
                    (profile_id, release, target, subtarget, device_id, document,
                     created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(profile_id) DO UPDATE SET
                    release = excluded.release,
                    target = excluded.target,
                    subtarget = excluded.subtarget,
                    device_id = excluded.device_id,
                    document = excluded.document,
                    updated_at = excluded.updated_at
                "#,
                params![
                    profile.profile_id,
                    profile.release,
                    profile.target,
                    profile.subtarget,
                    profile.device_id,
                    document,
                    now,
                ],
            )?;
            rows::profile_by_id(tx, &profile.profile_id)?.ok_or_else(|| {
                CoreError::new(ErrorCode::NotFound, "profile vanished during upsert").into()
            })
        })
    }

    pub fn get_profile(&self, profile_id: &str) -> Result<Option<ProfileRecord>> {
        let conn = self.connection()?;
        rows::profile_by_id(&conn, profile_id)
    }

    /// Fetches a profile, failing with `not_found` when absent.
    pub fn require_profile(&self, profile_id: &str) -> Result<ProfileRecord> {
        self.get_profile(profile_id)?.ok_or_else(|| {
            CoreError::new(
                ErrorCode::NotFound,
                format!("profile '{profile_id}' does not exist"),
            )
            .into()
        })
    }

    /// Lists profiles matching the filter. Triple predicates are pushed into
    /// SQL; tag and free-text matching happen on the decoded document.
    pub fn list_profiles(&self, filter: &ProfileFilter) -> Result<Vec<ProfileRecord>> {
        let conn = self.connection()?;
        let mut sql = String::from("SELECT id, document, created_at, updated_at FROM profiles");
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(release) = &filter.release {
            args.push(release.clone());
            clauses.push(format!("release = ?{}", args.len()));
        }
        if let Some(target) = &filter.target {
            args.push(target.clone());
            clauses.push(format!("target = ?{}", args.len()));
        }
        if let Some(subtarget) = &filter.subtarget {
            args.push(subtarget.clone());
            clauses.push(format!("subtarget = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY profile_id");

        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), rows::map_profile_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records
            .into_iter()
            .filter(|record| filter.matches(&record.profile))
            .collect())
    }

    /// Removes a profile. Build records reference profiles, so a profile
    /// with history refuses deletion rather than orphaning its builds.
    pub fn delete_profile(&self, profile_id: &str) -> Result<bool> {
        self.with_immediate_tx(|tx| {
            let Some(record) = rows::profile_by_id(tx, profile_id)? else {
                return Ok(false);
            };
            let builds: i64 = tx.query_row(
                "SELECT COUNT(*) FROM builds WHERE profile_row = ?1",
                params![record.id],
                |row| row.get(0),
            )?;
            if builds > 0 {
                return Err(CoreError::new(
                    ErrorCode::Precondition,
                    format!("profile '{profile_id}' has {builds} build record(s)"),
                )
                .into());
            }
            tx.execute("DELETE FROM profiles WHERE id = ?1", params![record.id])?;
            Ok(true)
        })
    }

    // ------------------------------------------------------------------
    // Toolchains
    // ------------------------------------------------------------------

    pub fn toolchain_by_key(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
    ) -> Result<Option<ToolchainRecord>> {
        let conn = self.connection()?;
        rows::toolchain_by_key(&conn, release, target, subtarget)
    }

    pub fn get_toolchain(&self, id: i64) -> Result<Option<ToolchainRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {} FROM toolchains WHERE id = ?1", rows::TOOLCHAIN_COLS),
            params![id],
            rows::map_toolchain_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_toolchains(&self) -> Result<Vec<ToolchainRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM toolchains ORDER BY release, target, subtarget",
            rows::TOOLCHAIN_COLS
        ))?;
        let records = stmt
            .query_map([], rows::map_toolchain_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Creates (or resets to `pending`) the record for a toolchain key that is
    /// about to be fetched.
    pub fn begin_toolchain_fetch(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
        url: &str,
    ) -> Result<ToolchainRecord> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                r#"
                INSERT INTO toolchains (release, target, subtarget, url, state)
                VALUES (?1, ?2, ?3, ?4, 'pending')
                ON CONFLICT(release, target, subtarget) DO UPDATE SET
                    url = excluded.url,
                    state = 'pending'
                "#,
                params![release, target, subtarget, url],
            )?;
            rows::toolchain_by_key(tx, release, target, subtarget)?.ok_or_else(|| {
                CoreError::new(ErrorCode::NotFound, "toolchain vanished during fetch").into()
            })
        })
    }

    pub fn mark_toolchain_ready(
        &self,
        id: i64,
        archive_path: &Path,
        root_dir: &Path,
        archive_sha256: &str,
        signature_verified: bool,
    ) -> Result<()> {
        let now = now_unix();
        self.with_immediate_tx(|tx| {
            let changed = tx.execute(
                r#"
                UPDATE toolchains SET
                    state = 'ready',
                    archive_path = ?2,
                    root_dir = ?3,
                    archive_sha256 = ?4,
                    signature_verified = ?5,
                    first_used_at = COALESCE(first_used_at, ?6),
                    last_used_at = ?6
                WHERE id = ?1 AND state = 'pending'
                "#,
                params![
                    id,
                    archive_path.display().to_string(),
                    root_dir.display().to_string(),
                    archive_sha256,
                    signature_verified,
                    now,
                ],
            )?;
            if changed != 1 {
                return Err(CoreError::new(
                    ErrorCode::CacheConflict,
                    format!("toolchain {id} was not pending when marked ready"),
                )
                .into());
            }
            Ok(())
        })
    }

    pub fn set_toolchain_state(&self, id: i64, state: ToolchainState) -> Result<()> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE toolchains SET state = ?2 WHERE id = ?1",
                params![id, state.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn touch_toolchain(&self, id: i64) -> Result<()> {
        let now = now_unix();
        self.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE toolchains SET
                     first_used_at = COALESCE(first_used_at, ?2),
                     last_used_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
            Ok(())
        })
    }

    /// True when any non-terminal build references this toolchain.
    pub fn toolchain_in_use(&self, id: i64) -> Result<bool> {
        let conn = self.connection()?;
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM builds
             WHERE toolchain_id = ?1 AND status IN ('pending', 'running')",
            params![id],
            |row| row.get(0),
        )?;
        Ok(active > 0)
    }

    pub fn delete_toolchain(&self, id: i64) -> Result<()> {
        self.with_immediate_tx(|tx| {
            tx.execute("DELETE FROM toolchains WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Builds
    // ------------------------------------------------------------------

    pub fn create_build(
        &self,
        profile_row: i64,
        profile_id: &str,
        toolchain_id: i64,
        cache_key: &str,
        input_snapshot: &serde_json::Value,
    ) -> Result<BuildRecord> {
        let now = now_unix();
        let snapshot = serde_json::to_string(input_snapshot).context("snapshot serialization")?;
        self.with_immediate_tx(|tx| {
            tx.execute(
                r#"
                INSERT INTO builds
                    (profile_row, profile_id, toolchain_id, cache_key, input_snapshot,
                     status, requested_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                "#,
                params![profile_row, profile_id, toolchain_id, cache_key, snapshot, now],
            )?;
            let id = tx.last_insert_rowid();
            rows::build_by_id(tx, id)?
                .ok_or_else(|| CoreError::new(ErrorCode::NotFound, "build vanished").into())
        })
    }

    pub fn mark_build_running(&self, id: i64, build_dir: &Path, log_path: &Path) -> Result<()> {
        let now = now_unix();
        self.transition_build(
            id,
            "UPDATE builds SET status = 'running', started_at = ?2, build_dir = ?3,
                 log_path = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![
                id,
                now,
                build_dir.display().to_string(),
                log_path.display().to_string()
            ],
        )
    }

    pub fn mark_build_succeeded(&self, id: i64) -> Result<()> {
        let now = now_unix();
        self.transition_build(
            id,
            "UPDATE builds SET status = 'succeeded', finished_at = ?2
             WHERE id = ?1 AND status = 'running'",
            params![id, now],
        )
    }

    pub fn mark_build_failed(&self, id: i64, code: ErrorCode, message: &str) -> Result<()> {
        let now = now_unix();
        self.transition_build(
            id,
            "UPDATE builds SET status = 'failed', finished_at = ?2, error_code = ?3,
                 error_message = ?4
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, now, code.as_str(), message],
        )
    }

    fn transition_build(
        &self,
        id: i64,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<()> {
        self.with_immediate_tx(|tx| {
            let changed = tx.execute(sql, args)?;
            if changed != 1 {
                return Err(CoreError::new(
                    ErrorCode::CacheConflict,
                    format!("build {id} status transition conflicts with stored state"),
                )
                .into());
            }
            Ok(())
        })
    }

    pub fn get_build(&self, id: i64) -> Result<Option<BuildRecord>> {
        let conn = self.connection()?;
        rows::build_by_id(&conn, id)
    }

    pub fn require_build(&self, id: i64) -> Result<BuildRecord> {
        self.get_build(id)?.ok_or_else(|| {
            CoreError::new(ErrorCode::NotFound, format!("build {id} does not exist")).into()
        })
    }

    /// Newest `succeeded` build for a cache key; the record a cache-hit caller
    /// receives.
    pub fn latest_succeeded_by_cache_key(&self, cache_key: &str) -> Result<Option<BuildRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM builds
                 WHERE cache_key = ?1 AND status = 'succeeded'
                 ORDER BY id DESC LIMIT 1",
                rows::BUILD_COLS
            ),
            params![cache_key],
            rows::map_build_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_builds(
        &self,
        profile_id: Option<&str>,
        status: Option<BuildStatus>,
        limit: usize,
    ) -> Result<Vec<BuildRecord>> {
        let conn = self.connection()?;
        let mut sql = format!("SELECT {} FROM builds", rows::BUILD_COLS);
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(profile_id) = profile_id {
            args.push(profile_id.to_string());
            clauses.push(format!("profile_id = ?{}", args.len()));
        }
        if let Some(status) = status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), rows::map_build_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    pub fn add_artifact(
        &self,
        build_id: i64,
        kind: ArtifactKind,
        filename: &str,
        relative_path: &str,
        size_bytes: u64,
        sha256: &str,
        labels: &[String],
    ) -> Result<ArtifactRecord> {
        let labels_json = serde_json::to_string(labels).context("labels serialization")?;
        self.with_immediate_tx(|tx| {
            tx.execute(
                r#"
                INSERT INTO artifacts
                    (build_id, kind, filename, relative_path, size_bytes, sha256, labels)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    build_id,
                    kind.as_str(),
                    filename,
                    relative_path,
                    size_bytes as i64,
                    sha256,
                    labels_json
                ],
            )?;
            let id = tx.last_insert_rowid();
            rows::artifact_by_id(tx, id)?
                .ok_or_else(|| CoreError::new(ErrorCode::NotFound, "artifact vanished").into())
        })
    }

    pub fn artifacts_by_build(&self, build_id: i64) -> Result<Vec<ArtifactRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM artifacts WHERE build_id = ?1 ORDER BY filename",
            rows::ARTIFACT_COLS
        ))?;
        let records = stmt
            .query_map(params![build_id], rows::map_artifact_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get_artifact(&self, id: i64) -> Result<Option<ArtifactRecord>> {
        let conn = self.connection()?;
        rows::artifact_by_id(&conn, id)
    }

    pub fn require_artifact(&self, id: i64) -> Result<ArtifactRecord> {
        self.get_artifact(id)?.ok_or_else(|| {
            CoreError::new(ErrorCode::NotFound, format!("artifact {id} does not exist")).into()
        })
    }

    // ------------------------------------------------------------------
    // Flash records
    // ------------------------------------------------------------------

    pub fn create_flash(&self, new: &NewFlash) -> Result<FlashRecord> {
        let now = now_unix();
        self.with_immediate_tx(|tx| {
            tx.execute(
                r#"
                INSERT INTO flashes
                    (artifact_id, build_id, device_path, device_model, device_serial,
                     image_path, status, verify_mode, dry_run, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9)
                "#,
                params![
                    new.artifact_id,
                    new.build_id,
                    new.device_path,
                    new.device_model,
                    new.device_serial,
                    new.image_path,
                    new.verify_mode,
                    new.dry_run,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();
            rows::flash_by_id(tx, id)?
                .ok_or_else(|| CoreError::new(ErrorCode::NotFound, "flash vanished").into())
        })
    }

    pub fn mark_flash_running(&self, id: i64, wiped: bool, log_path: Option<&Path>) -> Result<()> {
        self.with_immediate_tx(|tx| {
            let changed = tx.execute(
                "UPDATE flashes SET status = 'running', wiped = ?2, log_path = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id, wiped, log_path.map(|p| p.display().to_string())],
            )?;
            if changed != 1 {
                return Err(CoreError::new(
                    ErrorCode::CacheConflict,
                    format!("flash {id} was not pending when marked running"),
                )
                .into());
            }
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finish_flash(
        &self,
        id: i64,
        status: FlashStatus,
        bytes_written: u64,
        verify_result: Option<VerifyOutcome>,
        suspect: bool,
        error: Option<(&ErrorCode, &str)>,
    ) -> Result<()> {
        let now = now_unix();
        self.with_immediate_tx(|tx| {
            let changed = tx.execute(
                "UPDATE flashes SET status = ?2, bytes_written = ?3, verify_result = ?4,
                     suspect = ?5, error_code = ?6, error_message = ?7, finished_at = ?8
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![
                    id,
                    status.as_str(),
                    bytes_written as i64,
                    verify_result.map(VerifyOutcome::as_str),
                    suspect,
                    error.map(|(code, _)| code.as_str()),
                    error.map(|(_, message)| message),
                    now
                ],
            )?;
            if changed != 1 {
                return Err(CoreError::new(
                    ErrorCode::CacheConflict,
                    format!("flash {id} already reached a terminal state"),
                )
                .into());
            }
            Ok(())
        })
    }

    pub fn get_flash(&self, id: i64) -> Result<Option<FlashRecord>> {
        let conn = self.connection()?;
        rows::flash_by_id(&conn, id)
    }

    pub fn list_flashes(
        &self,
        status: Option<FlashStatus>,
        artifact_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<FlashRecord>> {
        let conn = self.connection()?;
        let mut sql = format!("SELECT {} FROM flashes", rows::FLASH_COLS);
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(artifact_id) = artifact_id {
            args.push(artifact_id.to_string());
            clauses.push(format!("artifact_id = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), rows::map_flash_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

/// Summary used by `toolchain info` and the facade.
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub db_path: String,
    pub profiles: i64,
    pub toolchains: i64,
    pub builds: i64,
    pub artifacts: i64,
    pub flashes: i64,
}

impl StateStore {
    pub fn info(&self) -> Result<StoreInfo> {
        let conn = self.connection()?;
        let count = |table: &str| -> Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .map_err(Into::into)
        };
        Ok(StoreInfo {
            db_path: self.path.display().to_string(),
            profiles: count("profiles")?,
            toolchains: count("toolchains")?,
            builds: count("builds")?,
            artifacts: count("artifacts")?,
            flashes: count("flashes")?,
        })
    }
}

#[cfg(test)]
mod tests;
