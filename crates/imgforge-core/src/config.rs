use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dirs_next::{cache_dir, data_dir};

/// Immutable snapshot of the process environment, taken once so that
/// configuration reads do not race concurrent `set_var` calls in tests.
#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub(crate) fn flag(&self, key: &str) -> bool {
        matches!(self.var(key), Some("1") | Some("true"))
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// All configuration the engines need, resolved once and passed explicitly to
/// component constructors. Environment variables use the `IMGFORGE_` prefix.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root for toolchain archives and extracted builder trees.
    pub cache_dir: PathBuf,
    /// Root for build working directories and produced artifacts.
    pub artifacts_dir: PathBuf,
    /// Path of the sqlite state store.
    pub db_path: PathBuf,
    /// Base URL of the upstream download server.
    pub base_url: String,
    /// When set, `ensure` never fetches; only already-ready toolchains serve.
    pub offline: bool,
    /// Program invoked as the external image builder (`make` unless overridden
    /// for tests).
    pub builder_program: PathBuf,
    /// Upper bound on concurrently running builds in batch mode.
    pub max_concurrent_builds: usize,
    pub download_timeout: Duration,
    pub build_timeout: Duration,
    pub flash_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL when stopping a build subprocess.
    pub term_grace: Duration,
    /// Zeroed prefix length for `wipe` before flashing.
    pub wipe_bytes: u64,
    /// Chunk size for device writes and read-back hashing.
    pub io_chunk_bytes: usize,
}

pub(crate) const DEFAULT_BASE_URL: &str = "https://downloads.openwrt.org";

impl Settings {
    /// Builds settings from the current process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let cache_root = match snapshot.var("IMGFORGE_CACHE_DIR") {
            Some(path) => PathBuf::from(path),
            None => cache_dir()
                .ok_or_else(|| anyhow!("unable to determine a cache directory"))?
                .join("imgforge")
                .join("builders"),
        };
        let data_root = match snapshot.var("IMGFORGE_DATA_DIR") {
            Some(path) => PathBuf::from(path),
            None => data_dir()
                .ok_or_else(|| anyhow!("unable to determine a data directory"))?
                .join("imgforge"),
        };
        let artifacts_dir = match snapshot.var("IMGFORGE_ARTIFACTS_DIR") {
            Some(path) => PathBuf::from(path),
            None => data_root.join("artifacts"),
        };
        let db_path = match snapshot.var("IMGFORGE_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => data_root.join("imgforge.sqlite"),
        };

        Ok(Self {
            cache_dir: cache_root,
            artifacts_dir,
            db_path,
            base_url: snapshot
                .var("IMGFORGE_BASE_URL")
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            offline: snapshot.flag("IMGFORGE_OFFLINE"),
            builder_program: snapshot
                .var("IMGFORGE_BUILDER_PROGRAM")
                .map_or_else(|| PathBuf::from("make"), PathBuf::from),
            max_concurrent_builds: parse_bounded(snapshot, "IMGFORGE_MAX_BUILDS", 2, 1, 16)?,
            download_timeout: parse_secs(snapshot, "IMGFORGE_DOWNLOAD_TIMEOUT", 3600)?,
            build_timeout: parse_secs(snapshot, "IMGFORGE_BUILD_TIMEOUT", 3600)?,
            flash_timeout: parse_secs(snapshot, "IMGFORGE_FLASH_TIMEOUT", 1800)?,
            term_grace: parse_secs(snapshot, "IMGFORGE_TERM_GRACE", 10)?,
            wipe_bytes: 8 * 1024 * 1024,
            io_chunk_bytes: 4 * 1024 * 1024,
        })
    }

    /// Lock-file directory shared by the toolchain and build key locks.
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.cache_dir.join(".locks")
    }
}

fn parse_secs(snapshot: &EnvSnapshot, key: &str, default: u64) -> Result<Duration> {
    match snapshot.var(key) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| anyhow!("{key} must be a number of seconds, got '{raw}'")),
    }
}

fn parse_bounded(
    snapshot: &EnvSnapshot,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> Result<usize> {
    match snapshot.var(key) {
        None => Ok(default),
        Some(raw) => {
            let value: usize = raw
                .parse()
                .map_err(|_| anyhow!("{key} must be an integer, got '{raw}'"))?;
            if !(min..=max).contains(&value) {
                return Err(anyhow!("{key} must be between {min} and {max}"));
            }
            Ok(value)
        }
    }
}
