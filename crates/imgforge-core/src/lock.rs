use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use tracing::debug;

/// Advisory exclusive lock scoped to one key (toolchain triple or build cache
/// key). Held for the lifetime of the guard; blocking acquisition so waiters
/// queue behind the holder and observe its result afterwards.
#[derive(Debug)]
pub(crate) struct KeyLock {
    path: PathBuf,
    _file: File,
}

impl KeyLock {
    pub(crate) fn acquire(locks_dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(locks_dir)
            .with_context(|| format!("failed to create {}", locks_dir.display()))?;
        let path = locks_dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        debug!(lock = %path.display(), "acquiring key lock");
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        debug!(lock = %path.display(), "key lock acquired");
        Ok(Self { path, _file: file })
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        debug!(lock = %self.path.display(), "key lock released");
    }
}
