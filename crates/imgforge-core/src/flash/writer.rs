//! Raw write path: signature wipe, O_SYNC chunked streaming, device flush,
//! and cache-bypassing read-back hashing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use imgforge_domain::{CoreError, ErrorCode};

use crate::CancelToken;

/// Progress granularity for write logging.
const PROGRESS_STEP: u64 = 64 * 1024 * 1024;

fn map_open_err(err: std::io::Error, path: &Path, action: &str) -> anyhow::Error {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        CoreError::new(
            ErrorCode::PermissionDenied,
            format!("permission denied {action} {}", path.display()),
        )
        .into()
    } else {
        anyhow::Error::new(err).context(format!("failed {action} {}", path.display()))
    }
}

fn open_sync_writer(device: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(device)
        .map_err(|err| map_open_err(err, device, "opening for write"))
}

/// Zeroes the leading `wipe_bytes` of the device so stale filesystem and
/// partition signatures cannot survive a short image.
pub fn wipe_prefix(device: &Path, wipe_bytes: u64, chunk: usize) -> Result<u64> {
    info!(device = %device.display(), bytes = wipe_bytes, "wiping signature region");
    let mut file = open_sync_writer(device)?;
    let zeros = vec![0u8; chunk];
    let mut remaining = wipe_bytes;
    while remaining > 0 {
        let step = remaining.min(zeros.len() as u64) as usize;
        match file.write_all(&zeros[..step]) {
            Ok(()) => {}
            // A device smaller than the wipe window is fine; stop at its end.
            Err(err) if err.raw_os_error() == Some(libc::ENOSPC) => break,
            Err(err) => return Err(map_open_err(err, device, "wiping")),
        }
        remaining -= step as u64;
    }
    file.sync_all().context("flush after wipe failed")?;
    Ok(wipe_bytes - remaining)
}

/// Streams the image onto the device through an O_SYNC descriptor. On return
/// (success or error) `bytes_written` holds the actual stream count.
pub fn write_image(
    image: &Path,
    device: &Path,
    chunk: usize,
    cancel: &CancelToken,
    deadline: Instant,
    bytes_written: &mut u64,
) -> Result<()> {
    let mut src = File::open(image).map_err(|err| map_open_err(err, image, "opening"))?;
    let total = src
        .metadata()
        .with_context(|| format!("failed to stat {}", image.display()))?
        .len();
    let mut dst = open_sync_writer(device)?;

    info!(
        image = %image.display(),
        device = %device.display(),
        bytes = total,
        "writing image"
    );
    let mut buf = vec![0u8; chunk];
    let mut next_progress = PROGRESS_STEP;
    loop {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Err(CoreError::new(
                ErrorCode::Cancelled,
                format!(
                    "flash stopped after {bytes_written} of {total} bytes",
                    bytes_written = *bytes_written
                ),
            )
            .into());
        }
        let read = src
            .read(&mut buf)
            .with_context(|| format!("read error on {}", image.display()))?;
        if read == 0 {
            break;
        }
        dst.write_all(&buf[..read])
            .map_err(|err| map_open_err(err, device, "writing"))?;
        *bytes_written += read as u64;
        if *bytes_written >= next_progress {
            debug!(
                written = *bytes_written,
                total,
                pct = (*bytes_written * 100 / total.max(1)),
                "write progress"
            );
            next_progress += PROGRESS_STEP;
        }
    }

    dst.sync_all().context("device sync failed")?;
    flush_device(&dst, device);
    // Process-level sync covers caches outside this descriptor.
    unsafe { libc::sync() };
    info!(written = *bytes_written, "image written and flushed");
    Ok(())
}

/// Device-level cache flush. Only meaningful for real block devices; a
/// regular file standing in as a test device skips it.
fn flush_device(file: &File, device: &Path) {
    let is_block = file
        .metadata()
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false);
    if !is_block {
        return;
    }
    // BLKFLSBUF: flush the block device's buffer cache.
    const BLKFLSBUF: libc::c_ulong = 0x1261;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKFLSBUF as _) };
    if rc != 0 {
        debug!(device = %device.display(), "BLKFLSBUF not supported; relying on fsync");
    }
}

/// SHA-256 of the leading `num_bytes` of the device, bypassing page cache:
/// O_DIRECT with an aligned buffer when the open succeeds, otherwise a
/// buffered read after advising the kernel to drop cached pages.
pub fn read_back_hash(device: &Path, num_bytes: u64, chunk: usize) -> Result<String> {
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(device)
    {
        Ok(file) => {
            debug!(device = %device.display(), "read-back via O_DIRECT");
            hash_direct(file, num_bytes, chunk)
        }
        Err(_) => {
            debug!(device = %device.display(), "O_DIRECT unavailable; dropping caches instead");
            let file =
                File::open(device).map_err(|err| map_open_err(err, device, "opening"))?;
            unsafe {
                libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
            }
            hash_buffered(file, num_bytes)
        }
    }
}

const DIRECT_ALIGN: usize = 4096;

fn hash_direct(mut file: File, num_bytes: u64, chunk: usize) -> Result<String> {
    // O_DIRECT requires aligned buffers and read lengths; over-allocate and
    // slice at the first aligned offset.
    let chunk = chunk.max(DIRECT_ALIGN) / DIRECT_ALIGN * DIRECT_ALIGN;
    let mut backing = vec![0u8; chunk + DIRECT_ALIGN];
    let offset = backing.as_ptr().align_offset(DIRECT_ALIGN);
    let buf = &mut backing[offset..offset + chunk];

    let mut hasher = Sha256::new();
    let mut hashed: u64 = 0;
    while hashed < num_bytes {
        let read = file.read(buf).context("direct read failed")?;
        if read == 0 {
            break;
        }
        let take = ((num_bytes - hashed).min(read as u64)) as usize;
        hasher.update(&buf[..take]);
        hashed += take as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_buffered(mut file: File, num_bytes: u64) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut remaining = num_bytes;
    let mut buf = vec![0u8; 1024 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want]).context("read-back failed")?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}
