//! Subprocess supervision for external builder invocations.
//!
//! One `make image` process per build, working directory set to the builder
//! root, arguments passed as `KEY=VALUE` assignments. Output is captured to
//! the build log with a bounded in-memory tail; stop requests escalate from
//! SIGTERM to SIGKILL against the child's process group.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use imgforge_domain::{BuildOverrides, Profile};

use crate::util::now_unix;
use crate::CancelToken;

/// Bytes of combined output kept in memory for error reporting.
const TAIL_LIMIT: usize = 64 * 1024;

/// Fully composed builder invocation.
#[derive(Debug, Clone)]
pub struct BuilderInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl BuilderInvocation {
    #[must_use]
    pub fn rendered(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Why the subprocess stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exited,
    TimedOut,
    Cancelled,
}

/// Everything the engine needs to judge one subprocess run.
#[derive(Debug)]
pub struct ExecutionReport {
    pub exit_code: Option<i32>,
    pub stop_reason: StopReason,
    pub tail: String,
    pub started_at: i64,
    pub finished_at: i64,
}

impl ExecutionReport {
    #[must_use]
    pub fn success(&self) -> bool {
        self.stop_reason == StopReason::Exited && self.exit_code == Some(0)
    }
}

/// Composes the `make image` invocation for a profile plus request overrides.
pub fn compose_invocation(
    builder_program: &Path,
    builder_root: &Path,
    profile: &Profile,
    package_tokens: &[String],
    files_dir: Option<&Path>,
    bin_dir: &Path,
    overrides: &BuildOverrides,
) -> BuilderInvocation {
    let mut args = vec![
        "image".to_string(),
        format!("PROFILE={}", profile.builder_profile),
    ];

    if !package_tokens.is_empty() {
        args.push(format!("PACKAGES={}", package_tokens.join(" ")));
    }
    if let Some(files) = files_dir {
        args.push(format!("FILES={}", files.display()));
    }
    args.push(format!("BIN_DIR={}", bin_dir.display()));

    let extra_name = overrides
        .extra_image_name
        .as_deref()
        .or(profile.image_options.extra_image_name.as_deref());
    if let Some(extra) = extra_name {
        args.push(format!("EXTRA_IMAGE_NAME={extra}"));
    }
    if !profile.image_options.disabled_services.is_empty() {
        args.push(format!(
            "DISABLED_SERVICES={}",
            profile.image_options.disabled_services.join(" ")
        ));
    }
    if let Some(size) = profile.image_options.rootfs_partsize {
        args.push(format!("ROOTFS_PARTSIZE={size}"));
    }
    if profile.image_options.add_local_key.unwrap_or(false) {
        args.push("ADD_LOCAL_KEY=1".to_string());
    }
    if overrides.initramfs {
        args.push("INITRAMFS=1".to_string());
    }

    BuilderInvocation {
        program: builder_program.to_path_buf(),
        args,
        cwd: builder_root.to_path_buf(),
    }
}

struct LogSink {
    file: File,
    tail: Vec<u8>,
}

impl LogSink {
    fn push_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
        self.tail.extend_from_slice(line.as_bytes());
        self.tail.push(b'\n');
        if self.tail.len() > TAIL_LIMIT {
            let cut = self.tail.len() - TAIL_LIMIT;
            self.tail.drain(..cut);
        }
    }
}

fn pump_stream<R: Read + Send + 'static>(
    reader: R,
    sink: Arc<Mutex<LogSink>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let buffered = BufReader::new(reader);
        for line in buffered.lines() {
            let Ok(line) = line else { break };
            if let Ok(mut sink) = sink.lock() {
                sink.push_line(&line);
            }
        }
    })
}

fn kill_pgroup(pgid: u32, force: bool) {
    let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
    // Negative pid addresses the whole process group.
    let _ = unsafe { libc::kill(-(pgid as i32), sig) };
}

/// Runs the invocation to completion, honoring the deadline and the caller's
/// cancellation token. Never returns early while the child is alive.
pub fn run(
    invocation: &BuilderInvocation,
    log_path: &Path,
    timeout: Duration,
    term_grace: Duration,
    cancel: &CancelToken,
) -> Result<ExecutionReport> {
    let started_at = now_unix();
    let mut log_file = File::create(log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    writeln!(log_file, "# Command: {}", invocation.rendered())?;
    writeln!(log_file, "# CWD: {}", invocation.cwd.display())?;
    writeln!(log_file, "# Started: {started_at}")?;
    writeln!(log_file, "# {}", "=".repeat(70))?;
    log_file.flush()?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    {
        use std::os::unix::process::CommandExt;
        // Own process group so stop requests reach the whole build subtree.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    info!(command = %invocation.rendered(), cwd = %invocation.cwd.display(), "starting builder");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", invocation.program.display()))?;
    let pgid = child.id();

    let sink = Arc::new(Mutex::new(LogSink {
        file: log_file,
        tail: Vec::new(),
    }));
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump_stream(stdout, Arc::clone(&sink)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump_stream(stderr, Arc::clone(&sink)));
    }

    let deadline = Instant::now() + timeout;
    let mut stop_reason = StopReason::Exited;
    let mut termed_at: Option<Instant> = None;

    let status = loop {
        if let Some(status) = child.try_wait().context("failed to poll builder")? {
            break status;
        }
        if termed_at.is_none() {
            if cancel.is_cancelled() {
                warn!(pgid, "build cancelled; sending SIGTERM to process group");
                stop_reason = StopReason::Cancelled;
                kill_pgroup(pgid, false);
                termed_at = Some(Instant::now());
            } else if Instant::now() >= deadline {
                warn!(pgid, timeout_secs = timeout.as_secs(), "build deadline exceeded");
                stop_reason = StopReason::TimedOut;
                kill_pgroup(pgid, false);
                termed_at = Some(Instant::now());
            }
        } else if termed_at.is_some_and(|t| t.elapsed() >= term_grace) {
            debug!(pgid, "grace elapsed; sending SIGKILL to process group");
            kill_pgroup(pgid, true);
        }
        std::thread::sleep(Duration::from_millis(100));
    };

    for pump in pumps {
        let _ = pump.join();
    }

    let finished_at = now_unix();
    let tail = {
        let mut sink = sink.lock().expect("log sink poisoned");
        let _ = writeln!(sink.file, "# Finished: {finished_at}");
        let _ = writeln!(sink.file, "# Exit: {:?}", status.code());
        String::from_utf8_lossy(&sink.tail).into_owned()
    };

    Ok(ExecutionReport {
        exit_code: status.code(),
        stop_reason,
        tail,
        started_at,
        finished_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgforge_domain::{ImageOptions, Policies};

    fn profile() -> Profile {
        serde_json::from_value(serde_json::json!({
            "profile_id": "cmd.test",
            "name": "Cmd",
            "device_id": "dev",
            "release": "23.05.3",
            "target": "ath79",
            "subtarget": "generic",
            "builder_profile": "tplink_tl-wdr4300-v1",
            "image_options": {
                "disabled_services": ["dnsmasq", "odhcpd"],
                "rootfs_partsize": 256,
                "add_local_key": true
            }
        }))
        .unwrap()
    }

    #[test]
    fn invocation_carries_the_full_assignment_contract() {
        let p = profile();
        let tokens = vec!["luci".to_string(), "htop".to_string(), "-ppp".to_string()];
        let inv = compose_invocation(
            Path::new("make"),
            Path::new("/builder/root"),
            &p,
            &tokens,
            Some(Path::new("/staging/files")),
            Path::new("/out/bin"),
            &BuildOverrides {
                extra_image_name: Some("lab".into()),
                initramfs: true,
                ..BuildOverrides::default()
            },
        );
        assert_eq!(inv.args[0], "image");
        assert!(inv.args.contains(&"PROFILE=tplink_tl-wdr4300-v1".to_string()));
        assert!(inv.args.contains(&"PACKAGES=luci htop -ppp".to_string()));
        assert!(inv.args.contains(&"FILES=/staging/files".to_string()));
        assert!(inv.args.contains(&"BIN_DIR=/out/bin".to_string()));
        assert!(inv.args.contains(&"EXTRA_IMAGE_NAME=lab".to_string()));
        assert!(inv.args.contains(&"DISABLED_SERVICES=dnsmasq odhcpd".to_string()));
        assert!(inv.args.contains(&"ROOTFS_PARTSIZE=256".to_string()));
        assert!(inv.args.contains(&"ADD_LOCAL_KEY=1".to_string()));
        assert!(inv.args.contains(&"INITRAMFS=1".to_string()));
    }

    #[test]
    fn profile_extra_image_name_is_used_when_not_overridden() {
        let mut p = profile();
        p.image_options = ImageOptions {
            extra_image_name: Some("fleet".into()),
            ..ImageOptions::default()
        };
        p.policies = Policies::default();
        let inv = compose_invocation(
            Path::new("make"),
            Path::new("/builder"),
            &p,
            &[],
            None,
            Path::new("/bin"),
            &BuildOverrides::default(),
        );
        assert!(inv.args.contains(&"EXTRA_IMAGE_NAME=fleet".to_string()));
        assert!(!inv.args.iter().any(|a| a.starts_with("PACKAGES=")));
        assert!(!inv.args.iter().any(|a| a.starts_with("FILES=")));
    }

    #[test]
    fn run_captures_output_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fake-builder");
        std::fs::write(&script, "#!/bin/sh\necho building\necho oops >&2\nexit 3\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let inv = BuilderInvocation {
            program: script,
            args: vec!["image".into()],
            cwd: tmp.path().to_path_buf(),
        };
        let log = tmp.path().join("build.log");
        let report = run(
            &inv,
            &log,
            Duration::from_secs(30),
            Duration::from_secs(1),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.stop_reason, StopReason::Exited);
        assert!(!report.success());
        assert!(report.tail.contains("building"));
        assert!(report.tail.contains("oops"));
        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("# Command:"));
        assert!(logged.contains("building"));
    }

    #[test]
    fn timeout_escalates_and_reports_timed_out() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("sleepy");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let inv = BuilderInvocation {
            program: script,
            args: Vec::new(),
            cwd: tmp.path().to_path_buf(),
        };
        let started = Instant::now();
        let report = run(
            &inv,
            &tmp.path().join("build.log"),
            Duration::from_millis(300),
            Duration::from_millis(200),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.stop_reason, StopReason::TimedOut);
        assert!(!report.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_stops_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("sleepy");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let cancel = CancelToken::new();
        let cancel_after = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel_after.cancel();
        });

        let inv = BuilderInvocation {
            program: script,
            args: Vec::new(),
            cwd: tmp.path().to_path_buf(),
        };
        let report = run(
            &inv,
            &tmp.path().join("build.log"),
            Duration::from_secs(60),
            Duration::from_millis(200),
            &cancel,
        )
        .unwrap();
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert!(!report.success());
    }
}
