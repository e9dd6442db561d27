use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::assert::Assert;
use assert_cmd::Command;

/// Per-test workspace: isolated cache, data, and db paths plus a stub
/// builder program.
pub struct TestEnv {
    pub tmp: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            tmp: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.tmp.path().join("cache")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.tmp.path().join("data")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("imgforge.sqlite")
    }

    /// Command against the imgforge binary with the environment pinned to
    /// this test's directories.
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("imgforge").expect("imgforge binary");
        cmd.env("IMGFORGE_CACHE_DIR", self.cache_dir())
            .env("IMGFORGE_DATA_DIR", self.data_dir())
            .env("IMGFORGE_OFFLINE", "1");
        cmd
    }

    /// Installs an executable stub builder and returns its path. The stub
    /// honors BIN_DIR and produces one sysupgrade image plus a manifest.
    pub fn install_stub_builder(&self) -> PathBuf {
        let script = self.tmp.path().join("stub-builder");
        fs::write(
            &script,
            "#!/bin/sh\n\
             for arg in \"$@\"; do case \"$arg\" in BIN_DIR=*) BIN=\"${arg#BIN_DIR=}\";; esac; done\n\
             mkdir -p \"$BIN\"\n\
             dd if=/dev/zero of=\"$BIN/fw-squashfs-sysupgrade.bin\" bs=1024 count=8 2>/dev/null\n\
             printf 'kernel 6.1\\n' > \"$BIN/fw.manifest\"\n",
        )
        .expect("write stub builder");
        let mut perms = fs::metadata(&script).expect("stat stub").permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("chmod stub");
        script
    }

    /// Seeds a ready toolchain record with a minimal builder tree, the way a
    /// prior `toolchain ensure` would have left it.
    pub fn seed_ready_toolchain(&self, release: &str, target: &str, subtarget: &str) {
        let root = self
            .cache_dir()
            .join(release)
            .join(target)
            .join(subtarget)
            .join("openwrt-imagebuilder-stub");
        fs::create_dir_all(root.join("target")).expect("builder target dir");
        fs::create_dir_all(root.join("packages")).expect("builder packages dir");
        fs::write(root.join("Makefile"), "all:\n").expect("builder makefile");

        let store = imgforge_core::store::StateStore::open(&self.db_path()).expect("open store");
        let record = store
            .begin_toolchain_fetch(release, target, subtarget, "https://example.invalid/stub")
            .expect("begin fetch");
        store
            .mark_toolchain_ready(
                record.id,
                &root.with_extension("tar.xz"),
                &root,
                "stubhash",
                false,
            )
            .expect("mark ready");
    }

    pub fn write_profile_doc(&self, profile_id: &str) -> PathBuf {
        let doc = serde_json::json!({
            "profile_id": profile_id,
            "name": "Home AP",
            "description": "attic access point",
            "device_id": "tl-wdr4300-v1",
            "tags": ["home", "ap"],
            "release": "23.05.3",
            "target": "ath79",
            "subtarget": "generic",
            "builder_profile": "tplink_tl-wdr4300-v1",
            "packages": ["luci", "htop"],
            "packages_remove": ["ppp"]
        });
        let path = self.tmp.path().join(format!("{profile_id}.json"));
        fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).expect("write profile doc");
        path
    }
}

/// Parses the JSON envelope from a finished command's stdout.
pub fn parse_stdout(assert: &Assert) -> serde_json::Value {
    let raw = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    serde_json::from_str(&raw).unwrap_or_else(|err| panic!("stdout is not JSON ({err}): {raw}"))
}

/// Parses the JSON envelope from stderr (error path). Tracing writes log
/// lines to stderr first; the envelope starts at the first `{` line.
pub fn parse_stderr(assert: &Assert) -> serde_json::Value {
    let raw = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    let start = raw
        .lines()
        .position(|line| line.trim_start().starts_with('{'))
        .unwrap_or_else(|| panic!("no JSON envelope on stderr: {raw}"));
    let tail: String = raw.lines().skip(start).collect::<Vec<_>>().join("\n");
    serde_json::from_str(&tail).unwrap_or_else(|err| panic!("stderr is not JSON ({err}): {raw}"))
}

#[allow(dead_code)]
pub fn exists(path: &Path) -> bool {
    path.exists()
}
