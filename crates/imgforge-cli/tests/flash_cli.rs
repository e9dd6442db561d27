mod common;

use common::{parse_stderr, parse_stdout, TestEnv};

#[test]
fn flash_requires_exactly_one_source() {
    let env = TestEnv::new();
    let assert = env
        .cmd()
        .args(["--json", "flash", "run", "/dev/sdz"])
        .assert()
        .failure();
    let payload = parse_stderr(&assert);
    assert_eq!(payload["error"]["code"], "validation");
}

#[test]
fn missing_device_is_a_precondition_failure() {
    let env = TestEnv::new();
    let image = env.tmp.path().join("fw.bin");
    std::fs::write(&image, vec![0u8; 4096]).unwrap();

    let assert = env
        .cmd()
        .args(["--json", "flash", "run", "/dev/definitely-not-here", "--image"])
        .arg(&image)
        .args(["--force"])
        .assert()
        .failure();
    let payload = parse_stderr(&assert);
    assert_eq!(payload["error"]["code"], "precondition");

    // The attempt still left a terminal failed record.
    let assert = env
        .cmd()
        .args(["--json", "flash", "list", "--status", "failed"])
        .assert()
        .success();
    let payload = parse_stdout(&assert);
    let records = payload["result"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["bytes_written"], 0);
}

#[test]
fn regular_file_is_not_a_block_device() {
    let env = TestEnv::new();
    let image = env.tmp.path().join("fw.bin");
    std::fs::write(&image, vec![0u8; 4096]).unwrap();
    let fake_device = env.tmp.path().join("not-a-device");
    std::fs::write(&fake_device, vec![0u8; 4096]).unwrap();

    let assert = env
        .cmd()
        .args(["--json", "flash", "run"])
        .arg(&fake_device)
        .args(["--image"])
        .arg(&image)
        .args(["--force"])
        .assert()
        .failure();
    let payload = parse_stderr(&assert);
    assert_eq!(payload["error"]["code"], "precondition");
    assert!(payload["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not a block device"));
}

#[test]
fn invalid_verify_mode_is_rejected_up_front() {
    let env = TestEnv::new();
    let image = env.tmp.path().join("fw.bin");
    std::fs::write(&image, vec![0u8; 4096]).unwrap();

    let assert = env
        .cmd()
        .args(["--json", "flash", "run", "/dev/sdz", "--image"])
        .arg(&image)
        .args(["--verify", "sometimes"])
        .assert()
        .failure();
    let payload = parse_stderr(&assert);
    assert_eq!(payload["error"]["code"], "validation");
}

#[test]
fn missing_image_file_is_a_precondition_failure() {
    let env = TestEnv::new();
    let assert = env
        .cmd()
        .args([
            "--json",
            "flash",
            "run",
            "/dev/sdz",
            "--image",
            "/nonexistent/fw.bin",
            "--dry-run",
        ])
        .assert()
        .failure();
    let payload = parse_stderr(&assert);
    assert_eq!(payload["error"]["code"], "precondition");
}
