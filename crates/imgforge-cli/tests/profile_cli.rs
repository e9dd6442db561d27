mod common;

use common::{parse_stderr, parse_stdout, TestEnv};

#[test]
fn import_get_export_round_trip() {
    let env = TestEnv::new();
    let doc_path = env.write_profile_doc("home.ap.23.05");

    let assert = env
        .cmd()
        .args(["--json", "profile", "import"])
        .arg(&doc_path)
        .assert()
        .success();
    let payload = parse_stdout(&assert);
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["result"]["profile_id"], "home.ap.23.05");

    let assert = env
        .cmd()
        .args(["--json", "profile", "get", "home.ap.23.05"])
        .assert()
        .success();
    let payload = parse_stdout(&assert);
    assert_eq!(payload["result"]["release"], "23.05.3");
    assert_eq!(payload["result"]["packages"][0], "luci");

    // Export, then re-import under the same id: a lossless round trip.
    let exported = env.tmp.path().join("exported.json");
    env.cmd()
        .args(["profile", "export", "home.ap.23.05", "--output"])
        .arg(&exported)
        .assert()
        .success();
    let original: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&doc_path).unwrap()).unwrap();
    let round_tripped: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&exported).unwrap()).unwrap();
    assert_eq!(round_tripped, original);
}

#[test]
fn unknown_keys_fail_import_with_validation_code() {
    let env = TestEnv::new();
    let path = env.tmp.path().join("bad.json");
    std::fs::write(
        &path,
        serde_json::json!({
            "profile_id": "bad.one",
            "name": "Bad",
            "device_id": "dev",
            "release": "23.05.3",
            "target": "ath79",
            "subtarget": "generic",
            "builder_profile": "generic",
            "favorite_color": "blue"
        })
        .to_string(),
    )
    .unwrap();

    let assert = env
        .cmd()
        .args(["--json", "profile", "import"])
        .arg(&path)
        .assert()
        .failure();
    let payload = parse_stderr(&assert);
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["error"]["code"], "validation");

    // Nothing was stored.
    let assert = env
        .cmd()
        .args(["--json", "profile", "list"])
        .assert()
        .success();
    let payload = parse_stdout(&assert);
    assert_eq!(payload["result"].as_array().unwrap().len(), 0);
}

#[test]
fn list_filters_by_release_and_tag() {
    let env = TestEnv::new();
    let doc = env.write_profile_doc("home.ap.23.05");
    env.cmd()
        .args(["profile", "import"])
        .arg(&doc)
        .assert()
        .success();

    let assert = env
        .cmd()
        .args(["--json", "profile", "list", "--release", "23.05.3", "--tag", "home"])
        .assert()
        .success();
    let payload = parse_stdout(&assert);
    assert_eq!(payload["result"].as_array().unwrap().len(), 1);

    let assert = env
        .cmd()
        .args(["--json", "profile", "list", "--release", "22.03.0"])
        .assert()
        .success();
    let payload = parse_stdout(&assert);
    assert_eq!(payload["result"].as_array().unwrap().len(), 0);
}

#[test]
fn get_missing_profile_is_not_found() {
    let env = TestEnv::new();
    let assert = env
        .cmd()
        .args(["--json", "profile", "get", "ghost"])
        .assert()
        .failure();
    let payload = parse_stderr(&assert);
    assert_eq!(payload["error"]["code"], "not_found");
}

#[test]
fn delete_removes_the_profile() {
    let env = TestEnv::new();
    let doc = env.write_profile_doc("home.ap.23.05");
    env.cmd()
        .args(["profile", "import"])
        .arg(&doc)
        .assert()
        .success();

    let assert = env
        .cmd()
        .args(["--json", "profile", "delete", "home.ap.23.05"])
        .assert()
        .success();
    let payload = parse_stdout(&assert);
    assert_eq!(payload["result"]["removed"], true);

    env.cmd()
        .args(["--json", "profile", "get", "home.ap.23.05"])
        .assert()
        .failure();
}
