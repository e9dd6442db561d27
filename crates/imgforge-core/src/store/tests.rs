use std::path::Path;

use super::*;
use imgforge_domain::{BuildInputs, BuildOverrides};

fn sample_profile(id: &str) -> Profile {
    serde_json::from_value(serde_json::json!({
        "profile_id": id,
        "name": "Home AP",
        "device_id": "tl-wdr4300-v1",
        "tags": ["home", "ap"],
        "release": "23.05.3",
        "target": "ath79",
        "subtarget": "generic",
        "builder_profile": "tplink_tl-wdr4300-v1",
        "packages": ["luci", "htop"],
        "packages_remove": ["ppp"]
    }))
    .unwrap()
}

fn open_store() -> (tempfile::TempDir, StateStore) {
    let tmp = tempfile::tempdir().unwrap();
    let store = StateStore::open(&tmp.path().join("state.sqlite")).unwrap();
    (tmp, store)
}

fn seed_build(store: &StateStore, profile_id: &str) -> (ProfileRecord, ToolchainRecord, BuildRecord) {
    let profile = store.upsert_profile(&sample_profile(profile_id)).unwrap();
    let toolchain = store
        .begin_toolchain_fetch("23.05.3", "ath79", "generic", "https://example.invalid/a.tar.gz")
        .unwrap();
    store
        .mark_toolchain_ready(
            toolchain.id,
            Path::new("/tmp/archive.tar.gz"),
            Path::new("/tmp/root"),
            "aa11",
            false,
        )
        .unwrap();
    let inputs = BuildInputs::compose(&profile.profile, "aa11", None, &BuildOverrides::default())
        .unwrap();
    let cache_key = inputs.cache_key().unwrap();
    let build = store
        .create_build(profile.id, profile_id, toolchain.id, &cache_key, &inputs.to_value())
        .unwrap();
    (profile, toolchain, build)
}

#[test]
fn profile_upsert_is_idempotent_and_versioned() {
    let (_tmp, store) = open_store();
    let created = store.upsert_profile(&sample_profile("ap.home")).unwrap();
    assert_eq!(created.profile.profile_id, "ap.home");

    let mut changed = sample_profile("ap.home");
    changed.packages.push("tcpdump".into());
    let updated = store.upsert_profile(&changed).unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.profile.packages.len(), 3);
}

#[test]
fn profile_filters_combine_sql_and_document_predicates() {
    let (_tmp, store) = open_store();
    store.upsert_profile(&sample_profile("ap.one")).unwrap();
    let mut other = sample_profile("router.two");
    other.release = "22.03.5".into();
    other.tags = vec!["lab".into()];
    store.upsert_profile(&other).unwrap();

    let by_release = store
        .list_profiles(&ProfileFilter {
            release: Some("23.05.3".into()),
            ..ProfileFilter::default()
        })
        .unwrap();
    assert_eq!(by_release.len(), 1);
    assert_eq!(by_release[0].profile.profile_id, "ap.one");

    let by_tag = store
        .list_profiles(&ProfileFilter {
            tag: Some("lab".into()),
            ..ProfileFilter::default()
        })
        .unwrap();
    assert_eq!(by_tag.len(), 1);
    assert_eq!(by_tag[0].profile.profile_id, "router.two");
}

#[test]
fn missing_profile_is_not_found() {
    let (_tmp, store) = open_store();
    let err = store.require_profile("nope").unwrap_err();
    let core = err.downcast_ref::<CoreError>().unwrap();
    assert_eq!(core.code, ErrorCode::NotFound);
}

#[test]
fn toolchain_lifecycle_pending_to_ready() {
    let (_tmp, store) = open_store();
    let record = store
        .begin_toolchain_fetch("23.05.3", "ath79", "generic", "https://example.invalid/a")
        .unwrap();
    assert_eq!(record.state, ToolchainState::Pending);

    store
        .mark_toolchain_ready(record.id, Path::new("/a"), Path::new("/r"), "hash", true)
        .unwrap();
    let ready = store
        .toolchain_by_key("23.05.3", "ath79", "generic")
        .unwrap()
        .unwrap();
    assert_eq!(ready.state, ToolchainState::Ready);
    assert_eq!(ready.archive_sha256.as_deref(), Some("hash"));
    assert!(ready.signature_verified);
    assert!(ready.last_used_at.is_some());

    // Ready twice is a conflict: the record is no longer pending.
    let err = store
        .mark_toolchain_ready(ready.id, Path::new("/a"), Path::new("/r"), "hash", true)
        .unwrap_err();
    let core = err.downcast_ref::<CoreError>().unwrap();
    assert_eq!(core.code, ErrorCode::CacheConflict);
}

#[test]
fn build_transitions_are_guarded() {
    let (_tmp, store) = open_store();
    let (_profile, _toolchain, build) = seed_build(&store, "guarded");
    assert_eq!(build.status, BuildStatus::Pending);

    // succeeded straight from pending is a torn transition.
    let err = store.mark_build_succeeded(build.id).unwrap_err();
    assert_eq!(
        err.downcast_ref::<CoreError>().unwrap().code,
        ErrorCode::CacheConflict
    );

    store
        .mark_build_running(build.id, Path::new("/b"), Path::new("/b/build.log"))
        .unwrap();
    store.mark_build_succeeded(build.id).unwrap();
    let stored = store.require_build(build.id).unwrap();
    assert_eq!(stored.status, BuildStatus::Succeeded);
    assert!(stored.finished_at.is_some());

    // Terminal records are never rewritten.
    let err = store
        .mark_build_failed(build.id, ErrorCode::BuildFailed, "late failure")
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<CoreError>().unwrap().code,
        ErrorCode::CacheConflict
    );
}

#[test]
fn latest_succeeded_lookup_returns_newest_record() {
    let (_tmp, store) = open_store();
    let (profile, toolchain, first) = seed_build(&store, "cached");
    store
        .mark_build_running(first.id, Path::new("/b1"), Path::new("/b1/build.log"))
        .unwrap();
    store.mark_build_succeeded(first.id).unwrap();

    let second = store
        .create_build(
            profile.id,
            "cached",
            toolchain.id,
            &first.cache_key,
            &first.input_snapshot,
        )
        .unwrap();
    store
        .mark_build_running(second.id, Path::new("/b2"), Path::new("/b2/build.log"))
        .unwrap();
    store.mark_build_succeeded(second.id).unwrap();

    let latest = store
        .latest_succeeded_by_cache_key(&first.cache_key)
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, second.id);
}

#[test]
fn artifacts_are_unique_per_build_filename() {
    let (_tmp, store) = open_store();
    let (_profile, _toolchain, build) = seed_build(&store, "artifacts");
    store
        .mark_build_running(build.id, Path::new("/b"), Path::new("/b/build.log"))
        .unwrap();

    let stored = store
        .add_artifact(
            build.id,
            ArtifactKind::Sysupgrade,
            "fw-sysupgrade.bin",
            "23.05.3/ath79/generic/artifacts/1/fw-sysupgrade.bin",
            2048,
            "cafe",
            &["for-flash".to_string()],
        )
        .unwrap();
    assert_eq!(stored.kind, ArtifactKind::Sysupgrade);
    assert_eq!(stored.labels, vec!["for-flash"]);

    let duplicate = store.add_artifact(
        build.id,
        ArtifactKind::Sysupgrade,
        "fw-sysupgrade.bin",
        "elsewhere",
        1,
        "beef",
        &[],
    );
    assert!(duplicate.is_err());

    let listed = store.artifacts_by_build(build.id).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].sha256, "cafe");
}

#[test]
fn flash_record_lifecycle() {
    let (_tmp, store) = open_store();
    let record = store
        .create_flash(&NewFlash {
            artifact_id: None,
            build_id: None,
            device_path: "/dev/sdz".into(),
            device_model: None,
            device_serial: None,
            image_path: "/tmp/fw.bin".into(),
            verify_mode: "full".into(),
            dry_run: false,
        })
        .unwrap();
    assert_eq!(record.status, FlashStatus::Pending);

    store.mark_flash_running(record.id, true, None).unwrap();
    store
        .finish_flash(
            record.id,
            FlashStatus::Failed,
            4096,
            Some(VerifyOutcome::Mismatch),
            true,
            Some((&ErrorCode::FlashHashMismatch, "read-back digest differs")),
        )
        .unwrap();

    let stored = store.get_flash(record.id).unwrap().unwrap();
    assert_eq!(stored.status, FlashStatus::Failed);
    assert_eq!(stored.verify_result, Some(VerifyOutcome::Mismatch));
    assert!(stored.suspect);
    assert!(stored.wiped);
    assert_eq!(stored.bytes_written, 4096);
    assert_eq!(stored.error_code, Some(ErrorCode::FlashHashMismatch));

    let failed = store
        .list_flashes(Some(FlashStatus::Failed), None, 10)
        .unwrap();
    assert_eq!(failed.len(), 1);
}

#[test]
fn toolchain_in_use_tracks_non_terminal_builds() {
    let (_tmp, store) = open_store();
    let (_profile, toolchain, build) = seed_build(&store, "inuse");
    assert!(store.toolchain_in_use(toolchain.id).unwrap());
    store
        .mark_build_running(build.id, Path::new("/b"), Path::new("/b/build.log"))
        .unwrap();
    store
        .mark_build_failed(build.id, ErrorCode::BuildFailed, "exit 2")
        .unwrap();
    assert!(!store.toolchain_in_use(toolchain.id).unwrap());
}
