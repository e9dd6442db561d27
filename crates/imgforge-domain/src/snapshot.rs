//! Canonical build-input snapshot and cache-key hashing.
//!
//! The snapshot captures every input that determines build output. It is
//! rendered to canonical JSON (sorted map keys, compact separators, absent
//! fields omitted, strings in Unicode NFC) and hashed with SHA-256; the hex
//! digest is the cache key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::{is_nfc, UnicodeNormalization};

use crate::error::{CoreError, ErrorCode};
use crate::profile::{BuildDefaults, FileOverlay, ImageOptions, Policies, Profile};

/// Bumping this invalidates every previously computed cache key.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Per-request knobs that travel into the snapshot. `force_rebuild` is a
/// control signal, not an input, and deliberately has no field here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOverrides {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_packages_remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub initramfs: bool,
}

impl BuildOverrides {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extra_packages.is_empty()
            && self.extra_packages_remove.is_empty()
            && self.extra_image_name.is_none()
            && self.bin_dir.is_none()
            && !self.initramfs
    }
}

/// Profile fields that determine build output. Timestamps and provenance
/// (notes, created_by) are excluded; tag sets are sorted so declaration order
/// is not an input.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileSnapshot {
    profile_id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    device_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    release: String,
    target: String,
    subtarget: String,
    builder_profile: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    packages_remove: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    files: Vec<FileOverlay>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay_dir: Option<String>,
    #[serde(skip_serializing_if = "Policies::is_empty")]
    policies: Policies,
    build_defaults: BuildDefaults,
    image_options: ImageOptions,
}

impl ProfileSnapshot {
    fn capture(profile: &Profile) -> Self {
        let mut tags = profile.tags.clone();
        tags.sort();
        tags.dedup();
        let mut image_options = profile.image_options.clone();
        image_options.disabled_services.sort();
        image_options.disabled_services.dedup();
        Self {
            profile_id: profile.profile_id.clone(),
            name: profile.name.clone(),
            description: profile.description.clone(),
            device_id: profile.device_id.clone(),
            tags,
            release: profile.release.clone(),
            target: profile.target.clone(),
            subtarget: profile.subtarget.clone(),
            builder_profile: profile.builder_profile.clone(),
            packages: profile.packages.clone(),
            packages_remove: profile.packages_remove.clone(),
            files: profile.files.clone(),
            overlay_dir: profile.overlay_dir.clone(),
            policies: profile.policies.clone(),
            build_defaults: profile.build_defaults.clone(),
            image_options,
        }
    }
}

/// Canonical representation of everything that feeds one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInputs {
    schema_version: u32,
    profile_snapshot: serde_json::Value,
    toolchain_key: [String; 3],
    toolchain_archive_hash: String,
    effective_packages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay_tree_hash: Option<String>,
    #[serde(skip_serializing_if = "BuildOverrides::is_empty")]
    overrides: BuildOverrides,
}

/// Merges declared and override packages into the token list handed to the
/// builder: additive tokens in first-occurrence order, then `-`-prefixed
/// subtractive tokens. A subtractive entry shadows a same-named additive.
#[must_use]
pub fn effective_packages(profile: &Profile, overrides: &BuildOverrides) -> Vec<String> {
    let mut removals: Vec<&str> = Vec::new();
    for pkg in profile
        .packages_remove
        .iter()
        .chain(overrides.extra_packages_remove.iter())
    {
        if !removals.contains(&pkg.as_str()) {
            removals.push(pkg);
        }
    }

    let mut tokens: Vec<String> = Vec::new();
    for pkg in profile.packages.iter().chain(overrides.extra_packages.iter()) {
        if removals.contains(&pkg.as_str()) {
            continue;
        }
        if !tokens.iter().any(|t| t == pkg) {
            tokens.push(pkg.clone());
        }
    }
    for pkg in removals {
        tokens.push(format!("-{pkg}"));
    }
    tokens
}

impl BuildInputs {
    pub fn compose(
        profile: &Profile,
        toolchain_archive_hash: &str,
        overlay_tree_hash: Option<&str>,
        overrides: &BuildOverrides,
    ) -> Result<Self, CoreError> {
        let snapshot = ProfileSnapshot::capture(profile);
        let profile_snapshot = serde_json::to_value(&snapshot).map_err(|err| {
            CoreError::new(
                ErrorCode::Validation,
                format!("profile is not representable in the snapshot: {err}"),
            )
        })?;
        let mut overrides = overrides.clone();
        overrides.extra_packages_remove.sort();
        overrides.extra_packages_remove.dedup();
        Ok(Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            profile_snapshot,
            toolchain_key: [
                profile.release.clone(),
                profile.target.clone(),
                profile.subtarget.clone(),
            ],
            toolchain_archive_hash: toolchain_archive_hash.to_string(),
            effective_packages: effective_packages(profile, &overrides),
            overlay_tree_hash: overlay_tree_hash.map(str::to_string),
            overrides,
        })
    }

    /// Canonical byte form. Routing through `serde_json::Value` sorts every
    /// map by key; compact separators are the serializer default. Every
    /// string (keys included) is normalized to NFC so equivalent Unicode
    /// representations collapse to one key.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let mut value = serde_json::to_value(self).map_err(|err| {
            CoreError::new(
                ErrorCode::Validation,
                format!("snapshot is not representable: {err}"),
            )
        })?;
        normalize_strings(&mut value);
        serde_json::to_vec(&value).map_err(|err| {
            CoreError::new(ErrorCode::Validation, format!("snapshot serialization: {err}"))
        })
    }

    /// Cache key: `sha256:` + hex digest of the canonical bytes.
    pub fn cache_key(&self) -> Result<String, CoreError> {
        let bytes = self.canonical_bytes()?;
        let digest = Sha256::digest(&bytes);
        Ok(format!("sha256:{}", hex::encode(digest)))
    }

    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("snapshot serializes")
    }

    #[must_use]
    pub fn effective_package_tokens(&self) -> &[String] {
        &self.effective_packages
    }
}

/// Recursively rewrites every string in the value tree to NFC. Map keys are
/// normalized too; reinsertion keeps the map sorted on the normalized form.
fn normalize_strings(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if !is_nfc(s) {
                let normalized: String = s.nfc().collect();
                *s = normalized;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                normalize_strings(item);
            }
        }
        serde_json::Value::Object(map) => {
            if map.keys().any(|key| !is_nfc(key)) {
                let entries: Vec<(String, serde_json::Value)> =
                    std::mem::take(map).into_iter().collect();
                for (key, mut item) in entries {
                    normalize_strings(&mut item);
                    map.insert(key.nfc().collect(), item);
                }
            } else {
                for item in map.values_mut() {
                    normalize_strings(item);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::RootFilesystem;

    fn sample_profile() -> Profile {
        Profile {
            profile_id: "home.ap.23.05".into(),
            name: "Home AP".into(),
            description: None,
            device_id: "tl-wdr4300-v1".into(),
            tags: vec!["ap".into(), "home".into()],
            release: "23.05.3".into(),
            target: "ath79".into(),
            subtarget: "generic".into(),
            builder_profile: "tplink_tl-wdr4300-v1".into(),
            packages: vec!["luci".into(), "htop".into()],
            packages_remove: vec!["ppp".into()],
            files: Vec::new(),
            overlay_dir: None,
            policies: Policies {
                filesystem: Some(RootFilesystem::Squashfs),
                ..Policies::default()
            },
            build_defaults: BuildDefaults::default(),
            image_options: ImageOptions::default(),
            notes: None,
            created_by: None,
        }
    }

    fn key(profile: &Profile, overrides: &BuildOverrides) -> String {
        BuildInputs::compose(profile, "aa11", None, overrides)
            .unwrap()
            .cache_key()
            .unwrap()
    }

    #[test]
    fn cache_key_is_deterministic() {
        let profile = sample_profile();
        let overrides = BuildOverrides::default();
        let first = key(&profile, &overrides);
        for _ in 0..10 {
            assert_eq!(key(&profile, &overrides), first);
        }
    }

    #[test]
    fn nfc_equivalent_strings_collapse_to_the_same_key() {
        // Precomposed U+00E9 versus 'e' plus combining acute U+0301.
        let mut precomposed = sample_profile();
        precomposed.name = "Caf\u{e9} AP".into();
        precomposed.description = Some("attic caf\u{e9}".into());
        let mut decomposed = sample_profile();
        decomposed.name = "Cafe\u{301} AP".into();
        decomposed.description = Some("attic cafe\u{301}".into());

        assert_ne!(precomposed.name, decomposed.name);
        assert_eq!(
            key(&precomposed, &BuildOverrides::default()),
            key(&decomposed, &BuildOverrides::default())
        );
    }

    #[test]
    fn tag_declaration_order_is_not_an_input() {
        let a = sample_profile();
        let mut b = sample_profile();
        b.tags = vec!["home".into(), "ap".into()];
        assert_eq!(key(&a, &BuildOverrides::default()), key(&b, &BuildOverrides::default()));
    }

    #[test]
    fn package_order_is_an_input() {
        let a = sample_profile();
        let mut b = sample_profile();
        b.packages = vec!["htop".into(), "luci".into()];
        assert_ne!(key(&a, &BuildOverrides::default()), key(&b, &BuildOverrides::default()));
    }

    #[test]
    fn every_material_input_changes_the_key() {
        let base = sample_profile();
        let base_key = key(&base, &BuildOverrides::default());

        let mut p = sample_profile();
        p.packages.push("tcpdump".into());
        assert_ne!(key(&p, &BuildOverrides::default()), base_key);

        let mut p = sample_profile();
        p.files.push(FileOverlay {
            source: "files/banner".into(),
            destination: "/etc/banner".into(),
            mode: None,
            owner: None,
        });
        assert_ne!(key(&p, &BuildOverrides::default()), base_key);

        let mut p = sample_profile();
        p.image_options.rootfs_partsize = Some(256);
        assert_ne!(key(&p, &BuildOverrides::default()), base_key);

        // Different toolchain archive hash.
        let other = BuildInputs::compose(&base, "bb22", None, &BuildOverrides::default())
            .unwrap()
            .cache_key()
            .unwrap();
        assert_ne!(other, base_key);

        // Overlay tree hash present vs absent.
        let with_overlay =
            BuildInputs::compose(&base, "aa11", Some("deadbeef"), &BuildOverrides::default())
                .unwrap()
                .cache_key()
                .unwrap();
        assert_ne!(with_overlay, base_key);

        // Request overrides.
        let with_suffix = key(
            &base,
            &BuildOverrides {
                extra_image_name: Some("lab".into()),
                ..BuildOverrides::default()
            },
        );
        assert_ne!(with_suffix, base_key);

        let with_initramfs = key(
            &base,
            &BuildOverrides {
                initramfs: true,
                ..BuildOverrides::default()
            },
        );
        assert_ne!(with_initramfs, base_key);
    }

    #[test]
    fn overlay_mode_changes_the_key() {
        let mut a = sample_profile();
        a.files.push(FileOverlay {
            source: "files/banner".into(),
            destination: "/etc/banner".into(),
            mode: Some("0644".into()),
            owner: None,
        });
        let mut b = a.clone();
        b.files[0].mode = Some("0600".into());
        assert_ne!(key(&a, &BuildOverrides::default()), key(&b, &BuildOverrides::default()));
    }

    #[test]
    fn effective_packages_keep_declaration_order_and_append_removals() {
        let profile = sample_profile();
        let overrides = BuildOverrides {
            extra_packages: vec!["tcpdump".into(), "luci".into()],
            extra_packages_remove: vec!["odhcpd".into()],
            ..BuildOverrides::default()
        };
        let tokens = effective_packages(&profile, &overrides);
        assert_eq!(tokens, vec!["luci", "htop", "tcpdump", "-ppp", "-odhcpd"]);
    }

    #[test]
    fn removal_shadows_same_named_additive() {
        let mut profile = sample_profile();
        profile.packages = vec!["luci".into(), "ppp".into()];
        let tokens = effective_packages(&profile, &BuildOverrides::default());
        assert_eq!(tokens, vec!["luci", "-ppp"]);
    }
}
