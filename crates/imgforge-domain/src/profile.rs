use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode};

/// One file overlay: copy `source` from the host into the image at
/// `destination`, optionally forcing a mode and owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOverlay {
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl FileOverlay {
    /// Parsed octal mode bits, when a mode string is present.
    pub fn mode_bits(&self) -> Result<Option<u32>, CoreError> {
        match self.mode.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let trimmed = raw.trim_start_matches("0o");
                u32::from_str_radix(trimmed, 8).map(Some).map_err(|_| {
                    CoreError::new(
                        ErrorCode::Validation,
                        format!("invalid octal mode '{raw}' for {}", self.destination),
                    )
                })
            }
        }
    }

    /// Splits `user:group` owner strings; `user` alone is also accepted.
    pub fn owner_parts(&self) -> Result<Option<(String, Option<String>)>, CoreError> {
        match self.owner.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let raw = raw.trim();
                if raw.is_empty() {
                    return Err(CoreError::new(
                        ErrorCode::Validation,
                        format!("empty owner for {}", self.destination),
                    ));
                }
                match raw.split_once(':') {
                    Some((user, group)) if !user.is_empty() && !group.is_empty() => {
                        Ok(Some((user.to_string(), Some(group.to_string()))))
                    }
                    Some(_) => Err(CoreError::new(
                        ErrorCode::Validation,
                        format!("invalid owner '{raw}' for {}", self.destination),
                    )),
                    None => Ok(Some((raw.to_string(), None))),
                }
            }
        }
    }
}

/// Root filesystem flavor requested by the profile policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RootFilesystem {
    #[default]
    Squashfs,
    Ext4,
}

impl RootFilesystem {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Squashfs => "squashfs",
            Self::Ext4 => "ext4",
        }
    }
}

/// Build policies. All fields optional so that unset policies stay out of the
/// canonical snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Policies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<RootFilesystem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_kernel_symbols: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resize_rootfs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_snapshot: Option<bool>,
}

impl Policies {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filesystem.is_none()
            && self.include_kernel_symbols.is_none()
            && self.strip_debug.is_none()
            && self.auto_resize_rootfs.is_none()
            && self.allow_snapshot.is_none()
    }
}

/// Per-profile defaults applied when a build request leaves them unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_if_cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_build_dir: Option<bool>,
}

impl BuildDefaults {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rebuild_if_cached.is_none() && self.initramfs.is_none() && self.keep_build_dir.is_none()
    }
}

/// Options forwarded to the external image builder invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ImageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_partsize: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_local_key: Option<bool>,
}

impl ImageOptions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bin_dir.is_none()
            && self.extra_image_name.is_none()
            && self.disabled_services.is_empty()
            && self.rootfs_partsize.is_none()
            && self.add_local_key.is_none()
    }
}

/// Immutable build recipe for one device. This is the in-memory structure the
/// engines consume and the document shape import/export speaks.
///
/// Unknown keys in an import document are rejected so two profiles that hash
/// identically cannot carry invisible differences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub profile_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    pub release: String,
    pub target: String,
    pub subtarget: String,
    pub builder_profile: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages_remove: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileOverlay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Policies::is_empty")]
    pub policies: Policies,
    #[serde(default, skip_serializing_if = "BuildDefaults::is_empty")]
    pub build_defaults: BuildDefaults,
    #[serde(default, skip_serializing_if = "ImageOptions::is_empty")]
    pub image_options: ImageOptions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

fn valid_profile_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

impl Profile {
    /// Validates the invariants an import or upsert must uphold.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !valid_profile_id(&self.profile_id) {
            return Err(CoreError::new(
                ErrorCode::Validation,
                format!(
                    "profile id '{}' must match [A-Za-z0-9_.-]+",
                    self.profile_id
                ),
            ));
        }
        for field in [
            ("name", &self.name),
            ("release", &self.release),
            ("target", &self.target),
            ("subtarget", &self.subtarget),
            ("builder_profile", &self.builder_profile),
        ] {
            if field.1.trim().is_empty() {
                return Err(CoreError::new(
                    ErrorCode::Validation,
                    format!("profile field '{}' must not be empty", field.0),
                ));
            }
        }
        for overlay in &self.files {
            if !overlay.destination.starts_with('/') {
                return Err(CoreError::new(
                    ErrorCode::Validation,
                    format!(
                        "overlay destination '{}' must be absolute",
                        overlay.destination
                    ),
                ));
            }
            overlay.mode_bits()?;
            overlay.owner_parts()?;
        }
        for pkg in self.packages.iter().chain(self.packages_remove.iter()) {
            if pkg.trim().is_empty() || pkg.contains(char::is_whitespace) {
                return Err(CoreError::new(
                    ErrorCode::Validation,
                    format!("invalid package token '{pkg}'"),
                ));
            }
        }
        if let Some(size) = self.image_options.rootfs_partsize {
            if size == 0 {
                return Err(CoreError::new(
                    ErrorCode::Validation,
                    "rootfs_partsize must be at least 1 MiB",
                ));
            }
        }
        Ok(())
    }

    /// Parses a profile import document from its JSON form.
    pub fn from_json(doc: &str) -> Result<Self, CoreError> {
        let profile: Profile = serde_json::from_str(doc).map_err(|err| {
            CoreError::new(ErrorCode::Validation, format!("invalid profile document: {err}"))
        })?;
        profile.validate()?;
        Ok(profile)
    }

    /// Serializes the export document.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("profile serializes")
    }

    /// Key of the toolchain this profile builds against.
    #[must_use]
    pub fn toolchain_key(&self) -> (String, String, String) {
        (
            self.release.clone(),
            self.target.clone(),
            self.subtarget.clone(),
        )
    }

    #[must_use]
    pub fn has_overlay_content(&self) -> bool {
        !self.files.is_empty() || self.overlay_dir.is_some()
    }
}

/// Filter for profile listings; all predicates are conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtarget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Substring match against id, name, description, and device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ProfileFilter {
    #[must_use]
    pub fn matches(&self, profile: &Profile) -> bool {
        if let Some(release) = &self.release {
            if &profile.release != release {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if &profile.target != target {
                return false;
            }
        }
        if let Some(subtarget) = &self.subtarget {
            if &profile.subtarget != subtarget {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !profile.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let haystacks = [
                Some(profile.profile_id.as_str()),
                Some(profile.name.as_str()),
                profile.description.as_deref(),
                Some(profile.device_id.as_str()),
            ];
            if !haystacks
                .into_iter()
                .flatten()
                .any(|h| h.to_lowercase().contains(&needle))
            {
                return false;
            }
        }
        true
    }
}
