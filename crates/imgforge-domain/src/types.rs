use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode};

/// Lifecycle of one build attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl TryFrom<&str> for BuildStatus {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::new(
                ErrorCode::Validation,
                format!("unknown build status '{other}'"),
            )),
        }
    }
}

/// Lifecycle of one flash attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl FlashStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for FlashStatus {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::new(
                ErrorCode::Validation,
                format!("unknown flash status '{other}'"),
            )),
        }
    }
}

/// State of one cached toolchain instance. Only `ready` instances may build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolchainState {
    Pending,
    Ready,
    Broken,
    Deprecated,
}

impl ToolchainState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Broken => "broken",
            Self::Deprecated => "deprecated",
        }
    }
}

impl TryFrom<&str> for ToolchainState {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "broken" => Ok(Self::Broken),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(CoreError::new(
                ErrorCode::Validation,
                format!("unknown toolchain state '{other}'"),
            )),
        }
    }
}

/// Classification of a build output by filename suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Sysupgrade,
    Factory,
    Kernel,
    Rootfs,
    Initramfs,
    Manifest,
    Other,
}

impl ArtifactKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sysupgrade => "sysupgrade",
            Self::Factory => "factory",
            Self::Kernel => "kernel",
            Self::Rootfs => "rootfs",
            Self::Initramfs => "initramfs",
            Self::Manifest => "manifest",
            Self::Other => "other",
        }
    }
}

impl TryFrom<&str> for ArtifactKind {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "sysupgrade" => Ok(Self::Sysupgrade),
            "factory" => Ok(Self::Factory),
            "kernel" => Ok(Self::Kernel),
            "rootfs" => Ok(Self::Rootfs),
            "initramfs" => Ok(Self::Initramfs),
            "manifest" => Ok(Self::Manifest),
            "other" => Ok(Self::Other),
            other => Err(CoreError::new(
                ErrorCode::Validation,
                format!("unknown artifact kind '{other}'"),
            )),
        }
    }
}

/// How much of the written image is read back and compared after a flash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    /// Read back the full image length.
    Full,
    /// Read back only the leading `0` bytes (clamped to the image size).
    Prefix(u64),
}

impl VerifyMode {
    pub const PREFIX_16M: VerifyMode = VerifyMode::Prefix(16 * 1024 * 1024);
    pub const PREFIX_64M: VerifyMode = VerifyMode::Prefix(64 * 1024 * 1024);

    /// Number of bytes to verify for an image of `image_size` bytes.
    #[must_use]
    pub fn verify_bytes(self, image_size: u64) -> u64 {
        match self {
            Self::Full => image_size,
            Self::Prefix(n) => n.min(image_size),
        }
    }

    #[must_use]
    pub fn label(self) -> String {
        match self {
            Self::Full => "full".to_string(),
            Self::Prefix(n) => format!("prefix-{n}"),
        }
    }

    /// Parses `full`, `prefix-<bytes>`, and the documented MiB presets.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "full" | "full-hash" => return Ok(Self::Full),
            "prefix-16MiB" => return Ok(Self::PREFIX_16M),
            "prefix-64MiB" => return Ok(Self::PREFIX_64M),
            _ => {}
        }
        if let Some(raw) = value.strip_prefix("prefix-") {
            let bytes: u64 = raw.parse().map_err(|_| {
                CoreError::new(
                    ErrorCode::Validation,
                    format!("invalid verification mode '{value}'"),
                )
            })?;
            if bytes == 0 {
                return Err(CoreError::new(
                    ErrorCode::Validation,
                    "verification prefix must be non-zero",
                ));
            }
            return Ok(Self::Prefix(bytes));
        }
        Err(CoreError::new(
            ErrorCode::Validation,
            format!("invalid verification mode '{value}'"),
        ))
    }
}

/// Outcome of the post-write read-back comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyOutcome {
    Match,
    Mismatch,
    Skipped,
}

impl VerifyOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Mismatch => "mismatch",
            Self::Skipped => "skipped",
        }
    }
}

impl TryFrom<&str> for VerifyOutcome {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "match" => Ok(Self::Match),
            "mismatch" => Ok(Self::Mismatch),
            "skipped" => Ok(Self::Skipped),
            other => Err(CoreError::new(
                ErrorCode::Validation,
                format!("unknown verification result '{other}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Running,
            BuildStatus::Succeeded,
            BuildStatus::Failed,
        ] {
            assert_eq!(BuildStatus::try_from(status.as_str()).unwrap(), status);
        }
        assert!(BuildStatus::try_from("done").is_err());
    }

    #[test]
    fn verify_mode_parses_presets_and_raw_bytes() {
        assert_eq!(VerifyMode::parse("full").unwrap(), VerifyMode::Full);
        assert_eq!(
            VerifyMode::parse("prefix-16MiB").unwrap(),
            VerifyMode::Prefix(16 * 1024 * 1024)
        );
        assert_eq!(
            VerifyMode::parse("prefix-4096").unwrap(),
            VerifyMode::Prefix(4096)
        );
        assert!(VerifyMode::parse("prefix-0").is_err());
        assert!(VerifyMode::parse("partial").is_err());
    }

    #[test]
    fn verify_bytes_clamps_to_image_size() {
        assert_eq!(VerifyMode::Full.verify_bytes(1000), 1000);
        assert_eq!(VerifyMode::Prefix(64).verify_bytes(1000), 64);
        assert_eq!(VerifyMode::PREFIX_16M.verify_bytes(1000), 1000);
    }
}
