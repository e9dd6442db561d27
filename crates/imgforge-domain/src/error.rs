use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Closed taxonomy of failure codes. Codes are part of the public contract
/// and must stay stable across versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Precondition,
    CacheConflict,
    DownloadFailed,
    BuildFailed,
    BuildTimeout,
    Cancelled,
    FlashHashMismatch,
    PermissionDenied,
    Security,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Precondition => "precondition",
            Self::CacheConflict => "cache_conflict",
            Self::DownloadFailed => "download_failed",
            Self::BuildFailed => "build_failed",
            Self::BuildTimeout => "build_timeout",
            Self::Cancelled => "cancelled",
            Self::FlashHashMismatch => "flash_hash_mismatch",
            Self::PermissionDenied => "permission_denied",
            Self::Security => "security",
        }
    }
}

impl TryFrom<&str> for ErrorCode {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "validation" => Ok(Self::Validation),
            "not_found" => Ok(Self::NotFound),
            "precondition" => Ok(Self::Precondition),
            "cache_conflict" => Ok(Self::CacheConflict),
            "download_failed" => Ok(Self::DownloadFailed),
            "build_failed" => Ok(Self::BuildFailed),
            "build_timeout" => Ok(Self::BuildTimeout),
            "cancelled" => Ok(Self::Cancelled),
            "flash_hash_mismatch" => Ok(Self::FlashHashMismatch),
            "permission_denied" => Ok(Self::PermissionDenied),
            "security" => Ok(Self::Security),
            other => Err(format!("unknown error code '{other}'")),
        }
    }
}

/// Error value carried across every component boundary. Exactly one code,
/// a human message, optional structured details, and the log path when one
/// exists for the failed operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{}] {message}", .code.as_str())]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub log_path: Option<PathBuf>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            log_path: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
            log_path: self
                .log_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

/// Serialized error shape returned by the facade and persisted on records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl ErrorBody {
    /// Collapses an `anyhow` chain into the wire shape. A `CoreError` anywhere
    /// in the chain wins; otherwise the code is derived from the io error kind
    /// when one is present, defaulting to `precondition`.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(core) = cause.downcast_ref::<CoreError>() {
                return core.body();
            }
        }
        let code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<std::io::Error>())
            .and_then(|io| match io.kind() {
                std::io::ErrorKind::PermissionDenied => Some(ErrorCode::PermissionDenied),
                std::io::ErrorKind::NotFound => Some(ErrorCode::NotFound),
                _ => None,
            })
            .unwrap_or(ErrorCode::Precondition);
        Self {
            code,
            message: format!("{err:#}"),
            details: None,
            log_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_and_serialize_snake_case() {
        let codes = [
            ErrorCode::Validation,
            ErrorCode::NotFound,
            ErrorCode::Precondition,
            ErrorCode::CacheConflict,
            ErrorCode::DownloadFailed,
            ErrorCode::BuildFailed,
            ErrorCode::BuildTimeout,
            ErrorCode::Cancelled,
            ErrorCode::FlashHashMismatch,
            ErrorCode::PermissionDenied,
            ErrorCode::Security,
        ];
        for code in codes {
            assert_eq!(ErrorCode::try_from(code.as_str()).unwrap(), code);
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn anyhow_chain_surfaces_embedded_core_error() {
        let inner = CoreError::new(ErrorCode::DownloadFailed, "checksum mismatch")
            .with_details(serde_json::json!({"expected": "aa", "actual": "bb"}));
        let err = anyhow::Error::new(inner).context("ensuring toolchain");
        let body = ErrorBody::from_anyhow(&err);
        assert_eq!(body.code, ErrorCode::DownloadFailed);
        assert_eq!(body.message, "checksum mismatch");
        assert!(body.details.is_some());
    }

    #[test]
    fn anyhow_chain_maps_io_permission_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = anyhow::Error::new(io).context("opening device");
        let body = ErrorBody::from_anyhow(&err);
        assert_eq!(body.code, ErrorCode::PermissionDenied);
    }
}
