//! Shared domain model for imgforge: profile recipes, build/flash record
//! vocabulary, the closed error taxonomy, and canonical input hashing.

pub mod error;
pub mod profile;
pub mod snapshot;
pub mod types;

pub use error::{CoreError, ErrorBody, ErrorCode};
pub use profile::{
    BuildDefaults, FileOverlay, ImageOptions, Policies, Profile, ProfileFilter, RootFilesystem,
};
pub use snapshot::{BuildInputs, BuildOverrides, SNAPSHOT_SCHEMA_VERSION};
pub use types::{
    ArtifactKind, BuildStatus, FlashStatus, ToolchainState, VerifyMode, VerifyOutcome,
};
