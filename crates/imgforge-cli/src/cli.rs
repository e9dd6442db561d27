use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "imgforge",
    about = "Reproducible firmware image builds and verified flashing",
    version
)]
pub struct Cli {
    /// Emit machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Never download toolchains; only cached instances may serve.
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: CommandGroup,
}

#[derive(Debug, Subcommand)]
pub enum CommandGroup {
    /// Manage device build profiles.
    #[command(subcommand)]
    Profile(ProfileCmd),
    /// Manage cached builder toolchains.
    #[command(subcommand)]
    Toolchain(ToolchainCmd),
    /// Run and inspect builds.
    #[command(subcommand)]
    Build(BuildCmd),
    /// Write artifacts to block devices.
    #[command(subcommand)]
    Flash(FlashCmd),
}

#[derive(Debug, Subcommand)]
pub enum ProfileCmd {
    /// List profiles, optionally filtered.
    List(ProfileListArgs),
    /// Show one profile.
    Get { profile_id: String },
    /// Import a profile document (JSON).
    Import { file: PathBuf },
    /// Export a profile document (JSON).
    Export {
        profile_id: String,
        /// Write to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete a profile.
    Delete { profile_id: String },
}

#[derive(Debug, Args, Default)]
pub struct ProfileListArgs {
    #[arg(long)]
    pub release: Option<String>,
    #[arg(long)]
    pub target: Option<String>,
    #[arg(long)]
    pub subtarget: Option<String>,
    #[arg(long)]
    pub tag: Option<String>,
    /// Free-text match against id, name, description, and device.
    #[arg(long)]
    pub text: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ToolchainCmd {
    /// Download, verify, and extract the toolchain for a target triple.
    Ensure {
        release: String,
        target: String,
        subtarget: String,
    },
    /// List cached toolchains.
    List,
    /// Remove broken toolchains, and ready ones unused for the given days.
    Prune {
        #[arg(long)]
        unused_for_days: Option<i64>,
    },
    /// Show cache totals and instances.
    Info,
}

#[derive(Debug, Subcommand)]
pub enum BuildCmd {
    /// Build a profile, reusing a cached result when inputs are unchanged.
    Run(BuildRunArgs),
    /// Build several profiles with bounded parallelism.
    Batch(BuildBatchArgs),
    /// List build records.
    List {
        #[arg(long)]
        profile: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one build with its artifacts.
    Get { build_id: i64 },
    /// List the artifacts of a build.
    Artifacts { build_id: i64 },
}

#[derive(Debug, Args)]
pub struct BuildRunArgs {
    pub profile_id: String,
    /// Rebuild even when a cached result exists.
    #[arg(long)]
    pub force: bool,
    /// Request an initramfs image.
    #[arg(long)]
    pub initramfs: bool,
    /// Extra package to add (repeatable).
    #[arg(long = "package")]
    pub packages: Vec<String>,
    /// Extra package to remove (repeatable).
    #[arg(long = "remove-package")]
    pub remove_packages: Vec<String>,
    /// Image name suffix override.
    #[arg(long)]
    pub extra_image_name: Option<String>,
    /// Output directory override.
    #[arg(long)]
    pub bin_dir: Option<String>,
    /// Keep the overlay staging directory for debugging.
    #[arg(long)]
    pub keep_build_dir: bool,
}

#[derive(Debug, Args)]
pub struct BuildBatchArgs {
    /// Profiles to build, in admission order.
    #[arg(required = true)]
    pub profile_ids: Vec<String>,
    /// Stop admitting new builds after the first failure.
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(Debug, Subcommand)]
pub enum FlashCmd {
    /// Write an artifact or image file to a whole block device.
    Run(FlashRunArgs),
    /// List flash records.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        artifact: Option<i64>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one flash record.
    Get { flash_id: i64 },
}

#[derive(Debug, Args)]
pub struct FlashRunArgs {
    /// Whole-device path to write to (never a partition).
    pub device: String,
    /// Artifact id recorded by a build.
    #[arg(long, conflicts_with = "image")]
    pub artifact: Option<i64>,
    /// Raw image file path.
    #[arg(long, conflicts_with = "artifact")]
    pub image: Option<PathBuf>,
    /// Verification mode: full, prefix-16MiB, prefix-64MiB, or prefix-<bytes>.
    #[arg(long, default_value = "full")]
    pub verify: String,
    /// Zero the signature region before writing.
    #[arg(long)]
    pub wipe: bool,
    /// Log the plan and record it without writing.
    #[arg(long)]
    pub dry_run: bool,
    /// Required for any real write.
    #[arg(long)]
    pub force: bool,
}
