use std::env;
use std::fs;

use anyhow::{Context, Result};
use clap::Parser;

use imgforge_core::build::{BatchMode, BatchSelection, BuildRequest};
use imgforge_core::flash::{FlashRequest, FlashSource};
use imgforge_core::{CancelToken, ImgforgeService, Settings};
use imgforge_domain::{
    BuildOverrides, BuildStatus, FlashStatus, ProfileFilter, VerifyMode,
};

mod cli;
mod output;

use cli::{
    BuildCmd, Cli, CommandGroup, FlashCmd, ProfileCmd, ProfileListArgs, ToolchainCmd,
};
use output::{emit_error, emit_success};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if cli.offline {
        env::set_var("IMGFORGE_OFFLINE", "1");
    }

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => emit_error(cli.json, &err),
    };
    if code != 0 {
        std::process::exit(code);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = format!("imgforge={level},imgforge_core={level},imgforge_domain={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &Cli) -> Result<()> {
    let settings = Settings::from_env()?;
    let service = ImgforgeService::new(settings)?;
    let cancel = CancelToken::new();

    match &cli.command {
        CommandGroup::Profile(cmd) => run_profile(cli, &service, cmd),
        CommandGroup::Toolchain(cmd) => run_toolchain(cli, &service, cmd, &cancel),
        CommandGroup::Build(cmd) => run_build(cli, &service, cmd, &cancel),
        CommandGroup::Flash(cmd) => run_flash(cli, &service, cmd, &cancel),
    }
}

fn filter_from(args: &ProfileListArgs) -> ProfileFilter {
    ProfileFilter {
        release: args.release.clone(),
        target: args.target.clone(),
        subtarget: args.subtarget.clone(),
        tag: args.tag.clone(),
        text: args.text.clone(),
    }
}

fn run_profile(cli: &Cli, service: &ImgforgeService, cmd: &ProfileCmd) -> Result<()> {
    match cmd {
        ProfileCmd::List(args) => {
            let profiles = service.profile_list(&filter_from(args))?;
            emit_success(cli.json, &profiles, |profiles| {
                for record in profiles {
                    println!(
                        "{:<24} {:<10} {}/{}/{}",
                        record.profile.profile_id,
                        record.profile.device_id,
                        record.profile.release,
                        record.profile.target,
                        record.profile.subtarget
                    );
                }
            });
        }
        ProfileCmd::Get { profile_id } => {
            let record = service.profile_get(profile_id)?;
            emit_success(cli.json, &record, |record| {
                println!("{}", record.profile.to_json());
            });
        }
        ProfileCmd::Import { file } => {
            let document = fs::read_to_string(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let record = service.profile_import(&document)?;
            emit_success(cli.json, &record, |record| {
                println!("imported profile '{}'", record.profile.profile_id);
            });
        }
        ProfileCmd::Export { profile_id, output } => {
            let document = service.profile_export(profile_id)?;
            match output {
                Some(path) => {
                    fs::write(path, &document)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    emit_success(cli.json, &serde_json::json!({"written": path}), |_| {
                        println!("exported to {}", path.display());
                    });
                }
                None => println!("{document}"),
            }
        }
        ProfileCmd::Delete { profile_id } => {
            let removed = service.profile_delete(profile_id)?;
            emit_success(cli.json, &serde_json::json!({"removed": removed}), |_| {
                if removed {
                    println!("deleted profile '{profile_id}'");
                } else {
                    println!("profile '{profile_id}' did not exist");
                }
            });
        }
    }
    Ok(())
}

fn run_toolchain(
    cli: &Cli,
    service: &ImgforgeService,
    cmd: &ToolchainCmd,
    cancel: &CancelToken,
) -> Result<()> {
    match cmd {
        ToolchainCmd::Ensure {
            release,
            target,
            subtarget,
        } => {
            let record = service.toolchain_ensure(release, target, subtarget, cancel)?;
            emit_success(cli.json, &record, |record| {
                println!(
                    "{}/{}/{} is {}",
                    record.release,
                    record.target,
                    record.subtarget,
                    record.state.as_str()
                );
            });
        }
        ToolchainCmd::List => {
            let records = service.toolchain_list()?;
            emit_success(cli.json, &records, |records| {
                for record in records {
                    println!(
                        "{:<32} {}",
                        format!("{}/{}/{}", record.release, record.target, record.subtarget),
                        record.state.as_str()
                    );
                }
            });
        }
        ToolchainCmd::Prune { unused_for_days } => {
            let report = service.toolchain_prune(unused_for_days.map(|days| days * 86_400))?;
            emit_success(cli.json, &report, |report| {
                println!(
                    "pruned {} instance(s), freed {} bytes",
                    report.removed.len(),
                    report.freed_bytes
                );
            });
        }
        ToolchainCmd::Info => {
            let info = service.toolchain_info()?;
            emit_success(cli.json, &info, |info| {
                println!("cache: {} ({} bytes)", info.cache_dir, info.total_size_bytes);
                for record in &info.instances {
                    println!(
                        "  {}/{}/{}: {}",
                        record.release,
                        record.target,
                        record.subtarget,
                        record.state.as_str()
                    );
                }
            });
        }
    }
    Ok(())
}

fn run_build(
    cli: &Cli,
    service: &ImgforgeService,
    cmd: &BuildCmd,
    cancel: &CancelToken,
) -> Result<()> {
    match cmd {
        BuildCmd::Run(args) => {
            let request = BuildRequest {
                profile_id: args.profile_id.clone(),
                overrides: BuildOverrides {
                    extra_packages: args.packages.clone(),
                    extra_packages_remove: args.remove_packages.clone(),
                    extra_image_name: args.extra_image_name.clone(),
                    bin_dir: args.bin_dir.clone(),
                    initramfs: args.initramfs,
                },
                force_rebuild: args.force,
                keep_build_dir: args.keep_build_dir,
            };
            let outcome = service.build_or_reuse(&request, cancel)?;
            emit_success(cli.json, &outcome, |outcome| {
                println!(
                    "build {} {} ({} artifact(s), cache_hit={})",
                    outcome.build.id,
                    outcome.build.status.as_str(),
                    outcome.artifacts.len(),
                    outcome.cache_hit
                );
                for artifact in &outcome.artifacts {
                    println!(
                        "  [{}] {} ({} bytes)",
                        artifact.kind.as_str(),
                        artifact.filename,
                        artifact.size_bytes
                    );
                }
            });
        }
        BuildCmd::Batch(args) => {
            let mode = if args.fail_fast {
                BatchMode::FailFast
            } else {
                BatchMode::BestEffort
            };
            let selection = BatchSelection::Profiles(args.profile_ids.clone());
            let report = service.build_batch(&selection, mode, cancel)?;
            emit_success(cli.json, &report, |report| {
                println!(
                    "batch: {} succeeded, {} failed, {} skipped",
                    report.succeeded, report.failed, report.skipped
                );
            });
        }
        BuildCmd::List {
            profile,
            status,
            limit,
        } => {
            let status = status
                .as_deref()
                .map(BuildStatus::try_from)
                .transpose()?;
            let records = service.build_list(profile.as_deref(), status, *limit)?;
            emit_success(cli.json, &records, |records| {
                for record in records {
                    println!(
                        "{:>6} {:<24} {:<10} {}",
                        record.id,
                        record.profile_id,
                        record.status.as_str(),
                        &record.cache_key[..record.cache_key.len().min(23)]
                    );
                }
            });
        }
        BuildCmd::Get { build_id } => {
            let view = service.build_get(*build_id)?;
            emit_success(cli.json, &view, |view| {
                println!(
                    "build {}: {} (profile {}, {} artifact(s))",
                    view.build.id,
                    view.build.status.as_str(),
                    view.build.profile_id,
                    view.artifacts.len()
                );
            });
        }
        BuildCmd::Artifacts { build_id } => {
            let artifacts = service.build_artifacts(*build_id)?;
            emit_success(cli.json, &artifacts, |artifacts| {
                for artifact in artifacts {
                    println!(
                        "{:>6} [{}] {} {} bytes sha256:{}",
                        artifact.id,
                        artifact.kind.as_str(),
                        artifact.filename,
                        artifact.size_bytes,
                        artifact.sha256
                    );
                }
            });
        }
    }
    Ok(())
}

fn run_flash(
    cli: &Cli,
    service: &ImgforgeService,
    cmd: &FlashCmd,
    cancel: &CancelToken,
) -> Result<()> {
    match cmd {
        FlashCmd::Run(args) => {
            let source = match (&args.artifact, &args.image) {
                (Some(id), None) => FlashSource::Artifact(*id),
                (None, Some(path)) => FlashSource::Image(path.clone()),
                _ => {
                    return Err(imgforge_domain::CoreError::new(
                        imgforge_domain::ErrorCode::Validation,
                        "exactly one of --artifact or --image is required",
                    )
                    .into());
                }
            };
            let request = FlashRequest {
                source,
                device_path: args.device.clone(),
                verify_mode: VerifyMode::parse(&args.verify)?,
                wipe: args.wipe,
                dry_run: args.dry_run,
                force: args.force,
            };
            let record = service.flash(&request, cancel)?;
            emit_success(cli.json, &record, |record| {
                println!(
                    "flash {}: {} ({} bytes, verify={})",
                    record.id,
                    record.status.as_str(),
                    record.bytes_written,
                    record
                        .verify_result
                        .map_or("pending", |outcome| outcome.as_str())
                );
            });
        }
        FlashCmd::List {
            status,
            artifact,
            limit,
        } => {
            let status = status
                .as_deref()
                .map(FlashStatus::try_from)
                .transpose()?;
            let records = service.flash_list(status, *artifact, *limit)?;
            emit_success(cli.json, &records, |records| {
                for record in records {
                    println!(
                        "{:>6} {:<12} {:<20} {} bytes",
                        record.id,
                        record.status.as_str(),
                        record.device_path,
                        record.bytes_written
                    );
                }
            });
        }
        FlashCmd::Get { flash_id } => {
            let record = service.flash_get(*flash_id)?;
            emit_success(cli.json, &record, |record| {
                println!(
                    "flash {}: {} to {} ({} bytes)",
                    record.id,
                    record.status.as_str(),
                    record.device_path,
                    record.bytes_written
                );
            });
        }
    }
    Ok(())
}
