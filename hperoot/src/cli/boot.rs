// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::{
    cli::{status, warning},
    format::magisk,
    patch::{
        apk::Abi,
        classify::RamdiskState,
        magiskboot::{BootTool, MagiskBoot},
        pipeline::{self, PatchOptions, PatchOutcome, WorkDir},
    },
};

/// Inputs for the Magisk patch shared by every subcommand that patches a boot
/// image.
#[derive(Debug, Args)]
pub struct MagiskArgs {
    /// Path to Magisk APK.
    #[arg(long, value_name = "FILE", value_parser)]
    pub magisk: PathBuf,

    /// Path to magiskboot executable.
    #[arg(long, value_name = "FILE", value_parser)]
    pub magiskboot: PathBuf,

    /// Path to init script to add to the ramdisk.
    #[arg(long, value_name = "FILE", value_parser)]
    pub custom_rc: PathBuf,

    /// Path to APK to add to the ramdisk.
    #[arg(long, value_name = "FILE", value_parser)]
    pub superpower_apk: PathBuf,

    /// ABI of the Magisk binaries to use.
    #[arg(long, value_name = "ABI", value_enum, default_value_t)]
    pub abi: Abi,

    /// Partition Magisk uses for early-boot persistent storage.
    #[arg(long, value_name = "PARTITION", default_value = magisk::DEFAULT_PREINIT_DEVICE)]
    pub preinit_device: String,

    /// Scratch directory for intermediate files. Any existing contents are
    /// deleted.
    #[arg(long, value_name = "DIR", value_parser, default_value = pipeline::DEFAULT_WORK_DIR)]
    pub work_dir: PathBuf,
}

/// Check that the magiskboot executable from `args` exists.
pub fn magiskboot(args: &MagiskArgs) -> Result<MagiskBoot> {
    if !args.magiskboot.is_file() {
        bail!("magiskboot does not exist: {:?}", args.magiskboot);
    }

    Ok(MagiskBoot::new(&args.magiskboot))
}

/// Run the Magisk patch on `boot_image`. Returns the work directory and the
/// path to the patched image inside of it, or [`None`] if the image can't be
/// patched.
pub fn patch_image(
    args: &MagiskArgs,
    tool: &dyn BootTool,
    boot_image: &Path,
    cancel_signal: &AtomicBool,
) -> Result<Option<(WorkDir, PathBuf)>> {
    for (name, path) in [
        ("Magisk APK", &args.magisk),
        ("init script", &args.custom_rc),
        ("extra APK", &args.superpower_apk),
    ] {
        if !path.is_file() {
            bail!("{name} does not exist: {path:?}");
        }
    }

    let options = PatchOptions {
        boot_image: boot_image.to_owned(),
        magisk_apk: args.magisk.clone(),
        abi: args.abi,
        custom_rc: args.custom_rc.clone(),
        superpower_apk: args.superpower_apk.clone(),
        preinit_device: args.preinit_device.clone(),
    };

    let mut protected = options.inputs().to_vec();
    protected.push(&args.magiskboot);

    let work_dir = WorkDir::create(&args.work_dir, &protected)
        .with_context(|| format!("Failed to create work directory: {:?}", args.work_dir))?;

    let outcome = pipeline::patch_boot_image(tool, &options, &work_dir, cancel_signal)
        .with_context(|| {
            format!(
                "Failed to patch boot image {boot_image:?} (work directory: {:?})",
                work_dir.path(),
            )
        })?;

    match outcome {
        PatchOutcome::Patched { image, state } => {
            match state {
                RamdiskState::Stock { sha1 } => {
                    status!("Patched stock boot image (SHA1: {sha1})");
                }
                RamdiskState::MagiskPatched { sha1 } => {
                    status!("Re-patched Magisk boot image (stock SHA1: {sha1})");
                }
                RamdiskState::Unsupported => {}
            }

            Ok(Some((work_dir, image)))
        }
        PatchOutcome::Unsupported => {
            warning!("Boot image was patched by an unsupported tool; restore the stock image first");

            Ok(None)
        }
    }
}

fn patch_subcommand(cli: &PatchCli, cancel_signal: &AtomicBool) -> Result<()> {
    let tool = magiskboot(&cli.magisk)?;
    let Some((work_dir, image)) = patch_image(&cli.magisk, &tool, &cli.input, cancel_signal)?
    else {
        return Ok(());
    };

    fs::copy(&image, &cli.output)
        .with_context(|| format!("Failed to copy {image:?} to {:?}", cli.output))?;

    status!("Wrote patched boot image: {:?}", cli.output);

    let output_in_work_dir = fs::canonicalize(&cli.output)
        .and_then(|o| Ok(o.starts_with(fs::canonicalize(work_dir.path())?)))
        .with_context(|| format!("Failed to resolve path: {:?}", cli.output))?;

    if output_in_work_dir {
        warning!(
            "Output is inside the work directory, which was kept: {:?}",
            work_dir.path(),
        );
    } else if !cli.keep_work_dir {
        let path = work_dir.path().to_owned();
        work_dir
            .remove()
            .with_context(|| format!("Failed to remove work directory: {path:?}"))?;
    }

    Ok(())
}

pub fn boot_main(cli: &BootCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        BootCommand::Patch(c) => patch_subcommand(c, cancel_signal),
    }
}

/// Patch a boot image with Magisk.
///
/// Images already patched by Magisk are restored to stock before patching.
#[derive(Debug, Parser)]
struct PatchCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    magisk: MagiskArgs,

    /// Don't delete the work directory after patching.
    #[arg(long)]
    keep_work_dir: bool,
}

#[derive(Debug, Subcommand)]
enum BootCommand {
    Patch(PatchCli),
}

/// Patch boot images.
#[derive(Debug, Parser)]
pub struct BootCli {
    #[command(subcommand)]
    command: BootCommand,
}
