// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tempfile::NamedTempFile;

use crate::{
    cli::{bios, boot, status, warning},
    disk,
    install::{BOOT_PARTITION, Channel, InstallPaths},
    patch::magiskboot::BootTool,
    util::{self, NumBytes},
};

fn install_paths(dev: bool, install_dir: Option<&Path>) -> Result<InstallPaths> {
    let paths = InstallPaths::new(Channel::from_dev_flag(dev), install_dir);

    if !paths.root.is_dir() {
        bail!(
            "Google Play Games emulator installation not found: {:?}",
            paths.root,
        );
    }

    Ok(paths)
}

/// Copy the boot partition to `output` unless a copy already exists. The copy
/// only appears once it is complete.
fn backup_boot(disk_image: &Path, output: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    if output.exists() {
        return Ok(());
    }

    status!("Backing up stock {BOOT_PARTITION} partition to {output:?}");

    let temp_path = NamedTempFile::new_in(util::parent_path(output))
        .with_context(|| format!("Failed to create temporary file next to {output:?}"))?
        .into_temp_path();

    disk::extract_partition(disk_image, BOOT_PARTITION, &temp_path, cancel_signal)
        .with_context(|| format!("Failed to extract {BOOT_PARTITION} from {disk_image:?}"))?;

    temp_path
        .persist(output)
        .with_context(|| format!("Failed to move backup into place: {output:?}"))?;

    Ok(())
}

fn flash_boot(disk_image: &Path, image: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    let n = disk::flash_partition(disk_image, BOOT_PARTITION, image, cancel_signal)
        .with_context(|| format!("Failed to flash {image:?} to {BOOT_PARTITION} in {disk_image:?}"))?;

    status!("Flashed {} to {BOOT_PARTITION}", NumBytes(n));

    Ok(())
}

pub fn root_main(cli: &RootCli, cancel_signal: &AtomicBool) -> Result<()> {
    let tool = boot::magiskboot(&cli.magisk)?;

    root_with_tool(cli, &tool, cancel_signal)
}

/// Same as [`root_main`], but with the given boot image tool.
pub fn root_with_tool(
    cli: &RootCli,
    tool: &dyn BootTool,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let paths = install_paths(cli.dev, cli.install_dir.as_deref())?;
    let bios_path = paths.bios();
    let bios_backup = paths.bios_backup();
    let disk_image = paths.disk_image();
    let boot_backup = paths.boot_backup();

    if !bios_backup.exists() {
        status!("Backing up firmware to {bios_backup:?}");
        fs::copy(&bios_path, &bios_backup)
            .with_context(|| format!("Failed to copy {bios_path:?} to {bios_backup:?}"))?;
    }

    status!("Patching firmware: {bios_path:?}");
    bios::patch_bios(&bios_path)?;

    backup_boot(&disk_image, &boot_backup, cancel_signal)?;

    // Always patch the backup so that rerunning this starts from stock.
    status!("Patching boot image: {boot_backup:?}");
    let Some((work_dir, image)) =
        boot::patch_image(&cli.magisk, tool, &boot_backup, cancel_signal)?
    else {
        warning!("Boot partition was left unmodified");
        return Ok(());
    };

    status!("Flashing patched boot image");
    flash_boot(&disk_image, &image, cancel_signal)?;

    let path = work_dir.path().to_owned();
    work_dir
        .remove()
        .with_context(|| format!("Failed to remove work directory: {path:?}"))?;

    status!("Done");

    Ok(())
}

pub fn restore_main(cli: &RestoreCli, cancel_signal: &AtomicBool) -> Result<()> {
    let paths = install_paths(cli.dev, cli.install_dir.as_deref())?;
    let bios_path = paths.bios();
    let bios_backup = paths.bios_backup();
    let boot_backup = paths.boot_backup();

    if !bios_backup.exists() {
        bail!("No backup found: {bios_backup:?}");
    }

    status!("Restoring firmware from {bios_backup:?}");
    fs::copy(&bios_backup, &bios_path)
        .with_context(|| format!("Failed to copy {bios_backup:?} to {bios_path:?}"))?;

    if boot_backup.exists() {
        status!("Restoring stock boot image from {boot_backup:?}");
        flash_boot(&paths.disk_image(), &boot_backup, cancel_signal)?;
    } else {
        warning!("No boot image backup found: {boot_backup:?}");
    }

    status!("Done");

    Ok(())
}

/// Root the emulator with Magisk.
///
/// The firmware and the stock boot partition are backed up before being
/// modified. Running this again on a rooted emulator patches the stock backup
/// again, so it can be used to update Magisk.
#[derive(Debug, Parser)]
pub struct RootCli {
    #[command(flatten)]
    magisk: boot::MagiskArgs,

    /// Patch the developer emulator instead of the stable one.
    #[arg(long)]
    dev: bool,

    /// Emulator installation directory (the `current` directory).
    #[arg(long, value_name = "DIR", value_parser)]
    install_dir: Option<PathBuf>,
}

/// Undo the changes made by the root subcommand using the backups.
#[derive(Debug, Parser)]
pub struct RestoreCli {
    /// Restore the developer emulator instead of the stable one.
    #[arg(long)]
    dev: bool,

    /// Emulator installation directory (the `current` directory).
    #[arg(long, value_name = "DIR", value_parser)]
    install_dir: Option<PathBuf>,
}
