// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{status, warning},
    patch::signature::{self, SignatureOutcome},
};

/// Disable verified boot in the emulator firmware. Running this on already
/// patched firmware does nothing.
pub fn patch_bios(path: &Path) -> Result<SignatureOutcome> {
    let outcome = signature::patch_file(
        path,
        signature::VERIFIED_BOOT_MARKER,
        signature::VERIFIED_BOOT_REPLACEMENT,
    )
    .with_context(|| format!("Failed to patch firmware: {path:?}"))?;

    match outcome {
        SignatureOutcome::NotFound => {
            warning!("Verified boot marker not found; firmware may already be patched");
        }
        SignatureOutcome::Patched { offset } => {
            status!("Disabled verified boot at offset {offset:#x}");
        }
    }

    Ok(outcome)
}

fn patch_subcommand(cli: &PatchCli) -> Result<()> {
    patch_bios(&cli.input)?;

    Ok(())
}

pub fn bios_main(cli: &BiosCli) -> Result<()> {
    match &cli.command {
        BiosCommand::Patch(c) => patch_subcommand(c),
    }
}

/// Patch firmware image in place.
#[derive(Debug, Parser)]
struct PatchCli {
    /// Path to firmware image (bios.rom).
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum BiosCommand {
    Patch(PatchCli),
}

/// Patch emulator firmware.
#[derive(Debug, Parser)]
pub struct BiosCli {
    #[command(subcommand)]
    command: BiosCommand,
}
