// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{cli::status, disk, util::NumBytes};

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let table = disk::read_table(&cli.input)
        .with_context(|| format!("Failed to read partition table: {:?}", cli.input))?;

    println!("Disk GUID: {}", table.disk_guid);
    println!(
        "Usable blocks: {}-{}",
        table.first_usable_block, table.last_usable_block,
    );
    println!();

    for entry in &table.partitions {
        let offset = entry.byte_offset()?;
        let size = entry.byte_len()?;

        println!(
            "{:<24} {:>12} {:>12} {offset:#014x} {:>16} {}",
            entry.name,
            entry.first_block,
            entry.last_block,
            NumBytes(size).to_string(),
            entry.type_guid,
        );
    }

    Ok(())
}

fn extract_subcommand(cli: &ExtractCli, cancel_signal: &AtomicBool) -> Result<()> {
    let n = disk::extract_partition(&cli.input, &cli.partition, &cli.output, cancel_signal)
        .with_context(|| {
            format!(
                "Failed to extract partition {:?} from {:?} to {:?}",
                cli.partition, cli.input, cli.output,
            )
        })?;

    status!("Extracted {} from {:?}", NumBytes(n), cli.partition);

    Ok(())
}

fn flash_subcommand(cli: &FlashCli, cancel_signal: &AtomicBool) -> Result<()> {
    let n = disk::flash_partition(&cli.input, &cli.partition, &cli.image, cancel_signal)
        .with_context(|| {
            format!(
                "Failed to flash {:?} to partition {:?} in {:?}",
                cli.image, cli.partition, cli.input,
            )
        })?;

    status!("Flashed {} to {:?}", NumBytes(n), cli.partition);

    Ok(())
}

pub fn disk_main(cli: &DiskCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        DiskCommand::Info(c) => info_subcommand(c),
        DiskCommand::Extract(c) => extract_subcommand(c, cancel_signal),
        DiskCommand::Flash(c) => flash_subcommand(c, cancel_signal),
    }
}

/// List partitions in a disk image.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to disk image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Copy a partition out of a disk image.
#[derive(Debug, Parser)]
struct ExtractCli {
    /// Path to disk image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Name of partition to extract.
    #[arg(short, long, value_name = "NAME")]
    partition: String,

    /// Path to output partition image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Write an image into a partition of a disk image.
///
/// The image must not be larger than the partition. If it is smaller, the rest
/// of the partition is left untouched.
#[derive(Debug, Parser)]
struct FlashCli {
    /// Path to disk image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Name of partition to write.
    #[arg(short, long, value_name = "NAME")]
    partition: String,

    /// Path to partition image.
    #[arg(long, value_name = "FILE", value_parser)]
    image: PathBuf,
}

#[derive(Debug, Subcommand)]
enum DiskCommand {
    Info(InfoCli),
    Extract(ExtractCli),
    Flash(FlashCli),
}

/// Inspect and modify partitions in a raw disk image.
#[derive(Debug, Parser)]
pub struct DiskCli {
    #[command(subcommand)]
    command: DiskCommand,
}
