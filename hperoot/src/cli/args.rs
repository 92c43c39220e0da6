// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing::Level;

use crate::cli::{bios, boot, disk, root};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Root(root::RootCli),
    Restore(root::RestoreCli),
    Disk(disk::DiskCli),
    Bios(bios::BiosCli),
    Boot(boot::BootCli),
    Completion(CompletionCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", value_enum, default_value_t)]
    pub log_level: LogLevel,
}

/// Send log messages to stderr. Timestamps are only shown at the debug and
/// trace levels.
pub fn init_logging(log_level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(log_level.as_level())
        .with_target(false);

    match log_level {
        LogLevel::Debug | LogLevel::Trace => builder.init(),
        _ => builder.without_time().init(),
    }
}

/// Print a shell completion script for this tool to stdout.
#[derive(Debug, Parser)]
pub struct CompletionCli {
    #[arg(short, long, value_name = "SHELL", value_parser)]
    pub shell: Shell,
}

fn completion_main(cli: &CompletionCli) -> Result<()> {
    let mut command = Cli::command();
    let name = command.get_name().to_owned();

    clap_complete::generate(cli.shell, &mut command, name, &mut io::stdout());

    Ok(())
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Root(c) => root::root_main(&c, cancel_signal),
        Command::Restore(c) => root::restore_main(&c, cancel_signal),
        Command::Disk(c) => disk::disk_main(&c, cancel_signal),
        Command::Bios(c) => bios::bios_main(&c),
        Command::Boot(c) => boot::boot_main(&c, cancel_signal),
        Command::Completion(c) => completion_main(&c),
    }
}
