// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Invocation of the external `magiskboot` executable. The tool is treated as
//! a black box: a function from (arguments, working directory, environment) to
//! an exit code plus whatever files it leaves behind in the working directory.

use std::{
    ffi::{OsStr, OsString},
    fmt, io,
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run {0:?}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("Command was terminated without an exit code: {0}")]
    Terminated(String),
    #[error("Command failed with exit code {code}: {args}")]
    ExternalTool { args: String, code: i32 },
}

type Result<T> = std::result::Result<T, Error>;

/// An executor for `magiskboot`-compatible commands.
pub trait BootTool {
    /// Run the tool with `args` inside `dir`, adding `env` to the inherited
    /// environment, and return the exit code. This blocks until the tool exits.
    fn run(&self, args: &[OsString], dir: &Path, env: &[(&str, String)]) -> Result<i32>;
}

/// Runs the real `magiskboot` executable as a child process.
pub struct MagiskBoot {
    path: PathBuf,
}

impl MagiskBoot {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }
}

impl BootTool for MagiskBoot {
    fn run(&self, args: &[OsString], dir: &Path, env: &[(&str, String)]) -> Result<i32> {
        let mut command = Command::new(&self.path);
        command.args(args);
        command.current_dir(dir);
        command.envs(env.iter().map(|(k, v)| (k, v)));

        debug!("Running: {command:?}");

        let status = command
            .status()
            .map_err(|e| Error::Spawn(self.path.clone(), e))?;

        status
            .code()
            .ok_or_else(|| Error::Terminated(display_args(args)))
    }
}

/// Render arguments the way they'd be typed in a shell, quoting the ones that
/// contain spaces.
pub fn display_args(args: &[impl AsRef<OsStr>]) -> String {
    args.iter()
        .map(|a| {
            let a = a.as_ref().to_string_lossy();
            if a.contains(' ') {
                format!("\"{a}\"")
            } else {
                a.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A single ramdisk archive operation for `magiskboot cpio`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpioOp {
    /// Add (or replace) `path` in the archive with the contents of `source`.
    Add {
        mode: u32,
        path: String,
        source: String,
    },
    Mkdir {
        mode: u32,
        path: String,
    },
    /// Extract `path` from the archive to `output`.
    Extract {
        path: String,
        output: String,
    },
    /// Revert a previous Magisk patch using the archive's `.backup` directory.
    Restore,
    /// Record the difference from `original` in the archive's `.backup`
    /// directory.
    Backup {
        original: String,
    },
    Patch,
    /// Exit with a status describing the archive's patch state.
    Test,
}

impl CpioOp {
    pub fn add(mode: u32, path: &str, source: &str) -> Self {
        Self::Add {
            mode,
            path: path.to_owned(),
            source: source.to_owned(),
        }
    }

    pub fn mkdir(mode: u32, path: &str) -> Self {
        Self::Mkdir {
            mode,
            path: path.to_owned(),
        }
    }

    pub fn extract(path: &str, output: &str) -> Self {
        Self::Extract {
            path: path.to_owned(),
            output: output.to_owned(),
        }
    }

    pub fn backup(original: &str) -> Self {
        Self::Backup {
            original: original.to_owned(),
        }
    }
}

impl fmt::Display for CpioOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { mode, path, source } => write!(f, "add {mode:04o} {path} {source}"),
            Self::Mkdir { mode, path } => write!(f, "mkdir {mode:04o} {path}"),
            Self::Extract { path, output } => write!(f, "extract {path} {output}"),
            Self::Restore => f.write_str("restore"),
            Self::Backup { original } => write!(f, "backup {original}"),
            Self::Patch => f.write_str("patch"),
            Self::Test => f.write_str("test"),
        }
    }
}

/// A [`BootTool`] bound to a working directory. All file arguments are names
/// relative to that directory.
pub struct Session<'a> {
    tool: &'a dyn BootTool,
    dir: &'a Path,
}

impl<'a> Session<'a> {
    pub fn new(tool: &'a dyn BootTool, dir: &'a Path) -> Self {
        Self { tool, dir }
    }

    pub fn dir(&self) -> &Path {
        self.dir
    }

    /// Run the tool and return its exit code, whatever it is.
    pub fn run(&self, args: &[OsString], env: &[(&str, String)]) -> Result<i32> {
        info!("Running: magiskboot {}", display_args(args));

        let code = self.tool.run(args, self.dir, env)?;

        debug!("Exit code: {code}");

        Ok(code)
    }

    /// Run the tool and fail if it exits with a non-zero status.
    pub fn run_checked(&self, args: &[OsString], env: &[(&str, String)]) -> Result<()> {
        let code = self.run(args, env)?;
        if code != 0 {
            return Err(Error::ExternalTool {
                args: display_args(args),
                code,
            });
        }

        Ok(())
    }

    /// Split a boot image into its sections inside the working directory.
    pub fn unpack(&self, image: &str) -> Result<()> {
        self.run_checked(&["unpack".into(), image.into()], &[])
    }

    /// Reassemble `image` from the sections in the working directory. The
    /// result is written to `new-boot.img`.
    pub fn repack(&self, image: &str) -> Result<()> {
        self.run_checked(&["repack".into(), image.into()], &[])
    }

    pub fn compress_xz(&self, input: &str, output: &str) -> Result<()> {
        self.run_checked(&["compress=xz".into(), input.into(), output.into()], &[])
    }

    fn cpio_args(archive: &str, ops: &[CpioOp]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["cpio".into(), archive.into()];
        args.extend(ops.iter().map(|op| op.to_string().into()));
        args
    }

    /// Apply `ops` in order to `archive`, rewriting it once at the end.
    pub fn cpio(&self, archive: &str, ops: &[CpioOp], env: &[(&str, String)]) -> Result<()> {
        self.run_checked(&Self::cpio_args(archive, ops), env)
    }

    /// Like [`Self::cpio`], but return the exit code instead of treating a
    /// non-zero status as failure.
    pub fn cpio_status(&self, archive: &str, ops: &[CpioOp]) -> Result<i32> {
        self.run(&Self::cpio_args(archive, ops), &[])
    }
}
