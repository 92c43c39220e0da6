// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! File layout of a Google Play Games emulator installation.

use std::path::{Path, PathBuf};

/// Name of the partition holding the kernel and ramdisk.
pub const BOOT_PARTITION: &str = "boot_a";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Channel {
    #[default]
    Stable,
    /// The developer emulator.
    Dev,
}

impl Channel {
    pub fn from_dev_flag(dev: bool) -> Self {
        if dev { Self::Dev } else { Self::Stable }
    }

    pub fn default_root(&self) -> &'static Path {
        Path::new(match self {
            Self::Stable => r"C:\Program Files\Google\Play Games\current",
            Self::Dev => r"C:\Program Files\Google\Play Games Developer Emulator\current",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallPaths {
    pub root: PathBuf,
}

impl InstallPaths {
    pub fn new(channel: Channel, root_override: Option<&Path>) -> Self {
        let root = root_override.unwrap_or_else(|| channel.default_root());

        Self {
            root: root.to_owned(),
        }
    }

    fn avd_dir(&self) -> PathBuf {
        self.root.join("emulator").join("avd")
    }

    /// Raw disk image containing every partition.
    pub fn disk_image(&self) -> PathBuf {
        self.avd_dir().join("aggregate.img")
    }

    pub fn bios(&self) -> PathBuf {
        self.avd_dir().join("bios.rom")
    }

    pub fn bios_backup(&self) -> PathBuf {
        self.avd_dir().join("bios.rom.bak")
    }

    /// Copy of the stock boot partition.
    pub fn boot_backup(&self) -> PathBuf {
        self.avd_dir().join("boot_a.img")
    }
}
