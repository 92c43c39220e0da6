// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use ring::digest::SHA1_FOR_LEGACY_USE_ONLY;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    format::magisk::{self, Sha1Digest},
    patch::magiskboot::{self, CpioOp, Session},
    stream::{self, HashingReader},
};

/// Archive name produced by `magiskboot unpack`.
pub const RAMDISK: &str = "ramdisk.cpio";
/// Location of the config record inside a Magisk-patched ramdisk.
pub const BACKUP_CONFIG: &str = ".backup/.magisk";
/// Where the config record from a patched ramdisk is extracted to.
pub const ORIG_CONFIG: &str = "config.orig";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config record: {0:?}")]
    Config(PathBuf, #[source] magisk::Error),
    #[error("magiskboot error")]
    MagiskBoot(#[from] magiskboot::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Decoded result of `magiskboot cpio <archive> test`. Only the lowest two
/// bits of the status are meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RamdiskStatus {
    Stock,
    MagiskPatched,
    Unsupported,
}

impl RamdiskStatus {
    pub fn from_status(code: i32) -> Self {
        match code & 3 {
            0 => Self::Stock,
            1 => Self::MagiskPatched,
            _ => Self::Unsupported,
        }
    }
}

/// Classification of a boot image, along with the digest of the stock image it
/// was (or will be) derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RamdiskState {
    Stock { sha1: Sha1Digest },
    /// The ramdisk has been restored to its stock contents as a side effect of
    /// classification.
    MagiskPatched { sha1: Sha1Digest },
    /// Patched by something other than Magisk.
    Unsupported,
}

/// Compute the SHA-1 digest of a file.
pub fn sha1_file(path: &Path, cancel_signal: &AtomicBool) -> Result<Sha1Digest> {
    let file = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;
    let mut reader = HashingReader::new(BufReader::new(file), &SHA1_FOR_LEGACY_USE_ONLY);

    stream::copy(&mut reader, io::sink(), cancel_signal)
        .map_err(|e| Error::File(path.to_owned(), e))?;

    let mut sha1 = [0u8; 20];
    sha1.copy_from_slice(reader.finish().as_ref());

    Ok(Sha1Digest(sha1))
}

/// Classify the unpacked ramdisk in the session's working directory.
/// `stock_image` is the boot image as it was before unpacking.
///
/// If the ramdisk was already patched by Magisk, the original contents are
/// restored in place so that patching can start over from the stock state.
pub fn classify(
    session: &Session,
    stock_image: &Path,
    cancel_signal: &AtomicBool,
) -> Result<RamdiskState> {
    let code = session.cpio_status(RAMDISK, &[CpioOp::Test])?;
    let status = RamdiskStatus::from_status(code);

    debug!("Ramdisk test status: {code} ({status:?})");

    match status {
        RamdiskStatus::Stock => {
            let sha1 = sha1_file(stock_image, cancel_signal)?;
            info!("Stock boot image detected: SHA1={sha1}");

            Ok(RamdiskState::Stock { sha1 })
        }
        RamdiskStatus::MagiskPatched => {
            session.cpio(
                RAMDISK,
                &[CpioOp::extract(BACKUP_CONFIG, ORIG_CONFIG), CpioOp::Restore],
                &[],
            )?;

            let path = session.dir().join(ORIG_CONFIG);
            let data = fs::read_to_string(&path).map_err(|e| Error::File(path.clone(), e))?;
            let sha1 = magisk::parse_sha1(&data).map_err(|e| Error::Config(path, e))?;

            info!("Magisk-patched boot image detected: stock SHA1={sha1}");

            Ok(RamdiskState::MagiskPatched { sha1 })
        }
        RamdiskStatus::Unsupported => {
            warn!("Boot image was patched by an unsupported tool");

            Ok(RamdiskState::Unsupported)
        }
    }
}
