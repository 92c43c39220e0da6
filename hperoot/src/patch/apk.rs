// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Extraction of the Magisk binaries from the Magisk APK.

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use clap::ValueEnum;
use thiserror::Error;
use tracing::debug;
use zip::{ZipArchive, result::ZipError};

use crate::{stream, util::NumBytes};

pub const MAGISKINIT: &str = "magiskinit";
pub const MAGISK: &str = "magisk";
pub const STUB: &str = "stub.apk";
pub const INIT_LD: &str = "init-ld";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open zip: {0:?}")]
    Zip(PathBuf, #[source] ZipError),
    #[error("Zip error for entry name: {0:?}")]
    ZipEntryName(String, #[source] ZipError),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// CPU architecture of the native libraries to take from the APK.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Abi {
    #[default]
    #[value(name = "x86_64")]
    X86_64,
    #[value(name = "arm64-v8a")]
    Arm64V8a,
}

impl Abi {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64V8a => "arm64-v8a",
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Zip entry paths and the file names they are extracted to.
pub fn payload_entries(abi: Abi) -> [(String, &'static str); 4] {
    let abi = abi.as_str();

    [
        (format!("lib/{abi}/libmagiskinit.so"), MAGISKINIT),
        (format!("lib/{abi}/libmagisk.so"), MAGISK),
        (format!("lib/{abi}/libinit-ld.so"), INIT_LD),
        ("assets/stub.apk".to_owned(), STUB),
    ]
}

/// Extract the Magisk binaries for `abi` from `apk` into `dir`. Every entry
/// must be present.
pub fn extract_payload(apk: &Path, abi: Abi, dir: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = File::open(apk).map_err(|e| Error::File(apk.to_owned(), e))?;
    let mut zip =
        ZipArchive::new(BufReader::new(reader)).map_err(|e| Error::Zip(apk.to_owned(), e))?;

    for (source, target) in payload_entries(abi) {
        let entry = zip
            .by_name(&source)
            .map_err(|e| Error::ZipEntryName(source.clone(), e))?;

        let path = dir.join(target);
        let file = File::create(&path).map_err(|e| Error::File(path.clone(), e))?;
        let mut writer = BufWriter::new(file);

        let n = stream::copy(entry, &mut writer, cancel_signal)
            .map_err(|e| Error::File(path.clone(), e))?;
        writer.flush().map_err(|e| Error::File(path.clone(), e))?;

        debug!("Extracted {source:?} to {path:?} ({})", NumBytes(n));
    }

    Ok(())
}
