// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The Magisk config record stored as `.backup/.magisk` inside a patched
//! ramdisk. It is a list of `KEY=value` lines.

use std::{collections::HashMap, fmt, str::FromStr};

use thiserror::Error;

pub const KEY_KEEP_VERITY: &str = "KEEPVERITY";
pub const KEY_KEEP_FORCE_ENCRYPT: &str = "KEEPFORCEENCRYPT";
pub const KEY_RECOVERY_MODE: &str = "RECOVERYMODE";
pub const KEY_PREINIT_DEVICE: &str = "PREINITDEVICE";
pub const KEY_SHA1: &str = "SHA1";

/// Default partition used by Magisk for early-boot persistent storage.
pub const DEFAULT_PREINIT_DEVICE: &str = "metadata";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed config line: {0:?}")]
    MalformedLine(String),
    #[error("Duplicate config key: {0:?}")]
    DuplicateKey(String),
    #[error("Missing config key: {0:?}")]
    MissingKey(&'static str),
    #[error("Invalid SHA1 digest: {0:?}")]
    InvalidDigest(String, #[source] hex::FromHexError),
    #[error("Invalid preinit device: {0:?}")]
    InvalidPreinitDevice(String),
}

type Result<T> = std::result::Result<T, Error>;

/// A SHA-1 digest. This is displayed as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Digest(pub [u8; 20]);

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({self})")
    }
}

impl FromStr for Sha1Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut digest = [0u8; 20];
        hex::decode_to_slice(s, &mut digest)
            .map_err(|e| Error::InvalidDigest(s.to_owned(), e))?;

        Ok(Self(digest))
    }
}

/// Config embedded into the patched ramdisk. The same values are passed to
/// `magiskboot cpio ... patch` as environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagiskConfig {
    pub keep_verity: bool,
    pub keep_force_encrypt: bool,
    pub recovery_mode: bool,
    pub preinit_device: String,
    /// Digest of the *stock* boot image, no matter how many times the image
    /// has been patched since.
    pub sha1: Sha1Digest,
}

impl MagiskConfig {
    pub fn new(sha1: Sha1Digest, preinit_device: &str) -> Result<Self> {
        if preinit_device.is_empty() || preinit_device.contains(['\n', '\r', '=']) {
            return Err(Error::InvalidPreinitDevice(preinit_device.to_owned()));
        }

        Ok(Self {
            keep_verity: true,
            keep_force_encrypt: true,
            recovery_mode: false,
            preinit_device: preinit_device.to_owned(),
            sha1,
        })
    }

    /// Key/value pairs in the order they are written to the config file.
    pub fn entries(&self) -> [(&'static str, String); 5] {
        [
            (KEY_KEEP_VERITY, self.keep_verity.to_string()),
            (KEY_KEEP_FORCE_ENCRYPT, self.keep_force_encrypt.to_string()),
            (KEY_RECOVERY_MODE, self.recovery_mode.to_string()),
            (KEY_PREINIT_DEVICE, self.preinit_device.clone()),
            (KEY_SHA1, self.sha1.to_string()),
        ]
    }
}

impl fmt::Display for MagiskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.entries() {
            writeln!(f, "{key}={value}")?;
        }

        Ok(())
    }
}

/// Parse `KEY=value` lines. Empty lines are ignored and `\r\n` line endings
/// are accepted.
pub fn parse_props(data: &str) -> Result<HashMap<String, String>> {
    let mut result = HashMap::new();

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            return Err(Error::MalformedLine(line.to_owned()));
        };

        if result.insert(k.to_owned(), v.to_owned()).is_some() {
            return Err(Error::DuplicateKey(k.to_owned()));
        }
    }

    Ok(result)
}

/// Get the original stock image digest from a backup config record.
pub fn parse_sha1(data: &str) -> Result<Sha1Digest> {
    let props = parse_props(data)?;
    let value = props.get(KEY_SHA1).ok_or(Error::MissingKey(KEY_SHA1))?;

    value.parse()
}
