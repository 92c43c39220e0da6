// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Length-preserving replacement of a byte signature inside an opaque blob.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use bstr::ByteSlice;
use memchr::memmem;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::util;

/// Firmware marker that enables verified boot.
pub const VERIFIED_BOOT_MARKER: &[u8] = b" verified_boot_android";
/// Same length as [`VERIFIED_BOOT_MARKER`].
pub const VERIFIED_BOOT_REPLACEMENT: &[u8] = b"          boot_android";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Replacement length ({to}) does not match signature length ({from})")]
    LengthMismatch { from: usize, to: usize },
    #[error("Signature is empty")]
    EmptySignature,
    #[error("Signature {signature:?} found at multiple offsets: {offsets:?}")]
    Ambiguous {
        signature: String,
        offsets: Vec<usize>,
    },
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureOutcome {
    /// The signature does not occur. This is also the result of patching a
    /// second time.
    NotFound,
    Patched { offset: usize },
}

/// Replace the single occurrence of `from` in `buf` with `to`. If `from`
/// occurs more than once, `buf` is left unmodified.
pub fn patch_bytes(buf: &mut [u8], from: &[u8], to: &[u8]) -> Result<SignatureOutcome> {
    if from.len() != to.len() {
        return Err(Error::LengthMismatch {
            from: from.len(),
            to: to.len(),
        });
    } else if from.is_empty() {
        return Err(Error::EmptySignature);
    }

    let offsets = memmem::find_iter(buf, from).collect::<Vec<_>>();

    match offsets.as_slice() {
        [] => Ok(SignatureOutcome::NotFound),
        [offset] => {
            buf[*offset..][..to.len()].copy_from_slice(to);
            Ok(SignatureOutcome::Patched { offset: *offset })
        }
        _ => Err(Error::Ambiguous {
            signature: from.as_bstr().to_string(),
            offsets,
        }),
    }
}

/// Like [`patch_bytes`], but operating on a file. The file is only rewritten
/// if the signature was found, and the rewrite is done by atomically replacing
/// the file with a new one from the same directory.
pub fn patch_file(path: &Path, from: &[u8], to: &[u8]) -> Result<SignatureOutcome> {
    let mut data = fs::read(path).map_err(|e| Error::File(path.to_owned(), e))?;

    let outcome = patch_bytes(&mut data, from, to)?;

    match outcome {
        SignatureOutcome::NotFound => {
            info!("Signature {:?} not found in {path:?}", from.as_bstr());
        }
        SignatureOutcome::Patched { offset } => {
            info!("Patching signature at offset {offset:#x} in {path:?}");

            let mut temp_file = NamedTempFile::new_in(util::parent_path(path))
                .map_err(|e| Error::File(path.to_owned(), e))?;
            temp_file
                .write_all(&data)
                .map_err(|e| Error::File(temp_file.path().to_owned(), e))?;
            temp_file
                .as_file()
                .sync_all()
                .map_err(|e| Error::File(temp_file.path().to_owned(), e))?;

            debug!("Replacing {path:?} with {:?}", temp_file.path());

            temp_file
                .persist(path)
                .map_err(|e| Error::File(path.to_owned(), e.error))?;
        }
    }

    Ok(outcome)
}
