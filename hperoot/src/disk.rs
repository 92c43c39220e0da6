// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Byte-range I/O against raw disk images. The image file is opened and closed
//! within each call and is never resized.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    format::gpt::{self, PartitionEntry, PartitionTable},
    stream::{self, FromReader},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected {expected} bytes at offset {offset:#x}, but only {actual} are available")]
    TruncatedRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },
    #[error("Writing {size} bytes at offset {offset:#x} would grow the image past {disk_size} bytes")]
    WriteOutOfBounds {
        offset: u64,
        size: u64,
        disk_size: u64,
    },
    #[error("Region size exceeds addressable memory: {0}")]
    RegionTooLarge(u64),
    #[error("Image {path:?} ({size}) does not fit in partition {name:?} ({partition_size})")]
    ImageTooLarge {
        path: PathBuf,
        name: String,
        size: NumBytes<u64>,
        partition_size: NumBytes<u64>,
    },
    #[error("Failed to parse partition table: {0:?}")]
    PartitionTable(PathBuf, #[source] gpt::Error),
    #[error("Partition table error")]
    Gpt(#[from] gpt::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Parse the primary partition table of a disk image.
pub fn read_table(path: &Path) -> Result<PartitionTable> {
    let file = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;

    PartitionTable::from_reader(BufReader::new(file))
        .map_err(|e| Error::PartitionTable(path.to_owned(), e))
}

/// Read exactly `length` bytes at `offset` from the image.
pub fn extract_region(
    path: &Path,
    offset: u64,
    length: u64,
    cancel_signal: &AtomicBool,
) -> Result<Vec<u8>> {
    let size: usize = length
        .try_into()
        .map_err(|_| Error::RegionTooLarge(length))?;

    let mut file = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::File(path.to_owned(), e))?;

    let mut buf = vec![0u8; size];
    let n = stream::read_full(&mut file, &mut buf, cancel_signal)
        .map_err(|e| Error::File(path.to_owned(), e))?;

    if n != size {
        return Err(Error::TruncatedRead {
            offset,
            expected: length,
            actual: n as u64,
        });
    }

    debug!("Read {:?} at offset {offset:#x} from {path:?}", NumBytes(length));

    Ok(buf)
}

/// Copy the entire contents of `source` into the image starting at `offset`.
/// Bytes outside of the written range are left untouched and the image is
/// never grown. Returns the number of bytes written.
pub fn write_region(
    path: &Path,
    offset: u64,
    source: &Path,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let reader = File::open(source).map_err(|e| Error::File(source.to_owned(), e))?;
    let size = reader
        .metadata()
        .map_err(|e| Error::File(source.to_owned(), e))?
        .len();

    let mut writer = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::File(path.to_owned(), e))?;
    let disk_size = writer
        .metadata()
        .map_err(|e| Error::File(path.to_owned(), e))?
        .len();

    if offset.checked_add(size).is_none_or(|end| end > disk_size) {
        return Err(Error::WriteOutOfBounds {
            offset,
            size,
            disk_size,
        });
    }

    writer
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::File(path.to_owned(), e))?;

    let n = stream::copy(BufReader::new(reader).take(size), &mut writer, cancel_signal)
        .map_err(|e| Error::File(path.to_owned(), e))?;
    writer
        .flush()
        .map_err(|e| Error::File(path.to_owned(), e))?;

    debug!("Wrote {:?} at offset {offset:#x} to {path:?}", NumBytes(n));

    Ok(n)
}

/// Look up a partition by name.
pub fn find_partition(path: &Path, name: &str) -> Result<PartitionEntry> {
    let table = read_table(path)?;
    let entry = table.find(name)?;

    Ok(entry.clone())
}

/// Copy exactly `length` bytes at `offset` from the image into a new file at
/// `output`. Returns the number of bytes copied.
pub fn extract_region_to_file(
    path: &Path,
    offset: u64,
    length: u64,
    output: &Path,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let mut reader = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::File(path.to_owned(), e))?;

    let mut writer = File::create(output).map_err(|e| Error::File(output.to_owned(), e))?;

    let n = stream::copy(BufReader::new(reader).take(length), &mut writer, cancel_signal)
        .map_err(|e| Error::File(output.to_owned(), e))?;
    if n != length {
        return Err(Error::TruncatedRead {
            offset,
            expected: length,
            actual: n,
        });
    }

    writer
        .flush()
        .map_err(|e| Error::File(output.to_owned(), e))?;

    debug!("Copied {:?} at offset {offset:#x} from {path:?} to {output:?}", NumBytes(n));

    Ok(n)
}

/// Copy the full contents of a named partition to `output`.
pub fn extract_partition(
    path: &Path,
    name: &str,
    output: &Path,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let entry = find_partition(path, name)?;
    let offset = entry.byte_offset()?;
    let length = entry.byte_len()?;

    info!("Partition {name:?} at offset {offset:#010x}, {}", NumBytes(length));

    extract_region_to_file(path, offset, length, output, cancel_signal)
}

/// Write an image into a named partition. The image must not be larger than
/// the partition. If it is smaller, the remainder of the partition keeps its
/// old contents.
pub fn flash_partition(
    path: &Path,
    name: &str,
    image: &Path,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let entry = find_partition(path, name)?;
    let offset = entry.byte_offset()?;
    let partition_size = entry.byte_len()?;

    let size = image
        .metadata()
        .map_err(|e| Error::File(image.to_owned(), e))?
        .len();
    if size > partition_size {
        return Err(Error::ImageTooLarge {
            path: image.to_owned(),
            name: name.to_owned(),
            size: NumBytes(size),
            partition_size: NumBytes(partition_size),
        });
    }

    info!("Partition {name:?} at offset {offset:#010x}");

    write_region(path, offset, image, cancel_signal)
}
