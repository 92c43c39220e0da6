// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reader for the primary GUID partition table at the head of a raw disk
//! image. Only the contract needed for locating partitions by name is
//! implemented. The backup table at the end of the disk is never consulted.

use std::{
    fmt,
    io::{self, Read, Write},
    mem,
};

use bitflags::bitflags;
use bstr::ByteSlice;
use thiserror::Error;
use tracing::{debug, trace};
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    stream::{FromReader, ReadDiscardExt, ToWriter, WriteZerosExt},
    util,
};

/// Size of a logical block. This is fixed and never read from the table.
pub const BLOCK_SIZE: u64 = 512;

/// Magic value for [`RawHeader::signature`].
const HEADER_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Revision 1.0, the only revision ever published.
const HEADER_REVISION: u32 = 0x0001_0000;

/// The primary header always lives in the block after the protective MBR.
const PRIMARY_HEADER_LBA: u64 = 1;

/// Byte range of [`RawHeader::header_crc32`] within the header.
const HEADER_CRC_RANGE: std::ops::Range<usize> = 16..20;

/// Minimum number of entries the array must reserve space for when writing.
const MIN_ENTRY_COUNT: usize = 128;

/// Maximum size of the partition entry array to prevent the memory usage from
/// blowing up.
const ENTRIES_MAX_SIZE: u64 = 16 * 1024 * 1024;

/// Number of UTF-16 code units in a partition name.
const NAME_UNITS: usize = 36;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid GPT signature: {:?}", .0.as_bstr())]
    InvalidSignature([u8; 8]),
    #[error("Invalid GPT header size: {0}")]
    HeaderInvalidSize(u32),
    #[error("Expected GPT header CRC32 {expected:#010x}, but have {actual:#010x}")]
    HeaderInvalidCrc { expected: u32, actual: u32 },
    #[error("Primary GPT header claims to be at block {0}")]
    HeaderWrongLocation(u64),
    #[error("Partition entry array starts at block {0}, which overlaps the header")]
    EntriesOverlapHeader(u64),
    #[error("Partition entry array starts at block {0}, which is out of range")]
    EntriesOutOfRange(u64),
    #[error("Invalid partition entry size: {0}")]
    EntriesInvalidSize(u32),
    #[error("Partition entry array too large: {count} * {size}")]
    EntriesTooLarge { count: u32, size: u32 },
    #[error("Expected partition entry array CRC32 {expected:#010x}, but have {actual:#010x}")]
    EntriesInvalidCrc { expected: u32, actual: u32 },
    #[error("Partition entry #{0}: Name is not valid UTF-16")]
    PartitionNameInvalid(usize),
    #[error("Partition {0:?}: Name exceeds {NAME_UNITS} UTF-16 code units")]
    PartitionNameTooLong(String),
    #[error("Partition {name:?}: First block {first} is after last block {last}")]
    PartitionInvalidRange { name: String, first: u64, last: u64 },
    #[error("Partition {name:?}: Blocks {first}..={last} are outside usable range {usable_first}..={usable_last}")]
    PartitionOutOfBounds {
        name: String,
        first: u64,
        last: u64,
        usable_first: u64,
        usable_last: u64,
    },
    #[error("Partition {name:?}: Byte range too large")]
    PartitionByteRangeTooLarge { name: String },
    #[error("Partition not found: {0:?}")]
    PartitionNotFound(String),
    #[error("Partition name {name:?} is ambiguous: {count} entries share it")]
    PartitionAmbiguous { name: String, count: usize },
    #[error("Too many partitions: {0}")]
    TooManyPartitions(usize),
    #[error("Failed to read GPT data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write GPT data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PartitionAttributes: u64 {
        /// The partition is required for the platform to function.
        const REQUIRED = 1 << 0;
        /// Firmware must not produce a block I/O protocol for the partition.
        const NO_BLOCK_IO = 1 << 1;
        /// Legacy BIOS bootable.
        const LEGACY_BIOS_BOOTABLE = 1 << 2;

        const _ = !0;
    }
}

/// A GUID as stored on disk, in mixed-endian form.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn is_zero(&self) -> bool {
        util::is_zero(&self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;

        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9],
            hex::encode_upper(&b[10..]),
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Raw on-disk layout for the GPT header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_SIGNATURE`].
    signature: [u8; 8],
    /// Header revision.
    revision: little_endian::U32,
    /// Number of header bytes covered by [`Self::header_crc32`].
    header_size: little_endian::U32,
    /// CRC32 of the first [`Self::header_size`] bytes when this field is set
    /// to zero.
    header_crc32: little_endian::U32,
    reserved: little_endian::U32,
    /// Block containing this header.
    current_lba: little_endian::U64,
    /// Block containing the other copy of the header.
    backup_lba: little_endian::U64,
    /// First block usable by partitions.
    first_usable_lba: little_endian::U64,
    /// Last block usable by partitions (inclusive).
    last_usable_lba: little_endian::U64,
    disk_guid: [u8; 16],
    /// First block of the partition entry array.
    partition_entries_lba: little_endian::U64,
    /// Number of slots in the partition entry array, used or not.
    num_partition_entries: little_endian::U32,
    /// Size of each slot in the partition entry array.
    partition_entry_size: little_endian::U32,
    /// CRC32 of the whole partition entry array.
    partition_entries_crc32: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawHeader>() == 92);
const _: () = assert!(HEADER_CRC_RANGE.start == mem::offset_of!(RawHeader, header_crc32));

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("signature", &self.signature.as_bstr())
            .field("revision", &format_args!("{:#010x}", self.revision.get()))
            .field("header_size", &self.header_size.get())
            .field("header_crc32", &format_args!("{:#010x}", self.header_crc32.get()))
            .field("reserved", &self.reserved.get())
            .field("current_lba", &self.current_lba.get())
            .field("backup_lba", &self.backup_lba.get())
            .field("first_usable_lba", &self.first_usable_lba.get())
            .field("last_usable_lba", &self.last_usable_lba.get())
            .field("disk_guid", &Guid(self.disk_guid))
            .field("partition_entries_lba", &self.partition_entries_lba.get())
            .field("num_partition_entries", &self.num_partition_entries.get())
            .field("partition_entry_size", &self.partition_entry_size.get())
            .field(
                "partition_entries_crc32",
                &format_args!("{:#010x}", self.partition_entries_crc32.get()),
            )
            .finish()
    }
}

impl RawHeader {
    /// Compute the CRC32 of the first `header_size` bytes of `block` with the
    /// CRC field zeroed. `block` must be at least `header_size` bytes long.
    fn compute_crc(block: &[u8], header_size: usize) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&block[..HEADER_CRC_RANGE.start]);
        hasher.update(&[0u8; 4]);
        hasher.update(&block[HEADER_CRC_RANGE.end..header_size]);
        hasher.finalize()
    }

    /// Size of the partition entry array in bytes. Only valid after
    /// [`Self::validate`] has passed.
    fn entries_size(&self) -> u64 {
        u64::from(self.num_partition_entries.get()) * u64::from(self.partition_entry_size.get())
    }

    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. `block` is the full block the header was read from.
    fn validate(&self, block: &[u8]) -> Result<()> {
        if self.signature != HEADER_SIGNATURE {
            return Err(Error::InvalidSignature(self.signature));
        }

        let header_size = self.header_size.get();
        if (header_size as usize) < mem::size_of::<Self>() || header_size as usize > block.len() {
            return Err(Error::HeaderInvalidSize(header_size));
        }

        let actual = Self::compute_crc(block, header_size as usize);
        if actual != self.header_crc32.get() {
            return Err(Error::HeaderInvalidCrc {
                expected: self.header_crc32.get(),
                actual,
            });
        }

        if self.revision.get() != HEADER_REVISION {
            debug!("Unexpected GPT revision: {:#010x}", self.revision.get());
        }

        if self.current_lba.get() != PRIMARY_HEADER_LBA {
            return Err(Error::HeaderWrongLocation(self.current_lba.get()));
        }

        if self.partition_entries_lba.get() <= PRIMARY_HEADER_LBA {
            return Err(Error::EntriesOverlapHeader(
                self.partition_entries_lba.get(),
            ));
        }

        let entry_size = self.partition_entry_size.get();
        if (entry_size as usize) < mem::size_of::<RawEntry>() || entry_size % 8 != 0 {
            return Err(Error::EntriesInvalidSize(entry_size));
        }

        if self.entries_size() > ENTRIES_MAX_SIZE {
            return Err(Error::EntriesTooLarge {
                count: self.num_partition_entries.get(),
                size: entry_size,
            });
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the partition entry array.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawEntry {
    /// Partition type. All zeros means the slot is unused.
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: little_endian::U64,
    /// Last block (inclusive).
    last_lba: little_endian::U64,
    attributes: little_endian::U64,
    /// NULL-padded UTF-16LE name.
    name: [little_endian::U16; NAME_UNITS],
}

const _: () = assert!(mem::size_of::<RawEntry>() == 128);

impl fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawEntry")
            .field("type_guid", &Guid(self.type_guid))
            .field("unique_guid", &Guid(self.unique_guid))
            .field("first_lba", &self.first_lba.get())
            .field("last_lba", &self.last_lba.get())
            .field(
                "attributes",
                &PartitionAttributes::from_bits_retain(self.attributes.get()),
            )
            .field("name", &self.name_units().collect::<Vec<_>>())
            .finish()
    }
}

impl RawEntry {
    fn name_units(&self) -> impl Iterator<Item = u16> + '_ {
        self.name.iter().map(|c| c.get()).take_while(|c| *c != 0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_block: u64,
    /// Inclusive.
    pub last_block: u64,
    pub attributes: PartitionAttributes,
}

impl PartitionEntry {
    /// Number of blocks covered by this partition.
    pub fn num_blocks(&self) -> Result<u64> {
        self.last_block
            .checked_sub(self.first_block)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| Error::PartitionInvalidRange {
                name: self.name.clone(),
                first: self.first_block,
                last: self.last_block,
            })
    }

    /// Offset of the first byte of this partition within the disk image.
    pub fn byte_offset(&self) -> Result<u64> {
        self.first_block
            .checked_mul(BLOCK_SIZE)
            .ok_or_else(|| Error::PartitionByteRangeTooLarge {
                name: self.name.clone(),
            })
    }

    /// Size of this partition in bytes.
    pub fn byte_len(&self) -> Result<u64> {
        self.num_blocks()?
            .checked_mul(BLOCK_SIZE)
            .ok_or_else(|| Error::PartitionByteRangeTooLarge {
                name: self.name.clone(),
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTable {
    pub disk_guid: Guid,
    pub first_usable_block: u64,
    /// Inclusive.
    pub last_usable_block: u64,
    /// Used entries, in on-disk order.
    pub partitions: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Find the partition with the exact, case-sensitive name. Duplicate names
    /// are reported as an error rather than picking one of them.
    pub fn find(&self, name: &str) -> Result<&PartitionEntry> {
        let mut iter = self.partitions.iter().filter(|p| p.name == name);

        let Some(entry) = iter.next() else {
            return Err(Error::PartitionNotFound(name.to_owned()));
        };

        let others = iter.count();
        if others != 0 {
            return Err(Error::PartitionAmbiguous {
                name: name.to_owned(),
                count: others + 1,
            });
        }

        Ok(entry)
    }

    fn validate_range(entry: &PartitionEntry) -> Result<()> {
        if entry.first_block > entry.last_block {
            return Err(Error::PartitionInvalidRange {
                name: entry.name.clone(),
                first: entry.first_block,
                last: entry.last_block,
            });
        }

        Ok(())
    }

    /// Entries being written must also lie within the usable range. Tables
    /// that are read are only held to [`Self::validate_range`], so that one
    /// odd entry doesn't make every other partition inaccessible.
    fn validate_bounds(&self, entry: &PartitionEntry) -> Result<()> {
        Self::validate_range(entry)?;

        if entry.first_block < self.first_usable_block || entry.last_block > self.last_usable_block
        {
            return Err(Error::PartitionOutOfBounds {
                name: entry.name.clone(),
                first: entry.first_block,
                last: entry.last_block,
                usable_first: self.first_usable_block,
                usable_last: self.last_usable_block,
            });
        }

        Ok(())
    }
}

impl<R: Read> FromReader<R> for PartitionTable {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        // Protective MBR.
        reader
            .read_discard_exact(BLOCK_SIZE)
            .map_err(|e| Error::DataRead("protective_mbr", e))?;

        let mut block = [0u8; BLOCK_SIZE as usize];
        reader
            .read_exact(&mut block)
            .map_err(|e| Error::DataRead("header", e))?;
        let header =
            RawHeader::read_from_io(&block[..]).map_err(|e| Error::DataRead("header", e))?;

        trace!("{header:?}");

        header.validate(&block)?;

        let skip = (header.partition_entries_lba.get() - PRIMARY_HEADER_LBA - 1)
            .checked_mul(BLOCK_SIZE)
            .ok_or(Error::EntriesOutOfRange(header.partition_entries_lba.get()))?;
        reader
            .read_discard_exact(skip)
            .map_err(|e| Error::DataRead("entries_gap", e))?;

        let mut entries_buf = vec![0u8; header.entries_size() as usize];
        reader
            .read_exact(&mut entries_buf)
            .map_err(|e| Error::DataRead("entries", e))?;

        let entries_crc32 = crc32fast::hash(&entries_buf);
        if entries_crc32 != header.partition_entries_crc32.get() {
            return Err(Error::EntriesInvalidCrc {
                expected: header.partition_entries_crc32.get(),
                actual: entries_crc32,
            });
        }

        let mut table = Self {
            disk_guid: Guid(header.disk_guid),
            first_usable_block: header.first_usable_lba.get(),
            last_usable_block: header.last_usable_lba.get(),
            partitions: vec![],
        };

        let entry_size = header.partition_entry_size.get() as usize;

        for (index, chunk) in entries_buf.chunks_exact(entry_size).enumerate() {
            let raw = RawEntry::read_from_io(chunk).map_err(|e| Error::DataRead("entry", e))?;
            if Guid(raw.type_guid).is_zero() {
                continue;
            }

            trace!("Entry #{index}: {raw:?}");

            let name = String::from_utf16(&raw.name_units().collect::<Vec<_>>())
                .map_err(|_| Error::PartitionNameInvalid(index))?;

            let entry = PartitionEntry {
                name,
                type_guid: Guid(raw.type_guid),
                unique_guid: Guid(raw.unique_guid),
                first_block: raw.first_lba.get(),
                last_block: raw.last_lba.get(),
                attributes: PartitionAttributes::from_bits_retain(raw.attributes.get()),
            };

            Self::validate_range(&entry)?;
            table.partitions.push(entry);
        }

        debug!("Loaded GPT with {} partitions", table.partitions.len());

        Ok(table)
    }
}

impl<W: Write> ToWriter<W> for PartitionTable {
    type Error = Error;

    /// Write the protective MBR block (zeroed), the primary header, and the
    /// partition entry array starting at block 2. The backup copy at the end
    /// of the disk is not written.
    fn to_writer(&self, mut writer: W) -> Result<()> {
        let entry_count = self.partitions.len().max(MIN_ENTRY_COUNT);
        let entry_count_u32: u32 = entry_count
            .try_into()
            .map_err(|_| Error::TooManyPartitions(self.partitions.len()))?;
        let entries_size = entry_count * mem::size_of::<RawEntry>();
        if entries_size as u64 > ENTRIES_MAX_SIZE {
            return Err(Error::TooManyPartitions(self.partitions.len()));
        }
        let entries_blocks = (entries_size as u64).div_ceil(BLOCK_SIZE);

        let mut entries_buf = Vec::with_capacity(entries_size);

        for entry in &self.partitions {
            self.validate_bounds(entry)?;

            let units = entry.name.encode_utf16().collect::<Vec<_>>();
            if units.len() > NAME_UNITS {
                return Err(Error::PartitionNameTooLong(entry.name.clone()));
            }

            let mut name = [little_endian::U16::ZERO; NAME_UNITS];
            for (dest, unit) in name.iter_mut().zip(units) {
                *dest = unit.into();
            }

            let raw = RawEntry {
                type_guid: entry.type_guid.0,
                unique_guid: entry.unique_guid.0,
                first_lba: entry.first_block.into(),
                last_lba: entry.last_block.into(),
                attributes: entry.attributes.bits().into(),
                name,
            };

            entries_buf.extend_from_slice(raw.as_bytes());
        }

        entries_buf.resize(entries_size, 0);

        let mut header = RawHeader {
            signature: HEADER_SIGNATURE,
            revision: HEADER_REVISION.into(),
            header_size: (mem::size_of::<RawHeader>() as u32).into(),
            header_crc32: 0u32.into(),
            reserved: 0u32.into(),
            current_lba: PRIMARY_HEADER_LBA.into(),
            backup_lba: (self.last_usable_block + entries_blocks + 1).into(),
            first_usable_lba: self.first_usable_block.into(),
            last_usable_lba: self.last_usable_block.into(),
            disk_guid: self.disk_guid.0,
            partition_entries_lba: (PRIMARY_HEADER_LBA + 1).into(),
            num_partition_entries: entry_count_u32.into(),
            partition_entry_size: (mem::size_of::<RawEntry>() as u32).into(),
            partition_entries_crc32: crc32fast::hash(&entries_buf).into(),
        };
        let crc = RawHeader::compute_crc(header.as_bytes(), mem::size_of::<RawHeader>());
        header.header_crc32 = crc.into();

        writer
            .write_zeros_exact(BLOCK_SIZE)
            .map_err(|e| Error::DataWrite("protective_mbr", e))?;
        writer
            .write_all(header.as_bytes())
            .map_err(|e| Error::DataWrite("header", e))?;
        writer
            .write_zeros_exact(BLOCK_SIZE - mem::size_of::<RawHeader>() as u64)
            .map_err(|e| Error::DataWrite("header_padding", e))?;
        writer
            .write_all(&entries_buf)
            .map_err(|e| Error::DataWrite("entries", e))?;
        writer
            .write_zeros_exact(entries_blocks * BLOCK_SIZE - entries_size as u64)
            .map_err(|e| Error::DataWrite("entries_padding", e))?;

        Ok(())
    }
}
