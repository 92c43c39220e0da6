// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use ring::digest::{Algorithm, Context, Digest};

use crate::util;

/// Size of each chunk in the copy loops. Cancellation is checked between
/// chunks.
const CHUNK_SIZE: usize = 16384;

/// Parse a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Serialize a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Skip over bytes that aren't needed, like reserved areas between structures.
pub trait ReadDiscardExt {
    /// Discard exactly `size` bytes, failing with
    /// [`io::ErrorKind::UnexpectedEof`] if the reader ends first.
    fn read_discard_exact(&mut self, size: u64) -> io::Result<()>;
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = io::copy(&mut self.take(size), &mut io::sink())?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Reached EOF after discarding {n} of {size} bytes"),
            ));
        }

        Ok(())
    }
}

/// Fill padding areas with zeros.
pub trait WriteZerosExt {
    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()>;
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros_exact(&mut self, mut size: u64) -> io::Result<()> {
        while size > 0 {
            let n = size.min(util::ZEROS.len() as u64);
            self.write_all(&util::ZEROS[..n as usize])?;
            size -= n;
        }

        Ok(())
    }
}

/// Reader that feeds everything read through it into a digest.
pub struct HashingReader<R> {
    inner: R,
    context: Context,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, algorithm: &'static Algorithm) -> Self {
        Self {
            inner,
            context: Context::new(algorithm),
        }
    }

    /// Digest of all bytes read so far.
    pub fn finish(self) -> Digest {
        self.context.finish()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }
}

/// Fail with [`io::ErrorKind::Interrupted`] once `cancel_signal` is set.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Fill `buf` from `reader`, stopping early only at EOF. Returns how many bytes
/// were read, so a short count means the reader ended.
pub fn read_full(
    mut reader: impl Read,
    buf: &mut [u8],
    cancel_signal: &AtomicBool,
) -> io::Result<usize> {
    let mut total = 0;

    for chunk in buf.chunks_mut(CHUNK_SIZE) {
        check_cancel(cancel_signal)?;

        let mut filled = 0;
        while filled < chunk.len() {
            match reader.read(&mut chunk[filled..]) {
                Ok(0) => return Ok(total + filled),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        total += filled;
    }

    Ok(total)
}

/// Copy everything from `reader` to `writer` in chunks. Returns the number of
/// bytes copied. If `writer` can't accept all of the data, the copy fails.
pub fn copy(
    mut reader: impl Read,
    mut writer: impl Write,
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }

    Ok(copied)
}
