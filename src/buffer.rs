//! Growable byte buffers.
//!
//! The original implementation hand-rolled a raw-pointer growable buffer (kept in this tree's
//! git history / earlier generation as reference). Without a compiler in the loop to validate
//! pointer arithmetic, this crate instead gets the same read/write-offset/compact contract from
//! a `Vec<u8>`, which is no less efficient for our access pattern (sequential fill, sequential
//! drain) and considerably harder to get wrong.

use std::io::{self, Write};

const DEFAULT_CAPACITY: usize = 16 * 1024;

/// A growable, contiguous byte buffer with independent read and write cursors.
#[derive(Debug)]
pub struct ConnBuffer {
    data: Vec<u8>,
    read_offset: usize,
}

impl ConnBuffer {
    /// Creates an empty buffer that grows from `DEFAULT_CAPACITY` as needed.
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(DEFAULT_CAPACITY),
            read_offset: 0,
        }
    }

    /// Bytes available to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_offset
    }

    /// The unread portion of the buffer.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_offset..]
    }

    /// Marks `amount` bytes as consumed, compacting the buffer if it has fully drained.
    pub fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.data.len().min(self.read_offset + amount);
        self.compact();
    }

    /// Appends `bytes` to the buffer, growing as needed.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Reserves room for at least `additional` more bytes to be written via [`Self::spare_mut`].
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// A writable tail the caller may fill directly (e.g. via `Read::read`), followed by
    /// [`Self::commit`] to record how much was actually written.
    pub fn spare_mut(&mut self, len: usize) -> &mut [u8] {
        let start = self.data.len();
        if self.data.capacity() - start < len {
            self.data.reserve(len);
        }
        self.data.resize(start + len, 0);
        &mut self.data[start..start + len]
    }

    /// Truncates the buffer's logical length back to `data.len() - (spare_len - actually_written)`.
    pub fn commit(&mut self, spare_len: usize, actually_written: usize) {
        let drop_tail = spare_len - actually_written;
        self.data.truncate(self.data.len() - drop_tail);
    }

    /// Clears both cursors when the buffer has nothing left unread.
    fn compact(&mut self) {
        if self.read_offset == self.data.len() {
            self.data.clear();
            self.read_offset = 0;
        }
    }

    /// True if no unread bytes remain.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl Default for ConnBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for ConnBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Alignment required by `O_DIRECT` reads on Linux.
pub const DIRECT_IO_ALIGNMENT: usize = 512;

/// Read chunk size used when streaming a file into memory, per spec.md's binding constants.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A byte buffer whose backing storage starts on a [`DIRECT_IO_ALIGNMENT`]-byte boundary, for use
/// with files opened `O_DIRECT`.
pub struct AlignedBuffer {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Allocates an aligned buffer of exactly `len` usable bytes.
    pub fn new(len: usize) -> Self {
        let mut raw = vec![0u8; len + DIRECT_IO_ALIGNMENT];
        let base = raw.as_ptr() as usize;
        let offset = (DIRECT_IO_ALIGNMENT - (base % DIRECT_IO_ALIGNMENT)) % DIRECT_IO_ALIGNMENT;
        raw.truncate(offset + len);
        Self { raw, offset, len }
    }

    /// The aligned, writable region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }

    /// The aligned region, read-only.
    pub fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }
}
