use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

/// Storage exhaustion while growing an [`IoBuffer`]
///
/// Surfaced instead of aborting so a single starved connection can be torn
/// down without taking the whole reactor with it.
#[derive(Debug, Error)]
#[error("buffer allocation failed")]
pub struct AllocError;

impl From<TryReserveError> for AllocError {
    fn from(_: TryReserveError) -> Self {
        Self
    }
}

/// Resizable byte buffer supporting insertion and deletion at arbitrary
/// offsets
///
/// The substrate of every connection's `recv` and `send` queues, and the
/// scratch space of the protocol engines. Capacity grows in multiples of the
/// alignment passed to the mutating call, so repeated small appends reuse one
/// allocation. Appends are amortized O(1); insertion or deletion in the
/// middle is O(n) in the tail length.
///
/// Any slice obtained from the buffer is invalidated by the next mutating
/// call; the borrow checker enforces this.
#[derive(Default)]
pub struct IoBuffer {
    /// Fully-initialized backing storage; its length is the buffer capacity
    buf: Vec<u8>,
    len: usize,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer with `cap` bytes preallocated
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// Set the capacity to exactly `cap` bytes, truncating the length if it
    /// no longer fits. `resize(0)` releases the backing storage.
    pub fn resize(&mut self, cap: usize) -> Result<(), AllocError> {
        if cap == 0 {
            self.buf = Vec::new();
            self.len = 0;
            return Ok(());
        }
        if cap == self.buf.len() {
            return Ok(());
        }
        let mut next = Vec::new();
        next.try_reserve_exact(cap)?;
        next.resize(cap, 0);
        self.len = self.len.min(cap);
        next[..self.len].copy_from_slice(&self.buf[..self.len]);
        self.buf = next;
        Ok(())
    }

    /// Insert `data` at `ofs`, shifting the tail right. An offset past the
    /// end is clamped to an append. Capacity grows to the next multiple of
    /// `align` when needed. Returns the new length.
    pub fn insert(&mut self, ofs: usize, data: &[u8], align: usize) -> Result<usize, AllocError> {
        let ofs = ofs.min(self.len);
        if data.is_empty() {
            return Ok(self.len);
        }
        let need = self.len + data.len();
        if need > self.buf.len() {
            self.resize(round_up(need, align))?;
        }
        self.buf.copy_within(ofs..self.len, ofs + data.len());
        self.buf[ofs..ofs + data.len()].copy_from_slice(data);
        self.len = need;
        Ok(self.len)
    }

    /// Append `data`, growing in `align`-sized steps
    pub fn append(&mut self, data: &[u8], align: usize) -> Result<usize, AllocError> {
        self.insert(self.len, data, align)
    }

    /// Remove up to `n` bytes starting at `ofs`, shifting the tail left.
    /// Returns the number of bytes actually removed.
    pub fn delete(&mut self, ofs: usize, n: usize) -> usize {
        if ofs >= self.len || n == 0 {
            return 0;
        }
        let n = n.min(self.len - ofs);
        self.buf.copy_within(ofs + n..self.len, ofs);
        self.len -= n;
        n
    }

    /// Drop the contents without releasing capacity
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Ensure at least `room` spare bytes past the current length and return
    /// them for direct writes (socket reads land here), growing in
    /// `align`-sized steps.
    pub(crate) fn spare(&mut self, room: usize, align: usize) -> Result<&mut [u8], AllocError> {
        let need = self.len + room;
        if need > self.buf.len() {
            self.resize(round_up(need, align))?;
        }
        Ok(&mut self.buf[self.len..])
    }

    /// Account for `n` bytes written into the spare area
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len());
        self.len += n;
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

fn round_up(n: usize, align: usize) -> usize {
    if align <= 1 {
        n
    } else {
        n.div_ceil(align) * align
    }
}
