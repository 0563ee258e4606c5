// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Local memory that RDMA descriptors point at, and the circular staging
//! buffers built on top of it.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::error::BufferError;
use crate::lock::LockRecord;
use crate::LOCK_STATE_SIZE_LOCAL;

/// Alignment of registered buffers (one cache line).
const BUFFER_ALIGN: usize = 64;

/// A zeroed, fixed-size region of local memory with a stable address.
///
/// Work requests reference this memory by raw address, so it is accessed
/// through `&self` and never moves or grows after allocation.
pub struct RegisteredBuffer {
    /// Raw pointer to the region. Required for dealloc.
    rawp: NonNull<u8>,

    /// Size of the region in bytes. Required for dealloc.
    rawb: usize,
}

/// The buffer owns its allocation outright.
unsafe impl Send for RegisteredBuffer {}

/// The RegisteredBuffer is Sync. Every access copies through raw pointers
/// with bounds checks, and the owners of a buffer (the staging buffers and
/// the state manager) serialize access to overlapping byte ranges with
/// their own latches.
unsafe impl Sync for RegisteredBuffer {}

impl RegisteredBuffer {
    /// Allocates `bytes` zeroed bytes.
    pub fn new(bytes: usize) -> RegisteredBuffer {
        assert!(bytes > 0, "Can't register an empty buffer");
        let layout = RegisteredBuffer::layout(bytes);
        let mem = unsafe { alloc_zeroed(layout) };
        let rawp = match NonNull::new(mem) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };
        RegisteredBuffer { rawp, rawb: bytes }
    }

    fn layout(bytes: usize) -> Layout {
        Layout::from_size_align(bytes, BUFFER_ALIGN)
            .expect("Alignment error while allocating a registered buffer!")
    }

    /// Size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.rawb
    }

    /// Address of the first byte, as carried in a scatter/gather entry.
    pub fn addr(&self) -> u64 {
        self.rawp.as_ptr() as u64
    }

    /// Address of the byte at `offset`.
    pub fn addr_at(&self, offset: usize) -> u64 {
        assert!(offset <= self.rawb, "offset {} past buffer end", offset);
        self.addr() + offset as u64
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.rawb, "read past buffer end");
        unsafe {
            ptr::copy_nonoverlapping(self.rawp.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
        };
    }

    /// Copies `src` into the buffer starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.rawb, "write past buffer end");
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.rawp.as_ptr().add(offset), src.len()) };
    }

    /// Returns a copy of `len` bytes starting at `offset`.
    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        self.read(offset, &mut v);
        v
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn clear(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.rawb, "clear past buffer end");
        unsafe { ptr::write_bytes(self.rawp.as_ptr().add(offset), 0, len) };
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.rawp.as_ptr(), RegisteredBuffer::layout(self.rawb)) };
    }
}

/// Cursors of a circular buffer. `head == tail` is ambiguous on its own;
/// `free_size` tells an empty buffer from a full one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursors {
    head: usize,
    tail: usize,
    free_size: usize,
}

/// A circular staging buffer.
///
/// Writers append at `tail`; the flusher reads the range it snapshotted and
/// then hands it back with `release()`, which moves `head` forward. Offsets
/// wrap modulo the buffer size.
pub struct CircularBuffer {
    buf: RegisteredBuffer,

    /// Latch guarding head/tail/free_size. Writers copy while holding it so
    /// a snapshot of `tail` never covers a half-written record.
    cursors: Mutex<Cursors>,

    /// Bytes that always stay free. With a reserve the tail never catches
    /// up with the head, so equal offsets always mean an empty range.
    reserve: usize,
}

impl CircularBuffer {
    /// Creates an empty buffer of `bytes` bytes.
    pub fn new(bytes: usize) -> CircularBuffer {
        CircularBuffer::with_reserve(bytes, 0)
    }

    /// Creates an empty buffer of `bytes` bytes that refuses writes which
    /// would leave fewer than `reserve` bytes free.
    pub fn with_reserve(bytes: usize, reserve: usize) -> CircularBuffer {
        assert!(reserve < bytes, "reserve must leave room for data");
        CircularBuffer {
            buf: RegisteredBuffer::new(bytes),
            cursors: Mutex::new(Cursors {
                head: 0,
                tail: 0,
                free_size: bytes,
            }),
            reserve,
        }
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// The underlying memory, for building descriptors.
    pub fn memory(&self) -> &RegisteredBuffer {
        &self.buf
    }

    /// Appends `data`, wrapping around the end of the buffer if needed.
    /// Returns the offset the data starts at.
    pub fn write(&self, data: &[u8]) -> Result<usize, BufferError> {
        let mut c = self.cursors.lock();
        let usable = c.free_size.saturating_sub(self.reserve);
        if data.len() > usable {
            return Err(BufferError::Full {
                requested: data.len(),
                free: usable,
            });
        }

        let start = c.tail;
        self.copy_in(start, data);
        c.tail = (start + data.len()) % self.size();
        c.free_size -= data.len();
        Ok(start)
    }

    /// Appends the local encoding of a lock record.
    pub fn write_lock(&self, lock: &LockRecord) -> Result<usize, BufferError> {
        self.write(&lock.encode_local())
    }

    /// Decodes the lock record stored at `offset`.
    pub fn read_lock(&self, offset: usize) -> LockRecord {
        let mut raw = [0u8; LOCK_STATE_SIZE_LOCAL];
        self.copy_out(offset, &mut raw);
        LockRecord::decode_local(&raw)
    }

    /// Copies `len` bytes starting at `offset`, wrapping if needed.
    pub fn read_range(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        self.copy_out(offset, &mut v);
        v
    }

    /// Snapshot of (tail, free_size).
    pub fn tail_and_free_size(&self) -> (usize, usize) {
        let c = self.cursors.lock();
        (c.tail, c.free_size)
    }

    /// Snapshot of (head, tail).
    pub fn head_and_tail(&self) -> (usize, usize) {
        let c = self.cursors.lock();
        (c.head, c.tail)
    }

    /// Number of free bytes.
    pub fn free_size(&self) -> usize {
        self.cursors.lock().free_size
    }

    /// Gives back `size` bytes between `head` and `tail` once they have been
    /// flushed. The buffer's head moves to `tail`.
    pub fn release(&self, head: usize, tail: usize, size: usize) {
        let mut c = self.cursors.lock();
        debug_assert_eq!(c.head, head, "release must start at the current head");
        debug_assert!(c.free_size + size <= self.size());
        c.head = tail;
        c.free_size += size;
    }

    /// Current head offset.
    pub fn head(&self) -> usize {
        self.cursors.lock().head
    }

    /// Moves the head forward to `new_head`, reclaiming everything before it.
    pub fn advance_head(&self, new_head: usize) {
        let mut c = self.cursors.lock();
        let used = self.size() - c.free_size;
        let reclaimed = (new_head + self.size() - c.head) % self.size();
        assert!(reclaimed <= used, "head can't move past tail");
        c.head = new_head;
        c.free_size += reclaimed;
    }

    /// Resets the cursors after recovering the buffer contents from a
    /// remote copy. `used` disambiguates `head == tail`.
    pub fn restore(&self, head: usize, tail: usize, used: usize) {
        assert!(head < self.size() && tail < self.size() && used <= self.size());
        let mut c = self.cursors.lock();
        c.head = head;
        c.tail = tail;
        c.free_size = self.size() - used;
    }

    fn copy_in(&self, offset: usize, data: &[u8]) {
        let first = data.len().min(self.size() - offset);
        self.buf.write(offset, &data[..first]);
        if first < data.len() {
            self.buf.write(0, &data[first..]);
        }
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let first = dst.len().min(self.size() - offset);
        self.buf.read(offset, &mut dst[..first]);
        if first < dst.len() {
            self.buf.read(0, &mut dst[first..]);
        }
    }
}
