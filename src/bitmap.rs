// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Occupancy map of the remote lock region: bit `i` is set iff slot `i`
/// holds a live lock.
///
/// The bytes are split evenly between worker threads so that slot
/// allocation only ever scans the calling thread's partition. Bits are
/// numbered least significant first within a byte.
#[derive(Debug, Clone)]
pub struct LockBitmap {
    bits: Vec<u8>,

    /// Number of usable slots; bits past it only pad the last byte.
    slots: usize,

    /// Number of bytes owned by each thread.
    thread_local_size: usize,
}

impl LockBitmap {
    /// Creates an empty bitmap covering `slots` slots, partitioned between
    /// `thread_num` threads.
    pub fn new(slots: usize, thread_num: usize) -> LockBitmap {
        let bitmap_size = (slots + 7) / 8;
        assert!(thread_num > 0, "Need at least one thread");
        assert!(
            bitmap_size >= thread_num,
            "Every thread needs at least one byte of the bitmap"
        );
        LockBitmap {
            bits: vec![0u8; bitmap_size],
            slots,
            thread_local_size: bitmap_size / thread_num,
        }
    }

    /// Size of the bitmap in bytes; also the offset of slot 0 in the remote
    /// lock region.
    pub fn bitmap_size(&self) -> usize {
        self.bits.len()
    }

    /// Number of usable slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Claims the first free slot in `thread`'s partition. Padding bits of
    /// the last byte are never handed out.
    pub fn get_first_free_bit(&mut self, thread: usize) -> Option<usize> {
        let begin = self.thread_local_size * thread;
        let end = (begin + self.thread_local_size).min(self.bits.len());
        for i in begin..end {
            let byte = self.bits[i] | self.padding_mask(i);
            if byte != 0xFF {
                let bit = byte.trailing_ones() as usize;
                self.bits[i] |= 1 << bit;
                return Some(i * 8 + bit);
            }
        }
        None
    }

    /// Bits of byte `i` that lie past the last slot.
    fn padding_mask(&self, i: usize) -> u8 {
        let first = i * 8;
        if first + 8 <= self.slots {
            0
        } else {
            0xFFu8 << (self.slots - first)
        }
    }

    /// Marks slot `pos` as free.
    pub fn set_bit_to_free(&mut self, pos: usize) {
        self.bits[pos / 8] &= !(1 << (pos % 8));
    }

    /// Whether slot `pos` is occupied.
    pub fn is_set(&self, pos: usize) -> bool {
        self.bits[pos / 8] & (1 << (pos % 8)) != 0
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// The raw bitmap bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Replaces the whole bitmap, e.g. with one read back from the remote
    /// lock region after a takeover.
    pub fn load(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.bits.len(), "bitmap size mismatch");
        self.bits.copy_from_slice(src);
    }

    /// Returns the indices of all set bits in `src`, in ascending order.
    pub fn valid_bits(src: &[u8]) -> Vec<usize> {
        let mut valid = Vec::new();
        for (i, byte) in src.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    valid.push(i * 8 + bit);
                }
            }
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that the bitmap rounds the slot count up to whole bytes.
    #[test]
    fn test_bitmap_size() {
        assert_eq!(LockBitmap::new(16, 1).bitmap_size(), 2);
        assert_eq!(LockBitmap::new(17, 1).bitmap_size(), 3);
        assert_eq!(LockBitmap::new(8192, 4).bitmap_size(), 1024);
    }

    // Tests that slots are handed out in order and reused after release.
    #[test]
    fn test_allocate_and_free() {
        let mut b = LockBitmap::new(16, 1);
        assert_eq!(b.get_first_free_bit(0), Some(0));
        assert_eq!(b.get_first_free_bit(0), Some(1));
        assert_eq!(b.get_first_free_bit(0), Some(2));
        b.set_bit_to_free(1);
        assert!(!b.is_set(1));
        assert_eq!(b.get_first_free_bit(0), Some(1));
        assert_eq!(b.count(), 3);
    }

    // Tests that each thread only allocates from its own partition.
    #[test]
    fn test_thread_partitions() {
        let mut b = LockBitmap::new(32, 2);
        assert_eq!(b.get_first_free_bit(1), Some(16));
        assert_eq!(b.get_first_free_bit(0), Some(0));
        for _ in 0..15 {
            assert!(b.get_first_free_bit(0).is_some());
        }
        assert_eq!(b.get_first_free_bit(0), None);
        assert_eq!(b.get_first_free_bit(1), Some(17));
    }

    // Tests enumeration of set bits, least significant bit first.
    #[test]
    fn test_valid_bits() {
        let mut b = LockBitmap::new(16, 1);
        for _ in 0..6 {
            b.get_first_free_bit(0);
        }
        b.set_bit_to_free(0);
        b.set_bit_to_free(1);
        b.set_bit_to_free(3);
        b.set_bit_to_free(4);
        assert_eq!(LockBitmap::valid_bits(b.as_bytes()), vec![2, 5]);
        assert_eq!(LockBitmap::valid_bits(&[0b1000_0001, 0x01]), vec![0, 7, 8]);
    }

    // Tests that the padding bits of a partial last byte are never claimed.
    #[test]
    fn test_partial_last_byte() {
        let mut b = LockBitmap::new(12, 1);
        assert_eq!(b.bitmap_size(), 2);
        for i in 0..12 {
            assert_eq!(b.get_first_free_bit(0), Some(i));
        }
        assert_eq!(b.get_first_free_bit(0), None);
        assert_eq!(b.count(), 12);
        b.set_bit_to_free(11);
        assert_eq!(b.get_first_free_bit(0), Some(11));
        assert_eq!(b.get_first_free_bit(0), None);
    }

    // Tests that a loaded bitmap keeps its occupied slots out of allocation.
    #[test]
    fn test_load() {
        let mut b = LockBitmap::new(16, 1);
        b.load(&[0b0000_0111, 0]);
        assert_eq!(b.count(), 3);
        assert_eq!(b.get_first_free_bit(0), Some(3));
    }
}
