//! Streaming MurmurHash3 (x86, 32-bit) engine.
//!
//! Unlike the one-shot reference function, this engine accepts input in
//! arbitrary pieces: bytes are folded into the accumulator four at a time and
//! up to three trailing bytes are carried until [`Murmur3::finish`]. Feeding
//! the same byte sequence in any chunking yields the same hash.

use crate::repr::{ByteRepr, ByteSink};

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;
const R1: u32 = 15;
const R2: u32 = 13;
const M: u32 = 5;
const N: u32 = 0xe654_6b64;

/// Incremental 32-bit Murmur3 hasher.
#[derive(Debug, Clone)]
pub struct Murmur3 {
    hash: u32,
    length: u32,
    carry: [u8; 4],
    carry_len: usize,
}

impl Murmur3 {
    /// Start a fresh hash from `seed`.
    #[must_use]
    pub const fn new(seed: u32) -> Self {
        Self {
            hash: seed,
            length: 0,
            carry: [0; 4],
            carry_len: 0,
        }
    }

    /// Fold raw bytes into the accumulator.
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        for &byte in bytes {
            self.carry[self.carry_len] = byte;
            self.carry_len += 1;
            self.length = self.length.wrapping_add(1);
            if self.carry_len == 4 {
                let k = scramble(u32::from_le_bytes(self.carry));
                self.hash ^= k;
                self.hash = self.hash.rotate_left(R2).wrapping_mul(M).wrapping_add(N);
                self.carry_len = 0;
            }
        }
        self
    }

    /// Feed a typed value through its byte representation.
    pub fn feed<V: ByteRepr + ?Sized>(&mut self, value: &V) -> &mut Self {
        value.write_repr(self);
        self
    }

    /// Total number of bytes appended so far.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.length
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Finalize without consuming the engine; more input may follow.
    #[must_use]
    pub fn finish(&self) -> u32 {
        let mut result = self.hash;
        if self.carry_len > 0 {
            let mut tail = [0u8; 4];
            tail[..self.carry_len].copy_from_slice(&self.carry[..self.carry_len]);
            result ^= scramble(u32::from_le_bytes(tail));
        }
        result ^= self.length;
        fmix32(result)
    }
}

impl ByteSink for Murmur3 {
    fn put(&mut self, bytes: &[u8]) {
        self.append(bytes);
    }
}

#[inline(always)]
fn scramble(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(R1).wrapping_mul(C2)
}

#[inline(always)]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oneshot(seed: u32, data: &[u8]) -> u32 {
        Murmur3::new(seed).append(data).finish()
    }

    #[test]
    fn matches_reference_vectors() {
        // Published MurmurHash3_x86_32 vectors.
        assert_eq!(oneshot(0, b""), 0);
        assert_eq!(oneshot(1, b""), 0x514E_28B7);
        assert_eq!(oneshot(0xffff_ffff, b""), 0x81F1_6F39);
        assert_eq!(oneshot(0, &[0, 0, 0, 0]), 0x2362_F9DE);
        assert_eq!(oneshot(0x9747_b28c, b"aaaa"), 0x5A97_808A);
        assert_eq!(oneshot(0x9747_b28c, b"abc"), 0xC84A_62DD);
        assert_eq!(oneshot(0x9747_b28c, b"Hello, world!"), 0x2488_4CBA);
    }

    #[test]
    fn chunking_does_not_change_hash() {
        let data: Vec<u8> = (0u8..=200).collect();
        let whole = oneshot(0xABAD_BABE, &data);
        for split in [1usize, 2, 3, 5, 7, 64, 199] {
            let mut h = Murmur3::new(0xABAD_BABE);
            for chunk in data.chunks(split) {
                h.append(chunk);
            }
            assert_eq!(h.finish(), whole, "split={split}");
        }
    }

    #[test]
    fn finish_is_repeatable_and_non_consuming() {
        let mut h = Murmur3::new(7);
        h.append(b"xyz");
        let first = h.finish();
        assert_eq!(h.finish(), first);
        h.append(b"w");
        assert_ne!(h.finish(), first);
        assert_eq!(h.len(), 4);
    }

    #[test]
    fn typed_feed_equals_raw_bytes() {
        let mut typed = Murmur3::new(3);
        typed.feed(&0x0102_0304u32).feed(&[9u16, 10u16]);
        let mut raw = Murmur3::new(3);
        raw.append(&0x0102_0304u32.to_ne_bytes());
        raw.append(&9u16.to_ne_bytes());
        raw.append(&10u16.to_ne_bytes());
        assert_eq!(typed.finish(), raw.finish());
    }

    #[test]
    fn single_byte_flip_changes_hash() {
        let base = [0x5Au8; 37];
        let reference = oneshot(0xABAD_BABE, &base);
        for i in 0..base.len() {
            let mut flipped = base;
            flipped[i] ^= 0x01;
            assert_ne!(oneshot(0xABAD_BABE, &flipped), reference, "byte {i}");
        }
    }
}
