//! Address-derived canaries.
//!
//! A canary is a pure function of the address it guards:
//! `xorshift(CANARY_RANDOM_SEED ^ murmur3(HASH_SEED, addr))`, 16 words long.
//! A protected object stores two copies of its own canary (first and last
//! field) and its buffer carries two copies of the *buffer's* canary. If the
//! object is overwritten or bitwise relocated, recomputing from the current
//! address no longer matches what is stored.

use crate::murmur::Murmur3;
use crate::repr::{ByteRepr, ByteSink};
use crate::xorshift::XorShift32;

/// Number of 32-bit words in one canary.
pub const CANARY_WORDS: usize = 16;

/// Size in bytes of one canary.
pub const CANARY_SIZE: usize = CANARY_WORDS * std::mem::size_of::<u32>();

/// Seed shared by canary derivation and the integrity hashes.
pub const HASH_SEED: u32 = 0xABAD_BABE;

/// Seed mixed into the xorshift generator.
pub const CANARY_RANDOM_SEED: u32 = 0x8BAD_F00D;

/// Fixed-length sentinel sequence bound to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Canary(pub [u32; CANARY_WORDS]);

impl Canary {
    /// Derive the canary guarding `addr`.
    #[must_use]
    pub fn for_address(addr: usize) -> Self {
        let addr_hash = Murmur3::new(HASH_SEED).feed(&addr).finish();
        let mut rng = XorShift32::new(CANARY_RANDOM_SEED ^ addr_hash);
        let mut words = [0u32; CANARY_WORDS];
        rng.fill(&mut words);
        Self(words)
    }

    /// All-zero placeholder, never equal to a derived canary in practice.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; CANARY_WORDS])
    }

    /// True if this canary is the one derived from `addr`.
    #[must_use]
    pub fn verify(&self, addr: usize) -> bool {
        *self == Self::for_address(addr)
    }

    #[must_use]
    pub fn words(&self) -> &[u32; CANARY_WORDS] {
        &self.0
    }

    /// Serialize to native-endian bytes (the in-memory layout).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CANARY_SIZE] {
        let mut buf = [0u8; CANARY_SIZE];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(self.0.iter()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; CANARY_SIZE]) -> Self {
        let mut words = [0u32; CANARY_WORDS];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(4)) {
            *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(words)
    }
}

impl ByteRepr for Canary {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
        self.0.write_repr(sink);
    }
}
