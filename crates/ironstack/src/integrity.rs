//! Self and buffer checksums.
//!
//! Both hashes start from the canary of the instance's *current* address, so
//! relocating an instance invalidates them even when every byte was copied
//! faithfully.

use ironstack_membrane::shadow::IDENTITY_SIZE;
use ironstack_membrane::{ByteRepr, Canary, HASH_SEED, Murmur3, Paranoia};

use crate::buffer;
use crate::stack::ProtectedStack;

impl<T: ByteRepr, P: Paranoia> ProtectedStack<T, P> {
    /// Hash of the control fields: current canary, header canary, size,
    /// capacity, buffer address, shadow identity, footer canary.
    pub(crate) fn compute_self_hash(&self) -> u32 {
        let mut hash = Murmur3::new(HASH_SEED);
        hash.feed(&Canary::for_address(self.address()))
            .feed(&self.header_canary)
            .feed(&self.size)
            .feed(&self.capacity)
            .feed(&(self.buffer.as_ptr() as usize));
        match &self.shadow {
            Some(shadow) => hash.append(&shadow.identity_bytes()),
            None => hash.append(&[0; IDENTITY_SIZE]),
        };
        hash.feed(&self.footer_canary).finish()
    }

    /// Hash of the buffer: current canary, buffer header canary, live
    /// elements, raw dead slots, buffer footer canary.
    pub(crate) fn compute_buffer_hash(&self) -> u32 {
        let live = self.live_elements();
        let mut hash = Murmur3::new(HASH_SEED);
        hash.feed(&Canary::for_address(self.address()));
        // SAFETY: `buffer` is slot 0 of a live allocation of `capacity`
        // slots; slots from `live.len()` on hold poison.
        unsafe {
            hash.feed(&buffer::read_header(self.buffer));
            for element in live {
                hash.feed(element);
            }
            hash.append(buffer::dead_bytes(self.buffer, live.len(), self.capacity));
            hash.feed(&buffer::read_footer(self.buffer, self.capacity));
        }
        hash.finish()
    }

    /// Store fresh hashes after a legitimate change. No-op when unguarded.
    pub(crate) fn recalculate_hashes(&mut self) {
        if !P::LEVEL.guards_enabled() {
            return;
        }
        self.self_hash = self.compute_self_hash();
        self.buffer_hash = self.compute_buffer_hash();
    }
}
