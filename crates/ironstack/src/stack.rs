//! The protected LIFO container.
//!
//! A [`ProtectedStack`] is pinned for its whole life: canaries and the
//! instance registry are keyed by its address, so a bitwise move is
//! indistinguishable from corruption. Public construction therefore returns
//! `Pin<Box<Self>>`, mutation goes through `Pin<&mut Self>`, and
//! [`ProtectedStack::construct_in_place`] is the escape hatch for callers that
//! manage the storage themselves.

use std::fmt;
use std::marker::{PhantomData, PhantomPinned};
use std::panic::Location;
use std::pin::Pin;
use std::ptr::{self, NonNull};

use ironstack_membrane::config::verifier_endpoint;
use ironstack_membrane::{
    ByteRepr, Canary, DefaultParanoia, PageRights, Paranoia, ParanoiaLevel, ShadowChannel,
    StackMetrics, diag, global_metrics, global_registry, is_valid_pointer,
};

use crate::buffer;
use crate::fatal;
use crate::violation::Violation;

/// Capacity of a fresh instance; the buffer never shrinks below it.
pub const MIN_CAPACITY: usize = 16;

pub(crate) const SHADOW_SIZE: &str = "size";
pub(crate) const SHADOW_CAPACITY: &str = "capacity";
pub(crate) const SHADOW_TOP: &str = "stack_top";

/// Growable LIFO stack that verifies its own integrity around every
/// operation.
///
/// The amount of checking is fixed by `P` (see
/// [`ironstack_membrane::config`]). At [`ParanoiaLevel::Guarded`] and above
/// any failed check ends the process after a diagnostic dump; [`validate`]
/// runs the same checks without aborting.
///
/// [`validate`]: ProtectedStack::validate
#[repr(C)]
pub struct ProtectedStack<T: ByteRepr, P: Paranoia = DefaultParanoia> {
    pub(crate) header_canary: Canary,
    pub(crate) size: usize,
    pub(crate) capacity: usize,
    pub(crate) buffer: NonNull<T>,
    pub(crate) shadow: Option<ShadowChannel>,
    pub(crate) self_hash: u32,
    pub(crate) buffer_hash: u32,
    pub(crate) footer_canary: Canary,
    _pinned: PhantomPinned,
    _marker: PhantomData<(T, P)>,
}

impl<T: ByteRepr, P: Paranoia> ProtectedStack<T, P> {
    /// Verification depth of this instantiation.
    pub const LEVEL: ParanoiaLevel = P::LEVEL;

    /// Construct an empty instance on the heap.
    #[must_use]
    pub fn new() -> Pin<Box<Self>> {
        let mut slot = Box::<Self>::new_uninit();
        // SAFETY: `slot` is a fresh, aligned, writable allocation; it is
        // pinned right after initialisation and never moves again.
        unsafe {
            Self::construct_in_place(slot.as_mut_ptr());
            Box::into_pin(slot.assume_init())
        }
    }

    /// Construct an empty instance at `slot`.
    ///
    /// With guards enabled the address is checked first: an invalid pointer
    /// or an address that still hosts a live instance ends the process.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes and aligned for `Self`. Its previous
    /// contents are overwritten without being dropped. The instance must stay
    /// at `slot` until it is dropped in place, and nothing else may be
    /// written to that memory in between.
    pub unsafe fn construct_in_place(slot: *mut Self) {
        let addr = slot as usize;
        let level = P::LEVEL;
        let metrics = global_metrics();

        if level.guards_enabled() {
            if !is_valid_pointer(addr, PageRights::READ_WRITE, level) {
                diag::fatal_exit(Violation::BadAddress.description());
            }
            let in_use = global_registry().lock().contains(addr);
            if in_use {
                StackMetrics::inc(&metrics.registry_rejections);
                diag::fatal_exit(Violation::AddressInUse.description());
            }
        }

        let shadow = if level.shadow_oracle() {
            match ShadowChannel::connect(verifier_endpoint()) {
                Ok(channel) => Some(channel),
                Err(err) => diag::fatal_exit(&format!("Verificator is broken: {err}")),
            }
        } else {
            None
        };

        let Some(elements) = buffer::allocate::<T>(MIN_CAPACITY) else {
            diag::fatal_exit("buffer size overflows the address space");
        };
        let canary = if level.guards_enabled() {
            Canary::for_address(addr)
        } else {
            Canary::zeroed()
        };

        // SAFETY: the caller guarantees `slot` is writable and aligned.
        unsafe {
            slot.write(Self {
                header_canary: canary,
                size: 0,
                capacity: MIN_CAPACITY,
                buffer: elements,
                shadow,
                self_hash: 0,
                buffer_hash: 0,
                footer_canary: canary,
                _pinned: PhantomPinned,
                _marker: PhantomData,
            });
        }
        // SAFETY: initialised just above; nothing else refers to it yet.
        let this = unsafe { &mut *slot };
        if let Some(shadow) = &this.shadow {
            shadow.set_object(SHADOW_SIZE, &this.size);
            shadow.set_object(SHADOW_CAPACITY, &this.capacity);
        }
        if level.guards_enabled() {
            global_registry().lock().add(addr);
        }
        this.recalculate_hashes();
        StackMetrics::inc(&metrics.constructions);
    }

    /// Push `value` on top, doubling the buffer when it is full.
    #[track_caller]
    pub fn push(self: Pin<&mut Self>, value: T) {
        let location = Location::caller();
        // SAFETY: the instance is modified in place, never moved out.
        let this = unsafe { self.get_unchecked_mut() };
        this.assert_ok("push", location);

        if this.size >= this.capacity {
            let grown = this.capacity.saturating_mul(2);
            this.resize(grown);
            StackMetrics::inc(&global_metrics().grows);
        }
        // SAFETY: size < capacity after the resize, so the slot is inside the
        // buffer and holds poison rather than a live value.
        let slot = unsafe {
            let slot = this.buffer.as_ptr().add(this.size);
            slot.write(value);
            slot
        };
        if let Some(shadow) = &this.shadow {
            shadow.dup(SHADOW_TOP);
            // SAFETY: written just above.
            shadow.set_object(SHADOW_TOP, unsafe { &*slot });
        }
        this.size += 1;
        if let Some(shadow) = &this.shadow {
            shadow.set_object(SHADOW_SIZE, &this.size);
        }

        this.recalculate_hashes();
        this.assert_ok("push", location);
    }

    /// Reference to the most recently pushed element.
    ///
    /// Calling this on an empty stack is fatal at every level.
    #[track_caller]
    #[must_use]
    pub fn top(&self) -> &T {
        let location = Location::caller();
        self.assert_ok("top", location);
        if self.size == 0 {
            fatal::everything_is_bad(self, "top", location, Violation::StackEmpty);
        }
        // SAFETY: slots below `size` hold live values.
        let top = unsafe { &*self.buffer.as_ptr().add(self.size - 1) };
        self.assert_ok("top", location);
        top
    }

    /// Remove and drop the top element. Returns false on an empty stack.
    #[track_caller]
    pub fn pop(self: Pin<&mut Self>) -> bool {
        let location = Location::caller();
        // SAFETY: the instance is modified in place, never moved out.
        let this = unsafe { self.get_unchecked_mut() };
        this.assert_ok("pop", location);
        if this.size == 0 {
            return false;
        }

        this.size -= 1;
        // SAFETY: the slot at the old top holds a live value that is
        // dropped exactly once, then poisoned.
        unsafe {
            let slot = this.buffer.as_ptr().add(this.size);
            ptr::drop_in_place(slot);
            buffer::poison(slot);
        }
        if this.capacity > MIN_CAPACITY && this.size * 4 <= this.capacity {
            this.resize(this.capacity / 2);
            StackMetrics::inc(&global_metrics().shrinks);
        }
        if let Some(shadow) = &this.shadow {
            shadow.pop(SHADOW_TOP);
            shadow.set_object(SHADOW_SIZE, &this.size);
        }

        this.recalculate_hashes();
        this.assert_ok("pop", location);
        true
    }

    /// Number of elements.
    #[track_caller]
    #[must_use]
    pub fn len(&self) -> usize {
        self.assert_ok("len", Location::caller());
        self.size
    }

    #[track_caller]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assert_ok("is_empty", Location::caller());
        self.size == 0
    }

    /// Number of element slots in the current buffer.
    #[track_caller]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.assert_ok("capacity", Location::caller());
        self.capacity
    }

    /// Run every check this level enables and report the first failure.
    ///
    /// Never aborts. Order: self address, self hash, buffer hash, size
    /// bound, shadow size, shadow capacity, shadow top, registry.
    pub fn validate(&self) -> Result<(), Violation> {
        let metrics = global_metrics();
        StackMetrics::inc(&metrics.validations);
        let verdict = self.run_checks();
        if let Err(violation) = verdict {
            StackMetrics::inc(&metrics.validation_failures);
            match violation {
                Violation::BadSelfHash => StackMetrics::inc(&metrics.self_hash_failures),
                Violation::BadBufferHash => StackMetrics::inc(&metrics.buffer_hash_failures),
                _ => {}
            }
        }
        verdict
    }

    fn run_checks(&self) -> Result<(), Violation> {
        let level = P::LEVEL;
        if level.self_pointer_checks()
            && !is_valid_pointer(self.address(), PageRights::READ, level)
        {
            return Err(Violation::BadSelfPointer);
        }
        if level.guards_enabled() {
            if self.compute_self_hash() != self.self_hash {
                return Err(Violation::BadSelfHash);
            }
            if self.compute_buffer_hash() != self.buffer_hash {
                return Err(Violation::BadBufferHash);
            }
        }
        if self.size > self.capacity {
            return Err(Violation::BadSize);
        }
        if let Some(shadow) = &self.shadow {
            if !shadow.check_object(SHADOW_SIZE, &self.size) {
                return Err(Violation::BadShadowSize);
            }
            if !shadow.check_object(SHADOW_CAPACITY, &self.capacity) {
                return Err(Violation::BadShadowCapacity);
            }
            if let Some(top) = self.live_elements().last() {
                if !shadow.check_object(SHADOW_TOP, top) {
                    return Err(Violation::BadShadowTop);
                }
            }
        }
        if level.guards_enabled() && !global_registry().lock().valid() {
            return Err(Violation::BadRegistry);
        }
        Ok(())
    }

    /// Address the instance lives at.
    #[must_use]
    pub fn address(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    /// Elements below `size`, bounded by `capacity`.
    pub(crate) fn live_elements(&self) -> &[T] {
        let live = self.size.min(self.capacity);
        // SAFETY: slots below `size` hold initialised values; `capacity`
        // bounds the read to the allocation even if `size` was clobbered.
        unsafe { std::slice::from_raw_parts(self.buffer.as_ptr(), live) }
    }

    fn assert_ok(&self, operation: &str, location: &'static Location<'static>) {
        if !P::LEVEL.guards_enabled() {
            return;
        }
        if let Err(violation) = self.validate() {
            fatal::everything_is_bad(self, operation, location, violation);
        }
    }

    /// Move the live elements into a fresh buffer of `new_capacity` slots.
    fn resize(&mut self, new_capacity: usize) {
        let Some(fresh) = buffer::allocate::<T>(new_capacity) else {
            diag::fatal_exit("buffer size overflows the address space");
        };
        let moved = self.size.min(new_capacity);
        // SAFETY: both buffers hold at least `moved` slots and do not
        // overlap; the old one is released without dropping what moved.
        unsafe {
            ptr::copy_nonoverlapping(self.buffer.as_ptr(), fresh.as_ptr(), moved);
            buffer::release(self.buffer, self.capacity);
        }
        self.buffer = fresh;
        self.capacity = new_capacity;
        if let Some(shadow) = &self.shadow {
            shadow.set_object(SHADOW_SIZE, &self.size);
            shadow.set_object(SHADOW_CAPACITY, &self.capacity);
        }
    }
}

impl<T: ByteRepr, P: Paranoia> Drop for ProtectedStack<T, P> {
    fn drop(&mut self) {
        // `drop` cannot be `#[track_caller]`: a failure here reports this
        // line, not the scope that dropped the instance.
        self.assert_ok("drop", Location::caller());
        let live = self.size.min(self.capacity);
        // SAFETY: the first `live` slots hold values owned by the stack;
        // afterwards the buffer is released exactly once.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.buffer.as_ptr(), live));
            buffer::release(self.buffer, self.capacity);
        }
        if P::LEVEL.guards_enabled() {
            global_registry().lock().delete(self.address());
        }
        self.shadow = None;
        StackMetrics::inc(&global_metrics().destructions);
    }
}

impl<T: ByteRepr, P: Paranoia> fmt::Debug for ProtectedStack<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedStack")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("level", &P::LEVEL)
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("shadow", &self.shadow)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use ironstack_membrane::config::{
        Guarded, PageChecked, SelfChecked, Shadowed, Unguarded, VerifierEndpoint,
        install_verifier,
    };

    use super::*;

    fn loopback_peer() {
        install_verifier(VerifierEndpoint::Loopback);
    }

    fn field_bytes<F>(field: &mut F) -> &mut [u8] {
        // SAFETY: test-only view of a plain-data field.
        unsafe {
            std::slice::from_raw_parts_mut(ptr::from_mut(field).cast::<u8>(), mem::size_of::<F>())
        }
    }

    fn filled<P: Paranoia>(n: i32) -> Pin<Box<ProtectedStack<i32, P>>> {
        let mut stack = ProtectedStack::<i32, P>::new();
        for i in 0..n {
            stack.as_mut().push(i);
        }
        stack
    }

    #[test]
    fn push_pop_is_lifo() {
        loopback_peer();
        let mut stack = filled::<PageChecked>(3);
        assert_eq!(stack.len(), 3);
        assert_eq!(*stack.top(), 2);
        assert!(stack.as_mut().pop());
        assert_eq!(*stack.top(), 1);
        assert!(stack.as_mut().pop());
        assert!(stack.as_mut().pop());
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_on_empty_returns_false() {
        loopback_peer();
        let mut stack = ProtectedStack::<i32, Guarded>::new();
        assert!(!stack.as_mut().pop());
        assert!(stack.validate().is_ok());
    }

    #[test]
    fn grows_by_doubling() {
        loopback_peer();
        let mut stack = filled::<Guarded>(16);
        assert_eq!(stack.capacity(), 16);
        stack.as_mut().push(16);
        assert_eq!(stack.capacity(), 32);
        for i in 17..33 {
            stack.as_mut().push(i);
        }
        assert_eq!(stack.capacity(), 64);
        assert_eq!(*stack.top(), 32);
    }

    #[test]
    fn shrinks_at_quarter_load_but_not_below_minimum() {
        loopback_peer();
        let mut stack = filled::<SelfChecked>(17);
        assert_eq!(stack.capacity(), 32);
        while stack.len() > 9 {
            stack.as_mut().pop();
        }
        assert_eq!(stack.capacity(), 32);
        stack.as_mut().pop();
        assert_eq!(stack.len(), 8);
        assert_eq!(stack.capacity(), 16);
        while stack.as_mut().pop() {}
        assert_eq!(stack.capacity(), MIN_CAPACITY);
        assert!(stack.validate().is_ok());
    }

    #[test]
    fn elements_survive_resizes() {
        loopback_peer();
        let mut stack = filled::<Guarded>(100);
        for expected in (0..100).rev() {
            assert_eq!(*stack.top(), expected);
            stack.as_mut().pop();
        }
    }

    #[test]
    fn validate_is_idempotent() {
        loopback_peer();
        let stack = filled::<PageChecked>(5);
        assert_eq!(stack.validate(), Ok(()));
        assert_eq!(stack.validate(), Ok(()));
        assert_eq!(stack.len(), 5);
    }

    #[test]
    fn failed_validation_repeats_buffer_hash_verdict() {
        loopback_peer();
        let stack = filled::<Guarded>(3);
        let element = stack.buffer.as_ptr().cast::<u8>();
        // SAFETY: first byte of slot 0, restored right after.
        unsafe { *element ^= 0x10 };
        let first = stack.validate();
        let second = stack.validate();
        unsafe { *element ^= 0x10 };
        assert_eq!(first, Err(Violation::BadBufferHash));
        assert_eq!(second, first);
        assert_eq!(stack.validate(), Ok(()));
    }

    #[test]
    fn failed_validation_repeats_shadow_size_verdict() {
        loopback_peer();
        let stack = filled::<Shadowed>(3);
        let shadow = stack.shadow.as_ref().expect("shadowed stack has a channel");
        shadow.set_object(SHADOW_SIZE, &99usize);
        let first = stack.validate();
        assert!(shadow.is_damaged());
        let second = stack.validate();
        assert_eq!(first, Err(Violation::BadShadowSize));
        assert_eq!(second, first);
        mem::forget(stack);
    }

    #[test]
    fn popped_slots_are_poisoned() {
        loopback_peer();
        let mut stack = filled::<Guarded>(2);
        stack.as_mut().pop();
        let dead = unsafe { buffer::dead_bytes(stack.buffer, 1, stack.capacity) };
        assert!(dead.iter().all(|&b| b == buffer::POISON));
    }

    #[test]
    fn registry_tracks_lifetime() {
        loopback_peer();
        let stack = ProtectedStack::<u8, Guarded>::new();
        let addr = stack.address();
        assert!(global_registry().lock().contains(addr));
        drop(stack);
        assert!(!global_registry().lock().contains(addr));
    }

    #[test]
    fn unguarded_stack_skips_registry() {
        loopback_peer();
        let mut stack = ProtectedStack::<u64, Unguarded>::new();
        stack.as_mut().push(7);
        assert!(!global_registry().lock().contains(stack.address()));
        assert_eq!(*stack.top(), 7);
    }

    #[test]
    fn owned_elements_are_dropped() {
        use std::rc::Rc;

        #[derive(Clone)]
        struct Tracked(Rc<()>);
        impl ByteRepr for Tracked {
            fn write_repr<S: ironstack_membrane::ByteSink + ?Sized>(&self, sink: &mut S) {
                sink.put(&[1]);
            }
        }

        loopback_peer();
        let token = Rc::new(());
        let mut stack = ProtectedStack::<Tracked, Guarded>::new();
        for _ in 0..20 {
            stack.as_mut().push(Tracked(Rc::clone(&token)));
        }
        assert_eq!(Rc::strong_count(&token), 21);
        stack.as_mut().pop();
        assert_eq!(Rc::strong_count(&token), 20);
        drop(stack);
        assert_eq!(Rc::strong_count(&token), 1);
    }

    fn control_field<P: Paranoia>(raw: &mut ProtectedStack<i32, P>, field: usize) -> &mut [u8] {
        match field {
            0 => field_bytes(&mut raw.header_canary),
            1 => field_bytes(&mut raw.size),
            2 => field_bytes(&mut raw.capacity),
            3 => field_bytes(&mut raw.buffer),
            _ => field_bytes(&mut raw.footer_canary),
        }
    }

    #[test]
    fn any_control_byte_flip_breaks_self_hash() {
        loopback_peer();
        let mut stack = filled::<Guarded>(3);
        // SAFETY: bytes are restored before the instance is used again.
        let raw = unsafe { stack.as_mut().get_unchecked_mut() };
        for field in 0..5 {
            let len = control_field(raw, field).len();
            for i in 0..len {
                control_field(raw, field)[i] ^= 0x40;
                let verdict = raw.validate();
                control_field(raw, field)[i] ^= 0x40;
                assert_eq!(verdict, Err(Violation::BadSelfHash), "field {field} byte {i}");
            }
        }
        assert_eq!(stack.validate(), Ok(()));
    }

    #[test]
    fn swapped_shadow_channel_breaks_self_hash() {
        loopback_peer();
        let mut stack = filled::<Shadowed>(2);
        // SAFETY: the original channel is put back before further use.
        let raw = unsafe { stack.as_mut().get_unchecked_mut() };
        let mut other = Some(ShadowChannel::loopback().expect("loopback peer"));
        mem::swap(&mut raw.shadow, &mut other);
        let swapped = raw.validate();
        mem::swap(&mut raw.shadow, &mut other);
        assert_eq!(swapped, Err(Violation::BadSelfHash));

        let detached = raw.shadow.take();
        let missing = raw.validate();
        raw.shadow = detached;
        assert_eq!(missing, Err(Violation::BadSelfHash));
        assert_eq!(stack.validate(), Ok(()));
    }

    #[test]
    fn element_and_dead_region_flips_break_buffer_hash() {
        loopback_peer();
        let stack = filled::<Guarded>(4);
        let base = stack.buffer.as_ptr().cast::<u8>();
        let probes = [0, 5, 4 * 4, 4 * 15 + 3];
        for offset in probes {
            // SAFETY: inside the 16-slot buffer; restored right after.
            unsafe { *base.add(offset) ^= 0x01 };
            let verdict = stack.validate();
            unsafe { *base.add(offset) ^= 0x01 };
            assert_eq!(verdict, Err(Violation::BadBufferHash), "offset {offset}");
        }
        assert_eq!(stack.validate(), Ok(()));
    }

    #[test]
    fn buffer_canaries_are_covered() {
        loopback_peer();
        let stack = filled::<Guarded>(1);
        let header = buffer::base_address(stack.buffer) as *mut u8;
        unsafe { *header ^= 0xFF };
        let verdict = stack.validate();
        unsafe { *header ^= 0xFF };
        assert_eq!(verdict, Err(Violation::BadBufferHash));
    }

    #[test]
    fn consistent_rewrite_still_fails_size_bound() {
        loopback_peer();
        let mut stack = filled::<Guarded>(2);
        let raw = unsafe { stack.as_mut().get_unchecked_mut() };
        raw.size = raw.capacity + 1;
        raw.recalculate_hashes();
        let verdict = raw.validate();
        raw.size = 2;
        raw.recalculate_hashes();
        assert_eq!(verdict, Err(Violation::BadSize));
    }

    #[test]
    fn shadowed_stack_mirrors_state() {
        loopback_peer();
        let mut stack = filled::<Shadowed>(20);
        assert_eq!(stack.validate(), Ok(()));
        for _ in 0..15 {
            stack.as_mut().pop();
        }
        assert_eq!(*stack.top(), 4);
        assert_eq!(stack.validate(), Ok(()));
    }

    #[test]
    fn shadow_catches_consistent_size_rewrite() {
        loopback_peer();
        let mut stack = filled::<Shadowed>(3);
        let raw = unsafe { stack.as_mut().get_unchecked_mut() };
        raw.size = 2;
        raw.recalculate_hashes();
        assert_eq!(raw.validate(), Err(Violation::BadShadowSize));
        assert!(raw.shadow.as_ref().is_some_and(ShadowChannel::is_damaged));
        // The channel stays damaged, so this instance can never pass again.
        mem::forget(stack);
    }

    #[test]
    fn shadow_catches_consistent_top_rewrite() {
        loopback_peer();
        let mut stack = filled::<Shadowed>(3);
        let raw = unsafe { stack.as_mut().get_unchecked_mut() };
        unsafe { raw.buffer.as_ptr().add(2).write(99) };
        raw.recalculate_hashes();
        assert_eq!(raw.validate(), Err(Violation::BadShadowTop));
        mem::forget(stack);
    }

    #[test]
    fn in_place_construction_and_drop() {
        loopback_peer();
        let mut slot = mem::MaybeUninit::<ProtectedStack<u16, Guarded>>::uninit();
        unsafe {
            ProtectedStack::construct_in_place(slot.as_mut_ptr());
            let mut pinned = Pin::new_unchecked(&mut *slot.as_mut_ptr());
            pinned.as_mut().push(11);
            assert_eq!(*pinned.top(), 11);
            ptr::drop_in_place(slot.as_mut_ptr());
        }
    }
}
