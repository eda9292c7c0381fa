//! Guarded element storage.
//!
//! Layout of one allocation (`offset = max(align_of::<T>(), CANARY_SIZE)`
//! rounded up to the element alignment):
//!
//! ```text
//! base                     base+offset            +capacity*size_of::<T>()
//! | header canary | gap   | slot 0 | ... | slot n | footer canary |
//! ```
//!
//! Both canaries are derived from `base`. Slots that hold no live element are
//! filled with [`POISON`], so every byte of the region is initialised.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::{self, NonNull};

use ironstack_membrane::{CANARY_SIZE, Canary};

/// Fill byte of dead slots.
pub const POISON: u8 = 0x21;

/// Geometry of one buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferLayout {
    pub layout: Layout,
    /// Distance from the allocation base to slot 0.
    pub offset: usize,
    /// Distance from the allocation base to the footer canary.
    pub footer: usize,
}

impl BufferLayout {
    pub fn for_capacity<T>(capacity: usize) -> Option<Self> {
        let align = mem::align_of::<T>().max(mem::align_of::<Canary>());
        let offset = CANARY_SIZE.checked_next_multiple_of(align)?;
        let slots = mem::size_of::<T>().checked_mul(capacity)?;
        let footer = offset.checked_add(slots)?;
        let total = footer.checked_add(CANARY_SIZE)?;
        let layout = Layout::from_size_align(total, align).ok()?.pad_to_align();
        Some(Self {
            layout,
            offset,
            footer,
        })
    }
}

/// Allocate storage for `capacity` elements with both canaries written and
/// every slot poisoned.
///
/// Returns `None` when the size computation overflows.
pub(crate) fn allocate<T>(capacity: usize) -> Option<NonNull<T>> {
    let geometry = BufferLayout::for_capacity::<T>(capacity)?;
    // SAFETY: the layout has a non-zero size (two canaries at least).
    let raw = unsafe { alloc::alloc(geometry.layout) };
    let Some(base) = NonNull::new(raw) else {
        alloc::handle_alloc_error(geometry.layout);
    };

    let canary = Canary::for_address(base.as_ptr() as usize).to_bytes();
    // SAFETY: header and footer lie inside the allocation by construction of
    // `geometry`; the slot region is `[offset, footer)`.
    unsafe {
        ptr::copy_nonoverlapping(canary.as_ptr(), base.as_ptr(), CANARY_SIZE);
        ptr::copy_nonoverlapping(
            canary.as_ptr(),
            base.as_ptr().add(geometry.footer),
            CANARY_SIZE,
        );
        let slots = base.as_ptr().add(geometry.offset);
        ptr::write_bytes(slots, POISON, geometry.footer - geometry.offset);
        Some(NonNull::new_unchecked(slots.cast::<T>()))
    }
}

/// Free storage obtained from [`allocate`] without touching its slots.
///
/// # Safety
///
/// `elements` must come from `allocate::<T>(capacity)` and not have been
/// released; live elements must already be dropped or moved out.
pub(crate) unsafe fn release<T>(elements: NonNull<T>, capacity: usize) {
    let Some(geometry) = BufferLayout::for_capacity::<T>(capacity) else {
        return;
    };
    // SAFETY: the caller guarantees `elements` is `base + offset` of a live
    // allocation with this layout.
    unsafe {
        let base = elements.as_ptr().cast::<u8>().sub(geometry.offset);
        alloc::dealloc(base, geometry.layout);
    }
}

/// Allocation base of the buffer whose slot 0 is `elements`.
pub(crate) fn base_address<T>(elements: NonNull<T>) -> usize {
    let offset = BufferLayout::for_capacity::<T>(0).map_or(CANARY_SIZE, |g| g.offset);
    (elements.as_ptr() as usize).wrapping_sub(offset)
}

/// Copy of the header canary.
///
/// # Safety
///
/// `elements` must be slot 0 of a live buffer from [`allocate`].
pub(crate) unsafe fn read_header<T>(elements: NonNull<T>) -> Canary {
    // SAFETY: forwarded to the caller.
    unsafe { read_canary(base_address(elements) as *const u8) }
}

/// Copy of the footer canary.
///
/// # Safety
///
/// `elements` must be slot 0 of a live buffer of `capacity` slots.
pub(crate) unsafe fn read_footer<T>(elements: NonNull<T>, capacity: usize) -> Canary {
    // SAFETY: forwarded to the caller; the footer follows the last slot.
    unsafe {
        let end = elements.as_ptr().add(capacity).cast::<u8>();
        read_canary(end)
    }
}

unsafe fn read_canary(at: *const u8) -> Canary {
    let mut bytes = [0u8; CANARY_SIZE];
    // SAFETY: the caller guarantees CANARY_SIZE readable bytes at `at`.
    unsafe { ptr::copy_nonoverlapping(at, bytes.as_mut_ptr(), CANARY_SIZE) };
    Canary::from_bytes(&bytes)
}

/// Raw bytes of slots `from..capacity`.
///
/// # Safety
///
/// `elements` must be slot 0 of a live buffer of `capacity` slots and
/// `from <= capacity`. Those slots must hold poison, not live values.
pub(crate) unsafe fn dead_bytes<'a, T>(
    elements: NonNull<T>,
    from: usize,
    capacity: usize,
) -> &'a [u8] {
    // SAFETY: forwarded to the caller; dead slots are initialised poison.
    unsafe {
        std::slice::from_raw_parts(
            elements.as_ptr().add(from).cast::<u8>(),
            (capacity - from) * mem::size_of::<T>(),
        )
    }
}

/// Overwrite one slot with poison.
///
/// # Safety
///
/// `slot` must point into a live buffer and hold no live value.
pub(crate) unsafe fn poison<T>(slot: *mut T) {
    // SAFETY: forwarded to the caller.
    unsafe { ptr::write_bytes(slot, POISON, 1) };
}
