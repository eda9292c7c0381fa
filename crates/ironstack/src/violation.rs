//! Reasons a protected container can be found inconsistent.

use thiserror::Error;

/// First failed check of a validation, or the cause of a fatal abort.
///
/// `Display` yields the stable reason code printed in dumps and fatal
/// headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Violation {
    /// The instance address is null or not readable/writable.
    #[error("BAD_THIS_PTR")]
    BadSelfPointer,
    /// Control fields no longer match their stored hash.
    #[error("BAD_HASH_SUM")]
    BadSelfHash,
    /// Buffer contents no longer match their stored hash.
    #[error("BAD_BUFFER_HASH_SUM")]
    BadBufferHash,
    /// Size exceeds capacity.
    #[error("BAD_SIZE")]
    BadSize,
    #[error("BAD_EXTERNAL_SIZE")]
    BadShadowSize,
    #[error("BAD_EXTERNAL_CAPACITY")]
    BadShadowCapacity,
    #[error("BAD_EXTERNAL_STACK_TOP")]
    BadShadowTop,
    /// The instance registry failed its own cross-check.
    #[error("BAD_POINTER_MANAGER")]
    BadRegistry,
    /// `top` on an empty container.
    #[error("STACK_IS_EMPTY")]
    StackEmpty,
    /// Construction over an address that hosts a live instance.
    #[error("ADDRESS_IN_USE")]
    AddressInUse,
    /// Construction at an address that fails the pointer check.
    #[error("BAD_ADDRESS")]
    BadAddress,
}

impl Violation {
    /// All reason codes, in validation order.
    pub const ALL: [Self; 11] = [
        Self::BadSelfPointer,
        Self::BadSelfHash,
        Self::BadBufferHash,
        Self::BadSize,
        Self::BadShadowSize,
        Self::BadShadowCapacity,
        Self::BadShadowTop,
        Self::BadRegistry,
        Self::StackEmpty,
        Self::AddressInUse,
        Self::BadAddress,
    ];

    /// True for failures detected by a cross-check against the shadow peer.
    #[must_use]
    pub const fn is_shadow(self) -> bool {
        matches!(
            self,
            Self::BadShadowSize | Self::BadShadowCapacity | Self::BadShadowTop
        )
    }

    /// Human-readable explanation used when construction is refused.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::BadSelfPointer => "instance address is not valid",
            Self::BadSelfHash => "control fields changed outside the container",
            Self::BadBufferHash => "buffer changed outside the container",
            Self::BadSize => "size is larger than capacity",
            Self::BadShadowSize => "size disagrees with the shadow peer",
            Self::BadShadowCapacity => "capacity disagrees with the shadow peer",
            Self::BadShadowTop => "top element disagrees with the shadow peer",
            Self::BadRegistry => "instance registry is corrupted",
            Self::StackEmpty => "stack is empty",
            Self::AddressInUse => {
                "This pointer is already in use (two stacks are constructed at the same address)"
            }
            Self::BadAddress => "Pointer is not valid",
        }
    }
}
