//! # IronStack
//!
//! A growable LIFO stack that distrusts its own memory.
//!
//! Every operation on a [`ProtectedStack`] is bracketed by a validation pass
//! that recomputes address-derived canaries and two Murmur3 checksums,
//! bounds-checks the size, optionally queries the process memory map, and at
//! the deepest level cross-checks size, capacity and top element against an
//! out-of-process shadow peer. A failure dumps the full object state and
//! terminates the process.
//!
//! ```no_run
//! use ironstack::ProtectedStack;
//!
//! let mut stack = ProtectedStack::<i32>::new();
//! stack.as_mut().push(1);
//! stack.as_mut().push(2);
//! assert_eq!(*stack.top(), 2);
//! assert!(stack.as_mut().pop());
//! assert_eq!(stack.len(), 1);
//! ```
//!
//! Verification depth is a type parameter; the verification primitives live
//! in [`ironstack_membrane`].

mod buffer;
mod dump;
mod fatal;
mod integrity;
pub mod stack;
pub mod violation;

pub use buffer::POISON;
pub use ironstack_membrane::config::{
    DefaultParanoia, Guarded, PageChecked, Paranoia, ParanoiaLevel, SelfChecked, Shadowed,
    Unguarded,
};
pub use ironstack_membrane::{ByteRepr, ByteSink};
pub use stack::{MIN_CAPACITY, ProtectedStack};
pub use violation::Violation;
