//! Verification primitives for the IronStack self-checking container.
//!
//! The container itself lives in the `ironstack` crate; this crate provides
//! the independent layers it composes:
//! - **Hash engine** (`murmur`): streaming 32-bit Murmur3
//! - **Sequence generator** (`xorshift`): seeded xorshift words
//! - **Byte representation** (`repr`): fixed-width bytes of hashed values
//! - **Canaries** (`canary`): address-derived sentinel sequences
//! - **Pointer oracle** (`page_oracle`): page-permission queries
//! - **Instance registry** (`registry`): live-address set, shadow mirrored
//! - **Shadow oracle** (`shadow`): out-of-process state mirror and its peer
//! - **Configuration** (`config`): compile-time verification depth
//! - **Diagnostics** (`diag`) and **metrics** (`metrics`)

#![deny(unsafe_code)]

pub mod canary;
pub mod config;
pub mod diag;
pub mod metrics;
pub mod murmur;
pub mod page_oracle;
pub mod registry;
pub mod repr;
pub mod shadow;
pub mod xorshift;

pub use canary::{CANARY_SIZE, CANARY_WORDS, Canary, HASH_SEED};
pub use config::{DefaultParanoia, Paranoia, ParanoiaLevel, VerifierEndpoint};
pub use metrics::{MetricsSnapshot, StackMetrics, global_metrics};
pub use murmur::Murmur3;
pub use page_oracle::{PageRights, is_valid_pointer};
pub use registry::{InstanceRegistry, global_registry};
pub use repr::{ByteRepr, ByteSink};
pub use shadow::{ShadowChannel, ShadowError};
pub use xorshift::XorShift32;
