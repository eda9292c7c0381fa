//! Process-wide registry of addresses hosting a live protected instance.
//!
//! Construction at an address that is still registered means a second object
//! is being placed over a live one without destroying it first; the container
//! refuses that. When shadowing is enabled the registry mirrors its address
//! list into its own shadow channel under `"data"` after every change, so a
//! registry corrupted in place disagrees with the peer.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::{build_level, verifier_endpoint};
use crate::diag;
use crate::shadow::ShadowChannel;

/// Shadow name of the registry snapshot.
pub const REGISTRY_SHADOW_NAME: &str = "data";

/// Set of live instance addresses.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    addresses: Vec<usize>,
    shadow: Option<ShadowChannel>,
    damaged: bool,
}

impl InstanceRegistry {
    /// Registry without a shadow mirror.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry mirrored into `shadow`.
    #[must_use]
    pub fn with_shadow(shadow: ShadowChannel) -> Self {
        Self {
            addresses: Vec::new(),
            shadow: Some(shadow),
            damaged: false,
        }
    }

    /// Track `addr`. Returns false if it was already tracked.
    pub fn add(&mut self, addr: usize) -> bool {
        if self.contains(addr) {
            return false;
        }
        self.addresses.push(addr);
        self.update();
        true
    }

    /// Stop tracking `addr` (unordered removal). Returns false if untracked.
    pub fn delete(&mut self, addr: usize) -> bool {
        let Some(pos) = self.addresses.iter().position(|&a| a == addr) else {
            return false;
        };
        self.addresses.swap_remove(pos);
        self.update();
        true
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.addresses.contains(&addr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Tracked addresses in registry order.
    #[must_use]
    pub fn snapshot(&self) -> &[usize] {
        &self.addresses
    }

    /// The snapshot as sent to the shadow peer.
    #[must_use]
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.addresses
            .iter()
            .flat_map(|addr| addr.to_ne_bytes())
            .collect()
    }

    /// Cross-check the snapshot against the shadow mirror.
    #[must_use]
    pub fn valid(&self) -> bool {
        if self.damaged {
            return false;
        }
        match &self.shadow {
            Some(shadow) => shadow.check_binary(REGISTRY_SHADOW_NAME, &self.snapshot_bytes()),
            None => true,
        }
    }

    /// Poison all future cross-checks.
    pub fn damage(&mut self) {
        self.damaged = true;
        if let Some(shadow) = &self.shadow {
            shadow.damage();
        }
    }

    #[must_use]
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    /// True if the mirror lives in a separate process.
    #[must_use]
    pub fn has_process_shadow(&self) -> bool {
        self.shadow
            .as_ref()
            .is_some_and(ShadowChannel::is_out_of_process)
    }

    fn update(&self) {
        if let Some(shadow) = &self.shadow {
            shadow.set_binary(REGISTRY_SHADOW_NAME, &self.snapshot_bytes());
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<Mutex<InstanceRegistry>> = OnceLock::new();

/// The process-wide registry.
///
/// Created on first use; in a shadowed build it connects its own peer then,
/// and a peer that cannot be reached is fatal.
#[must_use]
pub fn global_registry() -> &'static Mutex<InstanceRegistry> {
    GLOBAL_REGISTRY.get_or_init(|| {
        if !build_level().shadow_oracle() {
            return Mutex::new(InstanceRegistry::new());
        }
        match ShadowChannel::connect(verifier_endpoint()) {
            Ok(shadow) => Mutex::new(InstanceRegistry::with_shadow(shadow)),
            Err(err) => diag::fatal_exit(&format!("instance registry: {err}")),
        }
    })
}
