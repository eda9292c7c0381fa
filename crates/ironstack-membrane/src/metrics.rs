//! Atomic counters for verification observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide verification counters.
pub struct StackMetrics {
    /// Full validation passes run.
    pub validations: AtomicU64,
    /// Validation passes that reported a violation.
    pub validation_failures: AtomicU64,
    /// Self-hash mismatches.
    pub self_hash_failures: AtomicU64,
    /// Buffer-hash mismatches.
    pub buffer_hash_failures: AtomicU64,
    /// Canaries that failed recomputation during a dump.
    pub canary_failures: AtomicU64,
    /// Shadow peer cross-checks performed.
    pub shadow_checks: AtomicU64,
    /// Shadow peer cross-checks that disagreed.
    pub shadow_mismatches: AtomicU64,
    /// Memory-map lookups.
    pub page_queries: AtomicU64,
    /// Buffer growths.
    pub grows: AtomicU64,
    /// Buffer shrinks.
    pub shrinks: AtomicU64,
    /// Instances constructed.
    pub constructions: AtomicU64,
    /// Instances destroyed.
    pub destructions: AtomicU64,
    /// Constructions refused because the address was still registered.
    pub registry_rejections: AtomicU64,
    /// Fatal corruption aborts started.
    pub fatal_aborts: AtomicU64,
}

impl StackMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            validations: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            self_hash_failures: AtomicU64::new(0),
            buffer_hash_failures: AtomicU64::new(0),
            canary_failures: AtomicU64::new(0),
            shadow_checks: AtomicU64::new(0),
            shadow_mismatches: AtomicU64::new(0),
            page_queries: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            shrinks: AtomicU64::new(0),
            constructions: AtomicU64::new(0),
            destructions: AtomicU64::new(0),
            registry_rejections: AtomicU64::new(0),
            fatal_aborts: AtomicU64::new(0),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            validations: Self::get(&self.validations),
            validation_failures: Self::get(&self.validation_failures),
            self_hash_failures: Self::get(&self.self_hash_failures),
            buffer_hash_failures: Self::get(&self.buffer_hash_failures),
            canary_failures: Self::get(&self.canary_failures),
            shadow_checks: Self::get(&self.shadow_checks),
            shadow_mismatches: Self::get(&self.shadow_mismatches),
            page_queries: Self::get(&self.page_queries),
            grows: Self::get(&self.grows),
            shrinks: Self::get(&self.shrinks),
            constructions: Self::get(&self.constructions),
            destructions: Self::get(&self.destructions),
            registry_rejections: Self::get(&self.registry_rejections),
            fatal_aborts: Self::get(&self.fatal_aborts),
        }
    }
}

impl Default for StackMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub validations: u64,
    pub validation_failures: u64,
    pub self_hash_failures: u64,
    pub buffer_hash_failures: u64,
    pub canary_failures: u64,
    pub shadow_checks: u64,
    pub shadow_mismatches: u64,
    pub page_queries: u64,
    pub grows: u64,
    pub shrinks: u64,
    pub constructions: u64,
    pub destructions: u64,
    pub registry_rejections: u64,
    pub fatal_aborts: u64,
}

impl MetricsSnapshot {
    /// Counter names and values in declaration order.
    #[must_use]
    pub fn entries(&self) -> [(&'static str, u64); 14] {
        [
            ("validations", self.validations),
            ("validation_failures", self.validation_failures),
            ("self_hash_failures", self.self_hash_failures),
            ("buffer_hash_failures", self.buffer_hash_failures),
            ("canary_failures", self.canary_failures),
            ("shadow_checks", self.shadow_checks),
            ("shadow_mismatches", self.shadow_mismatches),
            ("page_queries", self.page_queries),
            ("grows", self.grows),
            ("shrinks", self.shrinks),
            ("constructions", self.constructions),
            ("destructions", self.destructions),
            ("registry_rejections", self.registry_rejections),
            ("fatal_aborts", self.fatal_aborts),
        ]
    }
}

static GLOBAL_METRICS: StackMetrics = StackMetrics::new();

#[must_use]
pub fn global_metrics() -> &'static StackMetrics {
    &GLOBAL_METRICS
}
