//! Pointer validity oracle.
//!
//! Answers "may this address be dereferenced with these rights?" by looking
//! up the mapping that contains it in the process memory map. Where the map
//! cannot be read the oracle degrades to a null test.

use std::ops::BitOr;

use crate::config::ParanoiaLevel;
use crate::metrics::{StackMetrics, global_metrics};

/// Page permission bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PageRights(u8);

impl PageRights {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXECUTE: Self = Self(4);
    pub const READ_WRITE: Self = Self(1 | 2);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse the `rwxp` permission column of a maps line.
    #[must_use]
    pub fn from_perms(perms: &str) -> Self {
        let bytes = perms.as_bytes();
        let mut rights = Self::NONE;
        if bytes.first() == Some(&b'r') {
            rights = rights | Self::READ;
        }
        if bytes.get(1) == Some(&b'w') {
            rights = rights | Self::WRITE;
        }
        if bytes.get(2) == Some(&b'x') {
            rights = rights | Self::EXECUTE;
        }
        rights
    }
}

impl BitOr for PageRights {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Outcome of a memory-rights query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightsQuery {
    /// Address lies in a mapping with these rights.
    Mapped(PageRights),
    /// Address is not covered by any mapping.
    Unmapped,
    /// The platform offers no introspection; nothing is known.
    Unavailable,
}

/// Capability to inspect page permissions of the current process.
pub trait MemoryIntrospector {
    fn query_rights(&self, addr: usize) -> RightsQuery;
}

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRegion {
    pub start: usize,
    pub end: usize,
    pub rights: PageRights,
}

impl MapRegion {
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }
}

/// Parse `start-end perms ...`; returns None for malformed lines.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<MapRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let (start, end) = range.split_once('-')?;
    Some(MapRegion {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        rights: PageRights::from_perms(perms),
    })
}

/// Reads `/proc/self/maps` on every query.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMaps;

impl MemoryIntrospector for ProcMaps {
    fn query_rights(&self, addr: usize) -> RightsQuery {
        StackMetrics::inc(&global_metrics().page_queries);
        let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
            return RightsQuery::Unavailable;
        };
        maps.lines()
            .filter_map(parse_maps_line)
            .find(|region| region.contains(addr))
            .map_or(RightsQuery::Unmapped, |region| {
                RightsQuery::Mapped(region.rights)
            })
    }
}

/// Introspector for platforms without a memory map.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIntrospection;

impl MemoryIntrospector for NoIntrospection {
    fn query_rights(&self, _addr: usize) -> RightsQuery {
        RightsQuery::Unavailable
    }
}

/// Check `addr` against `required` using `introspector`.
pub fn check_rights<I: MemoryIntrospector + ?Sized>(
    introspector: &I,
    addr: usize,
    required: PageRights,
) -> bool {
    if addr == 0 {
        return false;
    }
    match introspector.query_rights(addr) {
        RightsQuery::Mapped(rights) => rights.contains(required),
        RightsQuery::Unmapped => false,
        RightsQuery::Unavailable => true,
    }
}

/// Validity test used by the container at a given verification depth.
///
/// Below [`ParanoiaLevel::PageChecked`] only null is rejected.
#[must_use]
pub fn is_valid_pointer(addr: usize, required: PageRights, level: ParanoiaLevel) -> bool {
    if !level.page_rights_checks() {
        return addr != 0;
    }
    if cfg!(target_os = "linux") {
        check_rights(&ProcMaps, addr, required)
    } else {
        check_rights(&NoIntrospection, addr, required)
    }
}
