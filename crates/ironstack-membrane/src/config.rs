//! Verification depth and runtime settings.
//!
//! How much checking a container performs is fixed when it is compiled: each
//! [`ParanoiaLevel`] has a zero-sized marker type implementing [`Paranoia`],
//! and a protected container is generic over that marker. The build-wide
//! default is chosen with the `paranoia-0` .. `paranoia-4` cargo features
//! (highest enabled wins).
//!
//! Two settings are read from the environment once and cached:
//! - `IRONSTACK_VERIFIER`: program run as the shadow peer.
//! - `IRONSTACK_DUMP_LOG`: dump file used when standard error is closed.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Cumulative verification depth.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParanoiaLevel {
    /// Plain dynamic stack, no checks.
    Unguarded = 0,
    /// Canaries, integrity hashes, poisoning, instance registry and
    /// validation around every operation.
    #[default]
    Guarded = 1,
    /// Adds the self-address check and the dump log-file fallback.
    SelfChecked = 2,
    /// Self-address checks consult the process memory map.
    PageChecked = 3,
    /// State is mirrored into an out-of-process shadow peer.
    Shadowed = 4,
}

impl ParanoiaLevel {
    /// Parse from a name or digit (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "unguarded" | "off" | "none" => Self::Unguarded,
            "1" | "guarded" | "default" => Self::Guarded,
            "2" | "selfchecked" | "self-checked" | "self" => Self::SelfChecked,
            "3" | "pagechecked" | "page-checked" | "page" | "maps" => Self::PageChecked,
            "4" | "shadowed" | "shadow" | "full" => Self::Shadowed,
            _ => Self::Guarded,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unguarded => "unguarded",
            Self::Guarded => "guarded",
            Self::SelfChecked => "self-checked",
            Self::PageChecked => "page-checked",
            Self::Shadowed => "shadowed",
        }
    }

    /// Canaries, hashes, registry and pre/post validation.
    #[must_use]
    pub const fn guards_enabled(self) -> bool {
        self as u8 >= Self::Guarded as u8
    }

    /// The container checks its own address before trusting its fields.
    #[must_use]
    pub const fn self_pointer_checks(self) -> bool {
        self as u8 >= Self::SelfChecked as u8
    }

    /// Pointer checks query page permissions instead of a null test.
    #[must_use]
    pub const fn page_rights_checks(self) -> bool {
        self as u8 >= Self::PageChecked as u8
    }

    /// A shadow peer process mirrors selected state.
    #[must_use]
    pub const fn shadow_oracle(self) -> bool {
        self as u8 >= Self::Shadowed as u8
    }
}

impl std::fmt::Display for ParanoiaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Compile-time verification depth carried as a type parameter.
pub trait Paranoia: 'static {
    const LEVEL: ParanoiaLevel;
}

macro_rules! paranoia_marker {
    ($($(#[$meta:meta])* $name:ident => $level:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
            pub struct $name;

            impl Paranoia for $name {
                const LEVEL: ParanoiaLevel = ParanoiaLevel::$level;
            }
        )*
    };
}

paranoia_marker! {
    /// Level 0.
    Unguarded => Unguarded;
    /// Level 1.
    Guarded => Guarded;
    /// Level 2.
    SelfChecked => SelfChecked;
    /// Level 3.
    PageChecked => PageChecked;
    /// Level 4.
    Shadowed => Shadowed;
}

#[cfg(feature = "paranoia-4")]
pub type DefaultParanoia = Shadowed;
#[cfg(all(feature = "paranoia-3", not(feature = "paranoia-4")))]
pub type DefaultParanoia = PageChecked;
#[cfg(all(
    feature = "paranoia-2",
    not(any(feature = "paranoia-3", feature = "paranoia-4"))
))]
pub type DefaultParanoia = SelfChecked;
#[cfg(all(
    feature = "paranoia-1",
    not(any(feature = "paranoia-2", feature = "paranoia-3", feature = "paranoia-4"))
))]
pub type DefaultParanoia = Guarded;
#[cfg(not(any(
    feature = "paranoia-1",
    feature = "paranoia-2",
    feature = "paranoia-3",
    feature = "paranoia-4"
)))]
pub type DefaultParanoia = Unguarded;

/// Verification depth this build was compiled with.
#[must_use]
pub const fn build_level() -> ParanoiaLevel {
    <DefaultParanoia as Paranoia>::LEVEL
}

/// Where the shadow peer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierEndpoint {
    /// Spawn `program args...` with piped stdin/stdout.
    Process { program: PathBuf, args: Vec<String> },
    /// Serve the peer protocol inside this process.
    Loopback,
}

impl VerifierEndpoint {
    #[must_use]
    pub fn process(program: impl Into<PathBuf>) -> Self {
        Self::Process {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Name of the peer binary looked up when nothing else is configured.
pub const VERIFIER_BIN: &str = "ironstack-verifier";

/// Default dump file used when standard error is unavailable.
pub const DEFAULT_DUMP_LOG: &str = "ironstack.log";

static VERIFIER: OnceLock<VerifierEndpoint> = OnceLock::new();
static DUMP_LOG: OnceLock<PathBuf> = OnceLock::new();

/// Pin the shadow peer endpoint for the rest of the process.
///
/// Returns false if an endpoint was already resolved or installed; the first
/// one stays in effect.
pub fn install_verifier(endpoint: VerifierEndpoint) -> bool {
    VERIFIER.set(endpoint).is_ok()
}

/// Shadow peer endpoint (installed, from `IRONSTACK_VERIFIER`, or default).
#[must_use]
pub fn verifier_endpoint() -> &'static VerifierEndpoint {
    VERIFIER.get_or_init(|| match std::env::var("IRONSTACK_VERIFIER") {
        Ok(raw) => parse_verifier_env(&raw),
        Err(_) => VerifierEndpoint::process(default_verifier_program()),
    })
}

fn parse_verifier_env(raw: &str) -> VerifierEndpoint {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("loopback") {
        return VerifierEndpoint::Loopback;
    }
    let mut parts = trimmed.split_whitespace();
    match parts.next() {
        Some(program) => VerifierEndpoint::Process {
            program: PathBuf::from(program),
            args: parts.map(str::to_string).collect(),
        },
        None => VerifierEndpoint::process(default_verifier_program()),
    }
}

/// `ironstack-verifier` next to the running executable if present, else the
/// bare name for a `PATH` lookup.
#[must_use]
pub fn default_verifier_program() -> PathBuf {
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(VERIFIER_BIN)))
        .filter(|candidate| candidate.is_file());
    sibling.unwrap_or_else(|| PathBuf::from(VERIFIER_BIN))
}

/// Fallback dump file path.
#[must_use]
pub fn dump_log_path() -> &'static PathBuf {
    DUMP_LOG.get_or_init(|| {
        std::env::var_os("IRONSTACK_DUMP_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_LOG))
    })
}
