//! Corruption scenarios.
//!
//! Each scenario drives a [`ProtectedStack`] into one specific misuse or
//! memory corruption. Most of them are expected to end the process, so they
//! are meant to run in a dedicated child (see [`crate::supervisor`]); run
//! in-process they only return if the container failed to notice.

use std::mem;
use std::ptr;

use ironstack::{
    Guarded, PageChecked, Paranoia, ParanoiaLevel, ProtectedStack, SelfChecked, Shadowed,
    Unguarded, Violation,
};
use ironstack_membrane::config::{VerifierEndpoint, default_verifier_program, install_verifier};
use serde::Serialize;
use thiserror::Error;

/// How a scenario process is expected to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// Exit status 0.
    Clean,
    /// Exit status 1 after a diagnostic.
    Exit1,
    /// SIGKILL of the whole process group.
    Killed,
    /// Anything else.
    Other,
}

/// Expected end of one scenario at one verification depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub termination: Termination,
    /// Reason the diagnostic header must name.
    pub violation: Option<Violation>,
    /// The failure happens before an instance exists.
    pub construction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Bitwise-copy one live stack over another, then read from it.
    OverwriteInstance,
    /// Construct a second stack at the address of a live one.
    ReconstructLive,
    /// Zero the first four bytes of a live instance.
    ClobberHeader,
    /// Flip one byte of the top element in the buffer.
    ClobberBuffer,
    /// Read the top of an empty stack.
    EmptyTop,
    /// Pop an empty stack, then use it normally.
    EmptyPop,
    /// Run against a shadow peer that stops recording updates.
    TamperShadowed,
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario `{scenario}` needs paranoia level {required} or higher, got {requested}")]
    LevelTooLow {
        scenario: &'static str,
        required: ParanoiaLevel,
        requested: ParanoiaLevel,
    },
    #[error("scenario `{0}` was expected to terminate the process but returned")]
    Survived(&'static str),
    #[error("shadow peer endpoint was already chosen; `{0}` needs its own")]
    EndpointTaken(&'static str),
}

impl Scenario {
    pub const ALL: [Self; 7] = [
        Self::OverwriteInstance,
        Self::ReconstructLive,
        Self::ClobberHeader,
        Self::ClobberBuffer,
        Self::EmptyTop,
        Self::EmptyPop,
        Self::TamperShadowed,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OverwriteInstance => "overwrite-instance",
            Self::ReconstructLive => "reconstruct-live",
            Self::ClobberHeader => "clobber-header",
            Self::ClobberBuffer => "clobber-buffer",
            Self::EmptyTop => "empty-top",
            Self::EmptyPop => "empty-pop",
            Self::TamperShadowed => "tamper-shadowed",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Lowest level at which the scenario is meaningful (and memory-safe).
    #[must_use]
    pub const fn min_level(self) -> ParanoiaLevel {
        match self {
            Self::EmptyTop | Self::EmptyPop => ParanoiaLevel::Unguarded,
            Self::TamperShadowed => ParanoiaLevel::Shadowed,
            _ => ParanoiaLevel::Guarded,
        }
    }

    #[must_use]
    pub fn expectation(self, level: ParanoiaLevel) -> Expectation {
        // A fatal abort with a live peer process takes the group down.
        let fatal = if level.shadow_oracle() {
            Termination::Killed
        } else {
            Termination::Exit1
        };
        let (termination, violation, construction) = match self {
            Self::OverwriteInstance | Self::ClobberHeader => {
                (fatal, Some(Violation::BadSelfHash), false)
            }
            Self::ClobberBuffer => (fatal, Some(Violation::BadBufferHash), false),
            Self::ReconstructLive => (Termination::Exit1, Some(Violation::AddressInUse), true),
            Self::EmptyTop => (fatal, Some(Violation::StackEmpty), false),
            Self::EmptyPop => (Termination::Clean, None, false),
            Self::TamperShadowed => (Termination::Killed, Some(Violation::BadShadowSize), false),
        };
        Expectation {
            termination,
            violation,
            construction,
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Run `scenario` in this process at `level`.
///
/// Returns a summary for scenarios that complete normally. Fatal scenarios
/// do not return unless detection failed.
pub fn run_in_process(scenario: Scenario, level: ParanoiaLevel) -> Result<String, ScenarioError> {
    if level < scenario.min_level() {
        return Err(ScenarioError::LevelTooLow {
            scenario: scenario.name(),
            required: scenario.min_level(),
            requested: level,
        });
    }
    match level {
        ParanoiaLevel::Unguarded => run::<Unguarded>(scenario),
        ParanoiaLevel::Guarded => run::<Guarded>(scenario),
        ParanoiaLevel::SelfChecked => run::<SelfChecked>(scenario),
        ParanoiaLevel::PageChecked => run::<PageChecked>(scenario),
        ParanoiaLevel::Shadowed => run::<Shadowed>(scenario),
    }
}

fn run<P: Paranoia>(scenario: Scenario) -> Result<String, ScenarioError> {
    match scenario {
        Scenario::OverwriteInstance => overwrite_instance::<P>(),
        Scenario::ReconstructLive => reconstruct_live::<P>(),
        Scenario::ClobberHeader => clobber_header::<P>(),
        Scenario::ClobberBuffer => clobber_buffer::<P>(),
        Scenario::EmptyTop => empty_top::<P>(),
        Scenario::EmptyPop => return Ok(empty_pop::<P>()),
        Scenario::TamperShadowed => tamper_shadowed()?,
    }
    Err(ScenarioError::Survived(scenario.name()))
}

#[allow(unsafe_code)]
fn overwrite_instance<P: Paranoia>() {
    let mut stack = ProtectedStack::<i32, P>::new();
    for i in 0..100 {
        stack.as_mut().push(i);
    }
    let mut other = ProtectedStack::<i32, P>::new();
    other.as_mut().push(0);

    // SAFETY: deliberately unsound; the container must abort on next use.
    unsafe {
        let dst = ptr::from_mut(stack.as_mut().get_unchecked_mut());
        ptr::copy_nonoverlapping(ptr::from_ref(&*other), dst, 1);
    }
    for i in (0..100).rev() {
        if *stack.top() != i {
            return;
        }
        stack.as_mut().pop();
    }
    mem::forget(stack);
    mem::forget(other);
}

#[allow(unsafe_code)]
fn reconstruct_live<P: Paranoia>() {
    let mut stack = ProtectedStack::<u32, P>::new();
    stack.as_mut().push(1);
    // SAFETY: deliberately unsound; construction must refuse the address.
    unsafe {
        let slot = ptr::from_mut(stack.as_mut().get_unchecked_mut());
        ProtectedStack::construct_in_place(slot);
    }
    mem::forget(stack);
}

#[allow(unsafe_code)]
fn clobber_header<P: Paranoia>() {
    let mut stack = ProtectedStack::<u64, P>::new();
    stack.as_mut().push(7);
    // SAFETY: the header canary is the first field; its first word is
    // deliberately clobbered.
    unsafe {
        let base = ptr::from_mut(stack.as_mut().get_unchecked_mut()).cast::<u8>();
        ptr::write_bytes(base, 0, mem::size_of::<u32>());
    }
    stack.as_mut().push(8);
    mem::forget(stack);
}

#[allow(unsafe_code, invalid_reference_casting)]
fn clobber_buffer<P: Paranoia>() {
    let mut stack = ProtectedStack::<u32, P>::new();
    for value in [10, 20, 30] {
        stack.as_mut().push(value);
    }
    let top = ptr::from_ref(stack.top()).cast::<u8>().cast_mut();
    // SAFETY: deliberately corrupts one element byte in place.
    unsafe { *top ^= 0x80 };
    let _ = stack.len();
    mem::forget(stack);
}

fn empty_top<P: Paranoia>() {
    let stack = ProtectedStack::<u8, P>::new();
    let _ = stack.top();
}

fn empty_pop<P: Paranoia>() -> String {
    let mut stack = ProtectedStack::<u8, P>::new();
    let popped_empty = stack.as_mut().pop();
    stack.as_mut().push(1);
    stack.as_mut().push(2);
    let top = *stack.top();
    let popped = stack.as_mut().pop();
    format!(
        "pop on empty returned {popped_empty}; after pushing 1, 2 the top was {top}, pop returned {popped}, {} left",
        stack.len()
    )
}

/// Peer configured to ignore every `set` after the construction seeding
/// (`size` and `capacity`, each a length line plus one line per byte).
fn tamper_shadowed() -> Result<(), ScenarioError> {
    let seeding = 2 * (1 + mem::size_of::<usize>());
    let endpoint = VerifierEndpoint::Process {
        program: default_verifier_program(),
        args: vec!["--drop-sets-after".to_string(), seeding.to_string()],
    };
    if !install_verifier(endpoint) {
        return Err(ScenarioError::EndpointTaken(Scenario::TamperShadowed.name()));
    }
    let mut stack = ProtectedStack::<u32, Shadowed>::new();
    stack.as_mut().push(1);
    mem::forget(stack);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for scenario in Scenario::ALL {
            assert_eq!(Scenario::from_name(scenario.name()), Some(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!(Scenario::from_name("nope"), None);
    }

    #[test]
    fn shadowed_fatal_scenarios_expect_group_kill() {
        let at_page = Scenario::ClobberHeader.expectation(ParanoiaLevel::PageChecked);
        assert_eq!(at_page.termination, Termination::Exit1);
        let at_shadow = Scenario::ClobberHeader.expectation(ParanoiaLevel::Shadowed);
        assert_eq!(at_shadow.termination, Termination::Killed);
        let rebuild = Scenario::ReconstructLive.expectation(ParanoiaLevel::Shadowed);
        assert_eq!(rebuild.termination, Termination::Exit1);
        assert!(rebuild.construction);
    }

    #[test]
    fn level_gate() {
        let err = run_in_process(Scenario::TamperShadowed, ParanoiaLevel::PageChecked)
            .expect_err("below shadowed");
        assert!(matches!(err, ScenarioError::LevelTooLow { .. }));
        assert!(run_in_process(Scenario::ClobberHeader, ParanoiaLevel::Unguarded).is_err());
    }

    #[test]
    fn empty_pop_completes() {
        let summary = run_in_process(Scenario::EmptyPop, ParanoiaLevel::PageChecked).unwrap();
        assert!(summary.starts_with("pop on empty returned false"));
        assert!(summary.ends_with("1 left"));
    }
}
