//! Shadow oracle: an independent mirror of selected named values.
//!
//! A [`ShadowChannel`] sends every update of a watched value to a peer that
//! keeps its own copy, and on request asks the peer to read the copy back
//! byte by byte. Corruption that rewrites both a protected object and its
//! integrity hashes consistently still disagrees with the peer.
//!
//! Wire protocol (one command per line, replies one value per line):
//! `get size <name>`, `get at <i> <name>`, `set size <name> <n>`,
//! `set at <i> <name> <byte>`, `dup <name>`, `pop <name>`, `exit`, preceded by a
//! `ready` handshake in both directions.

pub mod link;
pub mod peer;

use std::cell::{Cell, RefCell};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::config::VerifierEndpoint;
use crate::metrics::{StackMetrics, global_metrics};
use crate::murmur::Murmur3;
use crate::repr::ByteRepr;

pub use link::{LoopbackLink, ProcessLink, ShadowLink};
pub use peer::{HANDSHAKE, PeerReply, PeerSession, ShadowPeer};

/// Seed of the channel's own identity checksum.
const IDENTITY_HASH_SEED: u32 = 0x1234_ABCD;

/// Size of [`ChannelIdentity::to_bytes`].
pub const IDENTITY_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("failed to spawn shadow peer `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("shadow peer is broken: expected handshake `ready`, got `{0}`")]
    Handshake(String),
    #[error("shadow peer io: {0}")]
    Io(#[from] io::Error),
}

/// Identity of one channel: a process-unique serial and the peer pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelIdentity {
    pub serial: u64,
    pub pid: u32,
}

impl ChannelIdentity {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; IDENTITY_SIZE] {
        let mut buf = [0u8; IDENTITY_SIZE];
        buf[0..8].copy_from_slice(&self.serial.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.pid.to_ne_bytes());
        buf
    }

    fn checksum(&self) -> u32 {
        Murmur3::new(IDENTITY_HASH_SEED)
            .append(&self.to_bytes())
            .finish()
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// True if `name` is usable on the wire: non-empty printable ASCII, no spaces.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b > b' ' && b <= b'~')
}

/// Client side of the shadow oracle.
///
/// Once damaged (any mismatch observed), every later check fails and the
/// channel is not closed gracefully: dropping a damaged channel whose peer is
/// a separate process kills the whole process group.
pub struct ShadowChannel {
    link: RefCell<Box<dyn ShadowLink>>,
    identity: ChannelIdentity,
    identity_checksum: u32,
    damaged: Cell<bool>,
}

impl ShadowChannel {
    /// Connect to the peer described by `endpoint`.
    pub fn connect(endpoint: &VerifierEndpoint) -> Result<Self, ShadowError> {
        match endpoint {
            VerifierEndpoint::Process { program, args } => Self::spawn(program, args),
            VerifierEndpoint::Loopback => Self::loopback(),
        }
    }

    /// Start `program` as the peer and complete the handshake.
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self, ShadowError> {
        Self::over(Box::new(ProcessLink::spawn(program, args)?))
    }

    /// In-process peer.
    pub fn loopback() -> Result<Self, ShadowError> {
        Self::over(Box::new(LoopbackLink::new()))
    }

    /// Complete the handshake over an established link.
    pub fn over(mut link: Box<dyn ShadowLink>) -> Result<Self, ShadowError> {
        let greeting = link.recv()?;
        link.send(HANDSHAKE)?;
        link.flush()?;
        if greeting != HANDSHAKE {
            link.close();
            return Err(ShadowError::Handshake(greeting));
        }

        let identity = ChannelIdentity {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            pid: link.peer_pid().unwrap_or(0),
        };
        Ok(Self {
            link: RefCell::new(link),
            identity,
            identity_checksum: identity.checksum(),
            damaged: Cell::new(false),
        })
    }

    #[must_use]
    pub fn identity(&self) -> ChannelIdentity {
        self.identity
    }

    /// Bytes hashed into an owner's integrity checksum.
    #[must_use]
    pub fn identity_bytes(&self) -> [u8; IDENTITY_SIZE] {
        self.identity.to_bytes()
    }

    /// True if the peer runs in a separate process.
    #[must_use]
    pub fn is_out_of_process(&self) -> bool {
        self.identity.pid != 0
    }

    /// Mark the channel permanently untrustworthy.
    pub fn damage(&self) {
        self.damaged.set(true);
    }

    #[must_use]
    pub fn is_damaged(&self) -> bool {
        self.damaged.get() || self.identity.checksum() != self.identity_checksum
    }

    /// Store `bytes` under `name` on the peer.
    pub fn set_binary(&self, name: &str, bytes: &[u8]) {
        if !is_valid_name(name) {
            return;
        }
        let mut link = self.link.borrow_mut();
        let mut sent = link.send(&format!("set size {name} {}", bytes.len()));
        for (i, byte) in bytes.iter().enumerate() {
            sent = sent.and_then(|()| link.send(&format!("set at {i} {name} {byte}")));
        }
        if sent.is_err() {
            self.damage();
        }
    }

    pub fn set_object<V: ByteRepr + ?Sized>(&self, name: &str, value: &V) {
        self.set_binary(name, &value.repr_bytes());
    }

    /// Ask the peer whether `name` still holds exactly `expected`.
    ///
    /// A mismatch, an unreadable reply or an earlier damage all yield false;
    /// a mismatch also damages the channel.
    #[must_use]
    pub fn check_binary(&self, name: &str, expected: &[u8]) -> bool {
        if !is_valid_name(name) || self.is_damaged() {
            return false;
        }
        StackMetrics::inc(&global_metrics().shadow_checks);
        let matches = self.exchange(name, expected).unwrap_or(false);
        if !matches {
            StackMetrics::inc(&global_metrics().shadow_mismatches);
            self.damage();
        }
        matches
    }

    #[must_use]
    pub fn check_object<V: ByteRepr + ?Sized>(&self, name: &str, value: &V) -> bool {
        self.check_binary(name, &value.repr_bytes())
    }

    fn exchange(&self, name: &str, expected: &[u8]) -> io::Result<bool> {
        let mut link = self.link.borrow_mut();
        link.send(&format!("get size {name}"))?;
        link.flush()?;
        let size: usize = parse_reply(&link.recv()?)?;
        if size != expected.len() {
            return Ok(false);
        }
        for (i, want) in expected.iter().enumerate() {
            link.send(&format!("get at {i} {name}"))?;
            link.flush()?;
            let got: u8 = parse_reply(&link.recv()?)?;
            if got != *want {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Push a copy of the peer's current value of `name`.
    pub fn dup(&self, name: &str) {
        self.simple_command("dup", name);
    }

    /// Drop the peer's current value of `name`, exposing the previous one.
    pub fn pop(&self, name: &str) {
        self.simple_command("pop", name);
    }

    fn simple_command(&self, command: &str, name: &str) {
        if !is_valid_name(name) {
            return;
        }
        if self
            .link
            .borrow_mut()
            .send(&format!("{command} {name}"))
            .is_err()
        {
            self.damage();
        }
    }
}

fn parse_reply<N: std::str::FromStr>(reply: &str) -> io::Result<N> {
    reply.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed shadow reply `{reply}`"),
        )
    })
}

impl std::fmt::Debug for ShadowChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowChannel")
            .field("identity", &self.identity)
            .field("damaged", &self.is_damaged())
            .finish_non_exhaustive()
    }
}

impl Drop for ShadowChannel {
    fn drop(&mut self) {
        if self.is_damaged() && self.is_out_of_process() {
            kill_process_group();
        }
        self.link.get_mut().close();
    }
}

/// SIGKILL every process in the caller's process group, the caller included.
///
/// Used once a peer exchange can no longer be trusted to end in a clean
/// handshake.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn kill_process_group() -> ! {
    // SAFETY: kill(2)/wait(2) have no memory-safety preconditions.
    unsafe {
        libc::kill(0, libc::SIGKILL);
        while libc::wait(std::ptr::null_mut()) != -1 {}
    }
    std::process::abort()
}

#[cfg(not(unix))]
pub fn kill_process_group() -> ! {
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ShadowChannel {
        ShadowChannel::loopback().expect("loopback handshake")
    }

    #[test]
    fn name_filter() {
        assert!(is_valid_name("stack_top"));
        assert!(is_valid_name("~!{}"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("two words"));
        assert!(!is_valid_name("tab\there"));
        assert!(!is_valid_name("caf\u{e9}"));
        assert!(!is_valid_name("del\u{7f}"));
    }

    #[test]
    fn set_then_check_roundtrip() {
        let ch = channel();
        ch.set_object("size", &12usize);
        assert!(ch.check_object("size", &12usize));
        assert!(!ch.is_damaged());
    }

    #[test]
    fn mismatch_damages_permanently() {
        let ch = channel();
        ch.set_object("capacity", &16usize);
        assert!(!ch.check_object("capacity", &32usize));
        assert!(ch.is_damaged());
        assert!(!ch.check_object("capacity", &16usize));
    }

    #[test]
    fn size_mismatch_is_reported() {
        let ch = channel();
        ch.set_binary("data", &[1, 2, 3]);
        assert!(!ch.check_binary("data", &[1, 2]));
    }

    #[test]
    fn unknown_name_matches_only_empty() {
        let ch = channel();
        assert!(ch.check_binary("data", &[]));
        assert!(!ch.check_binary("other", &[0]));
    }

    #[test]
    fn invalid_names_are_ignored() {
        let ch = channel();
        ch.set_binary("bad name", &[1]);
        ch.dup("bad name");
        assert!(!ch.check_binary("bad name", &[1]));
        // Rejected by the filter, not by a mismatch.
        assert!(!ch.is_damaged());
    }

    #[test]
    fn dup_pop_tracks_stack_top() {
        let ch = channel();
        ch.dup("stack_top");
        ch.set_object("stack_top", &1i32);
        ch.dup("stack_top");
        ch.set_object("stack_top", &2i32);
        assert!(ch.check_object("stack_top", &2i32));
        ch.pop("stack_top");
        assert!(ch.check_object("stack_top", &1i32));
    }

    #[test]
    fn loopback_is_in_process_with_unique_identity() {
        let a = channel();
        let b = channel();
        assert!(!a.is_out_of_process());
        assert_ne!(a.identity().serial, b.identity().serial);
        assert_eq!(a.identity_bytes().len(), IDENTITY_SIZE);
    }

    #[test]
    fn tampered_identity_counts_as_damage() {
        let mut ch = channel();
        ch.identity.serial ^= 1;
        assert!(ch.is_damaged());
        ch.identity.serial ^= 1;
        assert!(!ch.is_damaged());
    }

    struct RudeLink(LoopbackLink);

    impl ShadowLink for RudeLink {
        fn send(&mut self, line: &str) -> io::Result<()> {
            self.0.send(line)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn recv(&mut self) -> io::Result<String> {
            Ok("error".to_string())
        }
        fn peer_pid(&self) -> Option<u32> {
            None
        }
        fn close(&mut self) {}
    }

    #[test]
    fn broken_peer_fails_handshake() {
        let err = ShadowChannel::over(Box::new(RudeLink(LoopbackLink::new())))
            .expect_err("handshake must fail");
        assert!(matches!(err, ShadowError::Handshake(ref got) if got == "error"));
    }
}
