//! Transports carrying the shadow line protocol.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use super::ShadowError;
use super::peer::{HANDSHAKE, PeerReply, ShadowPeer};

/// A synchronous, line-oriented duplex channel to a shadow peer.
///
/// Writes may be buffered; [`ShadowLink::flush`] must be called before
/// blocking on [`ShadowLink::recv`].
pub trait ShadowLink: Send {
    fn send(&mut self, line: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Next reply line, without its terminator.
    fn recv(&mut self) -> io::Result<String>;

    /// OS process id of the peer, if it is a separate process.
    fn peer_pid(&self) -> Option<u32>;

    /// Send `exit` and release the transport.
    fn close(&mut self);
}

/// Peer running as a child process over piped stdin/stdout.
pub struct ProcessLink {
    child: Child,
    writer: Option<BufWriter<ChildStdin>>,
    reader: BufReader<ChildStdout>,
}

impl ProcessLink {
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self, ShadowError> {
        let spawn_error = |source: io::Error| ShadowError::Spawn {
            program: program.display().to_string(),
            source,
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(io::Error::other("peer pipes unavailable")));
        };
        Ok(Self {
            child,
            writer: Some(BufWriter::new(stdin)),
            reader: BufReader::new(stdout),
        })
    }
}

impl ShadowLink for ProcessLink {
    fn send(&mut self, line: &str) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        writeln!(writer, "{line}")
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn recv(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(line.trim().to_string())
    }

    fn peer_pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writeln!(writer, "exit");
            let _ = writer.flush();
        }
        terminate_child(self.child.id());
        let _ = self.child.wait();
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn terminate_child(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; pid names our own child.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_child(_pid: u32) {}

/// Peer served inside the calling process.
///
/// Offers the same protocol without a second process; the mirror then shares
/// the fate of the memory it is meant to cross-check, so it suits tests and
/// benchmarks rather than deployment.
#[derive(Debug, Default)]
pub struct LoopbackLink {
    peer: ShadowPeer,
    replies: VecDeque<String>,
    handshake_done: bool,
    closed: bool,
}

impl LoopbackLink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peer: ShadowPeer::new(),
            replies: VecDeque::from([HANDSHAKE.to_string()]),
            handshake_done: false,
            closed: false,
        }
    }

    /// Direct access to the mirrored state.
    #[must_use]
    pub fn peer(&self) -> &ShadowPeer {
        &self.peer
    }
}

impl ShadowLink for LoopbackLink {
    fn send(&mut self, line: &str) -> io::Result<()> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if !self.handshake_done {
            self.handshake_done = true;
            self.closed = line.trim() != HANDSHAKE;
            return Ok(());
        }
        match self.peer.handle(line) {
            PeerReply::Silent => {}
            PeerReply::Line(reply) => self.replies.push_back(reply),
            PeerReply::Exit => self.closed = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn recv(&mut self) -> io::Result<String> {
        self.replies
            .pop_front()
            .ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
    }

    fn peer_pid(&self) -> Option<u32> {
        None
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.send("exit");
        }
        self.closed = true;
    }
}
