//! The shadow peer: the process-independent half of the shadow oracle.
//!
//! Holds, per name, a stack of byte arrays. Only the top array of each name is
//! read or written; `dup` and `pop` move the top. Unknown names read as an
//! empty array. Malformed commands are ignored rather than answered, matching
//! the line protocol the client speaks.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

/// Handshake token exchanged in both directions before any command.
pub const HANDSHAKE: &str = "ready";

/// What the peer does in response to one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerReply {
    /// No output.
    Silent,
    /// Write this line back.
    Line(String),
    /// End the session.
    Exit,
}

/// How a served session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSession {
    /// The client never answered the handshake correctly.
    HandshakeRejected,
    /// The client sent `exit`.
    Exited,
    /// The client closed its end.
    Disconnected,
}

/// Named byte-array stacks mirrored on behalf of one client.
#[derive(Debug, Default, Clone)]
pub struct ShadowPeer {
    variables: HashMap<String, Vec<Vec<u8>>>,
}

impl ShadowPeer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current top array stored under `name` (empty when unknown).
    #[must_use]
    pub fn top(&self, name: &str) -> &[u8] {
        self.variables
            .get(name)
            .and_then(|stack| stack.last())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of arrays stacked under `name` (1 for unknown names).
    #[must_use]
    pub fn depth(&self, name: &str) -> usize {
        self.variables.get(name).map_or(1, Vec::len)
    }

    fn stack_mut(&mut self, name: &str) -> &mut Vec<Vec<u8>> {
        self.variables
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new()])
    }

    fn top_mut(&mut self, name: &str) -> &mut Vec<u8> {
        let stack = self.stack_mut(name);
        if stack.is_empty() {
            stack.push(Vec::new());
        }
        let last = stack.len() - 1;
        &mut stack[last]
    }

    /// Apply one command line.
    pub fn handle(&mut self, line: &str) -> PeerReply {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return PeerReply::Silent;
        };
        match command {
            "get" => self.get(args),
            "set" => {
                self.set(args);
                PeerReply::Silent
            }
            "dup" => {
                if let Some(&name) = args.first() {
                    let copy = self.top(name).to_vec();
                    self.stack_mut(name).push(copy);
                }
                PeerReply::Silent
            }
            "pop" => {
                if let Some(&name) = args.first() {
                    let stack = self.stack_mut(name);
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                PeerReply::Silent
            }
            "exit" => PeerReply::Exit,
            _ => PeerReply::Silent,
        }
    }

    fn get(&self, args: &[&str]) -> PeerReply {
        match args {
            ["size", name, ..] => PeerReply::Line(self.top(name).len().to_string()),
            ["at", index, name, ..] => match index.parse::<usize>() {
                Ok(i) => {
                    let byte = self.top(name).get(i).copied().unwrap_or(0);
                    PeerReply::Line(byte.to_string())
                }
                // Negative indices are in range of nothing.
                Err(_) if index.parse::<i64>().is_ok() => PeerReply::Line("0".to_string()),
                Err(_) => PeerReply::Silent,
            },
            _ => PeerReply::Silent,
        }
    }

    fn set(&mut self, args: &[&str]) {
        match args {
            ["size", name, size, ..] => {
                if let Ok(size) = size.parse::<usize>() {
                    self.top_mut(name).resize(size, 0);
                }
            }
            ["at", index, name, value, ..] => {
                let (Ok(i), Ok(value)) = (index.parse::<usize>(), value.parse::<u8>()) else {
                    return;
                };
                if let Some(slot) = self.top_mut(name).get_mut(i) {
                    *slot = value;
                }
            }
            _ => {}
        }
    }

    /// Run the protocol over a reader/writer pair until `exit` or EOF.
    pub fn serve<R: BufRead, W: Write>(&mut self, reader: R, writer: W) -> io::Result<PeerSession> {
        self.serve_filtered(reader, writer, |_| true)
    }

    /// Like [`ShadowPeer::serve`], but command lines for which `accept`
    /// returns false are read and dropped without effect.
    pub fn serve_filtered<R, W, F>(
        &mut self,
        mut reader: R,
        mut writer: W,
        mut accept: F,
    ) -> io::Result<PeerSession>
    where
        R: BufRead,
        W: Write,
        F: FnMut(&str) -> bool,
    {
        writeln!(writer, "{HANDSHAKE}")?;
        writer.flush()?;

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line.trim() != HANDSHAKE {
            return Ok(PeerSession::HandshakeRejected);
        }

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(PeerSession::Disconnected);
            }
            if !accept(line.trim()) {
                continue;
            }
            match self.handle(&line) {
                PeerReply::Silent => {}
                PeerReply::Line(reply) => {
                    writeln!(writer, "{reply}")?;
                    writer.flush()?;
                }
                PeerReply::Exit => return Ok(PeerSession::Exited),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(reply: PeerReply) -> String {
        match reply {
            PeerReply::Line(s) => s,
            other => panic!("expected a line, got {other:?}"),
        }
    }

    #[test]
    fn unknown_names_read_empty() {
        let mut peer = ShadowPeer::new();
        assert_eq!(line(peer.handle("get size nothing")), "0");
        assert_eq!(line(peer.handle("get at 3 nothing")), "0");
        assert_eq!(line(peer.handle("get at -1 nothing")), "0");
    }

    #[test]
    fn set_size_then_bytes() {
        let mut peer = ShadowPeer::new();
        peer.handle("set size size 4");
        peer.handle("set at 0 size 7");
        peer.handle("set at 3 size 255");
        peer.handle("set at 4 size 9");
        assert_eq!(peer.top("size"), &[7, 0, 0, 255]);
        peer.handle("set size size 2");
        assert_eq!(peer.top("size"), &[7, 0]);
        assert_eq!(line(peer.handle("get at 0 size")), "7");
        assert_eq!(line(peer.handle("get size size")), "2");
    }

    #[test]
    fn dup_and_pop_move_the_top() {
        let mut peer = ShadowPeer::new();
        peer.handle("set size stack_top 1");
        peer.handle("set at 0 stack_top 1");
        peer.handle("dup stack_top");
        peer.handle("set at 0 stack_top 2");
        assert_eq!(peer.top("stack_top"), &[2]);
        assert_eq!(peer.depth("stack_top"), 2);
        peer.handle("pop stack_top");
        assert_eq!(peer.top("stack_top"), &[1]);
        peer.handle("pop stack_top");
        assert_eq!(peer.depth("stack_top"), 1);
        assert_eq!(peer.top("stack_top"), &[1]);
    }

    #[test]
    fn malformed_commands_are_ignored() {
        let mut peer = ShadowPeer::new();
        assert_eq!(peer.handle(""), PeerReply::Silent);
        assert_eq!(peer.handle("frobnicate x"), PeerReply::Silent);
        assert_eq!(peer.handle("get"), PeerReply::Silent);
        assert_eq!(peer.handle("get at x name"), PeerReply::Silent);
        assert_eq!(peer.handle("set at 0 name"), PeerReply::Silent);
        assert_eq!(peer.handle("set size name many"), PeerReply::Silent);
        assert_eq!(peer.handle("exit"), PeerReply::Exit);
    }

    #[test]
    fn serve_runs_handshake_and_commands() {
        let input = b"ready\nset size x 1\nset at 0 x 42\nget size x\nget at 0 x\nexit\nget size x\n";
        let mut output = Vec::new();
        let session = ShadowPeer::new()
            .serve(&input[..], &mut output)
            .expect("in-memory io");
        assert_eq!(session, PeerSession::Exited);
        assert_eq!(String::from_utf8(output).unwrap(), "ready\n1\n42\n");
    }

    #[test]
    fn filtered_lines_have_no_effect() {
        let input = b"ready\nset size x 1\nset at 0 x 42\nget at 0 x\nexit\n";
        let mut output = Vec::new();
        let session = ShadowPeer::new()
            .serve_filtered(&input[..], &mut output, |line| !line.starts_with("set at"))
            .expect("in-memory io");
        assert_eq!(session, PeerSession::Exited);
        assert_eq!(String::from_utf8(output).unwrap(), "ready\n0\n");
    }

    #[test]
    fn serve_rejects_bad_handshake() {
        let mut output = Vec::new();
        let session = ShadowPeer::new()
            .serve(&b"hello\nget size x\n"[..], &mut output)
            .expect("in-memory io");
        assert_eq!(session, PeerSession::HandshakeRejected);
        assert_eq!(output, b"ready\n");
    }

    #[test]
    fn serve_ends_on_eof() {
        let mut output = Vec::new();
        let session = ShadowPeer::new()
            .serve(&b"ready\ndup a\n"[..], &mut output)
            .expect("in-memory io");
        assert_eq!(session, PeerSession::Disconnected);
    }
}
