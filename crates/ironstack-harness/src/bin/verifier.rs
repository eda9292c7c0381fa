//! Out-of-process shadow peer for IronStack.
//!
//! Speaks the line protocol of `ironstack_membrane::shadow` over
//! stdin/stdout until the client sends `exit` or closes the pipe.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use ironstack_membrane::shadow::{PeerSession, ShadowPeer};

#[derive(Debug, Parser)]
#[command(name = "ironstack-verifier")]
#[command(about = "Shadow peer that mirrors protected-container state")]
struct Cli {
    /// Apply only this many `set` commands and silently drop the rest.
    /// Simulates a peer that loses updates; used by corruption scenarios.
    #[arg(long)]
    drop_sets_after: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut budget = cli.drop_sets_after;
    let mut peer = ShadowPeer::new();

    let stdin = io::stdin();
    let stdout = io::stdout();
    let session = peer.serve_filtered(stdin.lock(), stdout.lock(), |line| {
        if !line.starts_with("set ") {
            return true;
        }
        match budget.as_mut() {
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
            None => true,
        }
    });

    match session {
        Ok(PeerSession::Exited | PeerSession::Disconnected) => ExitCode::SUCCESS,
        Ok(PeerSession::HandshakeRejected) => {
            eprintln!("ironstack-verifier: handshake rejected");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("ironstack-verifier: {err}");
            ExitCode::FAILURE
        }
    }
}
