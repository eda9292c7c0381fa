//! Diagnostic sink for dumps and fatal-error headers.
//!
//! Standard error by default. When standard error has been closed and the
//! verification depth asks for it, output goes to the dump log file instead.

use std::fs::OpenOptions;
use std::io::{self, Write};

use crate::config::{ParanoiaLevel, dump_log_path};

/// Writer receiving human-readable diagnostics.
#[must_use]
pub fn dump_sink(level: ParanoiaLevel) -> Box<dyn Write> {
    if level.self_pointer_checks() && !stderr_is_open() {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dump_log_path());
        if let Ok(file) = file {
            return Box::new(file);
        }
    }
    Box::new(io::stderr())
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn stderr_is_open() -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table.
    unsafe { libc::fcntl(libc::STDERR_FILENO, libc::F_GETFD) != -1 }
}

#[cfg(not(unix))]
fn stderr_is_open() -> bool {
    true
}

/// Write `Exiting...` and end the process with status 1.
pub fn exit(sink: &mut dyn Write) -> ! {
    let _ = writeln!(sink, "Exiting...");
    let _ = sink.flush();
    std::process::exit(1)
}

/// Report a failure that happens before any protected object exists.
pub fn fatal_exit(message: &str) -> ! {
    let mut sink = dump_sink(ParanoiaLevel::SelfChecked);
    let _ = writeln!(sink, "IronStack construction ERROR: {message}");
    exit(&mut *sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_process_has_stderr() {
        assert!(stderr_is_open());
    }

    #[test]
    fn sink_is_writable() {
        let mut sink = dump_sink(ParanoiaLevel::Guarded);
        assert!(sink.flush().is_ok());
    }
}
