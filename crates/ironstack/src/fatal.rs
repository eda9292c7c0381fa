//! Abort path taken when a container fails a check it cannot recover from.

use std::any::type_name;
use std::io::Write;
use std::panic::Location;

use ironstack_membrane::shadow::kill_process_group;
use ironstack_membrane::{ByteRepr, Paranoia, StackMetrics, diag, global_metrics, global_registry};

use crate::stack::ProtectedStack;
use crate::violation::Violation;

/// Report `reason`, dump `stack`, poison every cross-check and terminate.
///
/// Termination kills the whole process group when a shadow peer runs as a
/// separate process (its exit handshake can no longer be trusted), and exits
/// with status 1 otherwise.
#[cold]
pub(crate) fn everything_is_bad<T: ByteRepr, P: Paranoia>(
    stack: &ProtectedStack<T, P>,
    operation: &str,
    location: &Location<'_>,
    reason: Violation,
) -> ! {
    StackMetrics::inc(&global_metrics().fatal_aborts);
    let mut sink = diag::dump_sink(P::LEVEL);
    let _ = writeln!(
        sink,
        "Error in {}::{operation} ({}:{}), validator message: {reason}",
        type_name::<ProtectedStack<T, P>>(),
        location.file(),
        location.line()
    );
    let _ = stack.dump(&mut *sink);

    let mut process_peer = false;
    if let Some(shadow) = &stack.shadow {
        shadow.damage();
        process_peer |= shadow.is_out_of_process();
    }
    // Never block here: the failing check may have left the lock held.
    if let Some(mut registry) = global_registry().try_lock() {
        registry.damage();
        process_peer |= registry.has_process_shadow();
    }

    if process_peer {
        let _ = writeln!(sink, "Exiting...");
        let _ = sink.flush();
        kill_process_group();
    }
    diag::exit(&mut *sink)
}
