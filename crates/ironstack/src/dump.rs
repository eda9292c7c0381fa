//! Human-readable state dump.
//!
//! ```text
//! IronStack [0x5581d2a0] (Validator: + OK) {
//!     expected canary: {
//!         0x8BADF00D, ...
//!     },
//!     header_canary: {...} DAMAGED_CANARY,
//!     ...
//! }
//! ```
//!
//! Arrays print one `0x`-prefixed value per element, most significant byte
//! first, and wrap once a line passes 100 characters.

use std::io::{self, Write};

use ironstack_membrane::{
    ByteRepr, CANARY_SIZE, Canary, PageRights, Paranoia, StackMetrics, global_metrics,
    is_valid_pointer,
};

use crate::buffer::{self, BufferLayout};
use crate::stack::ProtectedStack;
use crate::violation::Violation;

const MAX_LINE: usize = 100;

impl<T: ByteRepr, P: Paranoia> ProtectedStack<T, P> {
    /// Write the validation verdict and every field to `out`.
    ///
    /// Validates first; when the instance address fails the pointer check
    /// only the header line is written. The buffer region is printed as
    /// `<untrusted>` when `size`, `capacity` or `buffer` cannot be relied on
    /// (self pointer or self hash failed, or `size > capacity`), and as
    /// `<unreadable>` when the allocation fails the pointer check.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        let level = P::LEVEL;
        let verdict = self.validate();
        let (sign, reason) = match verdict {
            Ok(()) => ('+', "OK".to_string()),
            Err(violation) => ('-', violation.to_string()),
        };
        write!(
            out,
            "IronStack [{:#x}] (Validator: {sign} {reason}) {{",
            self.address()
        )?;
        if !is_valid_pointer(self.address(), PageRights::READ, level) {
            return writeln!(out, "\n}}");
        }

        let guarded = level.guards_enabled();
        let expected = Canary::for_address(self.address());
        if guarded {
            write!(out, "\n\texpected canary: ")?;
            dump_words(out, &expected, 1)?;
            write!(out, ",\n\theader_canary: ")?;
            dump_words(out, &self.header_canary, 1)?;
            mark_canary(out, &self.header_canary, &expected)?;
        }

        write!(out, ",\n\tsize: {}", self.size)?;
        write!(out, ",\n\tcapacity: {}", self.capacity)?;
        write!(out, ",\n\tbuffer: ({:p}) ", self.buffer.as_ptr())?;

        let base = buffer::base_address(self.buffer);
        let trusted = control_fields_trusted(verdict) && self.size <= self.capacity;
        let readable = trusted && self.buffer_readable(base);
        let buffer_canary = Canary::for_address(base);
        if guarded && readable {
            // SAFETY: `buffer` and `capacity` are trusted and both ends of
            // the allocation passed the pointer check.
            let header = unsafe { buffer::read_header(self.buffer) };
            write!(out, "\n\t\tbuffer_header: ")?;
            dump_words(out, &header, 2)?;
            mark_canary(out, &header, &buffer_canary)?;
        }

        if readable {
            let live = self.live_elements();
            write!(out, ",\n\t\tbuffer elements (live): ")?;
            dump_array(out, live.iter().map(ByteRepr::repr_bytes), 2)?;

            // SAFETY: slots past the live ones hold poison.
            let dead = unsafe { buffer::dead_bytes(self.buffer, live.len(), self.capacity) };
            let slot = std::mem::size_of::<T>().max(1);
            write!(out, ",\n\t\tbuffer elements (dead): ")?;
            dump_array(out, dead.chunks(slot).map(<[u8]>::to_vec), 2)?;
        } else if trusted {
            write!(out, "\n\t\t<unreadable>")?;
        } else {
            write!(out, "\n\t\t<untrusted>")?;
        }

        if guarded && readable {
            // SAFETY: as for the header.
            let footer = unsafe { buffer::read_footer(self.buffer, self.capacity) };
            write!(out, ",\n\t\tbuffer_footer: ")?;
            dump_words(out, &footer, 2)?;
            mark_canary(out, &footer, &buffer_canary)?;
        }

        if guarded {
            write!(out, ",\n\tshadow: ")?;
            match &self.shadow {
                Some(shadow) => dump_array(out, shadow.identity_bytes().map(|b| vec![b]), 1)?,
                None => dump_array(out, std::iter::empty(), 1)?,
            }
            write!(out, ",\n\thash: {:#X}", self.self_hash)?;
            write!(out, ",\n\tbuffer_hash: {:#X}", self.buffer_hash)?;
            write!(out, ",\n\tfooter_canary: ")?;
            dump_words(out, &self.footer_canary, 1)?;
            mark_canary(out, &self.footer_canary, &expected)?;
        }
        writeln!(out, "\n}}")
    }

    /// Both ends of the allocation `capacity` describes pass the pointer
    /// check.
    fn buffer_readable(&self, base: usize) -> bool {
        let level = P::LEVEL;
        let Some(geometry) = BufferLayout::for_capacity::<T>(self.capacity) else {
            return false;
        };
        let Some(last) = base.checked_add(geometry.footer + CANARY_SIZE - 1) else {
            return false;
        };
        is_valid_pointer(base, PageRights::READ, level)
            && is_valid_pointer(last, PageRights::READ, level)
    }
}

/// `size`, `capacity` and `buffer` are only followed when the self hash
/// vouches for them.
fn control_fields_trusted(verdict: Result<(), Violation>) -> bool {
    !matches!(
        verdict,
        Err(Violation::BadSelfPointer | Violation::BadSelfHash | Violation::BadSize)
    )
}

fn mark_canary(out: &mut dyn Write, found: &Canary, expected: &Canary) -> io::Result<()> {
    if found != expected {
        StackMetrics::inc(&global_metrics().canary_failures);
        write!(out, " DAMAGED_CANARY")?;
    }
    Ok(())
}

fn dump_words(out: &mut dyn Write, canary: &Canary, indent: usize) -> io::Result<()> {
    dump_array(
        out,
        canary.words().iter().map(|w| w.to_ne_bytes().to_vec()),
        indent,
    )
}

fn dump_array<I>(out: &mut dyn Write, items: I, indent: usize) -> io::Result<()>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    out.write_all(b"{")?;
    let mut written = MAX_LINE;
    for item in items {
        if written >= MAX_LINE {
            written = 0;
            new_line(out, indent + 1)?;
        }
        written += dump_object(out, &item)?;
        out.write_all(b", ")?;
        written += 2;
    }
    new_line(out, indent)?;
    out.write_all(b"}")
}

/// `0x` followed by `bytes` from last to first.
fn dump_object(out: &mut dyn Write, bytes: &[u8]) -> io::Result<usize> {
    out.write_all(b"0x")?;
    for byte in bytes.iter().rev() {
        write!(out, "{byte:02X}")?;
    }
    Ok(2 + 2 * bytes.len())
}

fn new_line(out: &mut dyn Write, indent: usize) -> io::Result<()> {
    out.write_all(b"\n")?;
    for _ in 0..indent {
        out.write_all(b"\t")?;
    }
    Ok(())
}
