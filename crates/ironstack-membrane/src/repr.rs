//! Fixed-width byte representation for hashed and mirrored values.
//!
//! Integrity hashes, canaries and the shadow peer never look at a value's
//! in-memory layout directly. They consume the bytes a type writes through
//! [`ByteRepr`], so padding and niche bytes never leak into a checksum.

/// Destination for a value's byte representation.
pub trait ByteSink {
    fn put(&mut self, bytes: &[u8]);
}

impl ByteSink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// A value with a well-defined, fixed-size byte representation.
///
/// Every value of a given type must write the same number of bytes.
pub trait ByteRepr {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S);

    /// Collect the representation into a fresh vector.
    fn repr_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_repr(&mut out);
        out
    }
}

macro_rules! native_repr {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ByteRepr for $ty {
                #[inline]
                fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
                    sink.put(&self.to_ne_bytes());
                }
            }
        )*
    };
}

native_repr!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl ByteRepr for bool {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
        sink.put(&[u8::from(*self)]);
    }
}

impl ByteRepr for char {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
        sink.put(&u32::from(*self).to_ne_bytes());
    }
}

impl ByteRepr for () {
    fn write_repr<S: ByteSink + ?Sized>(&self, _sink: &mut S) {}
}

impl<V: ByteRepr, const N: usize> ByteRepr for [V; N] {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
        for item in self {
            item.write_repr(sink);
        }
    }
}

impl<A: ByteRepr, B: ByteRepr> ByteRepr for (A, B) {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
        self.0.write_repr(sink);
        self.1.write_repr(sink);
    }
}

impl<A: ByteRepr, B: ByteRepr, C: ByteRepr> ByteRepr for (A, B, C) {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
        self.0.write_repr(sink);
        self.1.write_repr(sink);
        self.2.write_repr(sink);
    }
}
