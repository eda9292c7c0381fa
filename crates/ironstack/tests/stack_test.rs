//! Public-API behaviour of the protected stack across verification depths.

use std::pin::Pin;

use ironstack::{
    ByteRepr, ByteSink, Guarded, MIN_CAPACITY, PageChecked, Paranoia, ProtectedStack,
    SelfChecked, Shadowed, Unguarded, Violation,
};
use ironstack_membrane::config::{VerifierEndpoint, install_verifier};
use ironstack_membrane::global_metrics;

fn setup() {
    install_verifier(VerifierEndpoint::Loopback);
}

fn lifo_roundtrip<P: Paranoia>() {
    let mut stack = ProtectedStack::<(u32, i8), P>::new();
    for i in 0..50u32 {
        stack.as_mut().push((i, -(i as i8)));
    }
    assert_eq!(stack.len(), 50);
    assert_eq!(stack.capacity(), 64);
    for i in (0..50u32).rev() {
        assert_eq!(*stack.top(), (i, -(i as i8)));
        assert!(stack.as_mut().pop());
    }
    assert!(stack.is_empty());
    assert!(!stack.as_mut().pop());
    assert_eq!(stack.capacity(), MIN_CAPACITY);
    assert_eq!(stack.validate(), Ok(()));
}

#[test]
fn lifo_at_every_level() {
    setup();
    lifo_roundtrip::<Unguarded>();
    lifo_roundtrip::<Guarded>();
    lifo_roundtrip::<SelfChecked>();
    lifo_roundtrip::<PageChecked>();
    lifo_roundtrip::<Shadowed>();
}

#[test]
fn level_is_part_of_the_type() {
    assert_eq!(ProtectedStack::<u8, Unguarded>::LEVEL.as_u8(), 0);
    assert_eq!(ProtectedStack::<u8, Shadowed>::LEVEL.as_u8(), 4);
    assert_eq!(
        ProtectedStack::<u8>::LEVEL,
        ironstack_membrane::config::build_level()
    );
}

#[derive(Debug, Clone, PartialEq)]
struct Reading {
    sensor: u16,
    value: f64,
}

impl ByteRepr for Reading {
    fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
        self.sensor.write_repr(sink);
        self.value.write_repr(sink);
    }
}

#[test]
fn user_types_with_padding() {
    setup();
    let mut stack = ProtectedStack::<Reading, Shadowed>::new();
    for sensor in 0..20 {
        stack.as_mut().push(Reading {
            sensor,
            value: f64::from(sensor) * 0.5,
        });
    }
    assert_eq!(stack.top().sensor, 19);
    assert_eq!(stack.validate(), Ok(()));
}

#[test]
fn heap_owning_elements() {
    setup();
    #[derive(Debug)]
    struct Label(String);
    impl ByteRepr for Label {
        fn write_repr<S: ByteSink + ?Sized>(&self, sink: &mut S) {
            // Fixed width: a hash of the text.
            ironstack_membrane::Murmur3::new(0)
                .append(self.0.as_bytes())
                .finish()
                .write_repr(sink);
        }
    }

    let mut stack = ProtectedStack::<Label, PageChecked>::new();
    for i in 0..33 {
        stack.as_mut().push(Label(format!("item-{i}")));
    }
    assert_eq!(stack.top().0, "item-32");
    for _ in 0..20 {
        stack.as_mut().pop();
    }
    assert_eq!(stack.top().0, "item-12");
}

#[test]
fn many_live_instances() {
    setup();
    let mut stacks: Vec<Pin<Box<ProtectedStack<u8, Guarded>>>> =
        (0..8).map(|_| ProtectedStack::new()).collect();
    for (i, stack) in stacks.iter_mut().enumerate() {
        stack.as_mut().push(i as u8);
    }
    for (i, stack) in stacks.iter().enumerate() {
        assert_eq!(*stack.top(), i as u8);
        assert_eq!(stack.validate(), Ok(()));
    }
}

#[test]
#[allow(invalid_reference_casting)]
fn corruption_is_reported_without_aborting() {
    setup();
    let mut stack = ProtectedStack::<u64, Guarded>::new();
    stack.as_mut().push(41);
    let failures_before = global_metrics().snapshot().validation_failures;

    // Flip one byte of the element slot through a raw pointer.
    let top = std::ptr::from_ref(stack.top()).cast::<u8>().cast_mut();
    unsafe { *top ^= 0x03 };
    assert_eq!(stack.validate(), Err(Violation::BadBufferHash));
    unsafe { *top ^= 0x03 };

    assert_eq!(stack.validate(), Ok(()));
    assert!(global_metrics().snapshot().validation_failures > failures_before);
}

#[test]
fn dump_reports_state() {
    setup();
    let mut stack = ProtectedStack::<u32, SelfChecked>::new();
    stack.as_mut().push(0xCAFE_F00D);
    let mut out = Vec::new();
    stack.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("(Validator: + OK)"));
    assert!(text.contains("0xCAFEF00D"));
    assert!(text.contains("expected canary"));
}
