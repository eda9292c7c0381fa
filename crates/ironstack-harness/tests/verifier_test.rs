//! Integration tests: the `ironstack-verifier` peer binary.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use ironstack_membrane::ShadowChannel;

fn verifier() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_ironstack-verifier"))
}

/// Feed `script` to a fresh verifier and return everything it printed.
fn converse(args: &[&str], script: &str) -> (String, Option<i32>) {
    let mut child = Command::new(verifier())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn verifier");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(script.as_bytes())
        .expect("write script");
    let mut out = String::new();
    child
        .stdout
        .take()
        .expect("stdout")
        .read_to_string(&mut out)
        .expect("read replies");
    let status = child.wait().expect("wait verifier");
    (out, status.code())
}

#[test]
fn answers_reads_after_handshake() {
    let (out, code) = converse(
        &[],
        "ready\nset size x 2\nset at 0 x 7\nset at 9 x 1\nget size x\nget at 0 x\nget at 5 x\nget size nothing\nexit\n",
    );
    assert_eq!(out, "ready\n2\n7\n0\n0\n");
    assert_eq!(code, Some(0));
}

#[test]
fn dup_and_pop_keep_history() {
    let (out, _) = converse(
        &[],
        "ready\nset size t 1\nset at 0 t 5\ndup t\nset at 0 t 6\nget at 0 t\npop t\nget at 0 t\npop t\nget at 0 t\n",
    );
    // The last pop would empty the history and is ignored.
    assert_eq!(out, "ready\n6\n5\n5\n");
}

#[test]
fn bad_handshake_fails() {
    let (out, code) = converse(&[], "hello\nget size x\n");
    assert_eq!(out, "ready\n");
    assert_eq!(code, Some(1));
}

#[test]
fn drop_sets_after_budget() {
    let (out, code) = converse(
        &["--drop-sets-after", "1"],
        "ready\nset size x 3\nset size x 5\nget size x\nexit\n",
    );
    assert_eq!(out, "ready\n3\n");
    assert_eq!(code, Some(0));
}

#[test]
fn channel_round_trip_through_binary() {
    let channel = ShadowChannel::spawn(verifier(), &[]).expect("spawn peer");
    assert!(channel.is_out_of_process());
    channel.set_object("size", &42usize);
    channel.set_object("stack_top", &0xABCDu16);
    assert!(channel.check_object("size", &42usize));
    assert!(channel.check_object("stack_top", &0xABCDu16));

    channel.dup("stack_top");
    channel.set_object("stack_top", &7u16);
    assert!(channel.check_object("stack_top", &7u16));
    channel.pop("stack_top");
    assert!(channel.check_object("stack_top", &0xABCDu16));
    assert!(!channel.is_damaged());
}
