//! Fragment listing file tests, including the xl8dump tool.

use fcache_xl8::core::{Gpr, MachineContext};
use fcache_xl8::frag_listing::{parse_listing, MemoryStore, SimThread};
use fcache_xl8::translate::{Classifier, RecoveryOutcome, StateRecreator};
use std::process::Command;

const TRACE: &str = include_str!("fragments/trace.frag");

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn load() -> (MemoryStore, SimThread) {
    let listing = parse_listing(TRACE).unwrap();
    let thread = SimThread::from_listing(&listing);
    let store = MemoryStore::from_listing(listing).unwrap();
    (store, thread)
}

#[test]
fn test_listing_file_parses() {
    init_logging();
    let listing = parse_listing(TRACE).unwrap();
    assert_eq!(listing.fragments.len(), 2);
    assert_eq!(listing.sources.len(), 1);
    assert_eq!(listing.routines, vec![0x5_0000..0x5_0100]);

    let trace = &listing.fragments[0];
    assert!(trace.fragment.flags.is_trace);
    assert!(trace.record_table);
    assert_eq!(trace.fragment.size, 0x24);
    assert_eq!(trace.fragment.exit_stubs.len(), 1);
    assert_eq!(trace.fragment.exit_stubs[0].cti_pc, 0x1_001c);
    assert_eq!(trace.fragment.exit_stubs[0].stub_pc, 0x1_0021);
    assert_eq!(trace.list.len(), 7);

    let (store, _) = load();
    assert!(store.fragment(1).unwrap().translation_table().is_some());
    assert!(store.in_fcache(0x1_0023));
    assert!(!store.in_fcache(0x1_0024));
}

#[test]
fn test_listing_file_recreates() {
    init_logging();
    let (store, thread) = load();
    let recreator = StateRecreator::new(&store, &store, &store);

    let mut mc = MachineContext::new(0x1_0010).with_reg(Gpr::Rsp, 0x7000);
    assert_eq!(
        recreator.recreate_state(&thread, &mut mc, false, None),
        RecoveryOutcome::FullState
    );
    assert_eq!(mc.pc, 0x40_1003);
    assert_eq!(mc.sp(), 0x7008);
    assert_eq!(mc.reg(Gpr::Rcx), 0x5555);

    assert_eq!(recreator.recreate_pc(&thread, 0x1_0022, None), Some(0x40_1008));
    assert_eq!(recreator.recreate_pc(&thread, 0x1_0103, None), Some(0x40_1008));
    assert_eq!(recreator.recreate_pc(&thread, 0x5_0010, None), Some(0x40_1020));
    assert_eq!(recreator.recreate_pc(&thread, 0x5_0040, None), None);
}

#[test]
fn test_listing_file_verifies() {
    init_logging();
    let (store, thread) = load();
    let recreator = StateRecreator::new(&store, &store, &store);
    for fragment in store.fragments() {
        let list = store.list(fragment.id).unwrap();
        assert!(recreator.verify_fragment(&thread, &fragment, list).is_empty());
    }
}

#[test]
fn test_xl8dump_translates_and_verifies() {
    let listing = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fragments/trace.frag");
    let output = Command::new(env!("CARGO_BIN_EXE_xl8dump"))
        .args([listing, "--pc", "0x10010", "--pc", "0x10103", "--verify", "--tables"])
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}");
    assert!(stdout.contains("0x10010 => 0x401003"), "{stdout}");
    assert!(stdout.contains("0x10103 => 0x401008"), "{stdout}");
    assert!(stdout.contains("translation info (3 entries)"), "{stdout}");
    assert!(stdout.contains("F1: ok"), "{stdout}");
    assert!(stdout.contains("F2: ok"), "{stdout}");

    let output = Command::new(env!("CARGO_BIN_EXE_xl8dump"))
        .args([listing, "--pc", "0x50040", "--full-state"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("0x50040 => failed"));
}
