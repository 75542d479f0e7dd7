//! Translation table recording tests.

use fcache_xl8::core::{Gpr, MachineContext, StatsSnapshot, XlateError};
use fcache_xl8::frag_listing::{parse_listing, MemoryStore, SimThread};
use fcache_xl8::translate::{
    record_translation, RecoveryOutcome, StateRecreator, TranslationEntry, TranslationTable,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn load(text: &str) -> (MemoryStore, SimThread) {
    let listing = parse_listing(text).unwrap();
    let thread = SimThread::from_listing(&listing);
    let store = MemoryStore::from_listing(listing).unwrap();
    (store, thread)
}

const PUSH_REGION: &str = "
tls 0x08 = 0x5555
fragment id=1 tag=0x401000 cache=0x10000
  app 0x401000 : 48 01 d8
  ours 0x401003 : 65 48 89 0c 25 08 00 00 00
  ours 0x401003 : 48 c7 c1 44 33 22 11
  ours 0x401003 : 51
  ours 0x401003 : 65 48 8b 0c 25 08 00 00 00
  app 0x401005 : 48 89 c2
  app 0x401008 : c3
end
";

#[test]
fn test_identical_run_collapses() {
    init_logging();
    // one source instruction taking three cache instructions, then the next
    let (store, _) = load(
        "
fragment id=1 tag=0x1000 cache=0x8000
  app 0x1000 : 90
  app 0x1000 : 90
  app 0x1000 : 90
  app 0x1001 : 90
end
",
    );
    let fragment = store.fragment(1).unwrap();
    let table = record_translation(&fragment, store.list(1).unwrap()).unwrap();
    assert_eq!(
        table.entries(),
        &[
            TranslationEntry::new(0, Some(0x1000), true, false),
            TranslationEntry::new(3, Some(0x1001), false, false),
        ]
    );
}

#[test]
fn test_mangling_region_gets_its_own_entry() {
    init_logging();
    let (store, _) = load(PUSH_REGION);
    let fragment = store.fragment(1).unwrap();
    let table = record_translation(&fragment, store.list(1).unwrap()).unwrap();
    assert_eq!(
        table.entries(),
        &[
            TranslationEntry::new(0, Some(0x40_1000), false, false),
            TranslationEntry::new(3, Some(0x40_1003), true, true),
            TranslationEntry::new(0x1d, Some(0x40_1005), false, false),
        ]
    );

    let shown = table.display_at(fragment.start_pc).to_string();
    let lines: Vec<&str> = shown.lines().collect();
    assert_eq!(lines[0], "translation info (3 entries)");
    assert_eq!(lines[2], "\t1 +    3 == 0x10003 => 0x401003 identical ours");
    assert_eq!(lines[3], "\t2 +   29 == 0x1001d => 0x401005 contiguous");
}

#[test]
fn test_meta_instruction_breaks_the_run() {
    init_logging();
    let (store, thread) = load(
        "
fragment id=1 tag=0x1000 cache=0x8000
  app 0x1000 : 90
  meta - : 90
  app 0x1001 : 90
end
",
    );
    let fragment = store.fragment(1).unwrap();
    let table = record_translation(&fragment, store.list(1).unwrap()).unwrap();
    assert_eq!(
        table.entries(),
        &[
            TranslationEntry::new(0, Some(0x1000), false, false),
            TranslationEntry::new(1, None, false, false),
            TranslationEntry::new(2, Some(0x1001), false, false),
        ]
    );

    // a fault on the meta instruction resumes at the next translated entry
    fragment.attach_translation_table(table).unwrap();
    let recreator = StateRecreator::new(&store, &store, &store);
    let mut mc = MachineContext::new(0x8001);
    assert_eq!(
        recreator.recreate_state(&thread, &mut mc, false, None),
        RecoveryOutcome::PcOnly
    );
    assert_eq!(mc.pc, 0x1001);
}

#[test]
fn test_prefix_maps_to_tag() {
    init_logging();
    let (store, thread) = load(
        "
fragment id=1 tag=0x401000 cache=0x10000 table
  prefix : 65 48 8b 0c 25 08 00 00 00
  app 0x401000 : 48 01 d8
  app 0x401003 : 48 89 c2
end
",
    );
    let fragment = store.fragment(1).unwrap();
    assert_eq!(fragment.entry_pc(), 0x1_0009);
    let table = fragment.translation_table().unwrap();
    assert_eq!(
        table.entries(),
        &[
            TranslationEntry::new(0, Some(0x40_1000), true, true),
            TranslationEntry::new(9, Some(0x40_1000), false, false),
        ]
    );

    let recreator = StateRecreator::new(&store, &store, &store);
    for (pc, app) in [(0x1_0009, 0x40_1000), (0x1_000c, 0x40_1003)] {
        let mut mc = MachineContext::new(pc).with_reg(Gpr::Rcx, 7);
        assert_eq!(
            recreator.recreate_state(&thread, &mut mc, false, None),
            RecoveryOutcome::FullState
        );
        assert_eq!(mc.pc, app);
        assert_eq!(mc.reg(Gpr::Rcx), 7);
    }
}

#[test]
fn test_record_translation_info_from_rebuilt_list() {
    init_logging();
    let (mut store, thread) = load(PUSH_REGION);
    let fragment = store.fragment(1).unwrap();

    let table = {
        let recreator = StateRecreator::new(&store, &store, &store);
        let table = recreator.record_translation_info(&fragment, None).unwrap();
        assert_eq!(
            Some(&table),
            record_translation(&fragment, store.list(1).unwrap()).ok().as_ref()
        );
        assert_eq!(recreator.stats().snapshot().translations_computed, 1);
        table
    };
    fragment.attach_translation_table(table).unwrap();

    // once the table is attached the source is no longer needed
    store.set_list(1, None);
    let recreator = StateRecreator::new(&store, &store, &store);
    let mut mc = MachineContext::new(0x1_0014).with_reg(Gpr::Rsp, 0x7000);
    assert_eq!(
        recreator.recreate_state(&thread, &mut mc, false, None),
        RecoveryOutcome::FullState
    );
    assert_eq!(mc.pc, 0x40_1003);
    assert_eq!(mc.sp(), 0x7008);
    assert_eq!(mc.reg(Gpr::Rcx), 0x5555);
    assert_eq!(recreator.stats().snapshot().recreate_via_stored_info, 1);

    assert_eq!(
        recreator.record_translation_info(&fragment, None),
        Err(XlateError::RebuildFailed { tag: 0x40_1000 })
    );
}

#[test]
fn test_table_survives_serialization() {
    init_logging();
    let (store, _) = load(PUSH_REGION);
    let fragment = store.fragment(1).unwrap();
    let table = record_translation(&fragment, store.list(1).unwrap()).unwrap();

    let bytes = table.to_bytes();
    assert_eq!(TranslationTable::from_bytes(&bytes).unwrap(), table);
    assert!(matches!(
        TranslationTable::from_bytes(&bytes[..bytes.len() - 1]),
        Err(XlateError::CorruptTable { .. })
    ));
}

#[test]
fn test_verify_finds_no_mismatch() {
    init_logging();
    let text = format!(
        "{PUSH_REGION}
fragment id=2 tag=0x402000 cache=0x20000
  app 0x402000 : 48 01 d8
  ours 0x402003 : 65 48 89 04 25 10 00 00 00
  ours 0x402003 : 48 8d 64 24 f8
  ours 0x402003 : 48 89 04 24
  ours 0x402003 : 65 48 8b 04 25 10 00 00 00
  app 0x402008 : 48 89 c2
end
"
    );
    let (store, thread) = load(&text);
    let recreator = StateRecreator::new(&store, &store, &store);
    for fragment in store.fragments() {
        let mismatches = recreator.verify_fragment(&thread, &fragment, store.list(fragment.id).unwrap());
        assert!(mismatches.is_empty(), "F{}: {mismatches:?}", fragment.id);
    }
    // verification keeps its own counters
    assert_eq!(recreator.stats().snapshot(), StatsSnapshot::default());
}
