// This module records a fragment's translation table from its instruction list in one
// pass. It tracks whether the current run is contiguous (source address advances with each
// instruction) or identical (source address stays put) and opens a new change point
// whenever the next translation breaks the current stride. Because the stride of a run is
// only known after its second instruction, a one-instruction run can be reclassified in
// place when its successor shows the other stride fits. A change in the our-mangling bit,
// or between inserted and rewritten application instructions inside a region, always
// starts a new run so the recreator knows which instructions it must track and how.
// Working entries live in a bumpalo arena and are copied into an exactly-sized table.

//! Translation table recording.

use super::table::{TranslationEntry, TranslationTable};
use crate::core::error::{XlateError, XlateResult};
use crate::core::fragment::Fragment;
use crate::core::instr::InstrList;
use bumpalo::{collections::Vec as BumpVec, Bump};
use log::{debug, trace};

/// A typical block needs one run for its body and one for the trailing jump.
const INITIAL_ENTRIES: usize = 2;

/// Record the translation table for `fragment` from `list`, which must be
/// the instruction list the fragment's body was encoded from, in order.
pub fn record_translation(fragment: &Fragment, list: &InstrList) -> XlateResult<TranslationTable> {
    debug!(
        "record_translation: F{}({:#x}).{:#x}",
        fragment.id, fragment.tag, fragment.start_pc
    );

    let arena = Bump::new();
    let mut entries: BumpVec<'_, TranslationEntry> =
        BumpVec::with_capacity_in(INITIAL_ENTRIES, &arena);

    let start = fragment.start_pc;
    let mut cpc = fragment.entry_pc();
    let mut last_len = 0u64;
    let mut last_translation: Option<u64> = None;
    let mut last_contig;

    if fragment.has_prefix() {
        push_entry(&mut entries, TranslationEntry::new(0, Some(fragment.tag), true, true));
        last_translation = Some(fragment.tag);
        last_contig = false;
    } else {
        // first entry is created on the first instruction
        last_contig = true;
    }

    for instr in list.iter().filter(|i| !i.is_label()) {
        let app = instr.translation();
        let ours = instr.is_our_mangling();
        let mangled_app = ours && instr.is_app();
        let entry = |offset, identical| {
            TranslationEntry::new(offset, app, identical, ours).with_mangled_app(mangled_app)
        };
        let prev_count = entries.len();
        let offset = cache_offset(start, cpc)?;
        // offset of the previous instruction
        let prev_offset = cpc - last_len - start;
        let follows_last = match (app, last_translation) {
            (Some(app), Some(last)) => last.checked_add(last_len) == Some(app),
            _ => false,
        };

        if last_contig {
            if (entries.is_empty() && (app.is_none() || ours)) || app == last_translation {
                // "x x+1 y y": a one-instruction contiguous run becomes identical
                match entries.last_mut() {
                    Some(prev) if u64::from(prev.cache_offset) == prev_offset => {
                        debug_assert!(!prev.identical);
                        prev.identical = true;
                        trace!("\tchanging {} to identical", entries.len() - 1);
                    }
                    _ => push_entry(&mut entries, entry(offset, true)),
                }
                last_contig = false;
            } else if (entries.is_empty() && app.is_some() && !ours) || !follows_last {
                push_entry(&mut entries, entry(offset, false));
                last_contig = true;
            }
        } else if app != last_translation {
            debug_assert!(!entries.is_empty());
            // "x x+1 x+1 x+2": a one-instruction identical run becomes contiguous
            match entries.last_mut() {
                Some(prev) if follows_last && u64::from(prev.cache_offset) == prev_offset => {
                    debug_assert!(prev.identical);
                    prev.identical = false;
                    trace!("\tchanging {} to contig", entries.len() - 1);
                }
                _ => push_entry(&mut entries, entry(offset, false)),
            }
            last_contig = true;
        }
        last_translation = app;

        if entries.len() == prev_count
            && entries
                .last()
                .is_some_and(|e| (e.our_mangling, e.mangled_app) != (ours, mangled_app))
        {
            // our mangling runs are usually identical
            let identical = ours;
            push_entry(&mut entries, entry(offset, identical));
            last_contig = !identical;
        }

        last_len = u64::from(instr.len());
        cpc += last_len;
    }

    Ok(TranslationTable::new(entries.iter().copied().collect()))
}

fn cache_offset(start: u64, cpc: u64) -> XlateResult<u16> {
    let size = cpc - start;
    u16::try_from(size).map_err(|_| XlateError::FragmentTooLarge { size })
}

fn push_entry(entries: &mut BumpVec<'_, TranslationEntry>, entry: TranslationEntry) {
    trace!(
        "\tset_translation: {} +{:5} => {:#x} {}{}{}",
        entries.len(),
        entry.cache_offset,
        entry.app.unwrap_or(0),
        if entry.identical { "identical" } else { "contiguous" },
        if entry.our_mangling { " ours" } else { "" },
        if entry.mangled_app { " app" } else { "" }
    );
    entries.push(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instr::{Instr, InstrOrigin};
    use crate::x64::decode::decode_one;

    const NOP: &[u8] = &[0x90];

    /// Decode `bytes` at consecutive cache addresses from `start`.
    fn list_at(start: u64, items: &[(&[u8], Option<u64>, InstrOrigin)]) -> InstrList {
        let mut pc = start;
        let mut list = InstrList::new();
        for (bytes, xl8, origin) in items {
            let (instr, next) = decode_one(bytes, pc).unwrap();
            list.push(instr.with_translation(*xl8).with_origin(*origin));
            pc = next;
        }
        list
    }

    #[test]
    fn test_straight_line_is_one_entry() {
        let frag = Fragment::new(1, 0x1000, 0x8000, 3);
        let list = list_at(
            0x8000,
            &[
                (NOP, Some(0x1000), InstrOrigin::App),
                (NOP, Some(0x1001), InstrOrigin::App),
                (NOP, Some(0x1002), InstrOrigin::App),
            ],
        );
        let table = record_translation(&frag, &list).unwrap();
        assert_eq!(table.entries(), &[TranslationEntry::new(0, Some(0x1000), false, false)]);
    }

    #[test]
    fn test_prefix_entry_and_labels() {
        let frag = Fragment::new(1, 0x1000, 0x8000, 5).with_prefix(3);
        let mut list = InstrList::new();
        list.push(Instr::label());
        for (i, instr) in list_at(
            0x8003,
            &[(NOP, Some(0x1000), InstrOrigin::App), (NOP, Some(0x1001), InstrOrigin::App)],
        )
        .iter()
        .enumerate()
        {
            list.push(*instr);
            if i == 0 {
                list.push(Instr::label());
            }
        }
        let table = record_translation(&frag, &list).unwrap();
        assert_eq!(
            table.entries(),
            &[
                TranslationEntry::new(0, Some(0x1000), true, true),
                TranslationEntry::new(3, Some(0x1000), false, false),
            ]
        );
    }

    #[test]
    fn test_contig_then_identical_merges() {
        // x x+1 y y
        let frag = Fragment::new(1, 0x1000, 0x8000, 4);
        let list = list_at(
            0x8000,
            &[
                (NOP, Some(0x1000), InstrOrigin::App),
                (NOP, Some(0x1001), InstrOrigin::App),
                (NOP, Some(0x2000), InstrOrigin::App),
                (NOP, Some(0x2000), InstrOrigin::App),
            ],
        );
        let table = record_translation(&frag, &list).unwrap();
        assert_eq!(
            table.entries(),
            &[
                TranslationEntry::new(0, Some(0x1000), false, false),
                TranslationEntry::new(2, Some(0x2000), true, false),
            ]
        );
    }

    #[test]
    fn test_identical_then_contig_merges() {
        // x x+1 x+1 x+2 x+3
        let frag = Fragment::new(1, 0x1000, 0x8000, 5);
        let list = list_at(
            0x8000,
            &[
                (NOP, Some(0x1000), InstrOrigin::App),
                (NOP, Some(0x1001), InstrOrigin::App),
                (NOP, Some(0x1001), InstrOrigin::App),
                (NOP, Some(0x1002), InstrOrigin::App),
                (NOP, Some(0x1003), InstrOrigin::App),
            ],
        );
        let table = record_translation(&frag, &list).unwrap();
        assert_eq!(
            table.entries(),
            &[
                TranslationEntry::new(0, Some(0x1000), false, false),
                TranslationEntry::new(2, Some(0x1001), false, false),
            ]
        );
    }

    #[test]
    fn test_mangling_flag_change_opens_entry() {
        // app at 0x1000, then two mangling nops for the app instruction at 0x1001
        let frag = Fragment::new(1, 0x1000, 0x8000, 4);
        let list = list_at(
            0x8000,
            &[
                (NOP, Some(0x1000), InstrOrigin::App),
                (NOP, Some(0x1001), InstrOrigin::Mangling),
                (NOP, Some(0x1001), InstrOrigin::Mangling),
                (NOP, Some(0x1001), InstrOrigin::App),
            ],
        );
        let table = record_translation(&frag, &list).unwrap();
        assert_eq!(
            table.entries(),
            &[
                TranslationEntry::new(0, Some(0x1000), false, false),
                TranslationEntry::new(1, Some(0x1001), true, true),
                TranslationEntry::new(3, Some(0x1001), false, false),
            ]
        );
    }

    #[test]
    fn test_mangled_app_gets_its_own_run() {
        // spill, rewritten app instruction, restore, all for the source at 0x1001
        let frag = Fragment::new(1, 0x1000, 0x8000, 5);
        let list = list_at(
            0x8000,
            &[
                (NOP, Some(0x1000), InstrOrigin::App),
                (NOP, Some(0x1001), InstrOrigin::Mangling),
                (NOP, Some(0x1001), InstrOrigin::MangledApp),
                (NOP, Some(0x1001), InstrOrigin::Mangling),
                (NOP, Some(0x1003), InstrOrigin::App),
            ],
        );
        let table = record_translation(&frag, &list).unwrap();
        assert_eq!(
            table.entries(),
            &[
                TranslationEntry::new(0, Some(0x1000), false, false),
                TranslationEntry::new(1, Some(0x1001), true, true),
                TranslationEntry::new(2, Some(0x1001), true, true).with_mangled_app(true),
                TranslationEntry::new(3, Some(0x1001), true, true),
                TranslationEntry::new(4, Some(0x1003), false, false),
            ]
        );
    }

    #[test]
    fn test_meta_code_keeps_no_translation() {
        let frag = Fragment::new(1, 0x1000, 0x8000, 4);
        let list = list_at(
            0x8000,
            &[
                (NOP, Some(0x1000), InstrOrigin::App),
                (NOP, None, InstrOrigin::Meta),
                (NOP, None, InstrOrigin::Meta),
                (NOP, Some(0x1001), InstrOrigin::App),
            ],
        );
        let table = record_translation(&frag, &list).unwrap();
        assert_eq!(
            table.entries(),
            &[
                TranslationEntry::new(0, Some(0x1000), false, false),
                TranslationEntry::new(1, None, true, false),
                TranslationEntry::new(3, Some(0x1001), false, false),
            ]
        );
    }

    #[test]
    fn test_oversized_fragment_rejected() {
        // the second body instruction lands past the last expressible offset
        let frag = Fragment::new(1, 0x1000, 0x8000, 0x1_0001).with_prefix(0xffff);
        let list = list_at(
            0x1_7fff,
            &[(NOP, Some(0x1000), InstrOrigin::App), (NOP, Some(0x1001), InstrOrigin::App)],
        );
        assert_eq!(
            record_translation(&frag, &list),
            Err(XlateError::FragmentTooLarge { size: 0x1_0000 })
        );
    }
}
