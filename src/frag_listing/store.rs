// This module hosts fragments in memory for the recreator. MemoryStore keeps every loaded
// fragment with the instruction list it was built from, maps their cache bytes and any
// source images into one CodeCache, and answers the recreator's store, classifier and
// decoder questions from that. Fragments can be unlinked (no longer found by lookup but
// still rebuildable by cache pc) and their lists replaced or dropped, which is how tests
// stand in for source that changed or went away. SimThread holds the spill-slot values of
// one interrupted thread.

//! In-memory fragment store and thread state.

use super::Listing;
use crate::core::context::MachineContext;
use crate::core::error::XlateResult;
use crate::core::fragment::Fragment;
use crate::core::instr::{Instr, InstrList};
use crate::translate::adaptor::{Classifier, FragmentStore, Landmark, RebuildTarget, ThreadState};
use crate::translate::recorder::record_translation;
use crate::x64::decode::{CacheDecoder, CodeCache};
use crate::x64::spill::{SpillReg, SpillSlot};
use hashbrown::HashMap;
use log::debug;
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug)]
struct Hosted {
    fragment: Arc<Fragment>,
    list: Option<InstrList>,
    linked: bool,
}

/// Fragments, cache memory and address map of a simulated runtime.
#[derive(Debug, Default)]
pub struct MemoryStore {
    code: CodeCache,
    fragments: HashMap<u32, Hosted>,
    routines: Vec<Range<u64>>,
    landmarks: HashMap<u64, Landmark>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host everything a listing describes, recording tables for the
    /// fragments that ask for one.
    pub fn from_listing(listing: Listing) -> XlateResult<Self> {
        let mut store = Self::new();
        for (base, bytes) in listing.sources {
            store.map_source(base, bytes);
        }
        for range in listing.routines {
            store.add_routine(range);
        }
        for (pc, landmark) in listing.landmarks {
            store.add_landmark(pc, landmark);
        }
        for listed in listing.fragments {
            if listed.record_table {
                let table = record_translation(&listed.fragment, &listed.list)?;
                let attached = listed.fragment.attach_translation_table(table);
                debug_assert!(
                    attached.is_ok(),
                    "freshly parsed F{} already has a table",
                    listed.fragment.id
                );
            }
            store.add_fragment(listed.fragment, listed.cache_bytes, Some(listed.list));
        }
        Ok(store)
    }

    /// Host `fragment` with its cache bytes mapped at its start pc.
    pub fn add_fragment(
        &mut self,
        fragment: Fragment,
        cache_bytes: Vec<u8>,
        list: Option<InstrList>,
    ) -> Arc<Fragment> {
        debug!(
            "hosting F{}({:#x}) at {:#x}..{:#x}",
            fragment.id,
            fragment.tag,
            fragment.start_pc,
            fragment.end_pc()
        );
        self.code.map(fragment.start_pc, cache_bytes);
        let fragment = Arc::new(fragment);
        self.fragments.insert(
            fragment.id,
            Hosted {
                fragment: Arc::clone(&fragment),
                list,
                linked: true,
            },
        );
        fragment
    }

    pub fn map_source(&mut self, base: u64, bytes: Vec<u8>) {
        self.code.map(base, bytes);
    }

    pub fn add_routine(&mut self, range: Range<u64>) {
        self.routines.push(range);
    }

    pub fn add_landmark(&mut self, pc: u64, landmark: Landmark) {
        self.landmarks.insert(pc, landmark);
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code
    }

    pub fn code_cache_mut(&mut self) -> &mut CodeCache {
        &mut self.code
    }

    pub fn fragment(&self, id: u32) -> Option<Arc<Fragment>> {
        self.fragments.get(&id).map(|h| Arc::clone(&h.fragment))
    }

    /// Hosted fragments in id order.
    pub fn fragments(&self) -> Vec<Arc<Fragment>> {
        let mut all: Vec<_> = self.fragments.values().map(|h| Arc::clone(&h.fragment)).collect();
        all.sort_by_key(|f| f.id);
        all
    }

    pub fn list(&self, id: u32) -> Option<&InstrList> {
        self.fragments.get(&id).and_then(|h| h.list.as_ref())
    }

    /// Replace what rebuilding fragment `id` produces; `None` makes it fail.
    pub fn set_list(&mut self, id: u32, list: Option<InstrList>) {
        if let Some(hosted) = self.fragments.get_mut(&id) {
            hosted.list = list;
        }
    }

    /// Hide fragment `id` from lookups; its cache bytes stay mapped.
    pub fn unlink(&mut self, id: u32) {
        if let Some(hosted) = self.fragments.get_mut(&id) {
            hosted.linked = false;
        }
    }

    fn hosted_at(&self, pc: u64) -> impl Iterator<Item = &Hosted> + '_ {
        self.fragments.values().filter(move |h| h.fragment.contains(pc))
    }
}

impl FragmentStore for MemoryStore {
    fn lookup_fragment(&self, tag: u64) -> Option<Arc<Fragment>> {
        self.fragments
            .values()
            .filter(|h| h.linked && h.fragment.tag == tag)
            .max_by_key(|h| (h.fragment.flags.is_trace, std::cmp::Reverse(h.fragment.id)))
            .map(|h| Arc::clone(&h.fragment))
    }

    fn lookup_by_cache_pc(&self, pc: u64) -> Option<Arc<Fragment>> {
        self.hosted_at(pc)
            .find(|h| h.linked)
            .map(|h| Arc::clone(&h.fragment))
    }

    fn rebuild_instruction_list(&self, target: RebuildTarget<'_>) -> Option<(InstrList, Arc<Fragment>)> {
        let hosted = match target {
            RebuildTarget::Fragment(fragment) => self.fragments.get(&fragment.id)?,
            RebuildTarget::CachePc(pc) => self.hosted_at(pc).find(|h| h.list.is_some())?,
        };
        let list = hosted.list.clone()?;
        Some((list, Arc::clone(&hosted.fragment)))
    }

    fn rebuild_selfmod_snapshot_list(&self, fragment: &Fragment) -> Option<InstrList> {
        let copy = fragment.selfmod_copy?;
        let list = self.fragments.get(&fragment.id)?.list.as_ref()?;
        // the snapshot was decoded from the copy, not from the tag
        Some(
            list.iter()
                .map(|instr| {
                    let moved = instr
                        .translation()
                        .map(|app| app.wrapping_sub(fragment.tag).wrapping_add(copy));
                    instr.with_translation(moved)
                })
                .collect(),
        )
    }
}

impl Classifier for MemoryStore {
    fn in_fcache(&self, pc: u64) -> bool {
        self.hosted_at(pc).next().is_some()
    }

    fn in_generated_routine(&self, pc: u64) -> bool {
        self.routines.iter().any(|r| r.contains(&pc))
    }

    fn landmark(&self, pc: u64) -> Option<Landmark> {
        self.landmarks.get(&pc).copied()
    }
}

impl CacheDecoder for MemoryStore {
    fn decode(&self, pc: u64) -> XlateResult<(Instr, u64)> {
        self.code.decode(pc)
    }
}

/// Spill slots and saved context of one interrupted thread.
#[derive(Debug, Clone, Default)]
pub struct SimThread {
    tls: HashMap<u64, u64>,
    mcontext: [u64; SpillReg::COUNT],
    saved: Option<MachineContext>,
    own_fault: bool,
}

impl SimThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_listing(listing: &Listing) -> Self {
        let mut thread = Self::new();
        for &(offset, value) in &listing.tls_slots {
            thread.set_tls(offset, value);
        }
        for &(reg, value) in &listing.mcontext_slots {
            thread.set_mcontext_slot(reg, value);
        }
        thread
    }

    pub fn set_tls(&mut self, offset: u64, value: u64) {
        self.tls.insert(offset, value);
    }

    pub fn set_mcontext_slot(&mut self, reg: SpillReg, value: u64) {
        self.mcontext[reg.index()] = value;
    }

    pub fn with_saved_context(mut self, mc: MachineContext) -> Self {
        self.saved = Some(mc);
        self
    }

    /// Mark recoveries as being for this thread's own fault.
    pub fn with_own_fault(mut self, own_fault: bool) -> Self {
        self.own_fault = own_fault;
        self
    }
}

impl ThreadState for SimThread {
    fn spill_slot(&self, reg: SpillReg, slot: SpillSlot) -> u64 {
        match slot {
            SpillSlot::Tls { offset } => self.tls.get(&offset).copied().unwrap_or(0),
            SpillSlot::Mcontext => self.mcontext[reg.index()],
        }
    }

    fn saved_app_context(&self) -> Option<MachineContext> {
        self.saved
    }

    fn is_synch_request(&self) -> bool {
        !self.own_fault
    }
}
