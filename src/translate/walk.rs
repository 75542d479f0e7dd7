//! Mangling-region tracking.
//!
//! A [`MangleWalk`] is fed every cache instruction passed on the way to a
//! target pc. Inside a run of the translator's own instructions for one
//! source instruction (a region) it remembers which registers currently live
//! in spill slots and how far `rsp` has been moved by emulated pushes and
//! pops, so the source context at the region's start can be put back.

use super::adaptor::ThreadState;
use crate::core::context::MachineContext;
use crate::core::instr::Instr;
use crate::core::stats::XlateStats;
use crate::x64::mangle::{classify, resets_spills, MangleIdiom};
use crate::x64::spill::{SpillLayout, SpillReg, SpillSet, SpillSlot};
use log::{debug, trace, warn};
use std::ops::Range;

/// Transient tracker state for one walk over one fragment.
#[derive(Debug, Clone)]
pub struct MangleWalk<'l> {
    layout: &'l SpillLayout,
    span: Range<u64>,
    spilled: SpillSet,
    /// Spilled to a TLS slot rather than the context save-slot.
    tls: SpillSet,
    tls_offsets: [u64; SpillReg::COUNT],
    /// Forward change of `rsp` within the region.
    xsp_adjust: i64,
    in_region: bool,
    /// Source pc the current region belongs to.
    translation: Option<u64>,
    unsupported: bool,
}

impl<'l> MangleWalk<'l> {
    /// Start a walk over the fragment occupying `[start, end)` in the cache.
    pub fn new(layout: &'l SpillLayout, start: u64, end: u64) -> Self {
        Self {
            layout,
            span: start..end,
            spilled: SpillSet::new(),
            tls: SpillSet::new(),
            tls_offsets: [0; SpillReg::COUNT],
            xsp_adjust: 0,
            in_region: false,
            translation: None,
            unsupported: false,
        }
    }

    pub fn xsp_adjust(&self) -> i64 {
        self.xsp_adjust
    }

    pub fn in_region(&self) -> bool {
        self.in_region
    }

    pub fn region_translation(&self) -> Option<u64> {
        self.translation
    }

    pub fn is_spilled(&self, reg: SpillReg) -> bool {
        self.spilled.contains(reg)
    }

    pub fn is_unsupported(&self) -> bool {
        self.unsupported
    }

    /// Account for one instruction the walk has passed.
    pub fn track(&mut self, instr: &Instr) {
        // adjacent regions are told apart by their translation
        if self.in_region
            && (!instr.is_our_mangling() || instr.translation() != self.translation)
        {
            trace!("from one mangle region to another");
            debug_assert!(
                self.spilled.is_empty(),
                "spill outstanding at end of region {:?}",
                self.translation
            );
            self.in_region = false;
            self.unsupported = false;
            self.xsp_adjust = 0;
            self.spilled.clear_all();
        }

        if !instr.is_our_mangling() {
            return;
        }
        if !self.in_region {
            self.in_region = true;
            self.translation = instr.translation();
            trace!("entering mangle region xl8={:?}", self.translation);
        }
        // Clean call arguments: only faults on application memory are
        // expected here and those restore the saved context wholesale.
        if self.translation.is_none() {
            trace!("\tin clean call arg region: {instr}");
            return;
        }

        if resets_spills(instr, &self.span) {
            self.spilled.clear_all();
        }

        match classify(self.layout, instr, &self.span) {
            MangleIdiom::SpillRestore(op) => {
                let reg = op.reg;
                // a restore whose spill preceded a reset is ignored
                if op.spill || self.spilled.contains(reg) {
                    debug_assert!(
                        op.spill != self.spilled.contains(reg),
                        "unpaired {} of {reg}",
                        if op.spill { "spill" } else { "restore" }
                    );
                    if op.spill {
                        self.spilled.set(reg);
                        match op.slot {
                            SpillSlot::Tls { offset } => {
                                self.tls.set(reg);
                                self.tls_offsets[reg.index()] = offset;
                            }
                            SpillSlot::Mcontext => self.tls.clear(reg),
                        }
                    } else {
                        debug_assert_eq!(self.slot_of(reg), op.slot, "restore of {reg} from another slot");
                        self.spilled.clear(reg);
                    }
                    trace!(
                        "\tspill update: {} {} {reg}",
                        if op.spill { "spill" } else { "restore" },
                        if matches!(op.slot, SpillSlot::Tls { .. }) { "tls" } else { "mcontext" }
                    );
                }
            }
            MangleIdiom::StackAdjust(delta) => self.xsp_adjust += delta,
            MangleIdiom::Unsupported => {
                debug!("unsupported mangle instr {instr}");
                self.unsupported = true;
            }
            MangleIdiom::TraceCmp
            | MangleIdiom::InlineSyscallJmp
            | MangleIdiom::SegRefLoad
            | MangleIdiom::MangledApp => {}
        }
    }

    /// Whether `instr`, were it tracked, would mark its region unsupported.
    pub fn would_be_unsupported(&self, instr: &Instr) -> bool {
        instr.is_our_mangling()
            && instr.translation().is_some()
            && !classify(self.layout, instr, &self.span).is_supported()
    }

    /// Whether full state can be recovered at source pc `pc`.
    pub fn good_state(&self, pc: u64) -> bool {
        // past the end of the region is fine
        !self.unsupported || (self.in_region && Some(pc) != self.translation)
    }

    /// Put back what the region has hidden, if `pc` is the region's own
    /// source pc: spilled registers from their slots and `rsp` by the
    /// negated adjustment.
    pub fn restore(
        &self,
        mc: &mut MachineContext,
        thread: &dyn ThreadState,
        pc: u64,
        stats: &XlateStats,
    ) {
        if Some(pc) != self.translation {
            // positioned after the region: nothing of it is in effect
            debug!(
                "\ttranslation {pc:#x} is post-walk {:?} so not fixing xsp",
                self.translation
            );
            if !self.spilled.is_empty() {
                warn!("spills outstanding past region {:?}", self.translation);
            }
            return;
        }

        for reg in self.spilled.iter() {
            let value = thread.spill_slot(reg, self.slot_of(reg));
            debug!("\trestoring spilled {reg} to {value:#x}");
            stats.record_spill_restore();
            mc.set_reg(reg.gpr(), value);
        }
        if self.xsp_adjust != 0 {
            mc.set_sp(mc.sp().wrapping_sub(self.xsp_adjust as u64));
            debug!(
                "\tundoing push/pop by {}: rsp now {:#x}",
                self.xsp_adjust,
                mc.sp()
            );
        }
    }

    fn slot_of(&self, reg: SpillReg) -> SpillSlot {
        if self.tls.contains(reg) {
            SpillSlot::Tls {
                offset: self.tls_offsets[reg.index()],
            }
        } else {
            SpillSlot::Mcontext
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Gpr;
    use crate::core::instr::InstrOrigin;
    use crate::x64::decode::decode_one;

    const XL8: u64 = 0x40_1000;

    struct Slots;

    impl ThreadState for Slots {
        fn spill_slot(&self, reg: SpillReg, slot: SpillSlot) -> u64 {
            match slot {
                SpillSlot::Tls { offset } => 0x7700 + offset,
                SpillSlot::Mcontext => 0x8800 + reg.index() as u64,
            }
        }
    }

    fn ours(bytes: &[u8], xl8: Option<u64>) -> Instr {
        let (instr, _) = decode_one(bytes, 0x1000).unwrap();
        instr.with_origin(InstrOrigin::Mangling).with_translation(xl8)
    }

    fn spill_rcx() -> Instr {
        ours(&[0x65, 0x48, 0x89, 0x0c, 0x25, 0x18, 0, 0, 0], Some(XL8))
    }

    fn restore_rcx() -> Instr {
        ours(&[0x65, 0x48, 0x8b, 0x0c, 0x25, 0x18, 0, 0, 0], Some(XL8))
    }

    #[test]
    fn test_spill_restore_pairing() {
        let layout = SpillLayout::default();
        let mut walk = MangleWalk::new(&layout, 0x1000, 0x1100);
        walk.track(&spill_rcx());
        assert!(walk.in_region());
        assert!(walk.is_spilled(SpillReg::Rcx));
        walk.track(&restore_rcx());
        assert!(!walk.is_spilled(SpillReg::Rcx));
        assert!(walk.good_state(XL8));
    }

    #[test]
    fn test_restore_writes_slot_and_stack() {
        let layout = SpillLayout::default();
        let mut walk = MangleWalk::new(&layout, 0x1000, 0x1100);
        walk.track(&spill_rcx());
        // push rax
        walk.track(&ours(&[0x50], Some(XL8)));
        assert_eq!(walk.xsp_adjust(), -8);

        let stats = XlateStats::new();
        let mut mc = MachineContext::new(0x1000).with_reg(Gpr::Rsp, 0x7ff0);
        walk.restore(&mut mc, &Slots, XL8, &stats);
        assert_eq!(mc.reg(Gpr::Rcx), 0x7718);
        assert_eq!(mc.sp(), 0x7ff8);
        assert_eq!(stats.snapshot().recreate_spill_restores, 1);

        // a pc outside the region leaves the context alone
        let mut other = MachineContext::new(0x1000).with_reg(Gpr::Rsp, 0x7ff0);
        walk.restore(&mut other, &Slots, XL8 + 1, &stats);
        assert_eq!(other.sp(), 0x7ff0);
    }

    #[test]
    fn test_unsupported_until_region_ends() {
        let layout = SpillLayout::default();
        let mut walk = MangleWalk::new(&layout, 0x1000, 0x1100);
        // nop inserted by the translator is not a known idiom
        let nop = ours(&[0x90], Some(XL8));
        assert!(walk.would_be_unsupported(&nop));
        walk.track(&nop);
        assert!(walk.is_unsupported());
        assert!(!walk.good_state(XL8));
        assert!(walk.good_state(XL8 + 1));

        let (app, _) = decode_one(&[0x90], 0x1001).unwrap();
        walk.track(&app.with_translation(Some(XL8 + 1)));
        assert!(!walk.in_region());
        assert!(walk.good_state(XL8 + 1));
    }

    #[test]
    fn test_clean_call_region_untracked() {
        let layout = SpillLayout::default();
        let mut walk = MangleWalk::new(&layout, 0x1000, 0x1100);
        walk.track(&ours(&[0x90], None));
        walk.track(&ours(&[0x50], None));
        assert!(walk.in_region());
        assert!(!walk.is_unsupported());
        assert_eq!(walk.xsp_adjust(), 0);
        assert!(!walk.would_be_unsupported(&ours(&[0x90], None)));
    }

    #[test]
    fn test_internal_branch_clears_spills() {
        let layout = SpillLayout::default();
        let mut walk = MangleWalk::new(&layout, 0x1000, 0x1100);
        walk.track(&spill_rcx());
        // jne 0x1012, inside the fragment
        walk.track(&ours(&[0x75, 0x10], Some(XL8)));
        assert!(!walk.is_spilled(SpillReg::Rcx));
        // the later restore is ignored rather than unpaired
        walk.track(&restore_rcx());
        assert!(!walk.is_spilled(SpillReg::Rcx));
    }
}
