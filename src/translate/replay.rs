// This module walks a fragment from its start to a captured cache pc and works out which
// source pc that cache pc stands for. There are two sources for the walk. Table replay
// decodes the live cache bytes and interpolates source pcs from the stored translation
// table, so it works after the source is gone. List replay steps through an instruction
// list rebuilt from source (or from a self-modifying fragment's snapshot) and reads each
// instruction's translation directly. Both feed every instruction they pass to the
// mangling-region tracker, and both end in the same driver, which decides at the target
// how much of the context can be trusted and restores what the tracker knows about.

//! Replay of a fragment up to a target cache pc.

use super::adaptor::ThreadState;
use super::table::TranslationTable;
use super::walk::MangleWalk;
use super::RecoveryOutcome;
use crate::core::config::XlateConfig;
use crate::core::context::{Gpr, MachineContext};
use crate::core::error::XlateResult;
use crate::core::fragment::FragmentFlags;
use crate::core::instr::{Instr, InstrOrigin};
use crate::core::stats::XlateStats;
use crate::x64::decode::CacheDecoder;
use crate::x64::spill::{SpillReg, SpillSlot};
use log::{debug, error, trace, warn};

/// A walk over one fragment's cache instructions.
pub trait ReplaySource {
    /// Cache pc of the first instruction the walk yields.
    fn start_pc(&self) -> u64;

    /// Next instruction and the cache pc it occupies, carrying its source
    /// translation; `None` past the end.
    fn next_step(&mut self) -> XlateResult<Option<(u64, Instr)>>;

    /// Note an instruction the walk has moved past.
    fn passed(&mut self, _instr: &Instr) {}

    /// Best guess for a target that has no translation of its own, or that
    /// was never reached.
    fn fallback(&self) -> Option<u64>;
}

/// Replay driven by a stored [`TranslationTable`] over live cache bytes.
pub struct TableReplay<'a> {
    table: &'a TranslationTable,
    decoder: &'a dyn CacheDecoder,
    start: u64,
    end: u64,
    cpc: u64,
    next_entry: usize,
    answer: Option<u64>,
    contig: bool,
    origin: InstrOrigin,
}

impl<'a> TableReplay<'a> {
    /// Walk `[start, end)`, the fragment's whole cache span.
    pub fn new(table: &'a TranslationTable, decoder: &'a dyn CacheDecoder, start: u64, end: u64) -> Self {
        debug_assert!(end >= start);
        debug_assert!(table.get(0).map_or(true, |e| e.cache_offset == 0));
        Self {
            table,
            decoder,
            start,
            end,
            cpc: start,
            next_entry: 0,
            answer: None,
            contig: true,
            origin: InstrOrigin::App,
        }
    }
}

impl ReplaySource for TableReplay<'_> {
    fn start_pc(&self) -> u64 {
        self.start
    }

    fn next_step(&mut self) -> XlateResult<Option<(u64, Instr)>> {
        if self.cpc >= self.end {
            return Ok(None);
        }
        // past the last change point the last entry holds
        if let Some(entry) = self.table.get(self.next_entry) {
            if self.cpc - self.start >= u64::from(entry.cache_offset) {
                self.answer = entry.app;
                self.contig = entry.is_contiguous();
                self.origin = match (entry.our_mangling, entry.mangled_app, entry.app) {
                    (true, true, _) => InstrOrigin::MangledApp,
                    (true, false, _) => InstrOrigin::Mangling,
                    (false, _, None) => InstrOrigin::Meta,
                    (false, _, Some(_)) => InstrOrigin::App,
                };
                self.next_entry += 1;
            }
        }

        let at = self.cpc;
        let (instr, next) = self.decoder.decode(at)?;
        let instr = instr.with_translation(self.answer).with_origin(self.origin);

        if self.contig {
            self.answer = self.answer.map(|a| a + (next - at));
        }
        self.cpc = next;
        Ok(Some((at, instr)))
    }

    fn fallback(&self) -> Option<u64> {
        // skip any further meta code
        self.table.next_translated(self.next_entry)
    }
}

/// Replay over an instruction list rebuilt for the fragment.
pub struct ListReplay<'a> {
    instrs: std::slice::Iter<'a, Instr>,
    decoder: &'a dyn CacheDecoder,
    start: u64,
    cpc: u64,
    tag: u64,
    /// Source pc just after the last translated instruction passed.
    prev_after: Option<u64>,
}

impl<'a> ListReplay<'a> {
    /// Walk `instrs`, whose first encoded instruction sits at cache pc
    /// `start`. `tag` is the guess of last resort.
    pub fn new(instrs: &'a [Instr], decoder: &'a dyn CacheDecoder, start: u64, tag: u64) -> Self {
        Self {
            instrs: instrs.iter(),
            decoder,
            start,
            cpc: start,
            tag,
            prev_after: None,
        }
    }
}

impl ReplaySource for ListReplay<'_> {
    fn start_pc(&self) -> u64 {
        self.start
    }

    fn next_step(&mut self) -> XlateResult<Option<(u64, Instr)>> {
        // labels and anything else unencoded take no cache bytes
        for instr in self.instrs.by_ref() {
            let len = u64::from(instr.len());
            if len == 0 {
                continue;
            }
            let at = self.cpc;
            self.cpc += len;
            return Ok(Some((at, *instr)));
        }
        Ok(None)
    }

    fn passed(&mut self, instr: &Instr) {
        let Some(app) = instr.translation() else {
            return;
        };
        self.prev_after = Some(if instr.is_app() {
            // the source instruction may differ in length from its copy
            match self.decoder.next_pc(app) {
                Ok(next) => next,
                Err(err) => {
                    trace!("source at {app:#x} not decodable ({err}); using cache length");
                    app + u64::from(instr.len())
                }
            }
        } else {
            app
        });
    }

    fn fallback(&self) -> Option<u64> {
        match self.prev_after {
            Some(after) => {
                warn!("recreate_app: guessing after prev translation (pc {after:#x})");
                Some(after)
            }
            None => {
                warn!("recreate_app: guessing start pc {:#x}", self.tag);
                Some(self.tag)
            }
        }
    }
}

/// Everything a replay needs besides its source and tracker.
pub struct ReplayEnv<'a> {
    pub thread: &'a dyn ThreadState,
    pub stats: &'a XlateStats,
    pub config: &'a XlateConfig,
    pub flags: FragmentFlags,
    pub just_pc: bool,
}

/// Walk `source` until `mc.pc`, feeding `walk`, and translate `mc` at the
/// target. `pc` is written for every outcome but [`RecoveryOutcome::Failed`].
pub fn replay_to_target(
    source: &mut dyn ReplaySource,
    walk: &mut MangleWalk<'_>,
    mc: &mut MachineContext,
    env: &ReplayEnv<'_>,
) -> RecoveryOutcome {
    let target = mc.pc;
    let mut res = if env.just_pc {
        RecoveryOutcome::PcOnly
    } else {
        RecoveryOutcome::FullState
    };
    debug!(
        "recreate_app: looking for {target:#x} starting at {:#x}",
        source.start_pc()
    );

    loop {
        let (cpc, instr) = match source.next_step() {
            Ok(Some(step)) => step,
            Ok(None) => break,
            Err(err) => {
                warn!("recreate_app: walk towards {target:#x} failed: {err}");
                return RecoveryOutcome::Failed;
            }
        };
        trace!("cache pc {cpc:#x} vs {target:#x}");

        if cpc < target {
            walk.track(&instr);
            source.passed(&instr);
            continue;
        }

        if cpc > target {
            if cpc == source.start_pc() {
                debug!("recreate_app: cache pc {cpc:#x} != {target:#x}, assuming a prefix instruction");
            } else {
                warn!("recreate_app: cache pc {cpc:#x} != {target:#x}, probably prefix instruction");
            }
            res = res.min(RecoveryOutcome::PcOnly);
        }

        let answer = match instr.translation() {
            Some(app) => {
                check_target_state(walk, &instr, app, mc, env, &mut res);
                app
            }
            None => {
                // decided before touching `mc`: a failure leaves it as captured
                let Some(guess) = source.fallback() else {
                    warn!("recreate_app: no translation at or after {cpc:#x}");
                    return RecoveryOutcome::Failed;
                };
                if instr.is_our_mangling() {
                    // clean call: the whole application context was saved on entry
                    debug!("\ttranslating clean call arg crash");
                    match env.thread.saved_app_context() {
                        Some(saved) if !env.just_pc => *mc = saved,
                        Some(_) => {}
                        None => res = res.min(RecoveryOutcome::PcOnly),
                    }
                } else {
                    res = res.min(RecoveryOutcome::PcOnly);
                    debug_assert!(
                        env.thread.is_synch_request() || env.config.stress_recreate_pc,
                        "meta instruction at {cpc:#x} faulted: it must carry a translation"
                    );
                }
                guess
            }
        };

        if !env.just_pc {
            walk.restore(mc, env.thread, answer, env.stats);
        }
        debug!("recreate_app: found ok pc {answer:#x}");
        mc.pc = answer;
        return res;
    }

    error!("recreate_app: looking for {target:#x} from {:#x}: not found", source.start_pc());
    match source.fallback() {
        Some(guess) => {
            mc.pc = guess;
            RecoveryOutcome::PcOnly
        }
        None => RecoveryOutcome::Failed,
    }
}

fn check_target_state(
    walk: &MangleWalk<'_>,
    instr: &Instr,
    app: u64,
    mc: &mut MachineContext,
    env: &ReplayEnv<'_>,
    res: &mut RecoveryOutcome,
) {
    if walk.good_state(app) && !walk.would_be_unsupported(instr) {
        debug!("recreate_app: found valid state pc {app:#x}");
        return;
    }
    if env.flags.selfmod_sandboxed && instr.is_rep_string() {
        // self-modifying rep strings keep rbx in its context save-slot
        if !env.just_pc {
            let rbx = env.thread.spill_slot(SpillReg::Rbx, SpillSlot::Mcontext);
            mc.set_reg(Gpr::Rbx, rbx);
            debug!("\trestoring spilled rbx to {rbx:#x}");
            env.stats.record_spill_restore();
        }
        return;
    }
    *res = (*res).min(RecoveryOutcome::PcOnly);
    debug_assert!(
        env.thread.is_synch_request()
            || env.config.stress_recreate_pc
            || env.flags.selfmod_sandboxed
            || env.flags.pending_deletion,
        "fault at {app:#x} inside unsupported mangling"
    );
    debug!("recreate_app: not able to fully recreate context, pc is in added instruction from mangling");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::table::TranslationEntry;
    use crate::x64::decode::CodeCache;
    use crate::x64::spill::SpillLayout;

    struct NoSlots;

    impl ThreadState for NoSlots {
        fn spill_slot(&self, _reg: SpillReg, _slot: SpillSlot) -> u64 {
            0
        }
    }

    #[test]
    fn test_table_interpolates_by_stride() {
        let mut cache = CodeCache::new();
        // add rax, rbx ; nop ; nop ; ret
        cache.map(0x8000, vec![0x48, 0x01, 0xd8, 0x90, 0x90, 0xc3]);
        let table = TranslationTable::new(
            vec![
                TranslationEntry::new(0, Some(0x1000), false, false),
                TranslationEntry::new(4, Some(0x2000), true, true),
            ]
            .into_boxed_slice(),
        );
        let mut replay = TableReplay::new(&table, &cache, 0x8000, 0x8006);
        let steps: Vec<(u64, Option<u64>)> = std::iter::from_fn(|| replay.next_step().unwrap())
            .map(|(pc, i)| (pc, i.translation()))
            .collect();
        assert_eq!(
            steps,
            vec![
                (0x8000, Some(0x1000)),
                (0x8003, Some(0x1003)),
                (0x8004, Some(0x2000)),
                (0x8005, Some(0x2000)),
            ]
        );
    }

    #[test]
    fn test_table_entries_set_origin() {
        let mut cache = CodeCache::new();
        cache.map(0x8000, vec![0x90, 0x90, 0x90, 0x90]);
        let table = TranslationTable::new(
            vec![
                TranslationEntry::new(0, Some(0x1000), false, false),
                TranslationEntry::new(1, Some(0x1001), true, true),
                TranslationEntry::new(2, Some(0x1001), true, true).with_mangled_app(true),
                TranslationEntry::new(3, None, true, false),
            ]
            .into_boxed_slice(),
        );
        let mut replay = TableReplay::new(&table, &cache, 0x8000, 0x8004);
        let origins: Vec<InstrOrigin> = std::iter::from_fn(|| replay.next_step().unwrap())
            .map(|(_, i)| i.origin())
            .collect();
        assert_eq!(
            origins,
            vec![
                InstrOrigin::App,
                InstrOrigin::Mangling,
                InstrOrigin::MangledApp,
                InstrOrigin::Meta,
            ]
        );
    }

    #[test]
    fn test_overshoot_mid_instruction_is_pc_only() {
        let mut cache = CodeCache::new();
        cache.map(0x8000, vec![0x48, 0x01, 0xd8, 0xc3]);
        let table = TranslationTable::new(
            vec![TranslationEntry::new(0, Some(0x1000), false, false)].into_boxed_slice(),
        );
        let layout = SpillLayout::default();
        let stats = XlateStats::new();
        let config = XlateConfig::default();
        let env = ReplayEnv {
            thread: &NoSlots,
            stats: &stats,
            config: &config,
            flags: FragmentFlags::default(),
            just_pc: false,
        };

        let mut mc = MachineContext::new(0x8001);
        let mut replay = TableReplay::new(&table, &cache, 0x8000, 0x8004);
        let mut walk = MangleWalk::new(&layout, 0x8000, 0x8004);
        // 0x8001 is never a boundary; the first one past it is 0x8003
        assert_eq!(
            replay_to_target(&mut replay, &mut walk, &mut mc, &env),
            RecoveryOutcome::PcOnly
        );
        assert_eq!(mc.pc, 0x1003);

        let mut mc = MachineContext::new(0x8003);
        let mut replay = TableReplay::new(&table, &cache, 0x8000, 0x8004);
        let mut walk = MangleWalk::new(&layout, 0x8000, 0x8004);
        assert_eq!(
            replay_to_target(&mut replay, &mut walk, &mut mc, &env),
            RecoveryOutcome::FullState
        );
        assert_eq!(mc.pc, 0x1003);
    }
}
