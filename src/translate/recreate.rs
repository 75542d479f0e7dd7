// This module provides the StateRecreator, the public entry point for fault translation.
// Given a context captured anywhere in the runtime, it first checks the classifier's fixed
// landmarks (system call return points and the reset exit stub), then refuses pcs in
// generated routines or outside the cache, and otherwise finds the owning fragment. A
// fragment with a stored table is replayed from the table over the live cache; any other is
// rebuilt, either from source, or from the snapshot copy for self-modifying code, with the
// snapshot's translations rebased onto the tag. Pending-deletion fragments without a table
// are only rebuilt when the configuration allows it, since their source may have changed.
// Successful translations are offered to the client restore hook, which may veto them.

//! State recreation entry points.

use super::adaptor::{
    Classifier, FragmentInfo, FragmentStore, RebuildTarget, RestoreHook, RestoreStateInfo,
    ThreadState,
};
use super::recorder::record_translation;
use super::replay::{replay_to_target, ListReplay, ReplayEnv, TableReplay};
use super::table::TranslationTable;
use super::walk::MangleWalk;
use super::RecoveryOutcome;
use crate::core::config::XlateConfig;
use crate::core::context::MachineContext;
use crate::core::error::{XlateError, XlateResult};
use crate::core::fragment::Fragment;
use crate::core::instr::InstrList;
use crate::core::stats::XlateStats;
use crate::x64::decode::CacheDecoder;
use crate::x64::spill::SpillLayout;
use log::{debug, trace, warn};
use std::sync::Arc;

/// Length of the system call instruction a landmark may be pointed just past.
pub const SYSCALL_LENGTH: u64 = 2;

/// Translates captured cache contexts into source contexts.
pub struct StateRecreator<'a> {
    pub(super) classifier: &'a dyn Classifier,
    pub(super) store: &'a dyn FragmentStore,
    pub(super) decoder: &'a dyn CacheDecoder,
    pub(super) layout: SpillLayout,
    pub(super) config: XlateConfig,
    hook: Option<&'a dyn RestoreHook>,
    pub(super) stats: XlateStats,
}

impl<'a> StateRecreator<'a> {
    pub fn new(
        classifier: &'a dyn Classifier,
        store: &'a dyn FragmentStore,
        decoder: &'a dyn CacheDecoder,
    ) -> Self {
        Self {
            classifier,
            store,
            decoder,
            layout: SpillLayout::default(),
            config: XlateConfig::default(),
            hook: None,
            stats: XlateStats::new(),
        }
    }

    pub fn with_hook(mut self, hook: &'a dyn RestoreHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_config(mut self, config: XlateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_layout(mut self, layout: SpillLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn config(&self) -> &XlateConfig {
        &self.config
    }

    pub fn layout(&self) -> &SpillLayout {
        &self.layout
    }

    pub fn stats(&self) -> &XlateStats {
        &self.stats
    }

    /// Source pc for cache pc `pc`, or `None` if not even the pc can be
    /// recovered. Pass the owning fragment if known.
    pub fn recreate_pc(
        &self,
        thread: &dyn ThreadState,
        pc: u64,
        fragment: Option<&Fragment>,
    ) -> Option<u64> {
        debug!("recreate_app_pc: translating from pc={pc:#x}");
        let mut mc = MachineContext::new(pc);
        let res = self.recreate_internal(thread, &mut mc, true, fragment, false);
        if res != RecoveryOutcome::PcOnly {
            debug_assert_ne!(res, RecoveryOutcome::FullState);
            warn!("recreate_app_pc: unable to translate pc {pc:#x}");
            self.stats.record_failure();
            return None;
        }
        debug!("recreate_app_pc: translation is {:#x}", mc.pc);
        Some(mc.pc)
    }

    /// Translate `mc` in place. On anything but [`RecoveryOutcome::Failed`]
    /// `mc.pc` holds the source pc; registers are only exact for
    /// [`RecoveryOutcome::FullState`].
    pub fn recreate_state(
        &self,
        thread: &dyn ThreadState,
        mc: &mut MachineContext,
        restore_memory: bool,
        fragment: Option<&Fragment>,
    ) -> RecoveryOutcome {
        trace!("recreate_app_state: translating from:\n{mc}");
        let res = self.recreate_internal(thread, mc, false, fragment, restore_memory);
        if res.is_success() {
            trace!("recreate_app_state: translation is:\n{mc}");
        } else {
            debug!("recreate_app_state: unable to translate");
            self.stats.record_failure();
        }
        res
    }

    /// Build the translation table for `fragment`, from `existing` if given
    /// or else from a rebuilt instruction list. The caller publishes it with
    /// [`Fragment::attach_translation_table`].
    pub fn record_translation_info(
        &self,
        fragment: &Fragment,
        existing: Option<&InstrList>,
    ) -> XlateResult<TranslationTable> {
        let rebuilt;
        let list = match existing {
            Some(list) => list,
            None => {
                let list = if fragment.flags.selfmod_sandboxed {
                    self.selfmod_list(fragment)
                } else {
                    self.store
                        .rebuild_instruction_list(RebuildTarget::Fragment(fragment))
                        .map(|(list, _)| list)
                };
                rebuilt = list.ok_or(XlateError::RebuildFailed { tag: fragment.tag })?;
                &rebuilt
            }
        };
        if self.config.dump_tables {
            debug!("ilist for recreation:\n{list}");
        }

        let table = record_translation(fragment, list)?;
        self.stats.record_translation_computed();
        if self.config.dump_tables {
            debug!("{}", table.display_at(fragment.start_pc));
        } else {
            trace!("{}", table.display_at(fragment.start_pc));
        }
        Ok(table)
    }

    fn recreate_internal(
        &self,
        thread: &dyn ThreadState,
        mc: &mut MachineContext,
        just_pc: bool,
        owner: Option<&Fragment>,
        restore_memory: bool,
    ) -> RecoveryOutcome {
        let res = if just_pc {
            RecoveryOutcome::PcOnly
        } else {
            RecoveryOutcome::FullState
        };
        let pc = mc.pc;

        if let Some(landmark) = self.classifier.landmark(pc) {
            // all registers hold application values here
            debug!(
                "recreate_app: pc {pc:#x} is {:?} => {:#x}",
                landmark.kind, landmark.app_pc
            );
            self.stats.record_landmark();
            mc.pc = landmark.app_pc;
            return res;
        }
        if let Some(landmark) = self
            .classifier
            .landmark(pc.wrapping_add(SYSCALL_LENGTH))
            .filter(|l| l.kind.follows_syscall())
        {
            // pointing right at the system call: keep the restart point
            debug!(
                "recreate_app: pc {pc:#x} is at the system call before {:?}",
                landmark.kind
            );
            self.stats.record_landmark();
            mc.pc = landmark.app_pc.wrapping_sub(SYSCALL_LENGTH);
            return res;
        }
        if self.classifier.in_generated_routine(pc) {
            debug!("recreate_app: state at untranslatable address {pc:#x} in generated routines");
            return RecoveryOutcome::Failed;
        }
        if !self.classifier.in_fcache(pc) {
            debug!("recreate_app: pc {pc:#x} is not in the code cache");
            return RecoveryOutcome::Failed;
        }
        self.recreate_in_fragment(thread, mc, just_pc, owner, restore_memory)
    }

    fn recreate_in_fragment(
        &self,
        thread: &dyn ThreadState,
        mc: &mut MachineContext,
        just_pc: bool,
        owner: Option<&Fragment>,
        restore_memory: bool,
    ) -> RecoveryOutcome {
        let raw_mcontext = *mc;

        let looked_up: Arc<Fragment>;
        let rebuilt_owner: Arc<Fragment>;
        let mut list: Option<InstrList> = None;
        let found = match owner {
            Some(fragment) => Some(fragment),
            None => match self.store.lookup_by_cache_pc(mc.pc) {
                Some(fragment) => {
                    looked_up = fragment;
                    Some(&*looked_up)
                }
                None => None,
            },
        };

        let fragment: &Fragment = match found {
            Some(fragment) => {
                if fragment.translation_table().is_none() {
                    if fragment.flags.selfmod_sandboxed {
                        list = self.selfmod_list(fragment);
                    } else if fragment.flags.pending_deletion && !self.config.rebuild_deleted_fragments {
                        warn!(
                            "recreate_app: F{}({:#x}) is pending deletion without stored translations",
                            fragment.id, fragment.tag
                        );
                    } else {
                        list = self
                            .store
                            .rebuild_instruction_list(RebuildTarget::Fragment(fragment))
                            .map(|(list, _)| list);
                    }
                    if list.is_none() {
                        return RecoveryOutcome::Failed;
                    }
                }
                fragment
            }
            None => match self.store.rebuild_instruction_list(RebuildTarget::CachePc(mc.pc)) {
                Some((rebuilt, fragment)) => {
                    list = Some(rebuilt);
                    rebuilt_owner = fragment;
                    &*rebuilt_owner
                }
                None => {
                    warn!("recreate_app: no fragment for {:#x}", mc.pc);
                    return RecoveryOutcome::Failed;
                }
            },
        };

        debug!(
            "recreate_app: pc is in F{}({:#x}){}",
            fragment.id,
            fragment.tag,
            if fragment.flags.is_trace { " (trace)" } else { "" }
        );
        if let (Some(list), true) = (&list, self.config.dump_tables) {
            debug!("ilist for recreation:\n{list}");
        }

        let mut res = if just_pc {
            RecoveryOutcome::PcOnly
        } else {
            RecoveryOutcome::FullState
        };
        let mut replay_just_pc = just_pc;
        if let Some(cti_pc) = fragment.exit_cti_for_stub_pc(mc.pc) {
            if !just_pc {
                debug!(
                    "recreate_app: can't full recreate state, pc {:#x} is in exit stub",
                    mc.pc
                );
                res = RecoveryOutcome::PcOnly;
                replay_just_pc = true;
            }
            debug!("\ttarget {:#x} is inside an exit stub, looking for its cti {cti_pc:#x}", mc.pc);
            mc.pc = cti_pc;
        }

        let env = ReplayEnv {
            thread,
            stats: &self.stats,
            config: &self.config,
            flags: fragment.flags,
            just_pc: replay_just_pc,
        };
        let end = fragment.end_pc();
        let replayed = match (&list, fragment.translation_table()) {
            (Some(list), _) => {
                let start = fragment.entry_pc();
                let mut source = ListReplay::new(list.as_slice(), self.decoder, start, fragment.tag);
                let mut walk = MangleWalk::new(&self.layout, start, end);
                self.stats.record_via_app_ilist();
                replay_to_target(&mut source, &mut walk, mc, &env)
            }
            (None, Some(table)) => {
                let start = fragment.start_pc;
                let mut source = TableReplay::new(table, self.decoder, start, end);
                let mut walk = MangleWalk::new(&self.layout, start, end);
                self.stats.record_via_stored_info();
                replay_to_target(&mut source, &mut walk, mc, &env)
            }
            (None, None) => RecoveryOutcome::Failed,
        };
        res = res.min(replayed);

        if res.is_success() {
            if let Some(hook) = self.hook {
                let mut info = RestoreStateInfo {
                    mcontext: mc,
                    raw_mcontext,
                    fragment_info: FragmentInfo::of(fragment),
                };
                if !hook.restore_state(&mut info, restore_memory) {
                    debug!("recreate_app: restore hook failed the translation");
                    res = RecoveryOutcome::Failed;
                }
            }
        }
        if !res.is_success() {
            // stub redirects and hook edits must not leak out of a failure
            *mc = raw_mcontext;
        }
        res
    }

    /// Snapshot list of a self-modifying fragment with translations moved
    /// from the copy back onto the tag.
    fn selfmod_list(&self, fragment: &Fragment) -> Option<InstrList> {
        debug_assert!(!fragment.flags.is_trace);
        let Some(copy) = fragment.selfmod_copy else {
            warn!("selfmod F{}({:#x}) has no snapshot copy", fragment.id, fragment.tag);
            return None;
        };
        let mut list = self.store.rebuild_selfmod_snapshot_list(fragment)?;
        for instr in list.iter_mut() {
            if let Some(app) = instr.translation() {
                instr.set_translation(Some(app.wrapping_sub(copy).wrapping_add(fragment.tag)));
            }
        }
        Some(list)
    }
}
