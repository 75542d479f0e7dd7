//! Self-check of a fragment's translation metadata.
//!
//! Recreates state at every instruction boundary of a fragment and compares
//! the result against what can be derived independently from the
//! instruction list: stack adjustments counted directly, and source pcs
//! read straight off each instruction. Table replay is checked against the
//! same list by recording a table on the fly: both engines must reach the
//! same outcome, pc and registers.

use super::adaptor::ThreadState;
use super::recorder::record_translation;
use super::recreate::StateRecreator;
use super::replay::{replay_to_target, ListReplay, ReplayEnv, ReplaySource, TableReplay};
use super::walk::MangleWalk;
use super::RecoveryOutcome;
use crate::core::context::{Gpr, MachineContext};
use crate::core::fragment::Fragment;
use crate::core::instr::InstrList;
use crate::core::stats::XlateStats;
use crate::x64::mangle::check_xsp_mangling;
use crate::x64::spill::{SpillReg, SpillSlot};
use log::{debug, warn};
use std::fmt;

/// Stack pointer handed to every synthetic recreation.
const STRESS_XSP_INIT: u64 = 0x0800_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// Recovered `rsp` differs from the synthetic value minus the region's
    /// stack adjustment.
    StackPointer { expected: u64, actual: u64 },
    /// Table replay and list replay disagree on how much could be recovered.
    Outcome { table: RecoveryOutcome, list: RecoveryOutcome },
    /// Table replay and list replay disagree on the source pc.
    Pc { table: Option<u64>, list: Option<u64> },
    /// Both recovered the full state but with different registers.
    Registers,
    /// The recorded table could not be built at all.
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyMismatch {
    pub cache_pc: u64,
    pub kind: MismatchKind,
}

impl fmt::Display for VerifyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MismatchKind::StackPointer { expected, actual } => write!(
                f,
                "{:#x}: rsp {actual:#x}, expected {expected:#x}",
                self.cache_pc
            ),
            MismatchKind::Outcome { table, list } => write!(
                f,
                "{:#x}: table replay is {table}, list replay is {list}",
                self.cache_pc
            ),
            MismatchKind::Pc { table, list } => write!(
                f,
                "{:#x}: table replay gives {}, list replay gives {}",
                self.cache_pc,
                fmt_pc(table),
                fmt_pc(list)
            ),
            MismatchKind::Registers => write!(f, "{:#x}: replays recover different registers", self.cache_pc),
            MismatchKind::Recording => write!(f, "{:#x}: translation table not recordable", self.cache_pc),
        }
    }
}

fn fmt_pc(pc: Option<u64>) -> String {
    pc.map_or_else(|| "nothing".to_string(), |pc| format!("{pc:#x}"))
}

/// Synthetic recoveries never come from the thread's own fault.
struct SynchRequest<'t>(&'t dyn ThreadState);

impl ThreadState for SynchRequest<'_> {
    fn spill_slot(&self, reg: SpillReg, slot: SpillSlot) -> u64 {
        self.0.spill_slot(reg, slot)
    }

    fn saved_app_context(&self) -> Option<MachineContext> {
        self.0.saved_app_context()
    }
}

impl StateRecreator<'_> {
    /// Check `list`, the instruction list `fragment` was encoded from,
    /// against both replay engines. The fragment's cache bytes must be
    /// decodable. Statistics of the recreator are left untouched.
    pub fn verify_fragment(
        &self,
        thread: &dyn ThreadState,
        fragment: &Fragment,
        list: &InstrList,
    ) -> Vec<VerifyMismatch> {
        debug!("verifying state restoration for F{}({:#x})", fragment.id, fragment.tag);
        let thread = SynchRequest(thread);
        let stats = XlateStats::new();
        let mut mismatches = Vec::new();

        let table = match record_translation(fragment, list) {
            Ok(table) => Some(table),
            Err(err) => {
                warn!("F{}: {err}", fragment.id);
                mismatches.push(VerifyMismatch {
                    cache_pc: fragment.start_pc,
                    kind: MismatchKind::Recording,
                });
                None
            }
        };

        let env = |just_pc| ReplayEnv {
            thread: &thread,
            stats: &stats,
            config: &self.config,
            flags: fragment.flags,
            just_pc,
        };
        let list_replay = |mc: &mut MachineContext, just_pc: bool| {
            let start = fragment.entry_pc();
            let mut source = ListReplay::new(list.as_slice(), self.decoder, start, fragment.tag);
            let mut walk = MangleWalk::new(&self.layout, start, fragment.end_pc());
            replay_to_target(&mut source, &mut walk, mc, &env(just_pc))
        };

        let mut inside_region = false;
        let mut region_translation = None;
        let mut xsp_adjust = 0i64;
        let mut cpc = fragment.entry_pc();
        for instr in list.iter().filter(|i| !i.is_empty()) {
            if inside_region
                && (!instr.is_our_mangling() || instr.translation() != region_translation)
            {
                inside_region = false;
                xsp_adjust = 0;
            }

            if instr.is_our_mangling() {
                if !inside_region {
                    inside_region = true;
                    region_translation = instr.translation();
                }
                // clean call regions restore a saved context instead
                if region_translation.is_some() {
                    let mut mc = MachineContext::new(cpc);
                    mc.set_sp(STRESS_XSP_INIT);
                    let res = list_replay(&mut mc, false);
                    let expected = STRESS_XSP_INIT.wrapping_sub(xsp_adjust as u64);
                    debug!("  restored res={res} pc={:#x}, rsp={:#x} vs {expected:#x}", mc.pc, mc.sp());
                    if res.is_success() && mc.sp() != expected {
                        mismatches.push(VerifyMismatch {
                            cache_pc: cpc,
                            kind: MismatchKind::StackPointer {
                                expected,
                                actual: mc.sp(),
                            },
                        });
                    }
                }
                if let Some(delta) = check_xsp_mangling(instr) {
                    xsp_adjust += delta;
                }
            }

            if let (Some(table), Some(_)) = (&table, instr.translation()) {
                let captured = MachineContext::new(cpc).with_reg(Gpr::Rsp, STRESS_XSP_INIT);

                let mut by_list = captured;
                let list_res = list_replay(&mut by_list, false);

                let mut by_table = captured;
                let mut source: TableReplay<'_> =
                    TableReplay::new(table, self.decoder, fragment.start_pc, fragment.end_pc());
                let mut walk = MangleWalk::new(&self.layout, source.start_pc(), fragment.end_pc());
                let table_res = replay_to_target(&mut source, &mut walk, &mut by_table, &env(false));

                let table_pc = table_res.is_success().then_some(by_table.pc);
                let list_pc = list_res.is_success().then_some(by_list.pc);
                let kind = if table_res != list_res {
                    Some(MismatchKind::Outcome {
                        table: table_res,
                        list: list_res,
                    })
                } else if table_pc != list_pc {
                    Some(MismatchKind::Pc {
                        table: table_pc,
                        list: list_pc,
                    })
                } else if table_res == RecoveryOutcome::FullState && by_table != by_list {
                    Some(MismatchKind::Registers)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    mismatches.push(VerifyMismatch { cache_pc: cpc, kind });
                }
            }

            cpc += u64::from(instr.len());
        }

        for mismatch in &mismatches {
            warn!("F{}: {mismatch}", fragment.id);
        }
        mismatches
    }
}
