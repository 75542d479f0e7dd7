//! Translation statistics.
//!
//! Counters are relaxed atomics so one recreator can serve recoveries from
//! several threads through a shared reference.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct XlateStats {
    recreate_via_stored_info: AtomicU64,
    recreate_via_app_ilist: AtomicU64,
    recreate_spill_restores: AtomicU64,
    translations_computed: AtomicU64,
    landmark_hits: AtomicU64,
    recreate_failures: AtomicU64,
}

impl XlateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_via_stored_info(&self) {
        self.recreate_via_stored_info.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_via_app_ilist(&self) {
        self.recreate_via_app_ilist.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spill_restore(&self) {
        self.recreate_spill_restores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_translation_computed(&self) {
        self.translations_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_landmark(&self) {
        self.landmark_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.recreate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            recreate_via_stored_info: self.recreate_via_stored_info.load(Ordering::Relaxed),
            recreate_via_app_ilist: self.recreate_via_app_ilist.load(Ordering::Relaxed),
            recreate_spill_restores: self.recreate_spill_restores.load(Ordering::Relaxed),
            translations_computed: self.translations_computed.load(Ordering::Relaxed),
            landmark_hits: self.landmark_hits.load(Ordering::Relaxed),
            recreate_failures: self.recreate_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`XlateStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Recreations that replayed a stored translation table.
    pub recreate_via_stored_info: u64,
    /// Recreations that replayed a rebuilt instruction list.
    pub recreate_via_app_ilist: u64,
    /// Registers written back from spill slots.
    pub recreate_spill_restores: u64,
    /// Translation tables recorded.
    pub translations_computed: u64,
    /// Recoveries resolved at a fixed landmark.
    pub landmark_hits: u64,
    pub recreate_failures: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Translation Statistics:")?;
        writeln!(f, "  Recreated via stored info: {}", self.recreate_via_stored_info)?;
        writeln!(f, "  Recreated via app ilist: {}", self.recreate_via_app_ilist)?;
        writeln!(f, "  Spill restores: {}", self.recreate_spill_restores)?;
        writeln!(f, "  Translations computed: {}", self.translations_computed)?;
        writeln!(f, "  Landmark hits: {}", self.landmark_hits)?;
        writeln!(f, "  Failures: {}", self.recreate_failures)?;
        Ok(())
    }
}
