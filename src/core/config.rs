//! Recreation policy knobs.

/// Policy for the state recreator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XlateConfig {
    /// Rebuild pending-deletion fragments that carry no stored table from
    /// whatever the source memory holds now. Off by default: the source may
    /// have changed since the fragment was built.
    pub rebuild_deleted_fragments: bool,
    /// Recoveries are expected to land on unsafe points (stress testing), so
    /// own-thread degradations are not asserted on.
    pub stress_recreate_pc: bool,
    /// Log every table and rebuilt list at debug level.
    pub dump_tables: bool,
}

impl XlateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rebuild_deleted_fragments(mut self, enable: bool) -> Self {
        self.rebuild_deleted_fragments = enable;
        self
    }

    pub fn with_stress_recreate_pc(mut self, enable: bool) -> Self {
        self.stress_recreate_pc = enable;
        self
    }

    pub fn with_dump_tables(mut self, enable: bool) -> Self {
        self.dump_tables = enable;
        self
    }
}
