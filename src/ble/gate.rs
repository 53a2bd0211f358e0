//! Single-outstanding-procedure gate.
//!
//! The GATT client may only have one read, write or discovery request in
//! flight per connection.  [`ProcedureGate`] records which one, and keeps
//! the read/write alternation used by the manual trigger.

/// GATT procedures serialized by the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Procedure {
    Read,
    Write,
    Discovery,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GateStatus {
    Allowed,
    Busy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProcedureGate {
    in_progress: Option<Procedure>,
    next_manual: Procedure,
    prev_manual: Procedure,
}

impl Default for ProcedureGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcedureGate {
    pub const fn new() -> Self {
        Self {
            in_progress: None,
            next_manual: Procedure::Read,
            prev_manual: Procedure::Read,
        }
    }

    /// Claim the gate for `kind`.
    ///
    /// On success a read or write also flips the alternation reported by
    /// [`alternate_kind`](Self::alternate_kind).
    pub fn begin(&mut self, kind: Procedure) -> GateStatus {
        if self.in_progress.is_some() {
            return GateStatus::Busy;
        }
        self.in_progress = Some(kind);
        self.prev_manual = self.next_manual;
        match kind {
            Procedure::Read => self.next_manual = Procedure::Write,
            Procedure::Write => self.next_manual = Procedure::Read,
            Procedure::Discovery => {}
        }
        GateStatus::Allowed
    }

    /// Mark the gate busy for a discovery run.
    pub fn arm_for_discovery(&mut self) {
        self.in_progress = Some(Procedure::Discovery);
    }

    /// The outstanding procedure finished.
    pub fn complete(&mut self) {
        self.in_progress = None;
    }

    /// Release a claim whose request never went out, undoing the alternation.
    pub fn abort(&mut self) {
        self.in_progress = None;
        self.next_manual = self.prev_manual;
    }

    /// Operation the alternating manual trigger performs next.
    pub fn alternate_kind(&self) -> Procedure {
        self.next_manual
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.is_some()
    }

    pub fn in_progress(&self) -> Option<Procedure> {
        self.in_progress
    }

    /// Disconnect force-clear; the alternation survives.
    pub fn reset(&mut self) {
        self.in_progress = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_busy_until_complete() {
        let mut gate = ProcedureGate::new();
        assert_eq!(gate.begin(Procedure::Read), GateStatus::Allowed);
        assert_eq!(gate.begin(Procedure::Read), GateStatus::Busy);
        assert_eq!(gate.begin(Procedure::Write), GateStatus::Busy);
        gate.complete();
        assert_eq!(gate.begin(Procedure::Write), GateStatus::Allowed);
    }

    #[test]
    fn never_two_allowed_without_complete() {
        let kinds = [Procedure::Read, Procedure::Write, Procedure::Discovery];
        for a in kinds {
            for b in kinds {
                let mut gate = ProcedureGate::new();
                let first = gate.begin(a);
                let second = gate.begin(b);
                assert!(!(first == GateStatus::Allowed && second == GateStatus::Allowed));
            }
        }
    }

    #[test]
    fn alternation_toggles_on_allowed_only() {
        let mut gate = ProcedureGate::new();
        assert_eq!(gate.alternate_kind(), Procedure::Read);
        gate.begin(Procedure::Read);
        assert_eq!(gate.alternate_kind(), Procedure::Write);
        // Busy attempt must not toggle.
        gate.begin(Procedure::Write);
        assert_eq!(gate.alternate_kind(), Procedure::Write);
        gate.complete();
        gate.begin(Procedure::Write);
        assert_eq!(gate.alternate_kind(), Procedure::Read);
    }

    #[test]
    fn abort_restores_alternation() {
        let mut gate = ProcedureGate::new();
        gate.begin(Procedure::Read);
        gate.abort();
        assert!(!gate.is_busy());
        assert_eq!(gate.alternate_kind(), Procedure::Read);
    }

    #[test]
    fn discovery_arming_blocks_reads() {
        let mut gate = ProcedureGate::new();
        gate.arm_for_discovery();
        assert_eq!(gate.in_progress(), Some(Procedure::Discovery));
        assert_eq!(gate.begin(Procedure::Read), GateStatus::Busy);
        gate.reset();
        assert_eq!(gate.begin(Procedure::Read), GateStatus::Allowed);
    }
}
