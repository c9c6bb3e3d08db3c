//! Optimistic mute toggle.
//!
//! The new mute state is shown immediately and only rolled back if the
//! presence write behind it fails. One toggle may be in flight at a time.

use crate::domain::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutePhase {
    /// Waiting on the write; `previous` is what a rollback restores.
    Pending { previous: bool, requested: bool },
    Committed(bool),
    RolledBack(bool),
}

#[derive(Debug)]
pub struct MuteToggle {
    phase: MutePhase,
}

impl MuteToggle {
    pub fn new(muted: bool) -> Self {
        Self {
            phase: MutePhase::Committed(muted),
        }
    }

    pub fn phase(&self) -> MutePhase {
        self.phase
    }

    /// The state to show right now (the requested one while pending).
    pub fn current(&self) -> bool {
        match self.phase {
            MutePhase::Pending { requested, .. } => requested,
            MutePhase::Committed(muted) | MutePhase::RolledBack(muted) => muted,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.phase, MutePhase::Pending { .. })
    }

    pub fn begin(&mut self, requested: bool) -> Result<(), SyncError> {
        if self.is_pending() {
            return Err(SyncError::MuteInFlight);
        }
        self.phase = MutePhase::Pending {
            previous: self.current(),
            requested,
        };
        Ok(())
    }

    pub fn commit(&mut self) {
        if let MutePhase::Pending { requested, .. } = self.phase {
            self.phase = MutePhase::Committed(requested);
        }
    }

    /// Abandon the pending toggle and return the restored state.
    pub fn roll_back(&mut self) -> bool {
        if let MutePhase::Pending { previous, .. } = self.phase {
            self.phase = MutePhase::RolledBack(previous);
        }
        self.current()
    }

    /// Force a settled state (leave, rejoin).
    pub fn reset(&mut self, muted: bool) {
        self.phase = MutePhase::Committed(muted);
    }
}

impl Default for MuteToggle {
    fn default() -> Self {
        Self::new(false)
    }
}
