//! Inbound presence deltas as delivered by the presence transport.

use std::collections::BTreeMap;

use super::member::PresenceRecord;

/// Full presence state: key → every record currently tracked under it.
/// Several records per key are normal (multiple tabs, reconnect leftovers).
pub type PresenceSnapshot = BTreeMap<String, Vec<PresenceRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Sync,
    Join,
    Leave,
}

/// One inbound presence event.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceDelta {
    Sync(PresenceSnapshot),
    Join {
        key: String,
        new_records: Vec<PresenceRecord>,
    },
    Leave {
        key: String,
        left_records: Vec<PresenceRecord>,
    },
}

impl PresenceDelta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Self::Sync(_) => DeltaKind::Sync,
            Self::Join { .. } => DeltaKind::Join,
            Self::Leave { .. } => DeltaKind::Leave,
        }
    }
}
