//! Member identity, presence records, and partial local edits.
//!
//! Pure data, no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers and enums
// ---------------------------------------------------------------------------

/// Stable participant identifier (survives reconnects and tab reloads).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discrete voice indicator shown next to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceStatus {
    #[default]
    Silent,
    Speaking,
    Muted,
    Deafened,
    Reconnecting,
    Error,
}

impl VoiceStatus {
    /// Statuses that are set by the session rather than derived from audio
    /// levels. The classifier holds them instead of measuring.
    pub fn is_pinned(self) -> bool {
        matches!(self, Self::Reconnecting | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Active,
    Left,
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

/// One participant as seen by the local registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Free-form status label ("playing X", "afk", ...).
    #[serde(default)]
    pub game: Option<String>,
    #[serde(default)]
    pub voice_status: VoiceStatus,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub is_deafened: bool,
    /// RTC uid, present only while connected to the RTC transport.
    #[serde(default)]
    pub transport_session_id: Option<u32>,
    /// Smoothed amplitude 0..1. View-only: filled from the voice overlay.
    #[serde(default)]
    pub level: f32,
    pub created_at: u64,
    pub last_seen: u64,
    #[serde(default)]
    pub status: MemberStatus,
}

impl Member {
    pub fn new(id: MemberId, name: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id,
            name: name.into(),
            avatar: None,
            game: None,
            voice_status: VoiceStatus::Silent,
            muted: false,
            is_deafened: false,
            transport_session_id: None,
            level: 0.0,
            created_at: now_ms,
            last_seen: now_ms,
            status: MemberStatus::Active,
        }
    }

    /// Reset every voice-related field to its silent/unmuted default.
    pub fn reset_voice(&mut self) {
        self.voice_status = VoiceStatus::Silent;
        self.muted = false;
        self.is_deafened = false;
        self.level = 0.0;
    }

    /// The record written to the presence transport for this member.
    pub fn to_record(&self) -> PresenceRecord {
        PresenceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            game: self.game.clone(),
            voice_status: Some(self.voice_status),
            muted: Some(self.muted),
            is_deafened: Some(self.is_deafened),
            transport_session_id: self.transport_session_id,
            created_at: self.created_at,
            last_seen: self.last_seen,
            status: self.status,
        }
    }

    /// Take the social fields from a presence record, leaving voice fields
    /// untouched. `last_seen` never moves backwards.
    pub(crate) fn merge_social(&mut self, record: &PresenceRecord) {
        self.name = record.name.clone();
        self.avatar = record.avatar.clone();
        self.game = record.game.clone();
        self.status = record.status;
        if self.created_at == 0 {
            self.created_at = record.created_at;
        }
        self.last_seen = self.last_seen.max(record.last_seen);
    }
}

// ---------------------------------------------------------------------------
// Presence record (wire form)
// ---------------------------------------------------------------------------

/// Raw record as tracked on the presence transport.
///
/// Voice fields are optional: records written by older clients omit them, and
/// a missing field must not overwrite a known value with a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: MemberId,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub game: Option<String>,
    #[serde(default)]
    pub voice_status: Option<VoiceStatus>,
    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub is_deafened: Option<bool>,
    #[serde(default)]
    pub transport_session_id: Option<u32>,
    #[serde(default)]
    pub created_at: u64,
    pub last_seen: u64,
    #[serde(default)]
    pub status: MemberStatus,
}

impl PresenceRecord {
    /// Build a fresh member from this record, keeping optional fields when
    /// present and defaulting the rest.
    pub fn to_member(&self) -> Member {
        self.to_member_over(None)
    }

    /// Like [`to_member`](Self::to_member), but optional fields this record
    /// omits fall back to `previous` instead of the defaults.
    pub fn to_member_over(&self, previous: Option<&Member>) -> Member {
        Member {
            id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            game: self.game.clone(),
            voice_status: self
                .voice_status
                .or(previous.map(|p| p.voice_status))
                .unwrap_or_default(),
            muted: self.muted.or(previous.map(|p| p.muted)).unwrap_or(false),
            is_deafened: self
                .is_deafened
                .or(previous.map(|p| p.is_deafened))
                .unwrap_or(false),
            transport_session_id: self
                .transport_session_id
                .or(previous.and_then(|p| p.transport_session_id)),
            level: 0.0,
            created_at: self.created_at,
            last_seen: self.last_seen,
            status: self.status,
        }
    }

    pub fn has_left(&self) -> bool {
        self.status == MemberStatus::Left
    }
}

/// Pick the freshest record out of the duplicates reported for one key
/// (several tabs, or stale records from a reconnect).
pub fn freshest(records: &[PresenceRecord]) -> Option<&PresenceRecord> {
    records.iter().max_by_key(|r| r.last_seen)
}

// ---------------------------------------------------------------------------
// Partial local edits
// ---------------------------------------------------------------------------

/// A partial update of the local member. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberPatch {
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub game: Option<String>,
    pub voice_status: Option<VoiceStatus>,
    pub muted: Option<bool>,
    pub is_deafened: Option<bool>,
    /// `Some(None)` clears the RTC uid.
    pub transport_session_id: Option<Option<u32>>,
    pub status: Option<MemberStatus>,
}

impl MemberPatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn voice_status(status: VoiceStatus) -> Self {
        Self {
            voice_status: Some(status),
            ..Self::default()
        }
    }

    /// Mute state plus the matching indicator.
    pub fn muted(muted: bool) -> Self {
        Self {
            muted: Some(muted),
            voice_status: Some(if muted {
                VoiceStatus::Muted
            } else {
                VoiceStatus::Silent
            }),
            ..Self::default()
        }
    }

    pub fn deafened(deafened: bool) -> Self {
        Self {
            is_deafened: Some(deafened),
            voice_status: Some(if deafened {
                VoiceStatus::Deafened
            } else {
                VoiceStatus::Silent
            }),
            ..Self::default()
        }
    }

    /// The terminal edit written when the local member leaves the room.
    pub fn departed() -> Self {
        Self {
            voice_status: Some(VoiceStatus::Silent),
            muted: Some(false),
            is_deafened: Some(false),
            transport_session_id: Some(None),
            status: Some(MemberStatus::Left),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold a later edit into this one. Fields set in `later` win.
    pub fn merge(&mut self, later: MemberPatch) {
        if later.name.is_some() {
            self.name = later.name;
        }
        if later.avatar.is_some() {
            self.avatar = later.avatar;
        }
        if later.game.is_some() {
            self.game = later.game;
        }
        if later.voice_status.is_some() {
            self.voice_status = later.voice_status;
        }
        if later.muted.is_some() {
            self.muted = later.muted;
        }
        if later.is_deafened.is_some() {
            self.is_deafened = later.is_deafened;
        }
        if later.transport_session_id.is_some() {
            self.transport_session_id = later.transport_session_id;
        }
        if later.status.is_some() {
            self.status = later.status;
        }
    }

    pub fn apply_to(&self, member: &mut Member) {
        if let Some(name) = &self.name {
            member.name = name.clone();
        }
        if let Some(avatar) = &self.avatar {
            member.avatar = Some(avatar.clone());
        }
        if let Some(game) = &self.game {
            member.game = Some(game.clone());
        }
        if let Some(status) = self.voice_status {
            member.voice_status = status;
        }
        if let Some(muted) = self.muted {
            member.muted = muted;
        }
        if let Some(deafened) = self.is_deafened {
            member.is_deafened = deafened;
        }
        if let Some(uid) = self.transport_session_id {
            member.transport_session_id = uid;
        }
        if let Some(status) = self.status {
            member.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, last_seen: u64) -> PresenceRecord {
        Member::new(MemberId::new(id), id, last_seen).to_record()
    }

    #[test]
    fn freshest_prefers_greatest_last_seen() {
        let records = vec![record("b", 10), record("b", 30), record("b", 20)];
        assert_eq!(freshest(&records).map(|r| r.last_seen), Some(30));
        assert!(freshest(&[]).is_none());
    }

    #[test]
    fn later_patch_fields_overwrite_earlier_ones() {
        let mut patch = MemberPatch::name("first");
        patch.merge(MemberPatch {
            game: Some("chess".into()),
            ..MemberPatch::default()
        });
        patch.merge(MemberPatch::name("second"));

        assert_eq!(patch.name.as_deref(), Some("second"));
        assert_eq!(patch.game.as_deref(), Some("chess"));
        assert!(patch.muted.is_none());
    }

    #[test]
    fn departed_patch_resets_voice_and_marks_left() {
        let mut member = Member::new(MemberId::new("a"), "A", 1);
        member.muted = true;
        member.voice_status = VoiceStatus::Speaking;
        member.transport_session_id = Some(42);

        MemberPatch::departed().apply_to(&mut member);

        assert_eq!(member.status, MemberStatus::Left);
        assert_eq!(member.voice_status, VoiceStatus::Silent);
        assert!(!member.muted);
        assert_eq!(member.transport_session_id, None);
    }

    #[test]
    fn record_without_voice_fields_defaults_them() {
        let json = r#"{"id":"c","name":"C","last_seen":5}"#;
        let record: PresenceRecord = serde_json::from_str(json).unwrap();
        let member = record.to_member();
        assert_eq!(member.voice_status, VoiceStatus::Silent);
        assert!(!member.muted);
        assert_eq!(member.status, MemberStatus::Active);
    }
}
