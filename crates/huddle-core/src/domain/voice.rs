//! Voice-activity records and the broadcast envelope that carries them.
//!
//! These travel on the ephemeral broadcast channel, encoded as JSON.

use serde::{Deserialize, Serialize};

use super::member::{MemberId, VoiceStatus};

/// Event name used for voice-activity broadcasts.
pub const VOICE_UPDATE_EVENT: &str = "voice_update";

/// Envelope type tag for broadcast messages.
pub const BROADCAST_KIND: &str = "broadcast";

/// Ephemeral voice state of one participant at one instant.
///
/// Applied whole or not at all: a record replaces the stored one only if its
/// `timestamp` is strictly newer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceActivityRecord {
    pub id: MemberId,
    /// Smoothed amplitude, 0..1.
    pub level: f32,
    pub voice_status: VoiceStatus,
    pub muted: bool,
    pub is_deafened: bool,
    #[serde(default)]
    pub transport_session_id: Option<u32>,
    /// Producer clock, epoch milliseconds, strictly increasing per producer.
    pub timestamp: u64,
}

impl VoiceActivityRecord {
    pub fn supersedes(&self, stored: Option<&VoiceActivityRecord>) -> bool {
        stored.map_or(true, |s| self.timestamp > s.timestamp)
    }
}

/// `{type: "broadcast", event: "voice_update", payload: ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub payload: VoiceActivityRecord,
}

impl BroadcastEnvelope {
    pub fn voice_update(payload: VoiceActivityRecord) -> Self {
        Self {
            kind: BROADCAST_KIND.to_string(),
            event: VOICE_UPDATE_EVENT.to_string(),
            payload,
        }
    }

    pub fn is_voice_update(&self) -> bool {
        self.kind == BROADCAST_KIND && self.event == VOICE_UPDATE_EVENT
    }
}
