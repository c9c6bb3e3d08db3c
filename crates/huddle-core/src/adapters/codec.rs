//! JSON-based [`BroadcastCodec`] implementation.

use bytes::Bytes;

use crate::application::ports::BroadcastCodec;
use crate::domain::voice::BroadcastEnvelope;

/// Encodes / decodes [`BroadcastEnvelope`] as JSON (via `serde_json`).
pub struct JsonBroadcastCodec;

impl BroadcastCodec for JsonBroadcastCodec {
    fn encode(&self, envelope: &BroadcastEnvelope) -> anyhow::Result<Bytes> {
        Ok(serde_json::to_vec(envelope)?.into())
    }

    fn decode(&self, frame: &[u8]) -> anyhow::Result<BroadcastEnvelope> {
        serde_json::from_slice(frame).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::member::{MemberId, VoiceStatus};
    use crate::domain::voice::VoiceActivityRecord;

    #[test]
    fn wire_shape_matches_the_broadcast_envelope() {
        let envelope = BroadcastEnvelope::voice_update(VoiceActivityRecord {
            id: MemberId::new("a"),
            level: 0.5,
            voice_status: VoiceStatus::Speaking,
            muted: false,
            is_deafened: false,
            transport_session_id: Some(9),
            timestamp: 1234,
        });
        let bytes = JsonBroadcastCodec.encode(&envelope).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["type"], "broadcast");
        assert_eq!(json["event"], "voice_update");
        assert_eq!(json["payload"]["voice_status"], "speaking");
        assert_eq!(json["payload"]["timestamp"], 1234);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(JsonBroadcastCodec.decode(b"{not json").is_err());
        assert!(JsonBroadcastCodec
            .decode(br#"{"type":"broadcast","event":"voice_update"}"#)
            .is_err());
    }
}
