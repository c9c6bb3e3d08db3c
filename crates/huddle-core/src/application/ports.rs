//! Port traits (interfaces) that use cases depend on.
//!
//! Adapters implement these traits; use cases never reference a concrete
//! presence service, broadcast service, or RTC SDK.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::domain::config::MicrophoneConfig;
use crate::domain::error::{RtcError, SyncError};
use crate::domain::member::{Member, MemberId, PresenceRecord};
use crate::domain::presence::PresenceDelta;
use crate::domain::voice::BroadcastEnvelope;

// ---------------------------------------------------------------------------
// Presence transport
// ---------------------------------------------------------------------------

/// Durable-ish presence primitive: who is tracked in a room.
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    /// Subscribe to a room's presence under `key`. Resolves once the transport
    /// reports the subscription as live; the receiver yields sync/join/leave
    /// deltas until the subscription ends.
    async fn subscribe(
        &self,
        room: &str,
        key: &MemberId,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<PresenceDelta>>;

    /// Publish (or replace) our tracked record.
    async fn track(&self, record: PresenceRecord) -> anyhow::Result<()>;

    /// Withdraw our tracked record.
    async fn untrack(&self) -> anyhow::Result<()>;

    /// Drop the subscription. The delta receiver terminates afterwards.
    async fn unsubscribe(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Voice broadcast transport + codec
// ---------------------------------------------------------------------------

/// Ephemeral fan-out channel for high-frequency voice-activity frames.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Open the room's broadcast channel. The receiver yields frames sent by
    /// other participants.
    async fn open(&self, room: &str) -> anyhow::Result<mpsc::UnboundedReceiver<Bytes>>;

    /// Best-effort send; no delivery or ordering guarantee.
    async fn send(&self, frame: Bytes) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Encodes / decodes broadcast envelopes to/from bytes (e.g. JSON).
pub trait BroadcastCodec: Send + Sync {
    fn encode(&self, envelope: &BroadcastEnvelope) -> anyhow::Result<Bytes>;
    fn decode(&self, frame: &[u8]) -> anyhow::Result<BroadcastEnvelope>;
}

// ---------------------------------------------------------------------------
// RTC transport (black box)
// ---------------------------------------------------------------------------

/// Opaque identifier of a capture track instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Leave,
    NetworkError,
    TokenExpired,
    Other,
}

/// Quality exception codes reported by the RTC transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    LowInputLevel,
    LowSendBitrate,
    InputLevelRecovered,
    SendBitrateRecovered,
    Other(u32),
}

impl ExceptionCode {
    /// Signals that count toward audio pipeline recovery.
    pub fn is_degradation(self) -> bool {
        matches!(self, Self::LowInputLevel | Self::LowSendBitrate)
    }

    pub fn is_recovery(self) -> bool {
        matches!(self, Self::InputLevelRecovered | Self::SendBitrateRecovered)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RtcEvent {
    UserJoined { uid: u32 },
    UserLeft { uid: u32 },
    UserPublished { uid: u32, media: MediaKind },
    UserUnpublished { uid: u32, media: MediaKind },
    ConnectionStateChange {
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    },
    VolumeIndicator { levels: Vec<(u32, f32)> },
    Exception { code: ExceptionCode },
}

/// Unity capture gain for [`MicrophoneTrack::set_volume`].
pub const DEFAULT_TRACK_VOLUME: u16 = 100;

/// A local microphone capture track owned by the RTC transport.
#[async_trait]
pub trait MicrophoneTrack: Send + Sync {
    fn id(&self) -> TrackId;

    /// Enable/disable capture (mute is `set_enabled(false)`).
    async fn set_enabled(&self, enabled: bool) -> Result<(), RtcError>;

    fn is_enabled(&self) -> bool;

    /// Current input amplitude, 0..1.
    fn volume_level(&self) -> f32;

    /// Capture gain, 0..=1000 (100 is unity).
    fn set_volume(&self, volume: u16);

    fn volume(&self) -> u16;

    /// Release the capture device.
    fn close(&self);
}

#[async_trait]
pub trait RtcTransport: Send + Sync {
    /// Join a voice channel. Returns the uid the transport assigned.
    async fn join(&self, app_id: &str, channel: &str, token: &str, uid: u32)
        -> Result<u32, RtcError>;

    async fn leave(&self) -> Result<(), RtcError>;

    /// Swap the credential of the live connection without rejoining.
    async fn renew_token(&self, token: &str) -> Result<(), RtcError>;

    async fn publish(&self, track: Arc<dyn MicrophoneTrack>) -> Result<(), RtcError>;

    async fn unpublish(&self, track: Arc<dyn MicrophoneTrack>) -> Result<(), RtcError>;

    async fn subscribe(&self, uid: u32, media: MediaKind) -> Result<(), RtcError>;

    async fn create_microphone_track(
        &self,
        config: &MicrophoneConfig,
    ) -> Result<Arc<dyn MicrophoneTrack>, RtcError>;

    /// The capture track the transport is currently sending, if any.
    fn published_track_id(&self) -> Option<TrackId>;

    /// Latest amplitude of every subscribed remote audio stream, by uid.
    fn remote_volume_levels(&self) -> Vec<(u32, f32)>;

    fn events(&self) -> broadcast::Receiver<RtcEvent>;
}

// ---------------------------------------------------------------------------
// Token issuance, local persistence, error reporting
// ---------------------------------------------------------------------------

/// Mints RTC credentials (`POST /token {channelName, uid} -> {token}`).
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, channel: &str, uid: u32) -> anyhow::Result<String>;
}

/// Persists the last-known local member between runs.
pub trait LocalStore: Send + Sync {
    fn load(&self, key: &str) -> anyhow::Result<Option<Member>>;
    fn save(&self, key: &str, member: &Member) -> anyhow::Result<()>;
}

/// External observability sink for caught errors.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &SyncError, context: &str);
}

// ---------------------------------------------------------------------------
// Registry listeners
// ---------------------------------------------------------------------------

/// Receives a full member snapshot after every registry mutation.
pub type MemberListener = Arc<dyn Fn(&[Member]) + Send + Sync>;
