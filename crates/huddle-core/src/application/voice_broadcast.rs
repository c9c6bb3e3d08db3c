//! Voice broadcast channel: fan-out of voice-activity records.
//!
//! Outbound records are fire-and-forget. Inbound frames are decoded and
//! merged into the registry's voice overlay; anything undecodable, of another
//! event type, or not strictly newer than what we hold is dropped.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::error::SyncError;
use crate::domain::voice::{BroadcastEnvelope, VoiceActivityRecord};

use super::lock;
use super::ports::{BroadcastCodec, BroadcastTransport, ErrorReporter};
use super::registry::MemberRegistry;
use super::retry::RetryPolicy;

#[derive(Default)]
struct Link {
    room: Option<String>,
    connected: bool,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

pub struct VoiceBroadcastChannel {
    transport: Arc<dyn BroadcastTransport>,
    codec: Arc<dyn BroadcastCodec>,
    registry: Arc<MemberRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    policy: RetryPolicy,
    link: Mutex<Link>,
}

impl VoiceBroadcastChannel {
    pub fn new(
        transport: Arc<dyn BroadcastTransport>,
        codec: Arc<dyn BroadcastCodec>,
        registry: Arc<MemberRegistry>,
        reporter: Arc<dyn ErrorReporter>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            codec,
            registry,
            reporter,
            policy,
            link: Mutex::new(Link::default()),
        })
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.link).connected
    }

    /// Open the room's broadcast channel and start receiving.
    ///
    /// On exhaustion the failure is logged and reported, and the channel
    /// stays disconnected until `connect` is called again.
    pub async fn connect(self: &Arc<Self>, room: &str) -> Result<(), SyncError> {
        let cancel = {
            let mut link = lock(&self.link);
            link.cancel.cancel();
            if let Some(pump) = link.pump.take() {
                pump.abort();
            }
            *link = Link {
                room: Some(room.to_string()),
                ..Link::default()
            };
            link.cancel.clone()
        };

        match self.open(room, &cancel).await {
            Ok(frames) => {
                let pump = tokio::spawn(Arc::clone(self).pump(room.to_string(), frames, cancel));
                let mut link = lock(&self.link);
                link.connected = true;
                link.pump = Some(pump);
                info!(room, "Voice broadcast connected");
                Ok(())
            }
            Err(e) => {
                warn!(room, "Voice broadcast unavailable: {e}");
                self.reporter.report(&e, "voice broadcast connect");
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        room: &str,
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, SyncError> {
        let transport = &self.transport;
        self.policy
            .run("broadcast open", cancel, |_| transport.open(room))
            .await
    }

    async fn pump(
        self: Arc<Self>,
        room: String,
        mut frames: mpsc::UnboundedReceiver<Bytes>,
        cancel: CancellationToken,
    ) {
        loop {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            self.receive(&frame);
                        }
                        None => break,
                    },
                }
            }

            lock(&self.link).connected = false;
            warn!(room = %room, "Voice broadcast stream ended, reconnecting");
            match self.open(&room, &cancel).await {
                Ok(next) => {
                    frames = next;
                    lock(&self.link).connected = true;
                    info!(room = %room, "Voice broadcast reconnected");
                }
                Err(SyncError::Cancelled { .. }) => return,
                Err(e) => {
                    self.reporter.report(&e, "voice broadcast reconnect");
                    return;
                }
            }
        }
    }

    /// Handle one inbound frame. Returns whether it changed the overlay.
    pub fn receive(&self, frame: &[u8]) -> bool {
        let envelope = match self.codec.decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping undecodable broadcast frame: {e:#}");
                return false;
            }
        };
        if !envelope.is_voice_update() {
            trace!(event = %envelope.event, "Ignoring broadcast event");
            return false;
        }
        if self.registry.local_id().as_ref() == Some(&envelope.payload.id) {
            trace!(id = %envelope.payload.id, "Ignoring echoed local voice record");
            return false;
        }
        self.registry.merge_voice(envelope.payload)
    }

    /// Best-effort send. A no-op while disconnected; failures are logged.
    pub async fn send(&self, record: VoiceActivityRecord) {
        if !self.is_connected() {
            return;
        }
        let frame = match self.codec.encode(&BroadcastEnvelope::voice_update(record)) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Could not encode voice record: {e:#}");
                return;
            }
        };
        if let Err(e) = self.transport.send(frame).await {
            debug!("Voice broadcast send failed: {e:#}");
        }
    }

    /// Cancel retries, stop receiving, and close the transport.
    pub async fn disconnect(&self) {
        let link = std::mem::take(&mut *lock(&self.link));
        link.cancel.cancel();
        if let Some(pump) = link.pump {
            pump.abort();
        }
        if link.room.is_some() {
            if let Err(e) = self.transport.close().await {
                debug!("Closing voice broadcast failed: {e:#}");
            }
            info!("Voice broadcast disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::codec::JsonBroadcastCodec;
    use crate::adapters::loopback::{BroadcastHub, LoopbackBroadcast};
    use crate::adapters::reporter::CollectingReporter;
    use crate::domain::member::{Member, MemberId, VoiceStatus};
    use crate::domain::presence::PresenceDelta;

    struct Peer {
        channel: Arc<VoiceBroadcastChannel>,
        registry: Arc<MemberRegistry>,
        transport: Arc<LoopbackBroadcast>,
        reporter: Arc<CollectingReporter>,
    }

    /// A peer whose registry holds itself as the local member and `a` and
    /// `b` as room members.
    fn peer(hub: &Arc<BroadcastHub>, id: &str) -> Peer {
        let registry = Arc::new(MemberRegistry::new());
        registry.establish_local(Member::new(MemberId::new(id), id, 1));
        for other in ["a", "b"].into_iter().filter(|other| *other != id) {
            registry.apply(&PresenceDelta::Join {
                key: other.into(),
                new_records: vec![Member::new(MemberId::new(other), other, 1).to_record()],
            });
        }
        let transport = Arc::new(hub.connect());
        let reporter = Arc::new(CollectingReporter::new());
        let channel = VoiceBroadcastChannel::new(
            transport.clone(),
            Arc::new(JsonBroadcastCodec),
            registry.clone(),
            reporter.clone(),
            RetryPolicy::default(),
        );
        Peer {
            channel,
            registry,
            transport,
            reporter,
        }
    }

    fn record(id: &str, status: VoiceStatus, timestamp: u64) -> VoiceActivityRecord {
        VoiceActivityRecord {
            id: MemberId::new(id),
            level: if status == VoiceStatus::Speaking { 0.6 } else { 0.0 },
            voice_status: status,
            muted: false,
            is_deafened: false,
            transport_session_id: None,
            timestamp,
        }
    }

    fn frame(record: VoiceActivityRecord) -> Vec<u8> {
        serde_json::to_vec(&BroadcastEnvelope::voice_update(record)).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn records_reach_other_peers_overlay() {
        let hub = BroadcastHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        a.channel.connect("main").await.unwrap();
        b.channel.connect("main").await.unwrap();

        a.channel.send(record("a", VoiceStatus::Speaking, 10)).await;
        settle().await;

        assert_eq!(b.registry.voice_level(&MemberId::new("a")), 0.6);
        assert_eq!(a.registry.voice_level(&MemberId::new("a")), 0.0);
    }

    #[test]
    fn stale_and_foreign_frames_are_dropped() {
        let hub = BroadcastHub::new();
        let b = peer(&hub, "b");

        assert!(b.channel.receive(&frame(record("a", VoiceStatus::Speaking, 10))));
        assert!(!b.channel.receive(&frame(record("a", VoiceStatus::Silent, 9))));
        assert!(!b.channel.receive(b"not json"));

        let mut other = BroadcastEnvelope::voice_update(record("a", VoiceStatus::Silent, 20));
        other.event = "chat".into();
        assert!(!b.channel.receive(&serde_json::to_vec(&other).unwrap()));

        assert_eq!(b.registry.voice_level(&MemberId::new("a")), 0.6);
    }

    #[test]
    fn records_about_self_or_strangers_are_dropped() {
        let hub = BroadcastHub::new();
        let b = peer(&hub, "b");

        assert!(!b.channel.receive(&frame(record("b", VoiceStatus::Speaking, 10))));
        assert!(!b.channel.receive(&frame(record("ghost", VoiceStatus::Speaking, 10))));

        assert_eq!(b.registry.voice_level(&MemberId::new("b")), 0.0);
        assert_eq!(b.registry.voice_level(&MemberId::new("ghost")), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_connect_stays_disconnected() {
        let hub = BroadcastHub::new();
        let a = peer(&hub, "a");
        a.transport.fail_next_opens(3);

        let err = a.channel.connect("main").await.unwrap_err();

        assert!(matches!(err, SyncError::RetriesExhausted { op: "broadcast open", .. }));
        assert!(!a.channel.is_connected());
        assert_eq!(a.reporter.contexts(), vec!["voice broadcast connect".to_string()]);

        a.channel.send(record("a", VoiceStatus::Speaking, 1)).await;
        assert_eq!(a.transport.sent(), 0);

        a.channel.connect("main").await.unwrap();
        assert!(a.channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn severed_stream_is_reopened() {
        let hub = BroadcastHub::new();
        let a = peer(&hub, "a");
        a.channel.connect("main").await.unwrap();

        hub.sever("main");
        settle().await;

        assert_eq!(a.transport.opens(), 2);
        assert!(a.channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_sending_and_receiving() {
        let hub = BroadcastHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        a.channel.connect("main").await.unwrap();
        b.channel.connect("main").await.unwrap();

        b.channel.disconnect().await;
        a.channel.send(record("a", VoiceStatus::Speaking, 10)).await;
        b.channel.send(record("b", VoiceStatus::Speaking, 10)).await;
        settle().await;

        assert!(!b.channel.is_connected());
        assert_eq!(b.registry.voice_level(&MemberId::new("a")), 0.0);
        assert_eq!(b.transport.sent(), 0);
    }
}
