//! Simulated RTC transport.
//!
//! - [`SimulatedRtc`]: implements [`RtcTransport`] in process. Input and
//!   remote levels are set by the caller; exceptions and connection changes
//!   are emitted on demand.
//! - [`SimulatedTrack`]: a capture track whose amplitude follows the
//!   transport's simulated microphone input.
//!
//! Failures for `join` and `create_microphone_track` can be queued up front.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::application::lock;
use crate::application::ports::{
    MediaKind, MicrophoneTrack, RtcEvent, RtcTransport, TrackId, DEFAULT_TRACK_VOLUME,
};
use crate::domain::config::MicrophoneConfig;
use crate::domain::error::RtcError;

const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

pub struct SimulatedTrack {
    id: TrackId,
    config: MicrophoneConfig,
    /// Shared with the transport: f32 bits of the simulated input amplitude.
    input: Arc<AtomicU32>,
    enabled: AtomicBool,
    closed: AtomicBool,
    volume: AtomicU16,
}

impl SimulatedTrack {
    pub fn config(&self) -> &MicrophoneConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MicrophoneTrack for SimulatedTrack {
    fn id(&self) -> TrackId {
        self.id
    }

    async fn set_enabled(&self, enabled: bool) -> Result<(), RtcError> {
        if self.is_closed() {
            return Err(RtcError::DeviceUnavailable("track closed".into()));
        }
        self.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn volume_level(&self) -> f32 {
        if self.is_closed() || !self.is_enabled() {
            return 0.0;
        }
        let gain = f32::from(self.volume()) / f32::from(DEFAULT_TRACK_VOLUME);
        (f32::from_bits(self.input.load(Ordering::Acquire)) * gain).clamp(0.0, 1.0)
    }

    fn set_volume(&self, volume: u16) {
        self.volume.store(volume.min(1000), Ordering::Release);
    }

    fn volume(&self) -> u16 {
        self.volume.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RtcState {
    /// `(channel, uid, token)` while joined.
    joined: Option<(String, u32, String)>,
    published: Option<Arc<dyn MicrophoneTrack>>,
    subscribed: Vec<(u32, MediaKind)>,
    remote_levels: BTreeMap<u32, f32>,
    join_faults: VecDeque<RtcError>,
    create_faults: VecDeque<RtcError>,
    created: Vec<MicrophoneConfig>,
    renewals: Vec<String>,
    joins: u32,
}

pub struct SimulatedRtc {
    state: Mutex<RtcState>,
    input: Arc<AtomicU32>,
    next_track: AtomicU64,
    events: broadcast::Sender<RtcEvent>,
}

impl SimulatedRtc {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(RtcState::default()),
            input: Arc::new(AtomicU32::new(0f32.to_bits())),
            next_track: AtomicU64::new(1),
            events,
        }
    }

    /// Amplitude the simulated microphone currently picks up.
    pub fn set_input_level(&self, level: f32) {
        self.input.store(level.to_bits(), Ordering::Release);
    }

    pub fn set_remote_level(&self, uid: u32, level: f32) {
        lock(&self.state).remote_levels.insert(uid, level);
    }

    pub fn emit(&self, event: RtcEvent) {
        // No receivers is fine: nobody has joined yet.
        let _ = self.events.send(event);
    }

    pub fn fail_next_join(&self, err: RtcError) {
        lock(&self.state).join_faults.push_back(err);
    }

    pub fn fail_next_create(&self, err: RtcError) {
        lock(&self.state).create_faults.push_back(err);
    }

    /// Configurations passed to `create_microphone_track`, oldest first.
    pub fn created_configs(&self) -> Vec<MicrophoneConfig> {
        lock(&self.state).created.clone()
    }

    pub fn renewed_tokens(&self) -> Vec<String> {
        lock(&self.state).renewals.clone()
    }

    pub fn joins(&self) -> u32 {
        lock(&self.state).joins
    }

    pub fn is_joined(&self) -> bool {
        lock(&self.state).joined.is_some()
    }

    pub fn current_token(&self) -> Option<String> {
        lock(&self.state).joined.as_ref().map(|(_, _, t)| t.clone())
    }

    pub fn subscriptions(&self) -> Vec<(u32, MediaKind)> {
        lock(&self.state).subscribed.clone()
    }

    pub fn published_track(&self) -> Option<Arc<dyn MicrophoneTrack>> {
        lock(&self.state).published.clone()
    }
}

impl Default for SimulatedRtc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RtcTransport for SimulatedRtc {
    async fn join(
        &self,
        app_id: &str,
        channel: &str,
        token: &str,
        uid: u32,
    ) -> Result<u32, RtcError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.join_faults.pop_front() {
            return Err(err);
        }
        state.joins += 1;
        // uid 0 asks the transport to pick one.
        let uid = if uid == 0 { 1000 + state.joins } else { uid };
        state.joined = Some((channel.to_string(), uid, token.to_string()));
        info!(app_id, channel, uid, "Simulated RTC joined");
        Ok(uid)
    }

    async fn leave(&self) -> Result<(), RtcError> {
        let mut state = lock(&self.state);
        state.joined = None;
        state.published = None;
        state.subscribed.clear();
        Ok(())
    }

    async fn renew_token(&self, token: &str) -> Result<(), RtcError> {
        let mut state = lock(&self.state);
        let Some(joined) = state.joined.as_mut() else {
            return Err(RtcError::Transport("not joined".into()));
        };
        joined.2 = token.to_string();
        state.renewals.push(token.to_string());
        Ok(())
    }

    async fn publish(&self, track: Arc<dyn MicrophoneTrack>) -> Result<(), RtcError> {
        let mut state = lock(&self.state);
        if state.joined.is_none() {
            return Err(RtcError::Transport("publish before join".into()));
        }
        debug!(track = track.id().0, "Simulated RTC published track");
        state.published = Some(track);
        Ok(())
    }

    async fn unpublish(&self, track: Arc<dyn MicrophoneTrack>) -> Result<(), RtcError> {
        let mut state = lock(&self.state);
        if state.published.as_ref().map(|t| t.id()) == Some(track.id()) {
            state.published = None;
        }
        Ok(())
    }

    async fn subscribe(&self, uid: u32, media: MediaKind) -> Result<(), RtcError> {
        let mut state = lock(&self.state);
        if !state.subscribed.contains(&(uid, media)) {
            state.subscribed.push((uid, media));
        }
        Ok(())
    }

    async fn create_microphone_track(
        &self,
        config: &MicrophoneConfig,
    ) -> Result<Arc<dyn MicrophoneTrack>, RtcError> {
        let mut state = lock(&self.state);
        state.created.push(config.clone());
        if let Some(err) = state.create_faults.pop_front() {
            return Err(err);
        }
        Ok(Arc::new(SimulatedTrack {
            id: TrackId(self.next_track.fetch_add(1, Ordering::Relaxed)),
            config: config.clone(),
            input: Arc::clone(&self.input),
            enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            volume: AtomicU16::new(DEFAULT_TRACK_VOLUME),
        }))
    }

    fn published_track_id(&self) -> Option<TrackId> {
        lock(&self.state).published.as_ref().map(|t| t.id())
    }

    fn remote_volume_levels(&self) -> Vec<(u32, f32)> {
        let state = lock(&self.state);
        state
            .remote_levels
            .iter()
            .filter(|(uid, _)| state.subscribed.contains(&(**uid, MediaKind::Audio)))
            .map(|(uid, level)| (*uid, *level))
            .collect()
    }

    fn events(&self) -> broadcast::Receiver<RtcEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn track_level_follows_input_gain_and_mute() {
        let rtc = SimulatedRtc::new();
        let track = rtc
            .create_microphone_track(&MicrophoneConfig::speech())
            .await
            .unwrap();

        rtc.set_input_level(0.4);
        assert_eq!(track.volume_level(), 0.4);

        track.set_volume(200);
        assert_eq!(track.volume_level(), 0.8);

        track.set_enabled(false).await.unwrap();
        assert_eq!(track.volume_level(), 0.0);

        track.close();
        assert!(track.set_enabled(true).await.is_err());
    }

    #[tokio::test]
    async fn publish_requires_join_and_tracks_the_published_id() {
        let rtc = SimulatedRtc::new();
        let track = rtc
            .create_microphone_track(&MicrophoneConfig::default())
            .await
            .unwrap();
        assert!(rtc.publish(track.clone()).await.is_err());

        rtc.join("app", "main", "t1", 7).await.unwrap();
        rtc.publish(track.clone()).await.unwrap();
        assert_eq!(rtc.published_track_id(), Some(track.id()));

        rtc.unpublish(track).await.unwrap();
        assert_eq!(rtc.published_track_id(), None);
    }

    #[tokio::test]
    async fn remote_levels_only_for_subscribed_audio() {
        let rtc = SimulatedRtc::new();
        rtc.join("app", "main", "t1", 1).await.unwrap();
        rtc.set_remote_level(2, 0.5);
        rtc.set_remote_level(3, 0.7);
        rtc.subscribe(2, MediaKind::Audio).await.unwrap();

        assert_eq!(rtc.remote_volume_levels(), vec![(2, 0.5)]);
    }

    #[tokio::test]
    async fn queued_faults_fire_once() {
        let rtc = SimulatedRtc::new();
        rtc.fail_next_create(RtcError::PermissionDenied);

        let first = rtc.create_microphone_track(&MicrophoneConfig::speech()).await;
        assert_eq!(first.err(), Some(RtcError::PermissionDenied));
        assert!(rtc
            .create_microphone_track(&MicrophoneConfig::speech())
            .await
            .is_ok());
        assert_eq!(rtc.created_configs().len(), 2);
    }
}
