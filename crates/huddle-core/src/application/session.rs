//! Room session: the composition root.
//!
//! Owns one registry, update queue, presence channel, broadcast channel and
//! recovery controller, and drives the RTC transport for the local
//! participant. Construct one per signed-in user with [`RoomSession::new`].

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::config::SessionConfig;
use crate::domain::error::SyncError;
use crate::domain::member::{Member, MemberId, MemberPatch, MemberStatus, VoiceStatus};

use super::clock::MonotonicClock;
use super::lock;
use super::mute::MuteToggle;
use super::ports::{
    BroadcastCodec, BroadcastTransport, ConnectionState, DisconnectReason, ErrorReporter,
    LocalStore, MediaKind, MemberListener, PresenceTransport, RtcEvent,
    RtcTransport, TokenProvider,
};
use super::presence::{PresenceChannel, PresenceState};
use super::recovery::{AudioContext, AudioRecoveryController, MicrophoneSlot, RecoveryState};
use super::registry::{MemberRegistry, Subscription};
use super::update_queue::UpdateQueue;
use super::voice_activity::{VoiceActivityMonitor, VoiceFlags};
use super::voice_broadcast::VoiceBroadcastChannel;

/// External collaborators of a session.
pub struct SessionDeps {
    pub presence: Arc<dyn PresenceTransport>,
    pub broadcast: Arc<dyn BroadcastTransport>,
    pub codec: Arc<dyn BroadcastCodec>,
    pub rtc: Arc<dyn RtcTransport>,
    pub tokens: Arc<dyn TokenProvider>,
    pub store: Arc<dyn LocalStore>,
    pub reporter: Arc<dyn ErrorReporter>,
}

/// Everything that exists only while the RTC transport is joined.
struct VoiceLink {
    room: String,
    uid: u32,
    monitor: Arc<VoiceActivityMonitor>,
    sampling: CancellationToken,
    sampler: JoinHandle<()>,
    events: JoinHandle<()>,
}

pub struct RoomSession {
    config: SessionConfig,
    registry: Arc<MemberRegistry>,
    presence: PresenceChannel,
    broadcast: Arc<VoiceBroadcastChannel>,
    recovery: AudioRecoveryController,
    microphone: Arc<MicrophoneSlot>,
    rtc: Arc<dyn RtcTransport>,
    tokens: Arc<dyn TokenProvider>,
    store: Arc<dyn LocalStore>,
    reporter: Arc<dyn ErrorReporter>,
    clock: Arc<MonotonicClock>,
    flags: watch::Sender<VoiceFlags>,
    mute: Mutex<MuteToggle>,
    voice: Mutex<Option<VoiceLink>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl RoomSession {
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Arc<Self> {
        let registry = Arc::new(MemberRegistry::new());
        let (queue, _drain) = UpdateQueue::spawn(Arc::clone(&registry));
        let clock = Arc::new(MonotonicClock::new());
        let microphone = Arc::new(MicrophoneSlot::new());

        let presence = PresenceChannel::new(
            deps.presence,
            queue,
            Arc::clone(&clock),
            Arc::clone(&deps.reporter),
            &config.presence,
        );
        let broadcast = VoiceBroadcastChannel::new(
            deps.broadcast,
            deps.codec,
            Arc::clone(&registry),
            Arc::clone(&deps.reporter),
            config.broadcast_retry.into(),
        );
        let recovery = AudioRecoveryController::new(
            Arc::clone(&deps.rtc),
            Arc::clone(&microphone),
            config.voice.microphone.clone(),
            &config.recovery,
        );
        let (flags, _) = watch::channel(VoiceFlags::default());

        Arc::new(Self {
            config,
            registry,
            presence,
            broadcast,
            recovery,
            microphone,
            rtc: deps.rtc,
            tokens: deps.tokens,
            store: deps.store,
            reporter: deps.reporter,
            clock,
            flags,
            mute: Mutex::new(MuteToggle::default()),
            voice: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    // -- Reads --------------------------------------------------------------

    pub fn members(&self) -> Vec<Member> {
        self.registry.list()
    }

    pub fn member(&self, id: &MemberId) -> Option<Member> {
        self.registry.get(id)
    }

    /// The local member as others see it (overlay applied).
    pub fn local_member(&self) -> Option<Member> {
        self.registry.get(&self.registry.local_id()?)
    }

    pub fn subscribe(&self, listener: MemberListener) -> Subscription {
        self.registry.subscribe(listener)
    }

    pub fn presence_state(&self) -> PresenceState {
        self.presence.state()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.mute).current()
    }

    // -- Lifecycle ----------------------------------------------------------

    /// The persisted local member, or a fresh one. Voice fields never
    /// survive a restart.
    pub fn restore_member(&self, id: MemberId, name: &str) -> Member {
        let now = self.clock.now_ms();
        let stored = match self.store.load(&self.config.storage_key) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Could not load the stored member: {e:#}");
                None
            }
        };
        match stored {
            Some(mut member) if member.id == id => {
                member.reset_voice();
                member.transport_session_id = None;
                member.status = MemberStatus::Active;
                member.last_seen = member.last_seen.max(now);
                debug!(id = %member.id, "Restored stored member");
                member
            }
            _ => Member::new(id, name, now),
        }
    }

    /// Join `room` as `member`.
    ///
    /// Presence is required; the broadcast channel is optional. Voice joins
    /// after presence, and a voice failure is returned while presence stays
    /// joined.
    pub async fn join(self: &Arc<Self>, room: &str, member: Member) -> Result<(), SyncError> {
        let _serial = self.lifecycle.lock().await;

        self.presence.join(room, member.clone()).await?;
        self.recovery.reset();
        lock(&self.mute).reset(member.muted);
        self.flags.send_replace(VoiceFlags {
            muted: member.muted,
            deafened: member.is_deafened,
            pinned: None,
        });
        if self.broadcast.connect(room).await.is_err() {
            debug!(room, "Continuing without voice broadcast");
        }

        let voice = self.join_voice(room, &member).await;
        self.persist();
        voice
    }

    async fn join_voice(self: &Arc<Self>, room: &str, member: &Member) -> Result<(), SyncError> {
        // Subscribe first so nothing the transport reports during join is lost.
        let events = self.rtc.events();
        let requested = member.transport_session_id.unwrap_or(0);

        let uid = match self.connect_voice(room, requested, member).await {
            Ok(uid) => uid,
            Err(e) => {
                self.reporter.report(&e, "voice join");
                if e == SyncError::PermissionDenied {
                    self.flags.send_modify(|f| f.pinned = Some(VoiceStatus::Error));
                    let patch = MemberPatch::voice_status(VoiceStatus::Error);
                    if let Err(update) = self.presence.update_presence(patch).await {
                        debug!("Could not publish the voice error: {update}");
                    }
                }
                return Err(e);
            }
        };

        let monitor = Arc::new(VoiceActivityMonitor::new(
            member.id.clone(),
            uid,
            Arc::clone(&self.registry),
            Arc::clone(&self.rtc),
            Arc::clone(&self.microphone),
            Arc::clone(&self.broadcast),
            Arc::clone(&self.clock),
            self.flags.subscribe(),
            &self.config.voice,
        ));
        let sampling = CancellationToken::new();
        let sampler = Arc::clone(&monitor).spawn(self.config.voice.poll_interval(), sampling.clone());
        let events = tokio::spawn(pump_rtc_events(Arc::downgrade(self), events));
        *lock(&self.voice) = Some(VoiceLink {
            room: room.to_string(),
            uid,
            monitor,
            sampling,
            sampler,
            events,
        });
        info!(room, uid, "Voice joined");

        let patch = MemberPatch {
            transport_session_id: Some(Some(uid)),
            ..MemberPatch::default()
        };
        if let Err(e) = self.presence.update_presence(patch).await {
            debug!("Could not publish the RTC uid: {e}");
        }
        Ok(())
    }

    /// Token, RTC join, microphone track, publish. Undoes its own partial
    /// work on failure.
    async fn connect_voice(
        &self,
        room: &str,
        requested: u32,
        member: &Member,
    ) -> Result<u32, SyncError> {
        let token = self
            .tokens
            .fetch_token(room, requested)
            .await
            .map_err(|e| SyncError::Transport(format!("token request: {e:#}")))?;
        let uid = self
            .rtc
            .join(&self.config.rtc.app_id, room, &token, requested)
            .await?;

        let published = async {
            let track = self
                .rtc
                .create_microphone_track(&self.config.voice.microphone)
                .await?;
            self.microphone.replace(Some(Arc::clone(&track)));
            track
                .set_enabled(!(member.muted || member.is_deafened))
                .await?;
            self.rtc.publish(track).await
        }
        .await;

        if let Err(e) = published {
            self.release_microphone(false).await;
            if let Err(leave) = self.rtc.leave().await {
                debug!("RTC leave after failed voice join: {leave}");
            }
            return Err(e.into());
        }
        Ok(uid)
    }

    async fn release_microphone(&self, joined: bool) {
        if let Some(track) = self.microphone.take() {
            if joined {
                if let Err(e) = self.rtc.unpublish(Arc::clone(&track)).await {
                    debug!("Unpublish failed: {e}");
                }
            }
            track.close();
        }
    }

    /// Leave the room.
    ///
    /// Local writes are halted first, then sampling, and only then does the
    /// network teardown start. The first teardown failure is returned after
    /// everything has been released.
    pub async fn leave(&self) -> Result<(), SyncError> {
        let _serial = self.lifecycle.lock().await;

        self.presence.halt_local_writes();

        let voice = lock(&self.voice).take();
        let voice_joined = voice.is_some();
        if let Some(link) = voice {
            link.events.abort();
            link.sampling.cancel();
            // An in-progress tick finishes before the teardown starts.
            if let Err(e) = link.sampler.await {
                debug!("Voice sampler ended abnormally: {e}");
            }
        }

        let mut departed = self.registry.local_record();
        let mut first_error = self.presence.leave().await.err();
        self.broadcast.disconnect().await;

        if voice_joined {
            self.release_microphone(true).await;
            if let Err(e) = self.rtc.leave().await {
                warn!("RTC leave failed: {e}");
                if first_error.is_none() {
                    first_error = Some(e.into());
                }
            }
        }

        self.recovery.reset();
        lock(&self.mute).reset(false);
        self.flags.send_replace(VoiceFlags::default());

        if let Some(member) = departed.as_mut() {
            member.reset_voice();
            member.transport_session_id = None;
            self.save(member);
        }
        info!("Left room");
        first_error.map_or(Ok(()), Err)
    }

    // -- Local edits --------------------------------------------------------

    /// Mute or unmute. Shown immediately, rolled back if the presence write
    /// fails.
    pub async fn set_muted(&self, muted: bool) -> Result<(), SyncError> {
        lock(&self.mute).begin(muted)?;

        match self.apply_mute(muted).await {
            Ok(()) => {
                lock(&self.mute).commit();
                self.persist();
                Ok(())
            }
            Err(e) => {
                let restored = lock(&self.mute).roll_back();
                warn!(muted, "Mute change failed, rolling back: {e}");
                let deafened = self.flags.borrow().deafened;
                self.set_capture(restored, deafened).await;
                self.flags.send_modify(|f| f.muted = restored);
                self.emit_voice_now().await;
                self.reporter.report(&e, "set muted");
                Err(e)
            }
        }
    }

    async fn apply_mute(&self, muted: bool) -> Result<(), SyncError> {
        let deafened = self.flags.borrow().deafened;
        if let Some(track) = self.microphone.current() {
            track.set_enabled(!(muted || deafened)).await?;
        }
        self.flags.send_modify(|f| f.muted = muted);
        self.emit_voice_now().await;
        self.presence.update_presence(MemberPatch::muted(muted)).await
    }

    /// Deafen or undeafen. Deafening also stops capture.
    pub async fn set_deafened(&self, deafened: bool) -> Result<(), SyncError> {
        let previous = self.flags.borrow().deafened;
        let muted = self.is_muted();

        self.set_capture(muted, deafened).await;
        self.flags.send_modify(|f| f.deafened = deafened);
        self.emit_voice_now().await;

        let mut patch = MemberPatch::deafened(deafened);
        if !deafened && muted {
            patch.voice_status = Some(VoiceStatus::Muted);
        }
        if let Err(e) = self.presence.update_presence(patch).await {
            self.set_capture(muted, previous).await;
            self.flags.send_modify(|f| f.deafened = previous);
            self.emit_voice_now().await;
            self.reporter.report(&e, "set deafened");
            return Err(e);
        }
        self.persist();
        Ok(())
    }

    /// Edit name, avatar or status label.
    pub async fn update_profile(&self, patch: MemberPatch) -> Result<(), SyncError> {
        self.presence.update_presence(patch).await?;
        self.persist();
        Ok(())
    }

    async fn set_capture(&self, muted: bool, deafened: bool) {
        if let Some(track) = self.microphone.current() {
            if let Err(e) = track.set_enabled(!(muted || deafened)).await {
                debug!("Could not switch capture: {e}");
            }
        }
    }

    /// Publish the local voice state now instead of on the next tick.
    async fn emit_voice_now(&self) {
        let monitor = lock(&self.voice).as_ref().map(|v| Arc::clone(&v.monitor));
        if let Some(monitor) = monitor {
            monitor.tick().await;
        }
    }

    fn persist(&self) {
        if let Some(member) = self.registry.local_record() {
            self.save(&member);
        }
    }

    fn save(&self, member: &Member) {
        if let Err(e) = self.store.save(&self.config.storage_key, member) {
            warn!("Could not persist the local member: {e:#}");
        }
    }

    // -- RTC events ---------------------------------------------------------

    async fn on_rtc_event(&self, event: RtcEvent) {
        match event {
            RtcEvent::UserPublished {
                uid,
                media: MediaKind::Audio,
            } => {
                if let Err(e) = self.rtc.subscribe(uid, MediaKind::Audio).await {
                    warn!(uid, "Could not subscribe to remote audio: {e}");
                    self.reporter.report(&SyncError::from(e), "rtc subscribe");
                }
            }
            RtcEvent::ConnectionStateChange { state, reason } => {
                self.on_connection_state(state, reason).await
            }
            RtcEvent::Exception { code } => {
                let ctx = {
                    let flags = self.flags.borrow();
                    AudioContext {
                        muted: flags.muted || flags.deafened,
                        joined: lock(&self.voice).is_some(),
                    }
                };
                if let Err(e) = self.recovery.on_exception(code, ctx).await {
                    self.flags.send_modify(|f| f.pinned = Some(VoiceStatus::Error));
                    self.emit_voice_now().await;
                    self.reporter.report(&e, "audio recovery");
                }
            }
            RtcEvent::UserJoined { uid } => debug!(uid, "Remote user joined voice"),
            RtcEvent::UserLeft { uid } => debug!(uid, "Remote user left voice"),
            other => trace!(?other, "Ignoring RTC event"),
        }
    }

    async fn on_connection_state(&self, state: ConnectionState, reason: Option<DisconnectReason>) {
        info!(?state, ?reason, "RTC connection state changed");
        match (state, reason) {
            (ConnectionState::Reconnecting, _) => {
                self.flags
                    .send_modify(|f| f.pinned = Some(VoiceStatus::Reconnecting));
                self.emit_voice_now().await;
            }
            (ConnectionState::Connected, _) => {
                let cleared = self.flags.send_if_modified(|f| {
                    let reconnecting = f.pinned == Some(VoiceStatus::Reconnecting);
                    if reconnecting {
                        f.pinned = None;
                    }
                    reconnecting
                });
                if cleared {
                    self.emit_voice_now().await;
                }
            }
            (ConnectionState::Disconnected, Some(DisconnectReason::TokenExpired)) => {
                if let Err(e) = self.renew_token().await {
                    warn!("Token renewal failed: {e}");
                    self.reporter.report(&e, "token renewal");
                }
            }
            _ => {}
        }
    }

    /// Fetch a fresh credential and swap it into the live connection.
    async fn renew_token(&self) -> Result<(), SyncError> {
        let (room, uid) = lock(&self.voice)
            .as_ref()
            .map(|v| (v.room.clone(), v.uid))
            .ok_or(SyncError::NotJoined)?;
        let token = self
            .tokens
            .fetch_token(&room, uid)
            .await
            .map_err(|e| SyncError::Transport(format!("token request: {e:#}")))?;
        self.rtc.renew_token(&token).await?;
        info!(uid, "RTC token renewed");
        Ok(())
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if let Some(link) = lock(&self.voice).take() {
            link.sampling.cancel();
            link.events.abort();
        }
    }
}

async fn pump_rtc_events(session: Weak<RoomSession>, mut events: broadcast::Receiver<RtcEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "RTC events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        session.on_rtc_event(event).await;
    }
}
