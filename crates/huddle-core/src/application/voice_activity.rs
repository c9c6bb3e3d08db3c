//! Voice activity: smoothing, hysteresis and the sampling loop.
//!
//! Raw amplitudes are smoothed with an exponential moving average. A
//! participant starts speaking once the smoothed level reaches the speaking
//! threshold and keeps speaking while it stays above the lower hold threshold,
//! for at most the debounce window after the last loud sample.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain::config::VoiceConfig;
use crate::domain::member::{Member, MemberId, VoiceStatus};
use crate::domain::voice::VoiceActivityRecord;

use super::clock::MonotonicClock;
use super::lock;
use super::ports::RtcTransport;
use super::recovery::MicrophoneSlot;
use super::registry::MemberRegistry;
use super::voice_broadcast::VoiceBroadcastChannel;

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Local switches that override measured audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceFlags {
    pub muted: bool,
    pub deafened: bool,
    /// A status set by the session (reconnecting, error) that holds until
    /// cleared.
    pub pinned: Option<VoiceStatus>,
}

impl VoiceFlags {
    /// Flags as seen on another participant's record.
    pub fn of(member: &Member) -> Self {
        Self {
            muted: member.muted,
            deafened: member.is_deafened,
            pinned: member
                .voice_status
                .is_pinned()
                .then_some(member.voice_status),
        }
    }

    fn forced_status(&self) -> Option<VoiceStatus> {
        if let Some(status) = self.pinned {
            return Some(status);
        }
        if self.deafened {
            return Some(VoiceStatus::Deafened);
        }
        self.muted.then_some(VoiceStatus::Muted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub level: f32,
    pub status: VoiceStatus,
}

#[derive(Debug, Default)]
struct SmoothingState {
    smoothed: f32,
    speaking: bool,
    /// Time of the last sample at or above the speaking threshold.
    last_loud: Option<Instant>,
}

pub struct VoiceActivityClassifier {
    alpha: f32,
    speaking_threshold: f32,
    hold_threshold: f32,
    debounce: Duration,
    states: HashMap<MemberId, SmoothingState>,
}

impl VoiceActivityClassifier {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            alpha: config.alpha.clamp(0.0, 1.0),
            speaking_threshold: config.speaking_threshold,
            hold_threshold: config.hold_threshold.min(config.speaking_threshold),
            debounce: config.debounce(),
            states: HashMap::new(),
        }
    }

    pub fn classify(
        &mut self,
        id: &MemberId,
        raw: f32,
        flags: VoiceFlags,
        now: Instant,
    ) -> Classification {
        let state = self.states.entry(id.clone()).or_default();

        if let Some(status) = flags.forced_status() {
            *state = SmoothingState::default();
            return Classification { level: 0.0, status };
        }

        let raw = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        state.smoothed = state.smoothed * (1.0 - self.alpha) + raw * self.alpha;

        let speaking = if state.smoothed >= self.speaking_threshold {
            state.last_loud = Some(now);
            true
        } else {
            state.speaking
                && state.smoothed >= self.hold_threshold
                && state
                    .last_loud
                    .is_some_and(|t| now.saturating_duration_since(t) < self.debounce)
        };
        state.speaking = speaking;

        Classification {
            level: state.smoothed,
            status: if speaking {
                VoiceStatus::Speaking
            } else {
                VoiceStatus::Silent
            },
        }
    }

    pub fn forget(&mut self, id: &MemberId) {
        self.states.remove(id);
    }

    /// Drop smoothing state for every id not in `keep`.
    pub fn retain(&mut self, keep: &HashSet<MemberId>) {
        self.states.retain(|id, _| keep.contains(id));
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Samples the local capture track and every remote stream on a fixed
/// interval and turns the levels into voice-activity records.
pub struct VoiceActivityMonitor {
    local_id: MemberId,
    /// Our RTC uid, stamped on outgoing records.
    uid: u32,
    registry: Arc<MemberRegistry>,
    rtc: Arc<dyn RtcTransport>,
    microphone: Arc<MicrophoneSlot>,
    broadcast: Arc<VoiceBroadcastChannel>,
    clock: Arc<MonotonicClock>,
    flags: watch::Receiver<VoiceFlags>,
    classifier: Mutex<VoiceActivityClassifier>,
}

impl VoiceActivityMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: MemberId,
        uid: u32,
        registry: Arc<MemberRegistry>,
        rtc: Arc<dyn RtcTransport>,
        microphone: Arc<MicrophoneSlot>,
        broadcast: Arc<VoiceBroadcastChannel>,
        clock: Arc<MonotonicClock>,
        flags: watch::Receiver<VoiceFlags>,
        config: &VoiceConfig,
    ) -> Self {
        Self {
            local_id,
            uid,
            registry,
            rtc,
            microphone,
            broadcast,
            clock,
            flags,
            classifier: Mutex::new(VoiceActivityClassifier::new(config)),
        }
    }

    /// Take one sample of every stream.
    ///
    /// Every classified stream goes to the overlay and out on the broadcast
    /// channel, changed or not. The local record is sent first.
    pub async fn tick(&self) {
        let now = Instant::now();
        let flags = *self.flags.borrow();
        let raw = self
            .microphone
            .current()
            .map_or(0.0, |track| track.volume_level());

        let (local, remotes) = {
            let mut classifier = lock(&self.classifier);
            let local = classifier.classify(&self.local_id, raw, flags, now);

            let mut seen = HashSet::from([self.local_id.clone()]);
            let mut remotes = Vec::new();
            for (uid, level) in self.rtc.remote_volume_levels() {
                let Some(member) = self.registry.by_transport_session(uid) else {
                    trace!(uid, "No member bound to remote stream");
                    continue;
                };
                if member.id == self.local_id {
                    continue;
                }
                let remote = classifier.classify(&member.id, level, VoiceFlags::of(&member), now);
                let record = VoiceActivityRecord {
                    id: member.id.clone(),
                    level: remote.level,
                    voice_status: remote.status,
                    muted: member.muted,
                    is_deafened: member.is_deafened,
                    transport_session_id: Some(uid),
                    timestamp: self.clock.now_ms(),
                };
                self.registry.merge_voice(record.clone());
                remotes.push(record);
                seen.insert(member.id);
            }
            classifier.retain(&seen);
            (local, remotes)
        };

        let record = VoiceActivityRecord {
            id: self.local_id.clone(),
            level: local.level,
            voice_status: local.status,
            muted: flags.muted,
            is_deafened: flags.deafened,
            transport_session_id: Some(self.uid),
            timestamp: self.clock.now_ms(),
        };
        self.registry.merge_voice(record.clone());
        self.broadcast.send(record).await;
        for record in remotes {
            self.broadcast.send(record).await;
        }
    }

    /// Sample every `period` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.tick().await,
                }
            }
            lock(&self.classifier).reset();
            debug!("Voice activity sampling stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::codec::JsonBroadcastCodec;
    use crate::adapters::loopback::BroadcastHub;
    use crate::adapters::reporter::CollectingReporter;
    use crate::adapters::rtc::SimulatedRtc;
    use crate::application::ports::{BroadcastCodec, BroadcastTransport, MediaKind};
    use crate::application::retry::RetryPolicy;
    use crate::domain::config::MicrophoneConfig;
    use crate::domain::presence::PresenceDelta;

    fn classifier() -> VoiceActivityClassifier {
        VoiceActivityClassifier::new(&VoiceConfig::default())
    }

    fn run(
        classifier: &mut VoiceActivityClassifier,
        samples: &[f32],
        flags: VoiceFlags,
    ) -> Vec<VoiceStatus> {
        let id = MemberId::new("a");
        let start = Instant::now();
        samples
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let at = start + Duration::from_millis(100 * i as u64);
                classifier.classify(&id, *raw, flags, at).status
            })
            .collect()
    }

    #[test]
    fn hold_threshold_keeps_speech_alive() {
        let statuses = run(&mut classifier(), &[0.02, 0.6, 0.05], VoiceFlags::default());
        assert_eq!(
            statuses,
            vec![VoiceStatus::Silent, VoiceStatus::Speaking, VoiceStatus::Speaking]
        );
    }

    #[test]
    fn hold_expires_after_the_debounce_window() {
        // Smoothed level: 0.3, 0.25, 0.225, ... stays above the hold threshold.
        let samples = [0.6, 0.2, 0.2, 0.2, 0.2, 0.2, 0.2];
        let statuses = run(&mut classifier(), &samples, VoiceFlags::default());
        assert_eq!(statuses[..5], [VoiceStatus::Speaking; 5]);
        assert_eq!(statuses[5], VoiceStatus::Silent);
        assert_eq!(statuses[6], VoiceStatus::Silent);
    }

    #[test]
    fn quiet_samples_drop_below_hold_immediately() {
        let statuses = run(&mut classifier(), &[0.8, 0.0, 0.0], VoiceFlags::default());
        assert_eq!(
            statuses,
            vec![VoiceStatus::Speaking, VoiceStatus::Speaking, VoiceStatus::Silent]
        );
    }

    #[test]
    fn mute_forces_zero_and_resets_smoothing() {
        let mut c = classifier();
        let id = MemberId::new("a");
        let now = Instant::now();
        c.classify(&id, 1.0, VoiceFlags::default(), now);

        let muted = VoiceFlags {
            muted: true,
            ..VoiceFlags::default()
        };
        let result = c.classify(&id, 1.0, muted, now);
        assert_eq!(result, Classification { level: 0.0, status: VoiceStatus::Muted });

        let deafened = VoiceFlags {
            deafened: true,
            ..muted
        };
        assert_eq!(c.classify(&id, 1.0, deafened, now).status, VoiceStatus::Deafened);

        // Smoothing restarts from zero once unmuted.
        assert_eq!(c.classify(&id, 0.4, VoiceFlags::default(), now).level, 0.2);
    }

    #[test]
    fn pinned_status_wins_and_bad_samples_count_as_silence() {
        let mut c = classifier();
        let id = MemberId::new("a");
        let now = Instant::now();
        let pinned = VoiceFlags {
            pinned: Some(VoiceStatus::Reconnecting),
            ..VoiceFlags::default()
        };
        assert_eq!(c.classify(&id, 0.9, pinned, now).status, VoiceStatus::Reconnecting);

        let result = c.classify(&id, f32::NAN, VoiceFlags::default(), now);
        assert_eq!(result.level, 0.0);
        assert_eq!(c.classify(&id, 7.0, VoiceFlags::default(), now).level, 0.5);
    }

    #[test]
    fn forgotten_ids_start_from_zero() {
        let mut c = classifier();
        let (a, b) = (MemberId::new("a"), MemberId::new("b"));
        let now = Instant::now();
        c.classify(&a, 1.0, VoiceFlags::default(), now);
        c.classify(&b, 1.0, VoiceFlags::default(), now);
        assert_eq!(c.tracked(), 2);

        c.forget(&a);
        assert_eq!(c.tracked(), 1);
        assert_eq!(c.classify(&a, 1.0, VoiceFlags::default(), now).level, 0.5);

        c.retain(&HashSet::from([b.clone()]));
        assert_eq!(c.tracked(), 1);
        assert_eq!(c.classify(&b, 1.0, VoiceFlags::default(), now).level, 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_samples_local_and_remote_streams() {
        let registry = Arc::new(MemberRegistry::new());
        registry.establish_local(Member::new(MemberId::new("a"), "A", 1));
        let mut b = Member::new(MemberId::new("b"), "B", 1);
        b.transport_session_id = Some(2);
        registry.apply(&PresenceDelta::Join {
            key: "b".into(),
            new_records: vec![b.to_record()],
        });

        let rtc = Arc::new(SimulatedRtc::new());
        rtc.join("app", "main", "t", 1).await.unwrap();
        rtc.subscribe(2, MediaKind::Audio).await.unwrap();
        rtc.set_remote_level(2, 0.8);
        rtc.set_remote_level(9, 0.8);
        rtc.set_input_level(0.9);
        let slot = Arc::new(MicrophoneSlot::new());
        slot.replace(Some(
            rtc.create_microphone_track(&MicrophoneConfig::speech())
                .await
                .unwrap(),
        ));

        let hub = BroadcastHub::new();
        let listener = hub.connect();
        let mut inbound = listener.open("main").await.unwrap();
        let broadcast = VoiceBroadcastChannel::new(
            Arc::new(hub.connect()),
            Arc::new(JsonBroadcastCodec),
            registry.clone(),
            Arc::new(CollectingReporter::new()),
            RetryPolicy::default(),
        );
        broadcast.connect("main").await.unwrap();

        let (flags_tx, flags_rx) = watch::channel(VoiceFlags::default());
        let monitor = VoiceActivityMonitor::new(
            MemberId::new("a"),
            1,
            registry.clone(),
            rtc.clone(),
            slot,
            broadcast,
            Arc::new(MonotonicClock::new()),
            flags_rx,
            &VoiceConfig::default(),
        );

        monitor.tick().await;
        let a = registry.get(&MemberId::new("a")).unwrap();
        assert_eq!(a.voice_status, VoiceStatus::Speaking);
        assert_eq!(a.level, 0.45);
        assert_eq!(
            registry.get(&MemberId::new("b")).unwrap().voice_status,
            VoiceStatus::Speaking
        );
        let sent: Vec<_> = std::iter::from_fn(|| inbound.try_recv().ok())
            .map(|frame| JsonBroadcastCodec.decode(&frame).unwrap().payload.id)
            .collect();
        assert_eq!(sent, vec![MemberId::new("a"), MemberId::new("b")]);
        assert_eq!(lock(&monitor.classifier).tracked(), 2);

        flags_tx.send_modify(|f| f.muted = true);
        monitor.tick().await;
        let a = registry.get(&MemberId::new("a")).unwrap();
        assert_eq!(a.voice_status, VoiceStatus::Muted);
        assert!(a.muted);
        assert_eq!(a.level, 0.0);

        // b leaves the room; its smoothing state is dropped.
        registry.apply(&PresenceDelta::Sync(Default::default()));
        monitor.tick().await;
        assert_eq!(lock(&monitor.classifier).tracked(), 1);
        let sent: Vec<_> = std::iter::from_fn(|| inbound.try_recv().ok()).collect();
        assert_eq!(sent.len(), 3);
    }
}
