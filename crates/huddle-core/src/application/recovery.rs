//! Audio pipeline recovery.
//!
//! The RTC transport reports quality exceptions (low input level, low send
//! bitrate). A run of them while unmuted means the capture pipeline is stuck,
//! so the microphone track is torn down and rebuilt:
//!
//! ```text
//! Healthy -> Degraded -> Recovering -> Healthy
//!                                  \-> Failed   (rejoin required)
//! ```

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::config::{MicrophoneConfig, RecoveryConfig};
use crate::domain::error::{RtcError, SyncError};

use super::lock;
use super::ports::{ExceptionCode, MicrophoneTrack, RtcTransport, TrackId, DEFAULT_TRACK_VOLUME};

// ---------------------------------------------------------------------------
// Microphone slot
// ---------------------------------------------------------------------------

/// The capture track currently in use, shared by the session, the voice
/// activity monitor and the recovery controller.
#[derive(Default)]
pub struct MicrophoneSlot {
    track: RwLock<Option<Arc<dyn MicrophoneTrack>>>,
}

impl MicrophoneSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<dyn MicrophoneTrack>> {
        self.track
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `track`, returning the previous one.
    pub fn replace(
        &self,
        track: Option<Arc<dyn MicrophoneTrack>>,
    ) -> Option<Arc<dyn MicrophoneTrack>> {
        let mut slot = self.track.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, track)
    }

    pub fn take(&self) -> Option<Arc<dyn MicrophoneTrack>> {
        self.replace(None)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Healthy,
    Degraded,
    Recovering,
    Failed,
}

/// What the session knows about the local audio when a signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioContext {
    pub muted: bool,
    /// Whether the RTC transport is joined (the track must be republished).
    pub joined: bool,
}

struct Inner {
    state: RecoveryState,
    bad_signals: u32,
}

pub struct AudioRecoveryController {
    rtc: Arc<dyn RtcTransport>,
    microphone: Arc<MicrophoneSlot>,
    preferred: MicrophoneConfig,
    threshold: u32,
    restart_delay: Duration,
    inner: Mutex<Inner>,
}

impl AudioRecoveryController {
    pub fn new(
        rtc: Arc<dyn RtcTransport>,
        microphone: Arc<MicrophoneSlot>,
        preferred: MicrophoneConfig,
        config: &RecoveryConfig,
    ) -> Self {
        Self {
            rtc,
            microphone,
            preferred,
            threshold: config.bad_signal_threshold.max(1),
            restart_delay: config.restart_delay(),
            inner: Mutex::new(Inner {
                state: RecoveryState::Healthy,
                bad_signals: 0,
            }),
        }
    }

    pub fn state(&self) -> RecoveryState {
        lock(&self.inner).state
    }

    /// Back to `Healthy` with a clean counter (leave, rejoin).
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.state = RecoveryState::Healthy;
        inner.bad_signals = 0;
    }

    /// Feed one quality exception. Rebuilds the track once the threshold is
    /// reached; an error means recovery failed for good.
    pub async fn on_exception(
        &self,
        code: ExceptionCode,
        ctx: AudioContext,
    ) -> Result<(), SyncError> {
        {
            let mut inner = lock(&self.inner);
            if matches!(inner.state, RecoveryState::Recovering | RecoveryState::Failed) {
                return Ok(());
            }
            if ctx.muted || code.is_recovery() {
                inner.bad_signals = 0;
                inner.state = RecoveryState::Healthy;
                return Ok(());
            }
            if !code.is_degradation() {
                return Ok(());
            }
            inner.bad_signals += 1;
            debug!(?code, count = inner.bad_signals, "Audio degradation signal");
            if inner.bad_signals < self.threshold {
                inner.state = RecoveryState::Degraded;
                return Ok(());
            }
            inner.bad_signals = 0;
            inner.state = RecoveryState::Recovering;
        }
        self.recover(ctx).await
    }

    /// Tear down the capture track and build a new one, falling back once to
    /// the transport's default microphone settings.
    pub async fn recover(&self, ctx: AudioContext) -> Result<(), SyncError> {
        lock(&self.inner).state = RecoveryState::Recovering;
        warn!(muted = ctx.muted, joined = ctx.joined, "Rebuilding microphone track");

        let previous = self.microphone.take();
        let volume = previous
            .as_ref()
            .map_or(DEFAULT_TRACK_VOLUME, |t| t.volume());
        if let Some(old) = previous {
            if ctx.joined {
                if let Err(e) = self.rtc.unpublish(Arc::clone(&old)).await {
                    debug!("Unpublishing stale track failed: {e}");
                }
            }
            old.close();
        }

        tokio::time::sleep(self.restart_delay).await;

        let outcome = match self.rebuild(&self.preferred, volume, ctx).await {
            Ok(id) => Ok(id),
            Err(RtcError::PermissionDenied) => Err(SyncError::PermissionDenied),
            Err(first) => {
                warn!("Preferred microphone settings failed ({first}), trying defaults");
                match self.rebuild(&MicrophoneConfig::default(), volume, ctx).await {
                    Ok(id) => Ok(id),
                    Err(RtcError::PermissionDenied) => Err(SyncError::PermissionDenied),
                    Err(second) => Err(SyncError::RecoveryFailed(format!(
                        "{first}; fallback: {second}"
                    ))),
                }
            }
        };

        let mut inner = lock(&self.inner);
        match outcome {
            Ok(id) => {
                inner.state = RecoveryState::Healthy;
                info!(track = id.0, "Microphone track rebuilt");
                Ok(())
            }
            Err(e) => {
                inner.state = RecoveryState::Failed;
                warn!("Audio recovery failed: {e}");
                Err(e)
            }
        }
    }

    async fn rebuild(
        &self,
        config: &MicrophoneConfig,
        volume: u16,
        ctx: AudioContext,
    ) -> Result<TrackId, RtcError> {
        let track = self.rtc.create_microphone_track(config).await?;
        if let Err(e) = self.install(&track, volume, ctx).await {
            track.close();
            return Err(e);
        }
        self.microphone.replace(Some(Arc::clone(&track)));
        Ok(track.id())
    }

    async fn install(
        &self,
        track: &Arc<dyn MicrophoneTrack>,
        volume: u16,
        ctx: AudioContext,
    ) -> Result<(), RtcError> {
        track.set_volume(volume);
        track.set_enabled(!ctx.muted).await?;
        if ctx.joined {
            self.rtc.publish(Arc::clone(track)).await?;
            if self.rtc.published_track_id() != Some(track.id()) {
                return Err(RtcError::Transport(
                    "transport is not sending the rebuilt track".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::adapters::rtc::SimulatedRtc;

    const JOINED: AudioContext = AudioContext {
        muted: false,
        joined: true,
    };

    async fn setup() -> (Arc<SimulatedRtc>, Arc<MicrophoneSlot>, AudioRecoveryController) {
        let rtc = Arc::new(SimulatedRtc::new());
        rtc.join("app", "main", "token", 1).await.unwrap();
        let track = rtc
            .create_microphone_track(&MicrophoneConfig::speech())
            .await
            .unwrap();
        rtc.publish(track.clone()).await.unwrap();
        let slot = Arc::new(MicrophoneSlot::new());
        slot.replace(Some(track));
        let controller = AudioRecoveryController::new(
            rtc.clone(),
            slot.clone(),
            MicrophoneConfig::speech(),
            &RecoveryConfig::default(),
        );
        (rtc, slot, controller)
    }

    async fn signal(controller: &AudioRecoveryController, code: ExceptionCode, n: usize) {
        for _ in 0..n {
            controller.on_exception(code, JOINED).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_rebuilds_and_preserves_volume() {
        let (rtc, slot, controller) = setup().await;
        let original = slot.current().unwrap();
        original.set_volume(250);

        signal(&controller, ExceptionCode::LowInputLevel, 2).await;
        assert_eq!(controller.state(), RecoveryState::Degraded);
        assert_eq!(slot.current().unwrap().id(), original.id());

        let start = Instant::now();
        signal(&controller, ExceptionCode::LowSendBitrate, 1).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));

        let rebuilt = slot.current().unwrap();
        assert_ne!(rebuilt.id(), original.id());
        assert_eq!(rebuilt.volume(), 250);
        assert!(rebuilt.is_enabled());
        assert_eq!(rtc.published_track_id(), Some(rebuilt.id()));
        assert_eq!(controller.state(), RecoveryState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_signal_resets_the_count() {
        let (rtc, _slot, controller) = setup().await;

        signal(&controller, ExceptionCode::LowInputLevel, 2).await;
        signal(&controller, ExceptionCode::InputLevelRecovered, 1).await;
        assert_eq!(controller.state(), RecoveryState::Healthy);
        signal(&controller, ExceptionCode::LowInputLevel, 2).await;

        assert_eq!(controller.state(), RecoveryState::Degraded);
        assert_eq!(rtc.created_configs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn muted_sessions_are_exempt() {
        let (rtc, _slot, controller) = setup().await;
        let muted = AudioContext {
            muted: true,
            joined: true,
        };

        for _ in 0..10 {
            controller
                .on_exception(ExceptionCode::LowInputLevel, muted)
                .await
                .unwrap();
        }

        assert_eq!(controller.state(), RecoveryState::Healthy);
        assert_eq!(rtc.created_configs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_default_settings_once() {
        let (rtc, slot, controller) = setup().await;
        rtc.fail_next_create(RtcError::DeviceUnavailable("busy".into()));

        signal(&controller, ExceptionCode::LowInputLevel, 3).await;

        assert_eq!(
            rtc.created_configs(),
            vec![
                MicrophoneConfig::speech(),
                MicrophoneConfig::speech(),
                MicrophoneConfig::default(),
            ]
        );
        assert_eq!(controller.state(), RecoveryState::Healthy);
        assert_eq!(rtc.published_track_id(), slot.current().map(|t| t.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn double_failure_is_terminal_until_reset() {
        let (rtc, slot, controller) = setup().await;
        rtc.fail_next_create(RtcError::DeviceUnavailable("busy".into()));
        rtc.fail_next_create(RtcError::DeviceUnavailable("still busy".into()));

        signal(&controller, ExceptionCode::LowInputLevel, 2).await;
        let err = controller
            .on_exception(ExceptionCode::LowInputLevel, JOINED)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RecoveryFailed(_)));
        assert_eq!(controller.state(), RecoveryState::Failed);
        assert!(slot.current().is_none());

        signal(&controller, ExceptionCode::LowInputLevel, 5).await;
        assert_eq!(rtc.created_configs().len(), 3);

        controller.reset();
        assert_eq!(controller.state(), RecoveryState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denial_skips_the_fallback() {
        let (rtc, _slot, controller) = setup().await;
        rtc.fail_next_create(RtcError::PermissionDenied);

        signal(&controller, ExceptionCode::LowInputLevel, 2).await;
        let err = controller
            .on_exception(ExceptionCode::LowInputLevel, JOINED)
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::PermissionDenied);
        assert_eq!(controller.state(), RecoveryState::Failed);
        assert_eq!(rtc.created_configs().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn muted_rebuild_keeps_the_track_disabled() {
        let (_rtc, slot, controller) = setup().await;
        controller
            .recover(AudioContext {
                muted: true,
                joined: true,
            })
            .await
            .unwrap();

        assert!(!slot.current().unwrap().is_enabled());
    }
}
