//! Session configuration.
//!
//! Every field has a default, so a partial JSON document (or none at all) is a
//! valid configuration. Durations are plain millisecond counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Storage key under which the last-known local member is persisted.
pub const LOCAL_MEMBER_KEY: &str = "huddle.local_member";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub presence: PresenceConfig,
    pub voice: VoiceConfig,
    /// Retry policy for opening the voice broadcast channel.
    pub broadcast_retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub rtc: RtcConfig,
    pub storage_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            voice: VoiceConfig::default(),
            broadcast_retry: RetryConfig::default(),
            recovery: RecoveryConfig::default(),
            rtc: RtcConfig::default(),
            storage_key: LOCAL_MEMBER_KEY.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Quiet period after the last local edit before the coalesced write.
    pub quiet_period_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub retry: RetryConfig,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 250,
            heartbeat_interval_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl PresenceConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Bounded exponential backoff: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Voice activity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub poll_interval_ms: u64,
    /// EMA weight of the newest sample.
    pub alpha: f32,
    /// Smoothed level at or above which a participant is speaking.
    pub speaking_threshold: f32,
    /// Lower level that keeps an ongoing "speaking" alive during the debounce.
    pub hold_threshold: f32,
    pub debounce_ms: u64,
    pub microphone: MicrophoneConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            alpha: 0.5,
            speaking_threshold: 0.3,
            hold_threshold: 0.15,
            debounce_ms: 500,
            microphone: MicrophoneConfig::speech(),
        }
    }
}

impl VoiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Capture track settings handed to the RTC transport.
///
/// `Default` is the transport's own default configuration, used as the
/// fallback when a tuned track cannot be created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrophoneConfig {
    pub encoder_profile: Option<String>,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub noise_suppression: bool,
}

impl MicrophoneConfig {
    pub fn speech() -> Self {
        Self {
            encoder_profile: Some("speech_standard".to_string()),
            echo_cancellation: true,
            auto_gain_control: true,
            noise_suppression: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery and RTC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive bad-quality signals before the capture track is rebuilt.
    pub bad_signal_threshold: u32,
    /// Pause between closing the old track and creating the new one.
    pub restart_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            bad_signal_threshold: 3,
            restart_delay_ms: 500,
        }
    }
}

impl RecoveryConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    pub app_id: String,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            app_id: "huddle-dev".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_other_defaults() {
        let json = r#"{"presence": {"quiet_period_ms": 100}, "voice": {"alpha": 0.25}}"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.presence.quiet_period(), Duration::from_millis(100));
        assert_eq!(config.presence.retry.max_attempts, 3);
        assert_eq!(config.voice.alpha, 0.25);
        assert_eq!(config.voice.speaking_threshold, 0.3);
        assert_eq!(config.storage_key, LOCAL_MEMBER_KEY);
    }
}
