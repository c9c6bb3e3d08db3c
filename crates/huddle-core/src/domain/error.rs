//! Error types surfaced by the synchronization engine.

use thiserror::Error;

/// Errors raised by the RTC transport port.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RtcError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("rtc transport error: {0}")]
    Transport(String),
}

/// Broad category of a failure, used when reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccups; retried with bounded backoff.
    Transient,
    /// Microphone denied or missing; needs the user to act.
    Device,
    /// Audio pipeline degradation that self-healing could not fix.
    Degradation,
    /// Caller misuse or a superseded operation.
    Lifecycle,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("{op} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("{op} cancelled")]
    Cancelled { op: &'static str },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not joined to a room")]
    NotJoined,

    #[error("already joined to a room")]
    AlreadyJoined,

    #[error("a mute change is already in flight")]
    MuteInFlight,

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio recovery failed, rejoin required: {0}")]
    RecoveryFailed(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RetriesExhausted { .. } | Self::Transport(_) => ErrorClass::Transient,
            Self::PermissionDenied | Self::Device(_) => ErrorClass::Device,
            Self::RecoveryFailed(_) => ErrorClass::Degradation,
            Self::Cancelled { .. } | Self::NotJoined | Self::AlreadyJoined | Self::MuteInFlight => {
                ErrorClass::Lifecycle
            }
        }
    }
}

impl From<RtcError> for SyncError {
    fn from(err: RtcError) -> Self {
        match err {
            RtcError::PermissionDenied => Self::PermissionDenied,
            RtcError::DeviceUnavailable(msg) => Self::Device(msg),
            RtcError::Transport(msg) => Self::Transport(msg),
        }
    }
}
