pub mod ports;

pub mod clock;
pub mod coalesce;
pub mod mute;
pub mod presence;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod session;
pub mod update_queue;
pub mod voice_activity;
pub mod voice_broadcast;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, ignoring poison.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
