//! Producer clock for presence and voice-activity timestamps.
//!
//! Wall-clock milliseconds, but never repeating or going backwards within one
//! process, so "strictly newer" comparisons hold for everything we produce.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch milliseconds, bumped past the previous reading if the
    /// wall clock stalled or stepped back.
    pub fn now_ms(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        wall.max(prev + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_strictly_increase() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now_ms();
        for _ in 0..1_000 {
            let next = clock.now_ms();
            assert!(next > prev);
            prev = next;
        }
    }
}
