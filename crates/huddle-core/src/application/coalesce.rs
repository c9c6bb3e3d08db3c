//! Coalescing of local presence edits.
//!
//! Edits arriving within one quiet period are folded into a single
//! [`PendingPatch`] and written once. Each caller gets a receiver that
//! resolves with the outcome of the write its edit ended up in.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::error::SyncError;
use crate::domain::member::MemberPatch;

use super::lock;

pub type FlushFuture = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send>>;

/// Writes one coalesced patch. Called at most once per quiet period.
pub type FlushFn = Arc<dyn Fn(MemberPatch) -> FlushFuture + Send + Sync>;

pub type FlushReceipt = oneshot::Receiver<Result<(), SyncError>>;

type Waiter = oneshot::Sender<Result<(), SyncError>>;

/// Accumulated edits plus everyone waiting on them.
#[derive(Default)]
pub struct PendingPatch {
    pub patch: MemberPatch,
    waiters: Vec<Waiter>,
}

impl PendingPatch {
    /// Hand the write outcome to every coalesced caller.
    pub fn resolve(self, result: Result<(), SyncError>) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

#[derive(Default)]
struct BufferState {
    pending: Option<PendingPatch>,
    /// Bumped on every re-arm; a timer whose generation is stale does nothing.
    generation: u64,
    armed: Option<JoinHandle<()>>,
    flushing: Vec<JoinHandle<()>>,
}

pub struct CoalescingBuffer {
    quiet: Duration,
    flush: FlushFn,
    state: Mutex<BufferState>,
    /// Serializes writes so a slow flush is never overtaken by a later one.
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl CoalescingBuffer {
    pub fn new(quiet: Duration, flush: FlushFn) -> Arc<Self> {
        Arc::new(Self {
            quiet,
            flush,
            state: Mutex::new(BufferState::default()),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Fold `patch` into the pending edit and restart the quiet timer.
    /// A flush that is already writing is left alone.
    pub fn accumulate(self: &Arc<Self>, patch: MemberPatch) -> FlushReceipt {
        let (tx, rx) = oneshot::channel();
        let mut state = lock(&self.state);

        let pending = state.pending.get_or_insert_with(PendingPatch::default);
        pending.patch.merge(patch);
        pending.waiters.push(tx);
        trace!(waiters = pending.waiters.len(), "Patch accumulated");

        if let Some(timer) = state.armed.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let this = Arc::clone(self);
        state.armed = Some(tokio::spawn(async move {
            tokio::time::sleep(this.quiet).await;
            this.fire(generation).await;
        }));
        rx
    }

    /// Remove the pending edit and disarm the timer without writing.
    pub fn take(&self) -> Option<PendingPatch> {
        let mut state = lock(&self.state);
        if let Some(timer) = state.armed.take() {
            timer.abort();
        }
        state.generation += 1;
        state.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Drop the pending edit, disarm the timer and abort any running flush.
    /// Waiters observe a closed receipt.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        if let Some(timer) = state.armed.take() {
            timer.abort();
        }
        for flush in state.flushing.drain(..) {
            flush.abort();
        }
        state.generation += 1;
        if let Some(pending) = state.pending.take() {
            debug!(waiters = pending.waiters.len(), "Discarding pending patch");
        }
    }

    async fn fire(&self, generation: u64) {
        let pending = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            // This task stops being the armed timer and becomes a flush, so a
            // re-arm from here on cannot abort it.
            if let Some(me) = state.armed.take() {
                state.flushing.retain(|h| !h.is_finished());
                state.flushing.push(me);
            }
            state.pending.take()
        };
        let Some(pending) = pending else {
            return;
        };

        let _serial = self.flush_lock.lock().await;
        let PendingPatch { patch, waiters } = pending;
        debug!(waiters = waiters.len(), "Flushing coalesced patch");
        let result = (self.flush)(patch).await;
        PendingPatch {
            patch: MemberPatch::default(),
            waiters,
        }
        .resolve(result);
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    type Log = Arc<Mutex<Vec<(MemberPatch, Duration)>>>;

    fn recording(delay: Duration, result: Result<(), SyncError>) -> (FlushFn, Log) {
        let log: Log = Arc::default();
        let sink = log.clone();
        let start = Instant::now();
        let flush: FlushFn = Arc::new(move |patch: MemberPatch| -> FlushFuture {
            let sink = sink.clone();
            let result = result.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                lock(&sink).push((patch, start.elapsed()));
                result
            })
        });
        (flush, log)
    }

    const QUIET: Duration = Duration::from_millis(250);

    #[tokio::test(start_paused = true)]
    async fn edits_within_quiet_period_are_written_once() {
        let (flush, log) = recording(Duration::ZERO, Ok(()));
        let buffer = CoalescingBuffer::new(QUIET, flush);

        let first = buffer.accumulate(MemberPatch::name("A"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = buffer.accumulate(MemberPatch {
            game: Some("chess".into()),
            ..MemberPatch::default()
        });

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));

        let log = lock(&log);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0.name.as_deref(), Some("A"));
        assert_eq!(log[0].0.game.as_deref(), Some("chess"));
        assert_eq!(log[0].1, Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_every_coalesced_caller() {
        let err = SyncError::Transport("offline".into());
        let (flush, _log) = recording(Duration::ZERO, Err(err.clone()));
        let buffer = CoalescingBuffer::new(QUIET, flush);

        let a = buffer.accumulate(MemberPatch::name("A"));
        let b = buffer.accumulate(MemberPatch::name("B"));

        assert_eq!(a.await.unwrap(), Err(err.clone()));
        assert_eq!(b.await.unwrap(), Err(err));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_without_writing() {
        let (flush, log) = recording(Duration::ZERO, Ok(()));
        let buffer = CoalescingBuffer::new(QUIET, flush);

        let receipt = buffer.accumulate(MemberPatch::name("A"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        buffer.cancel();

        assert!(receipt.await.is_err());
        tokio::time::sleep(QUIET * 4).await;
        assert!(lock(&log).is_empty());
        assert!(!buffer.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_leaves_a_running_flush_alone() {
        let (flush, log) = recording(Duration::from_millis(400), Ok(()));
        let buffer = CoalescingBuffer::new(QUIET, flush);

        let first = buffer.accumulate(MemberPatch::name("first"));
        // The first flush starts at 250 ms and runs until 650 ms.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = buffer.accumulate(MemberPatch::name("second"));

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));

        let log = lock(&log);
        let names: Vec<_> = log.iter().map(|(p, _)| p.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["first", "second"]);
        // The second write waits for the first to finish.
        assert_eq!(log[1].1, Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn take_disarms_the_timer() {
        let (flush, log) = recording(Duration::ZERO, Ok(()));
        let buffer = CoalescingBuffer::new(QUIET, flush);

        let receipt = buffer.accumulate(MemberPatch::name("A"));
        let pending = buffer.take().unwrap();
        assert_eq!(pending.waiter_count(), 1);
        assert_eq!(pending.patch.name.as_deref(), Some("A"));

        tokio::time::sleep(QUIET * 2).await;
        assert!(lock(&log).is_empty());

        pending.resolve(Ok(()));
        assert_eq!(receipt.await.unwrap(), Ok(()));
    }
}
