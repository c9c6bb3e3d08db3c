//! Presence channel: keeps the local member tracked in a room and feeds
//! everyone else's presence into the update queue.
//!
//! ```text
//! Idle -> Connecting -> Joined -> Leaving -> Idle
//!            \            \
//!             +------------+--> Error   (event stream ended unexpectedly)
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::config::PresenceConfig;
use crate::domain::error::SyncError;
use crate::domain::member::{Member, MemberPatch, MemberStatus};
use crate::domain::presence::PresenceDelta;

use super::clock::MonotonicClock;
use super::coalesce::{CoalescingBuffer, FlushFn, FlushFuture};
use super::lock;
use super::ports::{ErrorReporter, PresenceTransport};
use super::retry::RetryPolicy;
use super::update_queue::{LocalWrite, UpdateQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Idle,
    Connecting,
    Joined,
    Leaving,
    Error,
}

/// State shared with the background tasks and the coalescing buffer.
struct Shared {
    transport: Arc<dyn PresenceTransport>,
    queue: UpdateQueue,
    clock: Arc<MonotonicClock>,
    reporter: Arc<dyn ErrorReporter>,
    policy: RetryPolicy,
    state: watch::Sender<PresenceState>,
    /// Cancels retry loops and the heartbeat of the current membership.
    writes: Mutex<CancellationToken>,
}

impl Shared {
    fn set_state(&self, next: PresenceState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(?prev, ?next, "Presence state changed");
        }
    }

    fn write_scope(&self) -> CancellationToken {
        lock(&self.writes).clone()
    }

    async fn track(&self, member: &Member, cancel: &CancellationToken) -> Result<(), SyncError> {
        let record = member.to_record();
        self.policy
            .run("presence track", cancel, |_| self.transport.track(record.clone()))
            .await
    }
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct PresenceChannel {
    shared: Arc<Shared>,
    buffer: Arc<CoalescingBuffer>,
    heartbeat_interval: Duration,
    tasks: Mutex<Tasks>,
    /// Serializes join and leave.
    lifecycle: tokio::sync::Mutex<()>,
}

impl PresenceChannel {
    pub fn new(
        transport: Arc<dyn PresenceTransport>,
        queue: UpdateQueue,
        clock: Arc<MonotonicClock>,
        reporter: Arc<dyn ErrorReporter>,
        config: &PresenceConfig,
    ) -> Self {
        let (state, _) = watch::channel(PresenceState::Idle);
        let shared = Arc::new(Shared {
            transport,
            queue,
            clock,
            reporter,
            policy: config.retry.into(),
            state,
            writes: Mutex::new(CancellationToken::new()),
        });

        let flush_shared = Arc::clone(&shared);
        let flush: FlushFn = Arc::new(move |patch: MemberPatch| -> FlushFuture {
            Box::pin(flush_patch(Arc::clone(&flush_shared), patch))
        });

        Self {
            buffer: CoalescingBuffer::new(config.quiet_period(), flush),
            shared,
            heartbeat_interval: config.heartbeat_interval(),
            tasks: Mutex::new(Tasks::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> PresenceState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PresenceState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to `room`, track `member`, and start forwarding presence.
    ///
    /// On failure every partial step is undone, the channel is back in
    /// `Idle`, and the error has already been reported.
    pub async fn join(&self, room: &str, member: Member) -> Result<(), SyncError> {
        let _serial = self.lifecycle.lock().await;
        if !matches!(self.state(), PresenceState::Idle | PresenceState::Error) {
            return Err(SyncError::AlreadyJoined);
        }
        self.stop_tasks();

        let cancel = CancellationToken::new();
        *lock(&self.shared.writes) = cancel.clone();
        self.shared.set_state(PresenceState::Connecting);
        info!(room, id = %member.id, "Joining presence channel");

        match self.connect(room, member, &cancel).await {
            Ok(()) => {
                self.shared.set_state(PresenceState::Joined);
                info!(room, "Presence channel joined");
                Ok(())
            }
            Err(e) => {
                cancel.cancel();
                self.stop_tasks();
                if let Err(cleanup) = self.shared.transport.unsubscribe().await {
                    debug!("Unsubscribe after failed join: {cleanup:#}");
                }
                self.shared.set_state(PresenceState::Idle);
                self.shared.reporter.report(&e, "presence join");
                Err(e)
            }
        }
    }

    async fn connect(
        &self,
        room: &str,
        mut member: Member,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let key = member.id.clone();
        let transport = &self.shared.transport;
        let deltas = self
            .shared
            .policy
            .run("presence subscribe", cancel, |_| transport.subscribe(room, &key))
            .await?;
        lock(&self.tasks).pump = Some(tokio::spawn(pump(Arc::clone(&self.shared), deltas)));

        member.status = MemberStatus::Active;
        member.last_seen = member.last_seen.max(self.shared.clock.now_ms());
        self.shared.track(&member, cancel).await?;

        self.shared
            .queue
            .local(LocalWrite::Establish(member))
            .await?;

        lock(&self.tasks).heartbeat = Some(tokio::spawn(heartbeat(
            Arc::clone(&self.shared),
            self.heartbeat_interval,
            cancel.clone(),
        )));
        Ok(())
    }

    /// Queue a partial edit of the local member. Edits within one quiet
    /// period are written together; the result is that write's outcome.
    pub async fn update_presence(&self, patch: MemberPatch) -> Result<(), SyncError> {
        if self.state() != PresenceState::Joined {
            return Err(SyncError::NotJoined);
        }
        if patch.is_empty() {
            return Ok(());
        }
        self.buffer
            .accumulate(patch)
            .await
            .unwrap_or(Err(SyncError::Cancelled {
                op: "presence update",
            }))
    }

    /// Cancel the coalescing timer, every retry loop and the heartbeat.
    /// Safe to call any number of times.
    pub fn halt_local_writes(&self) {
        self.buffer.cancel();
        self.shared.write_scope().cancel();
        if let Some(heartbeat) = lock(&self.tasks).heartbeat.take() {
            heartbeat.abort();
        }
    }

    /// Mark the local member as departed, withdraw it, and tear the channel
    /// down. Cleanup always runs to completion; the first failure is
    /// returned afterwards.
    pub async fn leave(&self) -> Result<(), SyncError> {
        let _serial = self.lifecycle.lock().await;
        if self.state() == PresenceState::Idle {
            return Ok(());
        }
        self.shared.set_state(PresenceState::Leaving);
        self.halt_local_writes();

        let mut first_error: Option<SyncError> = None;
        let mut note = |result: Result<(), SyncError>| {
            if let Err(e) = result {
                warn!("Presence teardown step failed: {e}");
                first_error.get_or_insert(e);
            }
        };

        let departed = self
            .shared
            .queue
            .local(LocalWrite::Patch {
                patch: MemberPatch::departed(),
                now_ms: self.shared.clock.now_ms(),
            })
            .await;
        match departed {
            Ok(Some(member)) => {
                // Fresh scope: the membership's own scope is already cancelled.
                note(self.shared.track(&member, &CancellationToken::new()).await);
            }
            Ok(None) => {}
            Err(e) => note(Err(e)),
        }

        note(
            self.shared
                .transport
                .untrack()
                .await
                .map_err(|e| SyncError::Transport(format!("untrack: {e:#}"))),
        );
        note(
            self.shared
                .transport
                .unsubscribe()
                .await
                .map_err(|e| SyncError::Transport(format!("unsubscribe: {e:#}"))),
        );
        // Wait for the pump to stop so nothing it forwarded lands after the clear.
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in [tasks.pump, tasks.heartbeat].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }
        note(self.shared.queue.local(LocalWrite::Clear).await.map(drop));

        self.shared.set_state(PresenceState::Idle);
        info!("Presence channel left");
        match first_error {
            Some(e) => {
                self.shared.reporter.report(&e, "presence leave");
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn stop_tasks(&self) {
        let mut tasks = lock(&self.tasks);
        for task in [tasks.pump.take(), tasks.heartbeat.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl Drop for PresenceChannel {
    fn drop(&mut self) {
        self.halt_local_writes();
        self.stop_tasks();
    }
}

/// Forward inbound deltas to the update queue until the stream ends.
async fn pump(shared: Arc<Shared>, mut deltas: mpsc::UnboundedReceiver<PresenceDelta>) {
    while let Some(delta) = deltas.recv().await {
        shared.queue.enqueue(delta);
    }
    let state = *shared.state.borrow();
    if matches!(state, PresenceState::Connecting | PresenceState::Joined) {
        warn!(?state, "Presence event stream ended unexpectedly");
        shared.set_state(PresenceState::Error);
        shared.reporter.report(
            &SyncError::Transport("presence event stream ended".into()),
            "presence pump",
        );
    }
}

/// Re-track the local record with a fresh `last_seen` every `period`.
/// One attempt per beat; failures are reported and otherwise ignored.
async fn heartbeat(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let refreshed = shared
            .queue
            .local(LocalWrite::Patch {
                patch: MemberPatch::default(),
                now_ms: shared.clock.now_ms(),
            })
            .await;
        let member = match refreshed {
            Ok(Some(member)) => member,
            Ok(None) => continue,
            Err(_) => break,
        };
        if let Err(e) = shared.transport.track(member.to_record()).await {
            warn!("Presence heartbeat failed: {e:#}");
            shared.reporter.report(
                &SyncError::Transport(format!("heartbeat: {e:#}")),
                "presence heartbeat",
            );
        }
    }
    debug!("Presence heartbeat stopped");
}

/// Write the local record with a coalesced patch applied, and keep the
/// patch locally only once the write went through. On failure the patch is
/// discarded.
async fn flush_patch(shared: Arc<Shared>, patch: MemberPatch) -> Result<(), SyncError> {
    let cancel = shared.write_scope();
    let now_ms = shared.clock.now_ms();
    let candidate = shared
        .queue
        .preview(patch.clone(), now_ms)
        .await?
        .ok_or(SyncError::NotJoined)?;

    if let Err(e) = shared.track(&candidate, &cancel).await {
        debug!("Discarding coalesced presence patch");
        shared.reporter.report(&e, "presence update");
        return Err(e);
    }
    shared
        .queue
        .local(LocalWrite::Patch { patch, now_ms })
        .await?;
    Ok(())
}
