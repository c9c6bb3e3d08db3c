//! Strict FIFO serializer in front of the member registry.
//!
//! Every presence delta and every local write goes through one unbounded
//! channel drained by a single task, so the registry never sees two
//! mutations at once and applies them in arrival order. Each item carries a
//! completion sender that fires once the item has been applied.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::error::SyncError;
use crate::domain::member::{Member, MemberPatch};
use crate::domain::presence::PresenceDelta;

use super::registry::MemberRegistry;

/// A presence delta waiting for the drain, plus its completion signal.
/// The signal carries whether the registry view changed.
pub struct QueuedDelta {
    pub delta: PresenceDelta,
    completion: Option<oneshot::Sender<bool>>,
}

/// Writes that originate locally rather than from the presence transport.
#[derive(Debug, Clone)]
pub enum LocalWrite {
    Establish(Member),
    Patch { patch: MemberPatch, now_ms: u64 },
    Clear,
}

enum Work {
    Remote(QueuedDelta),
    Local(LocalWrite, oneshot::Sender<Option<Member>>),
    Preview(MemberPatch, u64, oneshot::Sender<Option<Member>>),
}

#[derive(Clone)]
pub struct UpdateQueue {
    tx: mpsc::UnboundedSender<Work>,
}

impl UpdateQueue {
    /// Create the queue and spawn its drain task. The task ends once every
    /// `UpdateQueue` clone has been dropped.
    pub fn spawn(registry: Arc<MemberRegistry>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drain(registry, rx));
        (Self { tx }, handle)
    }

    /// Queue a delta without waiting for it.
    pub fn enqueue(&self, delta: PresenceDelta) -> oneshot::Receiver<bool> {
        let (done_tx, done_rx) = oneshot::channel();
        let item = QueuedDelta {
            delta,
            completion: Some(done_tx),
        };
        if self.tx.send(Work::Remote(item)).is_err() {
            debug!("Update queue closed, dropping delta");
        }
        done_rx
    }

    /// Queue a delta and wait until it has been applied.
    pub async fn apply(&self, delta: PresenceDelta) -> Result<bool, SyncError> {
        self.enqueue(delta)
            .await
            .map_err(|_| SyncError::Cancelled { op: "apply" })
    }

    /// Queue a local write and wait for it. `Patch` resolves to the updated
    /// local record; the other writes resolve to `None`.
    pub async fn local(&self, write: LocalWrite) -> Result<Option<Member>, SyncError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Work::Local(write, done_tx))
            .map_err(|_| SyncError::Cancelled { op: "local write" })?;
        done_rx
            .await
            .map_err(|_| SyncError::Cancelled { op: "local write" })
    }

    /// The local record as `patch` would leave it, read in queue order
    /// without changing the registry.
    pub async fn preview(
        &self,
        patch: MemberPatch,
        now_ms: u64,
    ) -> Result<Option<Member>, SyncError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Work::Preview(patch, now_ms, done_tx))
            .map_err(|_| SyncError::Cancelled { op: "local preview" })?;
        done_rx
            .await
            .map_err(|_| SyncError::Cancelled { op: "local preview" })
    }
}

async fn drain(registry: Arc<MemberRegistry>, mut rx: mpsc::UnboundedReceiver<Work>) {
    while let Some(work) = rx.recv().await {
        match work {
            Work::Remote(QueuedDelta { delta, completion }) => {
                let kind = delta.kind();
                let changed = registry.apply(&delta);
                trace!(?kind, changed, "Applied presence delta");
                if let Some(done) = completion {
                    let _ = done.send(changed);
                }
            }
            Work::Local(write, done) => {
                let result = match write {
                    LocalWrite::Establish(member) => {
                        registry.establish_local(member);
                        None
                    }
                    LocalWrite::Patch { patch, now_ms } => registry.local_patch(&patch, now_ms),
                    LocalWrite::Clear => {
                        registry.clear();
                        None
                    }
                };
                let _ = done.send(result);
            }
            Work::Preview(patch, now_ms, done) => {
                let _ = done.send(registry.preview_local(&patch, now_ms));
            }
        }
    }
    debug!("Update queue drained and closed");
}
