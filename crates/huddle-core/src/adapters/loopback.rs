//! In-process presence and broadcast transports.
//!
//! A hub stands in for the realtime service; every connection made from it
//! behaves like one client tab. Used by the simulator and by tests, with
//! counters and fault injection for the failure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::application::lock;
use crate::application::ports::{BroadcastTransport, PresenceTransport};
use crate::domain::member::{MemberId, PresenceRecord};
use crate::domain::presence::{PresenceDelta, PresenceSnapshot};

/// Consume one injected failure, if any are left.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PresenceRoom {
    /// Tracked record per connection, with the key it was tracked under.
    tracked: BTreeMap<u64, (String, PresenceRecord)>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<PresenceDelta>>,
}

impl PresenceRoom {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        for (key, record) in self.tracked.values() {
            snapshot.entry(key.clone()).or_default().push(record.clone());
        }
        snapshot
    }

    fn publish(&mut self, delta: PresenceDelta) {
        let sync = PresenceDelta::Sync(self.snapshot());
        self.subscribers
            .retain(|_, tx| tx.send(delta.clone()).is_ok() && tx.send(sync.clone()).is_ok());
    }
}

/// Shared presence state for every connection in the process.
#[derive(Default)]
pub struct PresenceHub {
    next_conn: AtomicU64,
    rooms: Mutex<HashMap<String, PresenceRoom>>,
}

impl PresenceHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new client connection to this hub.
    pub fn connect(self: &Arc<Self>) -> LoopbackPresence {
        LoopbackPresence {
            hub: Arc::clone(self),
            conn: self.next_conn.fetch_add(1, Ordering::Relaxed),
            joined: Mutex::new(None),
            subscribe_faults: AtomicU32::new(0),
            track_faults: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Current presence state of a room.
    pub fn snapshot(&self, room: &str) -> PresenceSnapshot {
        lock(&self.rooms)
            .get(room)
            .map(PresenceRoom::snapshot)
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, room: &str) -> usize {
        lock(&self.rooms)
            .get(room)
            .map_or(0, |room| room.subscribers.len())
    }

    /// End every subscription in the room, as a server restart would.
    pub fn drop_subscribers(&self, room: &str) {
        if let Some(room) = lock(&self.rooms).get_mut(room) {
            room.subscribers.clear();
        }
    }

    /// Deliver a delta to every subscriber as if another client caused it.
    pub fn inject(&self, room: &str, delta: PresenceDelta) {
        if let Some(room) = lock(&self.rooms).get_mut(room) {
            room.subscribers.retain(|_, tx| tx.send(delta.clone()).is_ok());
        }
    }
}

/// One client's view of the [`PresenceHub`].
pub struct LoopbackPresence {
    hub: Arc<PresenceHub>,
    conn: u64,
    joined: Mutex<Option<(String, MemberId)>>,
    subscribe_faults: AtomicU32,
    track_faults: AtomicU32,
    writes: Mutex<Vec<PresenceRecord>>,
}

impl LoopbackPresence {
    pub fn fail_next_subscribes(&self, n: u32) {
        self.subscribe_faults.store(n, Ordering::Release);
    }

    pub fn fail_next_tracks(&self, n: u32) {
        self.track_faults.store(n, Ordering::Release);
    }

    /// Every record successfully written through `track`, oldest first.
    pub fn tracked_writes(&self) -> Vec<PresenceRecord> {
        lock(&self.writes).clone()
    }

    fn room(&self) -> anyhow::Result<(String, MemberId)> {
        lock(&self.joined)
            .clone()
            .ok_or_else(|| anyhow!("presence channel not subscribed"))
    }
}

#[async_trait]
impl PresenceTransport for LoopbackPresence {
    async fn subscribe(
        &self,
        room: &str,
        key: &MemberId,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<PresenceDelta>> {
        if take_fault(&self.subscribe_faults) {
            bail!("presence subscribe timed out");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = lock(&self.hub.rooms);
        let state = rooms.entry(room.to_string()).or_default();
        let _ = tx.send(PresenceDelta::Sync(state.snapshot()));
        state.subscribers.insert(self.conn, tx);
        *lock(&self.joined) = Some((room.to_string(), key.clone()));
        debug!(room, key = %key, conn = self.conn, "Loopback presence subscribed");
        Ok(rx)
    }

    async fn track(&self, record: PresenceRecord) -> anyhow::Result<()> {
        if take_fault(&self.track_faults) {
            bail!("presence track rejected");
        }
        let (room, key) = self.room()?;
        let mut rooms = lock(&self.hub.rooms);
        let state = rooms.entry(room).or_default();
        state
            .tracked
            .insert(self.conn, (key.0.clone(), record.clone()));
        state.publish(PresenceDelta::Join {
            key: key.0,
            new_records: vec![record.clone()],
        });
        trace!(id = %record.id, last_seen = record.last_seen, "Loopback presence tracked");
        lock(&self.writes).push(record);
        Ok(())
    }

    async fn untrack(&self) -> anyhow::Result<()> {
        let (room, _) = self.room()?;
        let mut rooms = lock(&self.hub.rooms);
        let state = rooms.entry(room).or_default();
        if let Some((key, record)) = state.tracked.remove(&self.conn) {
            state.publish(PresenceDelta::Leave {
                key,
                left_records: vec![record],
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> anyhow::Result<()> {
        let Some((room, _)) = lock(&self.joined).take() else {
            return Ok(());
        };
        if let Some(state) = lock(&self.hub.rooms).get_mut(&room) {
            state.subscribers.remove(&self.conn);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Shared broadcast fan-out for every connection in the process.
#[derive(Default)]
pub struct BroadcastHub {
    next_conn: AtomicU64,
    rooms: Mutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<Bytes>>>>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(self: &Arc<Self>) -> LoopbackBroadcast {
        LoopbackBroadcast {
            hub: Arc::clone(self),
            conn: self.next_conn.fetch_add(1, Ordering::Relaxed),
            room: Mutex::new(None),
            open_faults: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            sent: AtomicU32::new(0),
        }
    }

    /// Deliver a raw frame to every open connection in the room.
    pub fn inject(&self, room: &str, frame: Bytes) {
        if let Some(members) = lock(&self.rooms).get_mut(room) {
            members.retain(|_, tx| tx.send(frame.clone()).is_ok());
        }
    }

    /// Close every inbound stream in the room.
    pub fn sever(&self, room: &str) {
        lock(&self.rooms).remove(room);
    }
}

/// One client's connection to the [`BroadcastHub`].
pub struct LoopbackBroadcast {
    hub: Arc<BroadcastHub>,
    conn: u64,
    room: Mutex<Option<String>>,
    open_faults: AtomicU32,
    opens: AtomicU32,
    sent: AtomicU32,
}

impl LoopbackBroadcast {
    pub fn fail_next_opens(&self, n: u32) {
        self.open_faults.store(n, Ordering::Release);
    }

    /// Successful `open` calls so far.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::Acquire)
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BroadcastTransport for LoopbackBroadcast {
    async fn open(&self, room: &str) -> anyhow::Result<mpsc::UnboundedReceiver<Bytes>> {
        if take_fault(&self.open_faults) {
            bail!("broadcast channel refused");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.hub.rooms)
            .entry(room.to_string())
            .or_default()
            .insert(self.conn, tx);
        *lock(&self.room) = Some(room.to_string());
        self.opens.fetch_add(1, Ordering::AcqRel);
        Ok(rx)
    }

    async fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        let room = lock(&self.room)
            .clone()
            .ok_or_else(|| anyhow!("broadcast channel not open"))?;
        if let Some(members) = lock(&self.hub.rooms).get_mut(&room) {
            members.retain(|conn, tx| *conn == self.conn || tx.send(frame.clone()).is_ok());
        }
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(room) = lock(&self.room).take() {
            if let Some(members) = lock(&self.hub.rooms).get_mut(&room) {
                members.remove(&self.conn);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::member::Member;

    fn record(id: &str, last_seen: u64) -> PresenceRecord {
        Member::new(MemberId::new(id), id, last_seen).to_record()
    }

    #[tokio::test]
    async fn track_fans_out_join_then_sync() {
        let hub = PresenceHub::new();
        let a = hub.connect();
        let b = hub.connect();

        let mut a_rx = a.subscribe("main", &MemberId::new("a")).await.unwrap();
        let _b_rx = b.subscribe("main", &MemberId::new("b")).await.unwrap();
        assert_eq!(a_rx.recv().await, Some(PresenceDelta::Sync(PresenceSnapshot::new())));

        b.track(record("b", 1)).await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(PresenceDelta::Join { key, .. }) if key == "b"));
        let Some(PresenceDelta::Sync(snapshot)) = a_rx.recv().await else {
            panic!("expected sync");
        };
        assert_eq!(snapshot["b"].len(), 1);

        b.untrack().await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(PresenceDelta::Leave { .. })));
        assert!(hub.snapshot("main").is_empty());
    }

    #[tokio::test]
    async fn two_tabs_under_one_key_show_up_as_duplicates() {
        let hub = PresenceHub::new();
        let tab1 = hub.connect();
        let tab2 = hub.connect();
        let key = MemberId::new("b");
        let _rx1 = tab1.subscribe("main", &key).await.unwrap();
        let _rx2 = tab2.subscribe("main", &key).await.unwrap();

        tab1.track(record("b", 1)).await.unwrap();
        tab2.track(record("b", 2)).await.unwrap();

        assert_eq!(hub.snapshot("main")["b"].len(), 2);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let hub = PresenceHub::new();
        let conn = hub.connect();
        conn.fail_next_subscribes(1);

        assert!(conn.subscribe("main", &MemberId::new("a")).await.is_err());
        assert!(conn.subscribe("main", &MemberId::new("a")).await.is_ok());

        conn.fail_next_tracks(1);
        assert!(conn.track(record("a", 1)).await.is_err());
        conn.track(record("a", 2)).await.unwrap();
        assert_eq!(conn.tracked_writes().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let hub = BroadcastHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let mut a_rx = a.open("main").await.unwrap();
        let mut b_rx = b.open("main").await.unwrap();

        a.send(Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(b_rx.recv().await.as_deref(), Some(&b"hi"[..]));
        assert!(a_rx.try_recv().is_err());

        hub.sever("main");
        assert!(b_rx.recv().await.is_none());
    }
}
