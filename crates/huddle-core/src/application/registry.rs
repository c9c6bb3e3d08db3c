//! The local, authoritative map of who is in the room.
//!
//! Two layers live here:
//! - the **base** map, built from presence deltas and local edits, and
//! - the **voice overlay**, one [`VoiceActivityRecord`] per id, fed by the
//!   voice activity monitor and the broadcast channel.
//!
//! Readers always get the merged view. For each member the voice fields come
//! from whichever layer is newer (`last_seen` vs. overlay `timestamp`), so a
//! record is never merged field by field.
//!
//! Base mutations (`apply`, `establish_local`, `local_patch`, `clear`) are
//! only called from the update queue's drain task.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::domain::member::{freshest, Member, MemberId, MemberPatch, PresenceRecord};
use crate::domain::presence::{PresenceDelta, PresenceSnapshot};
use crate::domain::voice::VoiceActivityRecord;

use super::lock;
use super::ports::MemberListener;

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(u64, MemberListener)>,
}

#[derive(Default)]
struct RegistryState {
    local_id: Option<MemberId>,
    members: BTreeMap<MemberId, Member>,
    overlay: HashMap<MemberId, VoiceActivityRecord>,
}

pub struct MemberRegistry {
    state: Mutex<RegistryState>,
    listeners: Arc<Mutex<ListenerSet>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            listeners: Arc::new(Mutex::new(ListenerSet::default())),
        }
    }

    // -- Mutations ----------------------------------------------------------

    /// Apply one inbound presence delta. Returns whether the view changed.
    pub fn apply(&self, delta: &PresenceDelta) -> bool {
        self.mutate(|state| match delta {
            PresenceDelta::Sync(snapshot) => state.apply_sync(snapshot),
            PresenceDelta::Join { new_records, .. } => state.apply_join(new_records),
            PresenceDelta::Leave { left_records, .. } => state.apply_leave(left_records),
        })
        .1
    }

    /// Install the local member (after our own join-and-track succeeded).
    pub fn establish_local(&self, member: Member) -> bool {
        self.mutate(|state| {
            state.local_id = Some(member.id.clone());
            state.members.insert(member.id.clone(), member);
        })
        .1
    }

    /// Apply a partial edit to the local member and return its updated base
    /// record, or `None` when no local member is established.
    pub fn local_patch(&self, patch: &MemberPatch, now_ms: u64) -> Option<Member> {
        self.mutate(|state| {
            let id = state.local_id.clone()?;
            let member = state.members.get_mut(&id)?;
            patch.apply_to(member);
            member.last_seen = member.last_seen.max(now_ms);
            Some(member.clone())
        })
        .0
    }

    /// The local base record as `patch` would leave it, without storing it.
    pub fn preview_local(&self, patch: &MemberPatch, now_ms: u64) -> Option<Member> {
        let state = lock(&self.state);
        let mut member = state.members.get(state.local_id.as_ref()?)?.clone();
        patch.apply_to(&mut member);
        member.last_seen = member.last_seen.max(now_ms);
        Some(member)
    }

    /// Forget everything, including which id is local.
    pub fn clear(&self) -> bool {
        self.mutate(|state| {
            state.local_id = None;
            state.members.clear();
            state.overlay.clear();
        })
        .1
    }

    /// Merge a voice-activity record into the overlay. Records for ids not in
    /// the room, and records not strictly newer than the stored one, are
    /// dropped; returns whether the record was applied.
    pub fn merge_voice(&self, record: VoiceActivityRecord) -> bool {
        self.mutate(|state| {
            if !state.members.contains_key(&record.id) {
                trace!(id = %record.id, "Dropping voice record for unknown member");
                return false;
            }
            if !record.supersedes(state.overlay.get(&record.id)) {
                trace!(id = %record.id, ts = record.timestamp, "Dropping stale voice record");
                return false;
            }
            state.overlay.insert(record.id.clone(), record);
            true
        })
        .0
    }

    // -- Reads --------------------------------------------------------------

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        let state = lock(&self.state);
        state.members.get(id).map(|m| state.view(m))
    }

    /// Snapshot of every member, sorted by id.
    pub fn list(&self) -> Vec<Member> {
        lock(&self.state).snapshot()
    }

    pub fn local_id(&self) -> Option<MemberId> {
        lock(&self.state).local_id.clone()
    }

    /// The local member as last written by us, without the voice overlay.
    pub fn local_record(&self) -> Option<Member> {
        let state = lock(&self.state);
        let id = state.local_id.as_ref()?;
        state.members.get(id).cloned()
    }

    pub fn voice_level(&self, id: &MemberId) -> f32 {
        lock(&self.state).overlay.get(id).map_or(0.0, |r| r.level)
    }

    /// Find the member currently bound to an RTC uid.
    pub fn by_transport_session(&self, uid: u32) -> Option<Member> {
        let state = lock(&self.state);
        state
            .members
            .values()
            .map(|m| state.view(m))
            .find(|m| m.transport_session_id == Some(uid))
    }

    // -- Listeners ----------------------------------------------------------

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or disposed.
    pub fn subscribe(&self, listener: MemberListener) -> Subscription {
        let mut set = lock(&self.listeners);
        set.next_id += 1;
        let id = set.next_id;
        set.entries.push((id, listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Run a mutation and notify listeners if the visible snapshot changed.
    /// Returns the closure's result and whether anything changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> (R, bool) {
        let (result, changed) = {
            let mut state = lock(&self.state);
            let before = state.snapshot();
            let result = f(&mut state);
            let after = state.snapshot();
            (result, (before != after).then_some(after))
        };
        let did_change = changed.is_some();
        if let Some(snapshot) = changed {
            self.notify(&snapshot);
        }
        (result, did_change)
    }

    fn notify(&self, snapshot: &[Member]) {
        let listeners: Vec<MemberListener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

impl Default for MemberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    fn view(&self, member: &Member) -> Member {
        let mut view = member.clone();
        if let Some(record) = self.overlay.get(&member.id) {
            view.level = record.level;
            if record.timestamp > member.last_seen {
                view.voice_status = record.voice_status;
                view.muted = record.muted;
                view.is_deafened = record.is_deafened;
                if record.transport_session_id.is_some() {
                    view.transport_session_id = record.transport_session_id;
                }
            }
        }
        view
    }

    fn snapshot(&self) -> Vec<Member> {
        self.members.values().map(|m| self.view(m)).collect()
    }

    fn is_local(&self, id: &MemberId) -> bool {
        self.local_id.as_ref() == Some(id)
    }

    /// Resolve one record against what we already hold for its id.
    fn merged(&self, record: &PresenceRecord) -> Member {
        let existing = self.members.get(&record.id);
        match existing {
            Some(current) if current.last_seen > record.last_seen => current.clone(),
            Some(current) if self.is_local(&record.id) => {
                // Voice fields of the local member come from the classifier,
                // never from presence echoes.
                let mut member = current.clone();
                member.merge_social(record);
                member
            }
            _ => record.to_member_over(existing),
        }
    }

    fn apply_sync(&mut self, snapshot: &PresenceSnapshot) {
        let mut next = BTreeMap::new();
        for (key, records) in snapshot {
            let Some(best) = freshest(records) else {
                continue;
            };
            if best.has_left() {
                debug!(%key, "Sync reports member as left, skipping");
                continue;
            }
            let member = self.merged(best);
            next.insert(member.id.clone(), member);
        }

        if let Some(local) = self.local_id.clone() {
            if !next.contains_key(&local) {
                if let Some(member) = self.members.get(&local) {
                    next.insert(local, member.clone());
                }
            }
        }

        self.members = next;
        let members = &self.members;
        self.overlay.retain(|id, _| members.contains_key(id));
    }

    fn apply_join(&mut self, records: &[PresenceRecord]) {
        let Some(best) = freshest(records) else {
            return;
        };
        if best.has_left() {
            return;
        }
        let member = self.merged(best);
        self.members.insert(member.id.clone(), member);
    }

    fn apply_leave(&mut self, records: &[PresenceRecord]) {
        for record in records {
            if self.is_local(&record.id) {
                continue;
            }
            if !record.has_left() {
                debug!(id = %record.id, "Ignoring leave without a left marker");
                continue;
            }
            let stale = self
                .members
                .get(&record.id)
                .is_some_and(|m| m.last_seen > record.last_seen);
            if stale {
                debug!(id = %record.id, "Ignoring leave older than current record");
                continue;
            }
            self.members.remove(&record.id);
            self.overlay.remove(&record.id);
        }
    }
}

/// Keeps a registry listener registered; dropping it unregisters.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<ListenerSet>>,
}

impl Subscription {
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}
