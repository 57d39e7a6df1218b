//! Per-client lifecycle tracking.
//!
//! One record per known participant. A missing record reads as
//! [`LifecycleState::Disconnected`].

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use spawn_shared::net::ClientId;
use tokio::time::Instant;

use crate::error::SpawnError;

/// Transitions kept for diagnostics.
const HISTORY_LEN: usize = 256;

/// Where a client is in the spawn protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Connected,
    WaitingForScene,
    ReadyToSpawn,
    Spawning,
    Spawned,
    Disconnected,
}

impl LifecycleState {
    /// Legal transition table. Same-state is always allowed (a no-op).
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;

        if self == to || to == Disconnected {
            return true;
        }
        matches!(
            (self, to),
            (Connected, WaitingForScene | ReadyToSpawn | Spawning)
                | (WaitingForScene, Connected | ReadyToSpawn | Spawning)
                | (ReadyToSpawn, Connected | Spawning)
                // Spawning -> Connected is the rollback after a factory failure.
                | (Spawning, Spawned | Connected)
                | (Spawned, ReadyToSpawn)
                | (Disconnected, Connected | WaitingForScene | ReadyToSpawn)
        )
    }

    /// Neither spawned nor on the way there.
    pub fn is_awaiting_spawn(self) -> bool {
        matches!(
            self,
            LifecycleState::Connected | LifecycleState::WaitingForScene | LifecycleState::ReadyToSpawn
        )
    }
}

/// Book-keeping for one participant.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub state: LifecycleState,
    pub connected_at: Instant,
    /// Factory failures since the last successful spawn.
    pub failed_attempts: u32,
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub client: ClientId,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
}

/// State machine storage for every known client.
#[derive(Debug, Default)]
pub struct ClientLifecycleTracker {
    records: BTreeMap<ClientId, ClientRecord>,
    history: VecDeque<Transition>,
}

impl ClientLifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; unknown ids are `Disconnected`.
    pub fn get_state(&self, id: ClientId) -> LifecycleState {
        self.records
            .get(&id)
            .map(|r| r.state)
            .unwrap_or(LifecycleState::Disconnected)
    }

    pub fn record(&self, id: ClientId) -> Option<&ClientRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.records.contains_key(&id)
    }

    /// Sets a state without checking legality.
    ///
    /// Returns the previous state when something changed, `None` for a no-op.
    /// A missing record is created with `now` as its connect time.
    pub fn set_state(
        &mut self,
        id: ClientId,
        state: LifecycleState,
        now: Instant,
    ) -> Option<LifecycleState> {
        let prev = self.get_state(id);
        if prev == state {
            return None;
        }
        let record = self.records.entry(id).or_insert_with(|| ClientRecord {
            id,
            state: LifecycleState::Disconnected,
            connected_at: now,
            failed_attempts: 0,
        });
        record.state = state;
        self.push_history(id, prev, state);
        Some(prev)
    }

    /// Like [`set_state`](Self::set_state) but rejects transitions outside
    /// the legal table.
    pub fn transition(
        &mut self,
        id: ClientId,
        to: LifecycleState,
        now: Instant,
    ) -> Result<Option<LifecycleState>, SpawnError> {
        let from = self.get_state(id);
        if !from.can_transition_to(to) {
            return Err(SpawnError::IllegalTransition {
                client: id,
                from,
                to,
            });
        }
        Ok(self.set_state(id, to, now))
    }

    /// Records a fresh connection, resetting connect time and failure count.
    ///
    /// A client mid-spawn or already spawned has to disconnect first.
    pub fn track_connect(&mut self, id: ClientId, now: Instant) -> Result<(), SpawnError> {
        let from = self.get_state(id);
        if matches!(from, LifecycleState::Spawning | LifecycleState::Spawned) {
            return Err(SpawnError::IllegalTransition {
                client: id,
                from,
                to: LifecycleState::Connected,
            });
        }
        self.transition(id, LifecycleState::Connected, now)?;
        if let Some(record) = self.records.get_mut(&id) {
            record.connected_at = now;
            record.failed_attempts = 0;
        }
        Ok(())
    }

    pub fn note_failure(&mut self, id: ClientId) -> u32 {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.failed_attempts += 1;
                record.failed_attempts
            }
            None => 0,
        }
    }

    pub fn clear_failures(&mut self, id: ClientId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.failed_attempts = 0;
        }
    }

    /// Drops the record entirely.
    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        self.records.remove(&id)
    }

    /// Records in id order.
    pub fn records(&self) -> impl Iterator<Item = &ClientRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Oldest first.
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &Transition> {
        self.history.iter()
    }

    fn push_history(&mut self, client: ClientId, from: LifecycleState, to: LifecycleState) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            client,
            from,
            to,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn unknown_client_reads_disconnected() {
        let tracker = ClientLifecycleTracker::new();
        assert_eq!(tracker.get_state(ClientId(42)), Disconnected);
        assert!(tracker.record(ClientId(42)).is_none());
    }

    #[test]
    fn set_state_reports_previous_and_skips_noops() {
        let mut tracker = ClientLifecycleTracker::new();
        let now = Instant::now();
        let id = ClientId(1);

        assert_eq!(tracker.set_state(id, Connected, now), Some(Disconnected));
        assert_eq!(tracker.set_state(id, Connected, now), None);
        assert_eq!(tracker.set_state(id, ReadyToSpawn, now), Some(Connected));
        assert_eq!(tracker.history().count(), 2);
    }

    #[test]
    fn set_state_is_permissive() {
        let mut tracker = ClientLifecycleTracker::new();
        let now = Instant::now();
        let id = ClientId(1);
        tracker.set_state(id, Spawned, now);
        assert_eq!(tracker.set_state(id, WaitingForScene, now), Some(Spawned));
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let mut tracker = ClientLifecycleTracker::new();
        let now = Instant::now();
        let id = ClientId(3);

        let err = tracker.transition(id, Spawned, now).unwrap_err();
        assert_eq!(
            err,
            SpawnError::IllegalTransition {
                client: id,
                from: Disconnected,
                to: Spawned
            }
        );
        assert!(!tracker.contains(id));

        tracker.track_connect(id, now).unwrap();
        tracker.transition(id, ReadyToSpawn, now).unwrap();
        tracker.transition(id, Spawning, now).unwrap();
        assert!(tracker.transition(id, WaitingForScene, now).is_err());
        tracker.transition(id, Connected, now).unwrap();
    }

    #[test]
    fn any_state_may_disconnect() {
        for from in [Connected, WaitingForScene, ReadyToSpawn, Spawning, Spawned] {
            assert!(from.can_transition_to(Disconnected), "{from:?}");
        }
    }

    #[test]
    fn reconnect_resets_connect_time_and_failures() {
        let mut tracker = ClientLifecycleTracker::new();
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_secs(5);
        let id = ClientId(9);

        tracker.track_connect(id, t0).unwrap();
        tracker.note_failure(id);
        tracker.set_state(id, Disconnected, t0);
        tracker.track_connect(id, t1).unwrap();

        let record = tracker.record(id).unwrap();
        assert_eq!(record.connected_at, t1);
        assert_eq!(record.failed_attempts, 0);
    }

    #[test]
    fn repeated_connect_mid_spawn_is_rejected() {
        let mut tracker = ClientLifecycleTracker::new();
        let now = Instant::now();
        let id = ClientId(4);

        tracker.track_connect(id, now).unwrap();
        tracker.track_connect(id, now).unwrap();
        tracker.transition(id, Spawning, now).unwrap();
        assert_eq!(
            tracker.track_connect(id, now),
            Err(SpawnError::IllegalTransition {
                client: id,
                from: Spawning,
                to: Connected
            })
        );
        assert_eq!(tracker.get_state(id), Spawning);

        tracker.transition(id, Spawned, now).unwrap();
        assert!(tracker.track_connect(id, now).is_err());
        assert_eq!(tracker.get_state(id), Spawned);

        tracker.transition(id, Disconnected, now).unwrap();
        tracker.track_connect(id, now).unwrap();
        assert_eq!(tracker.get_state(id), Connected);
    }

    #[test]
    fn history_is_bounded() {
        let mut tracker = ClientLifecycleTracker::new();
        let now = Instant::now();
        for i in 0..(HISTORY_LEN as u32 + 10) {
            tracker.set_state(ClientId(i), Connected, now);
        }
        assert_eq!(tracker.history().count(), HISTORY_LEN);
    }
}
