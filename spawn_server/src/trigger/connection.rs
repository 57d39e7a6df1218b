//! Connection-driven trigger for the pre-game waiting room.
//!
//! There is no scene handshake to wait on: a connect makes the client ready
//! and schedules its spawn individually. A periodic sweep force-spawns
//! anyone left unspawned past the ready timeout.

use std::{collections::BTreeMap, time::Duration};

use spawn_shared::{config::SpawnConfig, event::SessionEvent, net::ClientId};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{membership_actions, TriggerAction, TriggerSource};
use crate::lifecycle::ClientLifecycleTracker;

pub struct ConnectionTrigger {
    ready_timeout: Duration,
    sweep_interval: Duration,
    connected_at: BTreeMap<ClientId, Instant>,
}

impl ConnectionTrigger {
    pub fn new(cfg: &SpawnConfig) -> Self {
        Self {
            ready_timeout: cfg.client_ready_timeout(),
            sweep_interval: cfg.sweep_interval(),
            connected_at: BTreeMap::new(),
        }
    }

    pub fn connected_at(&self, client: ClientId) -> Option<Instant> {
        self.connected_at.get(&client).copied()
    }
}

impl TriggerSource for ConnectionTrigger {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn requires_scene_load(&self) -> bool {
        false
    }

    fn on_event(&mut self, event: &SessionEvent, now: Instant) -> Vec<TriggerAction> {
        match event {
            SessionEvent::NetworkConnected(id) => {
                self.connected_at.insert(*id, now);
                vec![
                    TriggerAction::Track(*id),
                    TriggerAction::MarkReady(*id),
                    TriggerAction::SpawnDelayed(*id),
                ]
            }
            SessionEvent::NetworkDisconnected(id) => {
                self.connected_at.remove(id);
                vec![TriggerAction::Disconnect(*id)]
            }
            SessionEvent::SceneLoadCompleted { .. } | SessionEvent::SceneSyncCompleted(_) => {
                debug!(?event, "Scene event ignored by connection trigger");
                Vec::new()
            }
            other => membership_actions(other).into_iter().collect(),
        }
    }

    fn sweep_interval(&self) -> Option<Duration> {
        Some(self.sweep_interval)
    }

    fn sweep(&mut self, tracker: &ClientLifecycleTracker, now: Instant) -> Vec<TriggerAction> {
        self.connected_at
            .iter()
            .filter(|(id, _)| tracker.get_state(**id).is_awaiting_spawn())
            .filter(|(_, at)| now.saturating_duration_since(**at) > self.ready_timeout)
            .map(|(id, at)| {
                warn!(
                    client_id = ?id,
                    waited_ms = now.saturating_duration_since(*at).as_millis() as u64,
                    "Client not spawned within ready timeout, forcing spawn"
                );
                TriggerAction::ForceSpawn(*id)
            })
            .collect()
    }

    fn forget(&mut self, client: ClientId) {
        self.connected_at.remove(&client);
    }

    fn reset(&mut self) {
        self.connected_at.clear();
    }
}
