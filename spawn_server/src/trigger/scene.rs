//! Scene-driven trigger: clients become ready once they acknowledge the
//! shared scene. Used once gameplay begins.

use std::time::Duration;

use spawn_shared::{config::SpawnConfig, event::SessionEvent};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{membership_actions, TriggerAction, TriggerSource};
use crate::lifecycle::{ClientLifecycleTracker, LifecycleState};

pub struct SceneTrigger {
    ready_timeout: Duration,
    sweep_interval: Duration,
}

impl SceneTrigger {
    pub fn new(cfg: &SpawnConfig) -> Self {
        Self {
            ready_timeout: cfg.client_ready_timeout(),
            sweep_interval: cfg.sweep_interval(),
        }
    }
}

impl TriggerSource for SceneTrigger {
    fn name(&self) -> &'static str {
        "scene"
    }

    fn requires_scene_load(&self) -> bool {
        true
    }

    fn on_event(&mut self, event: &SessionEvent, _now: Instant) -> Vec<TriggerAction> {
        match event {
            SessionEvent::NetworkConnected(id) => {
                vec![TriggerAction::Track(*id), TriggerAction::AwaitScene(*id)]
            }
            SessionEvent::NetworkDisconnected(id) => vec![TriggerAction::Disconnect(*id)],
            SessionEvent::SceneLoadCompleted {
                scene,
                completed,
                timed_out,
            } => {
                if !timed_out.is_empty() {
                    warn!(%scene, timed_out = ?timed_out, "Scene load timed out for some clients, spawning anyway");
                }
                debug!(%scene, completed = completed.len(), "Scene load completed");
                let mut actions = vec![TriggerAction::SceneLoaded];
                actions.extend(
                    completed
                        .iter()
                        .chain(timed_out.iter())
                        .map(|id| TriggerAction::MarkReady(*id)),
                );
                actions.push(TriggerAction::Rescan);
                actions
            }
            SessionEvent::SceneSyncCompleted(id) => {
                vec![TriggerAction::MarkReady(*id), TriggerAction::Rescan]
            }
            other => membership_actions(other).into_iter().collect(),
        }
    }

    fn sweep_interval(&self) -> Option<Duration> {
        Some(self.sweep_interval)
    }

    /// Promotes clients whose acknowledgement never arrived.
    fn sweep(&mut self, tracker: &ClientLifecycleTracker, now: Instant) -> Vec<TriggerAction> {
        let mut actions: Vec<TriggerAction> = tracker
            .records()
            .filter(|r| {
                matches!(
                    r.state,
                    LifecycleState::Connected | LifecycleState::WaitingForScene
                )
            })
            .filter(|r| now.saturating_duration_since(r.connected_at) > self.ready_timeout)
            .map(|r| {
                warn!(client_id = ?r.id, state = ?r.state, "Scene acknowledgement overdue, marking ready");
                TriggerAction::MarkReady(r.id)
            })
            .collect();
        if !actions.is_empty() {
            actions.push(TriggerAction::Rescan);
        }
        actions
    }
}
