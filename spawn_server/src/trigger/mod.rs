//! Trigger sources: what advances a client to "ready".
//!
//! A strategy translates inbound [`SessionEvent`]s into [`TriggerAction`]s
//! that the orchestrator executes with its shared batching, watchdog and
//! cleanup machinery. Strategies never touch the tracker or the pool
//! directly; the sweep only reads the tracker.

mod connection;
mod scene;

use std::time::Duration;

use spawn_shared::{
    config::{SpawnConfig, TriggerMode},
    event::SessionEvent,
    net::{ClientId, ExternalId},
};
use tokio::time::Instant;

use crate::lifecycle::ClientLifecycleTracker;

pub use connection::ConnectionTrigger;
pub use scene::SceneTrigger;

/// A state change requested by a trigger source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAction {
    /// Record a new connection (`Connected`).
    Track(ClientId),
    /// `Connected -> WaitingForScene`.
    AwaitScene(ClientId),
    /// The shared scene is fully loaded on the server.
    SceneLoaded,
    /// Move to `ReadyToSpawn` unless already spawning or spawned.
    MarkReady(ClientId),
    /// Re-scan connected clients and batch whoever is eligible.
    Rescan,
    /// Schedule an individual delayed spawn, bypassing batching.
    SpawnDelayed(ClientId),
    /// Spawn right now regardless of trigger state.
    ForceSpawn(ClientId),
    /// `Disconnected` followed by cleanup.
    Disconnect(ClientId),
    /// Terminate the connection behind a membership identity.
    Kick(ExternalId),
    CleanupAll,
}

/// Pluggable source of readiness signals.
pub trait TriggerSource: Send {
    fn name(&self) -> &'static str;

    /// Whether spawning waits for a scene-load completion first.
    fn requires_scene_load(&self) -> bool;

    fn on_event(&mut self, event: &SessionEvent, now: Instant) -> Vec<TriggerAction>;

    /// Period of the timeout sweep; `None` disables it.
    fn sweep_interval(&self) -> Option<Duration>;

    fn sweep(&mut self, tracker: &ClientLifecycleTracker, now: Instant) -> Vec<TriggerAction>;

    /// Drops per-client bookkeeping after cleanup.
    fn forget(&mut self, _client: ClientId) {}

    fn reset(&mut self) {}
}

/// Lobby signals are handled the same way by every strategy.
fn membership_actions(event: &SessionEvent) -> Option<TriggerAction> {
    match event {
        SessionEvent::MembershipPlayerKicked(external) => Some(TriggerAction::Kick(external.clone())),
        SessionEvent::MembershipSessionRemoved => Some(TriggerAction::CleanupAll),
        _ => None,
    }
}

/// Builds the strategy selected by `cfg.trigger`.
pub fn trigger_for(cfg: &SpawnConfig) -> Box<dyn TriggerSource> {
    match cfg.trigger {
        TriggerMode::Scene => Box::new(SceneTrigger::new(cfg)),
        TriggerMode::Connection => Box::new(ConnectionTrigger::new(cfg)),
    }
}
