//! Inbound session events and outbound spawn signals.
//!
//! Collaborators (transport, scene manager, lobby) raise `SessionEvent`s.
//! The orchestrator answers with `SpawnSignal`s, delivered in FIFO order.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    ecs::EntityId,
    math::{Quat, Vec3},
    net::{ClientId, ExternalId},
};

/// An event consumed by the spawn orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    NetworkConnected(ClientId),
    NetworkDisconnected(ClientId),
    /// Scene load finished; ids split by whether they acknowledged in time.
    SceneLoadCompleted {
        scene: String,
        completed: Vec<ClientId>,
        timed_out: Vec<ClientId>,
    },
    /// A late joiner finished synchronizing the current scene.
    SceneSyncCompleted(ClientId),
    MembershipPlayerKicked(ExternalId),
    MembershipSessionRemoved,
}

/// A signal produced by the spawn orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpawnSignal {
    PlayerSpawned {
        client: ClientId,
        entity: EntityId,
        position: Vec3,
        rotation: Quat,
    },
    PlayerDespawned {
        client: ClientId,
        entity: EntityId,
    },
    /// Fired at most once per orchestrator lifetime.
    FinishedSpawning,
}

/// FIFO queue of outbound signals.
#[derive(Debug, Default)]
pub struct SignalQueue {
    queue: VecDeque<SpawnSignal>,
}

impl SignalQueue {
    pub fn push(&mut self, signal: SpawnSignal) {
        self.queue.push_back(signal);
    }

    /// Drains every queued signal in emission order.
    pub fn drain(&mut self) -> Vec<SpawnSignal> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
