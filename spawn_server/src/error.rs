//! Orchestrator error type.

use std::fmt;

use spawn_shared::net::ClientId;

use crate::lifecycle::LifecycleState;

/// Domain failures raised by the spawn orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// Unusable configuration at initialization; the orchestrator disables itself.
    Configuration(String),
    /// The orchestrator was disabled by an earlier configuration error.
    Disabled,
    /// A lifecycle transition outside the legal table.
    IllegalTransition {
        client: ClientId,
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Configuration(msg) => write!(f, "spawn configuration error: {msg}"),
            SpawnError::Disabled => write!(f, "spawn orchestrator is disabled"),
            SpawnError::IllegalTransition { client, from, to } => {
                write!(f, "illegal transition for client {client}: {from:?} -> {to:?}")
            }
        }
    }
}

impl std::error::Error for SpawnError {}
