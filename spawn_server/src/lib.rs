//! `spawn_server`
//!
//! Server-authoritative spawn orchestration:
//! - Spawn point pool with random selection and fallback placement
//! - Per-client lifecycle state machine
//! - Batched, delayed spawning with a watchdog and timeout sweep
//! - Scene-driven or connection-driven spawn triggers
//!
//! Networking model:
//! - TCP only: handshake, scene-load acknowledgements and spawn notifications
//! - [`service::SpawnService`] owns all state; [`host::NetHost`] feeds it

pub mod error;
pub mod factory;
pub mod host;
pub mod lifecycle;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod trigger;

pub use error::SpawnError;
pub use factory::{EntityFactory, WorldFactory};
pub use host::NetHost;
pub use lifecycle::{ClientLifecycleTracker, LifecycleState, Transition};
pub use orchestrator::{SpawnDiagnostics, SpawnOrchestrator};
pub use pool::{Placement, SlotId, SpawnPointPool};
pub use service::{ServiceInput, SpawnService};
pub use session::{LocalSession, NetSession, SpawnSession};
pub use trigger::{trigger_for, TriggerSource};
