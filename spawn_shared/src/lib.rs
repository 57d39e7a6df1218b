//! `spawn_shared`
//!
//! Shared libraries used by the spawn server, bot client and tests.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (net, ecs, math, events, config).
//! - No `unsafe`.

pub mod config;
pub mod ecs;
pub mod event;
pub mod math;
pub mod net;
