//! `spawn_client`
//!
//! Headless participant for a spawn server:
//! - Handshake over the reliable stream
//! - Scene-load acknowledgement (automatic or manual)
//! - Tracking of spawned and deleted entities

pub mod client;

pub use client::{BotClient, BotState};
