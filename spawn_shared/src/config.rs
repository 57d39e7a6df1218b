//! Configuration system.
//!
//! Loads server and spawn configuration from JSON. Every field has a default
//! so partial files are accepted.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::math::{Quat, Vec3};

/// Root server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default)]
    pub spawn: SpawnConfig,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            spawn: SpawnConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }
}

/// Which signal advances a client to "ready".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Scene-load acknowledgements (gameplay).
    #[default]
    Scene,
    /// Raw connect/disconnect plus a timeout sweep (waiting room).
    Connection,
}

impl std::str::FromStr for TriggerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scene" => Ok(TriggerMode::Scene),
            "connection" => Ok(TriggerMode::Connection),
            other => anyhow::bail!("unknown trigger mode '{other}'"),
        }
    }
}

/// What to do when a client about to spawn already owns an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExistingEntityPolicy {
    /// Re-register the surviving entity without creating a new one.
    #[default]
    Adopt,
    /// Destroy the surviving entity and create a fresh one.
    Replace,
}

/// A static candidate spawn location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnPointDef {
    pub position: Vec3,
    /// Facing, in degrees about the vertical axis.
    #[serde(default)]
    pub yaw: f32,
}

impl SpawnPointDef {
    pub fn new(position: Vec3, yaw: f32) -> Self {
        Self { position, yaw }
    }

    pub fn rotation(&self) -> Quat {
        Quat::from_yaw_degrees(self.yaw)
    }
}

/// Area used for overflow spawns once every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackArea {
    pub center: Vec3,
    /// Half-size of the square on the horizontal plane.
    pub half_extent: f32,
}

impl Default for FallbackArea {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            half_extent: 5.0,
        }
    }
}

/// Spawn orchestration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Artificial delay before a ready client is materialized.
    #[serde(default = "default_spawn_delay")]
    pub spawn_delay_seconds: f32,
    /// Unspawned clients older than this are force-spawned by the sweep.
    #[serde(default = "default_ready_timeout")]
    pub client_ready_timeout_seconds: f32,
    /// Extra time the watchdog waits on top of the spawn delay.
    #[serde(default = "default_watchdog_grace")]
    pub watchdog_grace_seconds: f32,
    #[serde(default = "default_sweep_interval")]
    pub timeout_sweep_interval_seconds: f32,
    /// Watchdog re-arms before spawning is reported as stalled.
    #[serde(default = "default_max_watchdog_rounds")]
    pub max_watchdog_rounds: u32,
    /// How long the host waits for scene acknowledgements.
    #[serde(default = "default_scene_load_timeout")]
    pub scene_load_timeout_seconds: f32,
    #[serde(default)]
    pub spawn_points: Vec<SpawnPointDef>,
    #[serde(default)]
    pub fallback_area: FallbackArea,
    /// Template used to build player entities.
    #[serde(default = "default_player_template")]
    pub player_template: String,
    #[serde(default)]
    pub trigger: TriggerMode,
    #[serde(default)]
    pub existing_entity_policy: ExistingEntityPolicy,
    #[serde(default)]
    pub debug_logging: bool,
    /// Seed for slot selection; random when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_spawn_delay() -> f32 {
    0.5
}

fn default_ready_timeout() -> f32 {
    10.0
}

fn default_watchdog_grace() -> f32 {
    1.0
}

fn default_sweep_interval() -> f32 {
    1.0
}

fn default_max_watchdog_rounds() -> u32 {
    10
}

fn default_scene_load_timeout() -> f32 {
    15.0
}

fn default_player_template() -> String {
    "player".to_string()
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            spawn_delay_seconds: default_spawn_delay(),
            client_ready_timeout_seconds: default_ready_timeout(),
            watchdog_grace_seconds: default_watchdog_grace(),
            timeout_sweep_interval_seconds: default_sweep_interval(),
            max_watchdog_rounds: default_max_watchdog_rounds(),
            scene_load_timeout_seconds: default_scene_load_timeout(),
            spawn_points: Vec::new(),
            fallback_area: FallbackArea::default(),
            player_template: default_player_template(),
            trigger: TriggerMode::default(),
            existing_entity_policy: ExistingEntityPolicy::default(),
            debug_logging: false,
            rng_seed: None,
        }
    }
}

fn secs(v: f32) -> Duration {
    Duration::from_secs_f32(v.max(0.0))
}

impl SpawnConfig {
    pub fn spawn_delay(&self) -> Duration {
        secs(self.spawn_delay_seconds)
    }

    pub fn client_ready_timeout(&self) -> Duration {
        secs(self.client_ready_timeout_seconds)
    }

    /// Watchdog period: spawn delay plus grace, never zero.
    pub fn watchdog_period(&self) -> Duration {
        (secs(self.spawn_delay_seconds) + secs(self.watchdog_grace_seconds))
            .max(Duration::from_millis(10))
    }

    /// Never zero, so the sweep cannot spin.
    pub fn sweep_interval(&self) -> Duration {
        secs(self.timeout_sweep_interval_seconds).max(Duration::from_millis(10))
    }

    pub fn scene_load_timeout(&self) -> Duration {
        secs(self.scene_load_timeout_seconds)
    }
}
