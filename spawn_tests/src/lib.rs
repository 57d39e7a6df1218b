//! Shared fixtures for the spawn integration tests.

use std::time::Duration;

use anyhow::bail;
use spawn_server::{
    pool::Placement, EntityFactory, LifecycleState, LocalSession, SpawnError, SpawnOrchestrator,
    WorldFactory,
};
use spawn_shared::{
    config::{SpawnConfig, SpawnPointDef, TriggerMode},
    ecs::EntityId,
    event::{SessionEvent, SpawnSignal},
    math::{Quat, Vec3},
    net::{ClientId, ExternalId},
};
use tokio::time::Instant;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// `points` spawn points on a line, 4 units apart, with a fixed seed.
pub fn spawn_config(points: usize, trigger: TriggerMode) -> SpawnConfig {
    SpawnConfig {
        spawn_delay_seconds: 0.5,
        client_ready_timeout_seconds: 5.0,
        watchdog_grace_seconds: 1.0,
        timeout_sweep_interval_seconds: 1.0,
        spawn_points: (0..points)
            .map(|i| SpawnPointDef::new(Vec3::new(i as f32 * 4.0, 0.0, 0.0), 90.0 * i as f32))
            .collect(),
        trigger,
        rng_seed: Some(7),
        ..SpawnConfig::default()
    }
}

/// World factory that fails on demand.
pub struct FlakyFactory {
    pub inner: WorldFactory,
    pub failures_left: u32,
    pub calls: u32,
}

impl FlakyFactory {
    pub fn new(failures_left: u32) -> Self {
        Self {
            inner: WorldFactory::new("player"),
            failures_left,
            calls: 0,
        }
    }
}

impl EntityFactory for FlakyFactory {
    fn spawn_entity(&mut self, client: ClientId, placement: &Placement) -> anyhow::Result<EntityId> {
        self.calls += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            bail!("transient factory failure");
        }
        self.inner.spawn_entity(client, placement)
    }

    fn despawn_entity(&mut self, entity: EntityId) {
        self.inner.despawn_entity(entity);
    }

    fn find_owned(&self, client: ClientId) -> Option<EntityId> {
        self.inner.find_owned(client)
    }

    fn pose_of(&self, entity: EntityId) -> Option<(Vec3, Quat)> {
        self.inner.pose_of(entity)
    }
}

/// Orchestrator plus an in-memory session on a millisecond clock.
pub struct Sim<F: EntityFactory = WorldFactory> {
    pub orch: SpawnOrchestrator<F>,
    pub session: LocalSession,
    pub signals: Vec<SpawnSignal>,
    t0: Instant,
}

impl Sim<WorldFactory> {
    pub fn new(config: SpawnConfig) -> Self {
        Self::with_factory(config, WorldFactory::new("player"))
    }
}

impl<F: EntityFactory> Sim<F> {
    pub fn with_factory(config: SpawnConfig, factory: F) -> Self {
        Self {
            orch: SpawnOrchestrator::new(config, factory),
            session: LocalSession::new(),
            signals: Vec::new(),
            t0: Instant::now(),
        }
    }

    pub fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    pub fn init(&mut self, ms: u64) -> Result<(), SpawnError> {
        let now = self.at(ms);
        let res = self.orch.initialize(&mut self.session, now);
        self.collect();
        res
    }

    pub fn connect(&mut self, id: u32, ms: u64) {
        self.connect_as(id, &format!("player-{id}"), ms);
    }

    pub fn connect_as(&mut self, id: u32, external: &str, ms: u64) {
        self.session
            .connect_as(ClientId(id), ExternalId::new(external));
        self.event(SessionEvent::NetworkConnected(ClientId(id)), ms);
    }

    pub fn disconnect(&mut self, id: u32, ms: u64) {
        self.session.drop_client(ClientId(id));
        self.event(SessionEvent::NetworkDisconnected(ClientId(id)), ms);
    }

    pub fn scene_loaded(&mut self, completed: &[u32], timed_out: &[u32], ms: u64) {
        self.event(
            SessionEvent::SceneLoadCompleted {
                scene: "arena".into(),
                completed: completed.iter().map(|id| ClientId(*id)).collect(),
                timed_out: timed_out.iter().map(|id| ClientId(*id)).collect(),
            },
            ms,
        );
    }

    pub fn scene_synced(&mut self, id: u32, ms: u64) {
        self.event(SessionEvent::SceneSyncCompleted(ClientId(id)), ms);
    }

    pub fn event(&mut self, event: SessionEvent, ms: u64) {
        let now = self.at(ms);
        self.orch.handle_event(&mut self.session, event, now);
        self.collect();
    }

    pub fn advance(&mut self, ms: u64) {
        let now = self.at(ms);
        self.orch.advance(&mut self.session, now);
        self.collect();
    }

    pub fn state(&self, id: u32) -> LifecycleState {
        self.orch.get_state(ClientId(id))
    }

    pub fn is_spawned(&self, id: u32) -> bool {
        self.orch.spawned_entity(ClientId(id)).is_some()
    }

    pub fn finished_count(&self) -> usize {
        self.signals
            .iter()
            .filter(|s| **s == SpawnSignal::FinishedSpawning)
            .count()
    }

    pub fn spawned_signals_for(&self, id: u32) -> usize {
        self.signals
            .iter()
            .filter(|s| matches!(s, SpawnSignal::PlayerSpawned { client, .. } if *client == ClientId(id)))
            .count()
    }

    fn collect(&mut self) {
        self.signals.extend(self.orch.drain_signals());
    }
}
