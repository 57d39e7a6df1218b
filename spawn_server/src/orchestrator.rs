//! Spawn orchestrator.
//!
//! Decides when and where each connected client's entity is materialized,
//! exactly once. All mutation happens on the caller's single execution
//! context: inbound events go through [`SpawnOrchestrator::handle_event`] and
//! timer continuations through [`SpawnOrchestrator::advance`]. A resumed spawn
//! task always re-validates eligibility before acting; a client that left
//! during the delay makes the task a no-op.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use spawn_shared::{
    config::{ExistingEntityPolicy, SpawnConfig},
    ecs::EntityId,
    event::{SessionEvent, SignalQueue, SpawnSignal},
    math::{Quat, Vec3},
    net::{ClientId, ExternalId},
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    error::SpawnError,
    factory::{EntityFactory, WorldFactory},
    lifecycle::{ClientLifecycleTracker, LifecycleState, Transition},
    pool::{SlotId, SpawnPointPool},
    scheduler::{Scheduler, TimerId},
    session::SpawnSession,
    trigger::{trigger_for, TriggerAction, TriggerSource},
};

/// Transitions listed in [`SpawnDiagnostics`].
const RECENT_TRANSITIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Spawn { client: ClientId, batched: bool },
    Watchdog,
    TimeoutSweep,
}

/// Per-client row of [`SpawnDiagnostics`].
#[derive(Debug, Clone, Serialize)]
pub struct ClientDiagnostic {
    pub id: ClientId,
    pub state: LifecycleState,
    pub failed_attempts: u32,
    pub slot: Option<SlotId>,
    pub entity: Option<EntityId>,
    pub connected_for_ms: u64,
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnDiagnostics {
    pub trigger: &'static str,
    pub initialized: bool,
    pub disabled: bool,
    pub scene_loaded: bool,
    pub finished: bool,
    pub stalled: bool,
    pub available_slots: usize,
    pub used_slots: usize,
    pub spawned_count: usize,
    pub pending_spawns: usize,
    pub clients: Vec<ClientDiagnostic>,
    /// Newest first.
    pub recent_transitions: Vec<Transition>,
}

pub struct SpawnOrchestrator<F: EntityFactory = WorldFactory> {
    config: SpawnConfig,
    trigger: Box<dyn TriggerSource>,
    factory: F,
    tracker: ClientLifecycleTracker,
    pool: SpawnPointPool,
    spawned: BTreeMap<ClientId, EntityId>,
    /// Clients of the outstanding batch.
    pending: BTreeSet<ClientId>,
    timers: Scheduler<Task>,
    spawn_timers: HashMap<ClientId, TimerId>,
    watchdog: Option<TimerId>,
    watchdog_rounds: u32,
    sweep: Option<TimerId>,
    signals: SignalQueue,
    scene_loaded: bool,
    initialized: bool,
    disabled: bool,
    finished: bool,
    stalled: bool,
}

impl<F: EntityFactory> SpawnOrchestrator<F> {
    /// Creates an orchestrator with the trigger source named by `config.trigger`.
    pub fn new(config: SpawnConfig, factory: F) -> Self {
        let trigger = trigger_for(&config);
        Self::with_trigger(config, factory, trigger)
    }

    pub fn with_trigger(config: SpawnConfig, factory: F, trigger: Box<dyn TriggerSource>) -> Self {
        let pool = SpawnPointPool::new(
            config.spawn_points.clone(),
            config.fallback_area,
            config.rng_seed,
        );
        Self {
            config,
            trigger,
            factory,
            tracker: ClientLifecycleTracker::new(),
            pool,
            spawned: BTreeMap::new(),
            pending: BTreeSet::new(),
            timers: Scheduler::new(),
            spawn_timers: HashMap::new(),
            watchdog: None,
            watchdog_rounds: 0,
            sweep: None,
            signals: SignalQueue::default(),
            scene_loaded: false,
            initialized: false,
            disabled: false,
            finished: false,
            stalled: false,
        }
    }

    /// Validates configuration, rebuilds the pool and spawns whoever is
    /// already connected. On a configuration error the orchestrator disables
    /// itself and ignores further events until [`reset`](Self::reset).
    pub fn initialize(
        &mut self,
        session: &mut dyn SpawnSession,
        now: Instant,
    ) -> Result<(), SpawnError> {
        if self.disabled {
            return Err(SpawnError::Disabled);
        }
        if self.initialized {
            debug!("Spawn orchestrator already initialized");
            return Ok(());
        }
        if self.config.spawn_points.is_empty() {
            return Err(self.disable("no spawn points configured".to_string()));
        }
        if let Err(e) = self.factory.validate() {
            return Err(self.disable(format!("entity factory: {e:#}")));
        }

        self.pool = SpawnPointPool::new(
            self.config.spawn_points.clone(),
            self.config.fallback_area,
            self.config.rng_seed,
        );
        self.initialized = true;
        if !self.trigger.requires_scene_load() {
            self.scene_loaded = true;
        }
        info!(
            trigger = self.trigger.name(),
            spawn_points = self.pool.total(),
            delay_ms = self.config.spawn_delay().as_millis() as u64,
            "Spawn orchestrator initialized"
        );

        self.arm_sweep(now);
        self.process_existing_clients(session, now);
        Ok(())
    }

    fn disable(&mut self, reason: String) -> SpawnError {
        error!(%reason, "Spawn orchestrator disabled");
        self.disabled = true;
        self.initialized = false;
        SpawnError::Configuration(reason)
    }

    /// Tears everything down and clears the completion flag.
    pub fn reset(&mut self, session: &mut dyn SpawnSession) {
        self.cleanup_all(session);
        self.timers.clear();
        self.spawn_timers.clear();
        self.watchdog = None;
        self.sweep = None;
        self.watchdog_rounds = 0;
        self.trigger.reset();
        self.scene_loaded = false;
        self.initialized = false;
        self.disabled = false;
        self.finished = false;
        self.stalled = false;
        info!("Spawn orchestrator reset");
    }

    // ─── Inbound ───

    /// Feeds one collaborator event through the trigger source.
    pub fn handle_event(
        &mut self,
        session: &mut dyn SpawnSession,
        event: SessionEvent,
        now: Instant,
    ) {
        if self.disabled {
            warn!(?event, "Spawn orchestrator disabled, event ignored");
            return;
        }
        let actions = self.trigger.on_event(&event, now);
        for action in actions {
            self.apply(session, action, now);
        }
    }

    pub fn on_scene_load_completed(
        &mut self,
        session: &mut dyn SpawnSession,
        scene: &str,
        completed: Vec<ClientId>,
        timed_out: Vec<ClientId>,
        now: Instant,
    ) {
        let event = SessionEvent::SceneLoadCompleted {
            scene: scene.to_string(),
            completed,
            timed_out,
        };
        self.handle_event(session, event, now);
    }

    pub fn on_scene_sync_complete(
        &mut self,
        session: &mut dyn SpawnSession,
        client: ClientId,
        now: Instant,
    ) {
        self.handle_event(session, SessionEvent::SceneSyncCompleted(client), now);
    }

    fn apply(&mut self, session: &mut dyn SpawnSession, action: TriggerAction, now: Instant) {
        match action {
            TriggerAction::Track(id) => {
                if let Err(e) = self.tracker.track_connect(id, now) {
                    warn!(error = %e, "Duplicate connect ignored");
                } else {
                    self.log_transition(id, LifecycleState::Connected);
                }
            }
            TriggerAction::AwaitScene(id) => {
                if self.tracker.get_state(id) == LifecycleState::Connected {
                    self.set(id, LifecycleState::WaitingForScene, now);
                }
            }
            TriggerAction::SceneLoaded => self.scene_loaded = true,
            TriggerAction::MarkReady(id) => self.mark_ready(session, id, now),
            TriggerAction::Rescan => self.process_existing_clients(session, now),
            TriggerAction::SpawnDelayed(id) => self.spawn_delayed(id, now),
            TriggerAction::ForceSpawn(id) => self.force_spawn(session, id, now),
            TriggerAction::Disconnect(id) => self.disconnect(session, id, now),
            TriggerAction::Kick(external) => self.kick(session, &external, now),
            TriggerAction::CleanupAll => self.cleanup_all(session),
        }
    }

    fn mark_ready(&mut self, session: &mut dyn SpawnSession, id: ClientId, now: Instant) {
        if !session.is_connected(id) {
            debug!(client_id = ?id, "Ready signal for unknown connection ignored");
            return;
        }
        match self.tracker.get_state(id) {
            LifecycleState::Spawning | LifecycleState::Spawned => {
                debug!(client_id = ?id, "Ready signal while spawning/spawned ignored");
            }
            _ => {
                self.set(id, LifecycleState::ReadyToSpawn, now);
            }
        }
    }

    fn disconnect(&mut self, session: &mut dyn SpawnSession, id: ClientId, now: Instant) {
        if self.tracker.contains(id) {
            self.set(id, LifecycleState::Disconnected, now);
        }
        let was_pending = self.pending.contains(&id);
        self.cleanup_client(session, id);
        // Its cancelled task will not drain the batch.
        if was_pending && self.pending.is_empty() && self.is_active() {
            self.on_batch_drained(session, now);
        }
    }

    fn kick(&mut self, session: &mut dyn SpawnSession, external: &ExternalId, now: Instant) {
        let Some(id) = session.lookup_client(external) else {
            warn!(external = %external, "Kicked player has no connection");
            return;
        };
        info!(external = %external, client_id = ?id, "Kicking player");
        session.disconnect_client(id, "kicked");
        self.disconnect(session, id, now);
    }

    // ─── Scanning and batching ───

    /// Lazily tracks untracked connections as ready, then batches every
    /// eligible client. With nothing eligible the watchdog is (re)started.
    pub fn process_existing_clients(&mut self, session: &mut dyn SpawnSession, now: Instant) {
        if !self.is_active() {
            return;
        }
        let connected = session.connected_clients();
        for id in &connected {
            if !self.tracker.contains(*id) {
                self.set(*id, LifecycleState::ReadyToSpawn, now);
            }
        }

        let eligible: Vec<ClientId> = connected
            .into_iter()
            .filter(|id| self.should_spawn(*id))
            .collect();
        if !eligible.is_empty() {
            self.batch_spawn(eligible, now);
        } else if self.pending.is_empty() {
            self.start_watchdog(now);
        }
    }

    /// Scene loaded, not yet spawned, and connected or ready.
    pub fn should_spawn(&self, id: ClientId) -> bool {
        self.scene_loaded
            && !self.spawned.contains_key(&id)
            && matches!(
                self.tracker.get_state(id),
                LifecycleState::Connected | LifecycleState::ReadyToSpawn
            )
    }

    fn batch_spawn(&mut self, ids: Vec<ClientId>, now: Instant) {
        let mut scheduled = 0usize;
        for id in ids {
            if !self.set(id, LifecycleState::Spawning, now) {
                continue;
            }
            self.pending.insert(id);
            self.schedule_spawn(id, true, now);
            scheduled += 1;
        }
        debug!(count = scheduled, "Batch spawn scheduled");
    }

    fn spawn_delayed(&mut self, id: ClientId, now: Instant) {
        if !self.is_active() {
            debug!(client_id = ?id, "Not initialized yet, spawn deferred to initial scan");
            return;
        }
        if !self.should_spawn(id) {
            return;
        }
        if self.set(id, LifecycleState::Spawning, now) {
            self.schedule_spawn(id, false, now);
        }
    }

    fn schedule_spawn(&mut self, id: ClientId, batched: bool, now: Instant) {
        if let Some(old) = self.spawn_timers.remove(&id) {
            self.timers.cancel(old);
        }
        let at = now + self.config.spawn_delay();
        let timer = self.timers.schedule(at, Task::Spawn { client: id, batched });
        self.spawn_timers.insert(id, timer);
    }

    /// Immediate spawn attempt that skips the trigger's readiness gate.
    fn force_spawn(&mut self, session: &mut dyn SpawnSession, id: ClientId, now: Instant) {
        if !self.is_active()
            || !session.is_connected(id)
            || self.spawned.contains_key(&id)
            || !self.tracker.get_state(id).is_awaiting_spawn()
        {
            return;
        }
        if let Some(timer) = self.spawn_timers.remove(&id) {
            self.timers.cancel(timer);
        }
        self.pending.remove(&id);
        if !self.set(id, LifecycleState::Spawning, now) {
            return;
        }
        if self.execute_spawn(session, id, now) {
            self.evaluate_completion(session);
        }
    }

    // ─── Timer continuations ───

    /// Runs every continuation due at or before `now`, each at its own deadline.
    pub fn advance(&mut self, session: &mut dyn SpawnSession, now: Instant) {
        while let Some((id, at, task)) = self.timers.pop_due(now) {
            match task {
                Task::Spawn { client, batched } => {
                    if self.spawn_timers.get(&client) == Some(&id) {
                        self.spawn_timers.remove(&client);
                    }
                    self.run_spawn_task(session, client, batched, at);
                }
                Task::Watchdog => {
                    self.watchdog = None;
                    self.on_watchdog(session, at);
                }
                Task::TimeoutSweep => {
                    self.sweep = None;
                    self.on_sweep(session, at);
                }
            }
        }
    }

    /// Earliest pending continuation, for the host loop to sleep until.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn run_spawn_task(
        &mut self,
        session: &mut dyn SpawnSession,
        id: ClientId,
        batched: bool,
        now: Instant,
    ) {
        let spawned = self.execute_spawn(session, id, now);
        if batched {
            self.pending.remove(&id);
            if self.pending.is_empty() {
                self.on_batch_drained(session, now);
            }
        } else if spawned {
            self.evaluate_completion(session);
        }
    }

    fn on_batch_drained(&mut self, session: &mut dyn SpawnSession, now: Instant) {
        if self.is_complete(session) {
            self.try_finish_spawning();
        } else {
            self.start_watchdog(now);
        }
    }

    /// Re-validates, allocates a slot and calls the factory.
    ///
    /// Returns true when the client ended up spawned by this call.
    fn execute_spawn(&mut self, session: &mut dyn SpawnSession, id: ClientId, now: Instant) -> bool {
        if !self.is_active() {
            return false;
        }
        if !session.is_connected(id) {
            debug!(client_id = ?id, "Client left before its spawn resumed, skipping");
            return false;
        }
        if self.spawned.contains_key(&id) {
            debug!(client_id = ?id, "Client already spawned, skipping");
            return false;
        }
        match self.tracker.get_state(id) {
            LifecycleState::Spawning => {}
            LifecycleState::Connected | LifecycleState::ReadyToSpawn => {
                if !self.set(id, LifecycleState::Spawning, now) {
                    return false;
                }
            }
            state => {
                debug!(client_id = ?id, ?state, "Client no longer eligible, skipping spawn");
                return false;
            }
        }

        if let Some(existing) = self.factory.find_owned(id) {
            match self.config.existing_entity_policy {
                ExistingEntityPolicy::Adopt => {
                    warn!(client_id = ?id, entity = ?existing, "Adopting surviving entity");
                    let (position, rotation) = self
                        .factory
                        .pose_of(existing)
                        .unwrap_or((Vec3::ZERO, Quat::IDENTITY));
                    self.register_spawn(id, existing, position, rotation, now);
                    return true;
                }
                ExistingEntityPolicy::Replace => {
                    warn!(client_id = ?id, entity = ?existing, "Replacing surviving entity");
                    self.factory.despawn_entity(existing);
                }
            }
        }

        let placement = self.pool.allocate();
        match self.factory.spawn_entity(id, &placement) {
            Ok(entity) => {
                self.pool.bind(id, placement.slot);
                self.register_spawn(id, entity, placement.position, placement.rotation, now);
                true
            }
            Err(e) => {
                if let Some(slot) = placement.slot {
                    self.pool.restore(slot);
                }
                let attempts = self.tracker.note_failure(id);
                warn!(client_id = ?id, attempts, error = %e, "Entity factory failed, will retry");
                self.set(id, LifecycleState::Connected, now);
                false
            }
        }
    }

    fn register_spawn(
        &mut self,
        id: ClientId,
        entity: EntityId,
        position: Vec3,
        rotation: Quat,
        now: Instant,
    ) {
        self.spawned.insert(id, entity);
        self.set(id, LifecycleState::Spawned, now);
        self.tracker.clear_failures(id);
        self.watchdog_rounds = 0;
        self.stalled = false;
        info!(client_id = ?id, entity = ?entity, ?position, "Player spawned");
        self.signals.push(SpawnSignal::PlayerSpawned {
            client: id,
            entity,
            position,
            rotation,
        });
    }

    fn start_watchdog(&mut self, now: Instant) {
        if let Some(old) = self.watchdog.take() {
            self.timers.cancel(old);
        }
        let at = now + self.config.watchdog_period();
        self.watchdog = Some(self.timers.schedule(at, Task::Watchdog));
    }

    fn on_watchdog(&mut self, session: &mut dyn SpawnSession, now: Instant) {
        if !self.scene_loaded {
            debug!("Watchdog: scene not loaded yet");
            return;
        }
        if self.is_complete(session) {
            self.try_finish_spawning();
            return;
        }
        self.watchdog_rounds += 1;
        if self.watchdog_rounds >= self.config.max_watchdog_rounds && !self.stalled {
            self.stalled = true;
            warn!(
                rounds = self.watchdog_rounds,
                missing = ?self.missing_clients(session),
                "Spawning stalled"
            );
        }
        let any_eligible = session
            .connected_clients()
            .into_iter()
            .any(|id| self.should_spawn(id));
        if self.stalled && !any_eligible {
            return;
        }
        self.process_existing_clients(session, now);
    }

    fn arm_sweep(&mut self, now: Instant) {
        if let Some(old) = self.sweep.take() {
            self.timers.cancel(old);
        }
        if let Some(interval) = self.trigger.sweep_interval() {
            self.sweep = Some(self.timers.schedule(now + interval, Task::TimeoutSweep));
        }
    }

    fn on_sweep(&mut self, session: &mut dyn SpawnSession, now: Instant) {
        if !self.is_active() {
            return;
        }
        let actions = self.trigger.sweep(&self.tracker, now);
        for action in actions {
            self.apply(session, action, now);
        }
        self.arm_sweep(now);
    }

    // ─── Completion ───

    /// The scene is loaded and every connected client is spawned (or nobody
    /// is connected).
    fn is_complete(&self, session: &dyn SpawnSession) -> bool {
        self.scene_loaded && self.missing_clients(session).is_empty()
    }

    fn missing_clients(&self, session: &dyn SpawnSession) -> Vec<ClientId> {
        session
            .connected_clients()
            .into_iter()
            .filter(|id| !self.spawned.contains_key(id))
            .collect()
    }

    fn evaluate_completion(&mut self, session: &mut dyn SpawnSession) {
        if self.is_complete(session) {
            self.try_finish_spawning();
        }
    }

    /// Emits `FinishedSpawning` unless it already fired. Returns whether it fired now.
    pub fn try_finish_spawning(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        info!(spawned = self.spawned.len(), "All players spawned");
        self.signals.push(SpawnSignal::FinishedSpawning);
        true
    }

    // ─── Cleanup ───

    /// Forgets a client entirely. Calling it twice is the same as once.
    pub fn cleanup_client(&mut self, session: &mut dyn SpawnSession, id: ClientId) {
        let had_record = self.tracker.remove(id).is_some();
        self.pool.release(id);
        self.despawn_entity_of(id);
        self.pending.remove(&id);
        if let Some(timer) = self.spawn_timers.remove(&id) {
            self.timers.cancel(timer);
        }
        session.forget_client(id);
        self.trigger.forget(id);
        if had_record {
            debug!(client_id = ?id, "Client cleaned up");
        }
    }

    fn despawn_entity_of(&mut self, id: ClientId) -> Option<EntityId> {
        let entity = self.spawned.remove(&id)?;
        self.factory.despawn_entity(entity);
        info!(client_id = ?id, entity = ?entity, "Player despawned");
        self.signals.push(SpawnSignal::PlayerDespawned { client: id, entity });
        Some(entity)
    }

    /// Cleans up every tracked client and rebuilds the pool.
    pub fn cleanup_all(&mut self, session: &mut dyn SpawnSession) {
        let ids: BTreeSet<ClientId> = self
            .spawned
            .keys()
            .copied()
            .chain(self.tracker.records().map(|r| r.id))
            .collect();
        for id in &ids {
            self.cleanup_client(session, *id);
        }
        self.pool.reset_all();
        self.pending.clear();
        info!(count = ids.len(), "All clients cleaned up");
    }

    /// Despawns every spawned client and spawns them again. Returns how many
    /// were re-triggered.
    pub fn force_respawn_all(&mut self, session: &mut dyn SpawnSession, now: Instant) -> usize {
        let ids: Vec<ClientId> = self.spawned.keys().copied().collect();
        for id in &ids {
            self.pool.release(*id);
            self.despawn_entity_of(*id);
            self.set(*id, LifecycleState::ReadyToSpawn, now);
        }
        info!(count = ids.len(), "Forcing respawn");
        self.process_existing_clients(session, now);
        ids.len()
    }

    // ─── Accessors ───

    pub fn get_state(&self, id: ClientId) -> LifecycleState {
        self.tracker.get_state(id)
    }

    pub fn spawned_entity(&self, id: ClientId) -> Option<EntityId> {
        self.spawned.get(&id).copied()
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn tracker(&self) -> &ClientLifecycleTracker {
        &self.tracker
    }

    pub fn pool(&self) -> &SpawnPointPool {
        &self.pool
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Outbound signals in emission order.
    pub fn drain_signals(&mut self) -> Vec<SpawnSignal> {
        self.signals.drain()
    }

    pub fn diagnostics(&self, now: Instant) -> SpawnDiagnostics {
        let clients = self
            .tracker
            .records()
            .map(|r| ClientDiagnostic {
                id: r.id,
                state: r.state,
                failed_attempts: r.failed_attempts,
                slot: self.pool.slot_of(r.id),
                entity: self.spawned.get(&r.id).copied(),
                connected_for_ms: now.saturating_duration_since(r.connected_at).as_millis() as u64,
            })
            .collect();
        SpawnDiagnostics {
            trigger: self.trigger.name(),
            initialized: self.initialized,
            disabled: self.disabled,
            scene_loaded: self.scene_loaded,
            finished: self.finished,
            stalled: self.stalled,
            available_slots: self.pool.available_count(),
            used_slots: self.pool.used_count(),
            spawned_count: self.spawned.len(),
            pending_spawns: self.spawn_timers.len(),
            clients,
            recent_transitions: self
                .tracker
                .history()
                .rev()
                .take(RECENT_TRANSITIONS)
                .cloned()
                .collect(),
        }
    }

    fn is_active(&self) -> bool {
        self.initialized && !self.disabled
    }

    /// Checked transition with logging. Returns false if it was rejected.
    fn set(&mut self, id: ClientId, to: LifecycleState, now: Instant) -> bool {
        match self.tracker.transition(id, to, now) {
            Ok(Some(_)) => {
                self.log_transition(id, to);
                true
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Rejected lifecycle transition");
                false
            }
        }
    }

    fn log_transition(&self, id: ClientId, to: LifecycleState) {
        if self.config.debug_logging {
            info!(client_id = ?id, state = ?to, "Lifecycle transition");
        } else {
            debug!(client_id = ?id, state = ?to, "Lifecycle transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::bail;
    use spawn_shared::config::{SpawnPointDef, TriggerMode};

    use super::*;
    use crate::{pool::Placement, session::LocalSession};

    /// Fails the first `failures_left` spawn calls.
    struct FlakyFactory {
        inner: WorldFactory,
        failures_left: u32,
        calls: u32,
    }

    impl FlakyFactory {
        fn new(failures_left: u32) -> Self {
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

    fn config(points: usize) -> SpawnConfig {
        SpawnConfig {
            spawn_delay_seconds: 0.5,
            watchdog_grace_seconds: 1.5,
            client_ready_timeout_seconds: 5.0,
            timeout_sweep_interval_seconds: 1.0,
            spawn_points: (0..points)
                .map(|i| SpawnPointDef::new(Vec3::new(i as f32 * 4.0, 0.0, 0.0), 0.0))
                .collect(),
            rng_seed: Some(11),
            ..Default::default()
        }
    }

    struct Harness<F: EntityFactory> {
        orch: SpawnOrchestrator<F>,
        session: LocalSession,
        t0: Instant,
        signals: Vec<SpawnSignal>,
    }

    impl<F: EntityFactory> Harness<F> {
        fn new(config: SpawnConfig, factory: F) -> Self {
            Self {
                orch: SpawnOrchestrator::new(config, factory),
                session: LocalSession::new(),
                t0: Instant::now(),
                signals: Vec::new(),
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.t0 + Duration::from_millis(ms)
        }

        fn init(&mut self, ms: u64) -> Result<(), SpawnError> {
            let now = self.at(ms);
            let res = self.orch.initialize(&mut self.session, now);
            self.collect();
            res
        }

        fn connect(&mut self, id: u32, ms: u64) {
            self.session.connect(ClientId(id));
            self.event(SessionEvent::NetworkConnected(ClientId(id)), ms);
        }

        fn event(&mut self, event: SessionEvent, ms: u64) {
            let now = self.at(ms);
            self.orch.handle_event(&mut self.session, event, now);
            self.collect();
        }

        fn scene_loaded(&mut self, completed: &[u32], ms: u64) {
            self.event(
                SessionEvent::SceneLoadCompleted {
                    scene: "arena".into(),
                    completed: completed.iter().map(|id| ClientId(*id)).collect(),
                    timed_out: Vec::new(),
                },
                ms,
            );
        }

        fn advance(&mut self, ms: u64) {
            let now = self.at(ms);
            self.orch.advance(&mut self.session, now);
            self.collect();
        }

        fn collect(&mut self) {
            self.signals.extend(self.orch.drain_signals());
        }

        fn state(&self, id: u32) -> LifecycleState {
            self.orch.get_state(ClientId(id))
        }

        fn finished_count(&self) -> usize {
            self.signals
                .iter()
                .filter(|s| **s == SpawnSignal::FinishedSpawning)
                .count()
        }
    }

    fn harness(points: usize) -> Harness<WorldFactory> {
        Harness::new(config(points), WorldFactory::new("player"))
    }

    #[test]
    fn missing_spawn_points_disable_orchestrator() {
        let mut h = harness(0);
        let err = h.init(0).unwrap_err();
        assert!(matches!(err, SpawnError::Configuration(_)));
        assert!(h.orch.is_disabled());

        h.connect(1, 10);
        assert_eq!(h.state(1), LifecycleState::Disconnected);
        assert_eq!(h.init(20), Err(SpawnError::Disabled));
    }

    #[test]
    fn missing_template_disables_orchestrator() {
        let mut h = Harness::new(config(2), WorldFactory::new(""));
        assert!(matches!(h.init(0), Err(SpawnError::Configuration(_))));
    }

    #[test]
    fn scene_ready_clients_spawn_after_delay() {
        let mut h = harness(3);
        h.connect(1, 0);
        h.connect(2, 0);
        h.init(0).unwrap();
        assert_eq!(h.state(1), LifecycleState::WaitingForScene);

        h.scene_loaded(&[1, 2], 100);
        assert_eq!(h.state(1), LifecycleState::Spawning);
        h.advance(599);
        assert_eq!(h.orch.spawned_count(), 0);

        h.advance(600);
        assert_eq!(h.state(1), LifecycleState::Spawned);
        assert_eq!(h.state(2), LifecycleState::Spawned);
        assert_eq!(h.orch.pool().available_count(), 1);
        assert_ne!(
            h.orch.pool().slot_of(ClientId(1)),
            h.orch.pool().slot_of(ClientId(2))
        );
        assert!(matches!(h.signals[0], SpawnSignal::PlayerSpawned { .. }));
        assert!(matches!(h.signals[1], SpawnSignal::PlayerSpawned { .. }));
        assert_eq!(h.signals[2], SpawnSignal::FinishedSpawning);
    }

    #[test]
    fn late_joiner_spawns_without_second_finish() {
        let mut h = harness(3);
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        h.advance(500);
        assert_eq!(h.finished_count(), 1);

        h.connect(3, 1_000);
        assert_eq!(h.state(3), LifecycleState::WaitingForScene);
        h.event(SessionEvent::SceneSyncCompleted(ClientId(3)), 1_200);
        assert_eq!(h.state(3), LifecycleState::Spawning);
        h.advance(10_000);

        assert_eq!(h.state(3), LifecycleState::Spawned);
        assert_eq!(h.finished_count(), 1);
    }

    #[test]
    fn disconnect_during_delay_never_spawns() {
        let mut h = harness(2);
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        assert_eq!(h.state(1), LifecycleState::Spawning);

        h.session.drop_client(ClientId(1));
        h.event(SessionEvent::NetworkDisconnected(ClientId(1)), 200);
        h.advance(5_000);

        assert_eq!(h.orch.spawned_count(), 0);
        assert!(h.orch.factory().world().is_empty());
        assert_eq!(h.orch.pool().available_count(), 2);
        assert_eq!(h.orch.pool().used_count(), 0);
        assert!(!h.orch.tracker().contains(ClientId(1)));
    }

    #[test]
    fn factory_failure_rolls_back_and_retries() {
        let mut h = Harness::new(config(3), FlakyFactory::new(1));
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);

        h.advance(500);
        assert_eq!(h.state(1), LifecycleState::Connected);
        assert_eq!(h.orch.factory().calls, 1);
        assert_eq!(h.orch.tracker().record(ClientId(1)).unwrap().failed_attempts, 1);
        assert_eq!(h.orch.pool().available_count(), 3);
        assert_eq!(h.finished_count(), 0);

        // The watchdog rescans 2s after the failure; the retry lands 0.5s later.
        h.advance(3_000);
        assert_eq!(h.state(1), LifecycleState::Spawned);
        assert_eq!(h.orch.tracker().record(ClientId(1)).unwrap().failed_attempts, 0);
        assert_eq!(h.orch.pool().used_count(), 1);
        assert_eq!(h.orch.factory().calls, 2);
        assert_eq!(h.finished_count(), 1);
    }

    #[test]
    fn watchdog_finishes_when_nobody_is_connected() {
        let mut h = harness(2);
        h.init(0).unwrap();
        h.scene_loaded(&[], 0);
        h.advance(1_999);
        assert_eq!(h.finished_count(), 0);
        h.advance(2_000);
        assert_eq!(h.finished_count(), 1);
        h.advance(60_000);
        assert_eq!(h.finished_count(), 1);
    }

    #[test]
    fn empty_server_waits_for_the_scene_before_finishing() {
        let mut h = harness(2);
        h.init(0).unwrap();
        h.advance(10_000);
        assert_eq!(h.finished_count(), 0);
        assert!(!h.orch.diagnostics(h.at(10_000)).finished);

        h.connect(1, 10_000);
        h.connect(2, 10_000);
        h.scene_loaded(&[1, 2], 10_100);
        h.advance(10_600);

        assert_eq!(h.orch.spawned_count(), 2);
        assert_eq!(h.finished_count(), 1);
        assert_eq!(h.signals.last(), Some(&SpawnSignal::FinishedSpawning));
    }

    #[test]
    fn repeated_connect_while_spawning_is_ignored() {
        let mut h = harness(2);
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        assert_eq!(h.state(1), LifecycleState::Spawning);

        h.event(SessionEvent::NetworkConnected(ClientId(1)), 100);
        assert_eq!(h.state(1), LifecycleState::Spawning);

        h.advance(500);
        assert_eq!(h.state(1), LifecycleState::Spawned);
        assert_eq!(h.orch.spawned_count(), 1);

        h.event(SessionEvent::NetworkConnected(ClientId(1)), 600);
        assert_eq!(h.state(1), LifecycleState::Spawned);
        assert_eq!(h.orch.spawned_count(), 1);
        assert_eq!(h.finished_count(), 1);
    }

    #[test]
    fn resumed_spawn_skips_client_back_to_waiting_for_scene() {
        let mut h = harness(2);
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        assert_eq!(h.state(1), LifecycleState::Spawning);

        h.orch
            .tracker
            .set_state(ClientId(1), LifecycleState::WaitingForScene, h.at(100));
        h.advance(500);

        assert_eq!(h.state(1), LifecycleState::WaitingForScene);
        assert_eq!(h.orch.spawned_count(), 0);
        assert!(h.orch.factory().world().is_empty());
        assert_eq!(h.orch.pool().used_count(), 0);
    }

    #[test]
    fn diagnostics_list_recent_transitions_newest_first() {
        let mut h = harness(2);
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        h.advance(500);

        let diag = h.orch.diagnostics(h.at(500));
        let moves: Vec<_> = diag
            .recent_transitions
            .iter()
            .map(|t| (t.client, t.from, t.to))
            .collect();
        assert_eq!(
            moves,
            vec![
                (ClientId(1), LifecycleState::Spawning, LifecycleState::Spawned),
                (ClientId(1), LifecycleState::ReadyToSpawn, LifecycleState::Spawning),
                (ClientId(1), LifecycleState::WaitingForScene, LifecycleState::ReadyToSpawn),
                (ClientId(1), LifecycleState::Connected, LifecycleState::WaitingForScene),
                (ClientId(1), LifecycleState::Disconnected, LifecycleState::Connected),
            ]
        );
    }

    #[test]
    fn repeated_failures_surface_as_stall() {
        let mut cfg = config(2);
        cfg.max_watchdog_rounds = 3;
        let mut h = Harness::new(cfg, FlakyFactory::new(u32::MAX));
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        h.advance(30_000);

        assert!(h.orch.is_stalled());
        assert_ne!(h.state(1), LifecycleState::Spawned);
        let diag = h.orch.diagnostics(h.at(30_000));
        assert!(diag.stalled);
        assert!(diag.clients[0].failed_attempts >= 3);
        assert_eq!(diag.available_slots, 2);
        assert_eq!(h.finished_count(), 0);
    }

    #[test]
    fn kick_terminates_only_the_resolved_connection() {
        let mut h = harness(3);
        h.session.connect_as(ClientId(1), ExternalId::new("alice"));
        h.session.connect_as(ClientId(2), ExternalId::new("bob"));
        h.event(SessionEvent::NetworkConnected(ClientId(1)), 0);
        h.event(SessionEvent::NetworkConnected(ClientId(2)), 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1, 2], 0);
        h.advance(500);

        h.event(
            SessionEvent::MembershipPlayerKicked(ExternalId::new("alice")),
            1_000,
        );

        assert_eq!(h.session.disconnects(), &[(ClientId(1), "kicked".to_string())]);
        assert_eq!(h.state(1), LifecycleState::Disconnected);
        assert_eq!(h.state(2), LifecycleState::Spawned);
        assert!(h.orch.spawned_entity(ClientId(2)).is_some());
        assert!(h.signals.iter().any(|s| matches!(
            s,
            SpawnSignal::PlayerDespawned { client, .. } if *client == ClientId(1)
        )));
        assert_eq!(h.orch.pool().used_count(), 1);
    }

    #[test]
    fn cleanup_client_twice_equals_once() {
        let mut h = harness(2);
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        h.advance(500);

        h.orch.cleanup_client(&mut h.session, ClientId(1));
        h.collect();
        let once = serde_json::to_string(&h.orch.diagnostics(h.at(600))).unwrap();
        h.orch.cleanup_client(&mut h.session, ClientId(1));
        h.collect();
        let twice = serde_json::to_string(&h.orch.diagnostics(h.at(600))).unwrap();

        assert_eq!(once, twice);
        let despawns = h
            .signals
            .iter()
            .filter(|s| matches!(s, SpawnSignal::PlayerDespawned { .. }))
            .count();
        assert_eq!(despawns, 1);
        assert_eq!(h.orch.pool().available_count(), 2);
    }

    #[test]
    fn session_removed_cleans_everything() {
        let mut h = harness(3);
        h.connect(1, 0);
        h.connect(2, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1, 2], 0);
        h.advance(500);

        h.event(SessionEvent::MembershipSessionRemoved, 1_000);

        assert_eq!(h.orch.spawned_count(), 0);
        assert!(h.orch.tracker().is_empty());
        assert_eq!(h.orch.pool().available_count(), 3);
        assert!(h.orch.factory().world().is_empty());
    }

    #[test]
    fn force_respawn_all_rebuilds_entities() {
        let mut h = harness(3);
        h.connect(1, 0);
        h.connect(2, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1, 2], 0);
        h.advance(500);
        let before = h.orch.spawned_entity(ClientId(1)).unwrap();

        let now = h.at(1_000);
        assert_eq!(h.orch.force_respawn_all(&mut h.session, now), 2);
        h.collect();
        assert_eq!(h.state(1), LifecycleState::Spawning);
        assert_eq!(h.orch.pool().used_count(), 0);

        h.advance(1_500);
        let after = h.orch.spawned_entity(ClientId(1)).unwrap();
        assert_ne!(before, after);
        assert_eq!(h.orch.factory().world().len(), 2);
        assert_eq!(h.finished_count(), 1);
    }

    #[test]
    fn reset_allows_a_second_completion() {
        let mut h = harness(2);
        h.init(0).unwrap();
        h.advance(2_000);
        assert_eq!(h.finished_count(), 1);

        h.orch.reset(&mut h.session);
        assert!(!h.orch.is_finished());
        h.init(3_000).unwrap();
        h.advance(5_000);
        assert_eq!(h.finished_count(), 2);
    }

    #[test]
    fn adopt_policy_reuses_surviving_entity() {
        let mut h = harness(3);
        let survivor = h
            .orch
            .factory_mut()
            .spawn_entity(
                ClientId(1),
                &Placement {
                    position: Vec3::new(9.0, 0.0, 9.0),
                    rotation: Default::default(),
                    slot: None,
                },
            )
            .unwrap();
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        h.advance(500);

        assert_eq!(h.orch.spawned_entity(ClientId(1)), Some(survivor));
        assert_eq!(h.orch.pool().available_count(), 3);
        assert_eq!(h.orch.factory().world().len(), 1);
    }

    #[test]
    fn replace_policy_discards_surviving_entity() {
        let mut cfg = config(3);
        cfg.existing_entity_policy = ExistingEntityPolicy::Replace;
        let mut h = Harness::new(cfg, WorldFactory::new("player"));
        let survivor = h
            .orch
            .factory_mut()
            .spawn_entity(
                ClientId(1),
                &Placement {
                    position: Vec3::ZERO,
                    rotation: Default::default(),
                    slot: None,
                },
            )
            .unwrap();
        h.connect(1, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        h.advance(500);

        let fresh = h.orch.spawned_entity(ClientId(1)).unwrap();
        assert_ne!(fresh, survivor);
        assert!(!h.orch.factory().world().is_alive(survivor));
        assert_eq!(h.orch.pool().used_count(), 1);
    }

    #[test]
    fn connection_mode_spawns_each_connect_individually() {
        let mut cfg = config(3);
        cfg.trigger = TriggerMode::Connection;
        let mut h = Harness::new(cfg, WorldFactory::new("player"));
        h.init(0).unwrap();

        h.connect(1, 100);
        assert_eq!(h.state(1), LifecycleState::Spawning);
        h.connect(2, 300);
        h.advance(600);
        assert_eq!(h.state(1), LifecycleState::Spawned);
        assert_eq!(h.state(2), LifecycleState::Spawning);

        h.advance(800);
        assert_eq!(h.state(2), LifecycleState::Spawned);
        assert_eq!(h.finished_count(), 1);
    }

    #[test]
    fn connection_sweep_forces_overdue_spawn() {
        let mut cfg = config(3);
        cfg.trigger = TriggerMode::Connection;
        // Keep the watchdog out of the way so only the sweep can retry.
        cfg.watchdog_grace_seconds = 60.0;
        let mut h = Harness::new(cfg, FlakyFactory::new(1));
        h.init(0).unwrap();
        h.connect(1, 0);

        h.advance(5_500);
        assert_eq!(h.state(1), LifecycleState::Connected);

        h.advance(6_000);
        assert_eq!(h.state(1), LifecycleState::Spawned);
        assert_eq!(h.finished_count(), 1);
    }

    #[test]
    fn scene_sweep_readies_silent_client() {
        let mut h = harness(3);
        h.connect(1, 0);
        h.connect(2, 0);
        h.init(0).unwrap();
        h.scene_loaded(&[1], 0);
        h.advance(5_000);
        assert_eq!(h.state(1), LifecycleState::Spawned);
        assert_eq!(h.state(2), LifecycleState::WaitingForScene);
        assert_eq!(h.finished_count(), 0);

        h.advance(7_000);
        assert_eq!(h.state(2), LifecycleState::Spawned);
        assert_eq!(h.finished_count(), 1);
    }
}
