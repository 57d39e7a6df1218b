//! Async host loop around the orchestrator.
//!
//! The orchestrator itself is synchronous and single-threaded. The service
//! owns it together with a [`NetSession`] and feeds it from one input channel,
//! sleeping until the next timer deadline in between. Outbound signals are
//! forwarded to every peer and to any subscribed observers, in FIFO order.

use std::collections::BTreeSet;

use spawn_shared::{
    event::{SessionEvent, SpawnSignal},
    net::{ClientId, EntitySpawn, ExternalId, NetMsg},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::SpawnError,
    factory::EntityFactory,
    orchestrator::SpawnOrchestrator,
    session::NetSession,
};

/// Everything that can wake the service.
#[derive(Debug)]
pub enum ServiceInput {
    PeerJoined {
        client: ClientId,
        external: ExternalId,
        outbound: mpsc::UnboundedSender<NetMsg>,
    },
    PeerLeft(ClientId),
    SceneReady {
        client: ClientId,
        scene: String,
    },
    /// Raw session/membership event, bypassing the peer bookkeeping.
    Event(SessionEvent),
    Command {
        line: String,
        reply: Option<oneshot::Sender<Vec<String>>>,
    },
}

/// An in-flight scene load: who still has to acknowledge it.
#[derive(Debug)]
struct SceneLoad {
    name: String,
    waiting: BTreeSet<ClientId>,
    completed: Vec<ClientId>,
    deadline: Instant,
}

pub struct SpawnService<F: EntityFactory> {
    orch: SpawnOrchestrator<F>,
    session: NetSession,
    current_scene: Option<String>,
    loading: Option<SceneLoad>,
    observers: Vec<mpsc::UnboundedSender<SpawnSignal>>,
    running: bool,
}

impl<F: EntityFactory> SpawnService<F> {
    pub fn new(orch: SpawnOrchestrator<F>) -> Self {
        Self {
            orch,
            session: NetSession::new(),
            current_scene: None,
            loading: None,
            observers: Vec::new(),
            running: true,
        }
    }

    /// Receives a copy of every outbound signal from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SpawnSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn orchestrator(&self) -> &SpawnOrchestrator<F> {
        &self.orch
    }

    pub fn session(&self) -> &NetSession {
        &self.session
    }

    pub fn current_scene(&self) -> Option<&str> {
        self.current_scene.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Initializes the orchestrator against the live session.
    pub fn start(&mut self, now: Instant) -> Result<(), SpawnError> {
        let result = self.orch.initialize(&mut self.session, now);
        self.flush();
        result
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_wakeup(&mut self) -> Option<Instant> {
        let timers = self.orch.next_deadline();
        let load = self.loading.as_ref().map(|l| l.deadline);
        match (timers, load) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs every timer and scene-load deadline due at `now`.
    pub fn tick(&mut self, now: Instant) {
        if self.loading.as_ref().is_some_and(|l| l.deadline <= now) {
            self.finish_scene_load(now);
        }
        self.orch.advance(&mut self.session, now);
        self.flush();
    }

    pub fn handle_input(&mut self, input: ServiceInput, now: Instant) {
        match input {
            ServiceInput::PeerJoined {
                client,
                external,
                outbound,
            } => self.peer_joined(client, external, outbound, now),
            ServiceInput::PeerLeft(client) => self.peer_left(client, now),
            ServiceInput::SceneReady { client, scene } => self.scene_ready(client, &scene, now),
            ServiceInput::Event(event) => {
                self.orch.handle_event(&mut self.session, event, now);
            }
            ServiceInput::Command { line, reply } => {
                let out = match self.exec_command(&line, now) {
                    Ok(out) => out,
                    Err(e) => vec![format!("error: {e:#}")],
                };
                match reply {
                    Some(reply) => {
                        let _ = reply.send(out);
                    }
                    None => {
                        for line in out {
                            info!(target: "console", "{line}");
                        }
                    }
                }
            }
        }
        self.flush();
    }

    /// Serves inputs until the channel closes or `quit` is executed.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<ServiceInput>) -> anyhow::Result<()> {
        if let Err(e) = self.start(Instant::now()) {
            warn!(error = %e, "Spawning unavailable; serving connections only");
        }

        while self.running {
            let wakeup = self.next_wakeup();
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input, Instant::now()),
                    None => break,
                },
                _ = sleep_until_opt(wakeup) => {}
            }
            self.tick(Instant::now());
        }

        info!("Spawn service stopped");
        self.orch.cleanup_all(&mut self.session);
        self.flush();
        Ok(())
    }

    /// Broadcasts a scene load and collects acknowledgements.
    ///
    /// Completes when every connected peer has answered or when the scene-load
    /// timeout elapses, whichever is first. A load already in progress is
    /// superseded.
    pub fn load_scene(&mut self, name: &str, now: Instant) {
        if let Some(prev) = self.loading.take() {
            warn!(scene = %prev.name, next = %name, "Superseding scene load in progress");
        }
        info!(scene = %name, peers = self.session.len(), "Loading scene");

        self.session.broadcast(&NetMsg::LoadScene {
            name: name.to_string(),
        });
        self.loading = Some(SceneLoad {
            name: name.to_string(),
            waiting: self.session.peer_ids().collect(),
            completed: Vec::new(),
            deadline: now + self.orch.config().scene_load_timeout(),
        });
        self.maybe_finish_scene_load(now);
    }

    /// Executes one console line.
    pub fn exec_command(&mut self, line: &str, now: Instant) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let diag = self.orch.diagnostics(now);
                let mut out = vec![format!(
                    "scene={} peers={}",
                    self.current_scene.as_deref().unwrap_or("-"),
                    self.session.len()
                )];
                out.push(serde_json::to_string_pretty(&diag)?);
                Ok(out)
            }
            "scene" => {
                let Some(name) = tokens.get(1) else {
                    return Ok(vec!["Usage: scene <name>".to_string()]);
                };
                self.load_scene(name, now);
                Ok(vec![format!("Loading scene '{name}'")])
            }
            "respawn_all" => {
                let n = self.orch.force_respawn_all(&mut self.session, now);
                Ok(vec![format!("Respawning {n} client(s)")])
            }
            "kick" => {
                let Some(external) = tokens.get(1) else {
                    return Ok(vec!["Usage: kick <external_id>".to_string()]);
                };
                let external = ExternalId::new(*external);
                self.orch.handle_event(
                    &mut self.session,
                    SessionEvent::MembershipPlayerKicked(external.clone()),
                    now,
                );
                Ok(vec![format!("Kicked '{external}'")])
            }
            "end" => {
                self.orch
                    .handle_event(&mut self.session, SessionEvent::MembershipSessionRemoved, now);
                self.loading = None;
                self.current_scene = None;
                Ok(vec!["Session ended".to_string()])
            }
            "quit" | "exit" => {
                info!("Spawn service shutting down");
                self.running = false;
                Ok(vec!["Shutting down".to_string()])
            }
            other => Ok(vec![format!("Unknown command '{other}'")]),
        }
    }

    fn peer_joined(
        &mut self,
        client: ClientId,
        external: ExternalId,
        outbound: mpsc::UnboundedSender<NetMsg>,
        now: Instant,
    ) {
        info!(client_id = ?client, external = %external, "Peer joined");
        self.session.add_peer(client, external, outbound);

        // Late joiners are told which scene to load.
        if let Some(load) = self.loading.as_mut() {
            load.waiting.insert(client);
            let name = load.name.clone();
            self.session.send(client, NetMsg::LoadScene { name });
        } else if let Some(name) = self.current_scene.clone() {
            self.session.send(client, NetMsg::LoadScene { name });
        }

        self.orch
            .handle_event(&mut self.session, SessionEvent::NetworkConnected(client), now);
    }

    fn peer_left(&mut self, client: ClientId, now: Instant) {
        // A peer we disconnected ourselves is already gone.
        if !self.session.remove_peer(client) {
            debug!(client_id = ?client, "Peer already removed");
            return;
        }
        info!(client_id = ?client, "Peer left");
        self.orch
            .handle_event(&mut self.session, SessionEvent::NetworkDisconnected(client), now);

        if let Some(load) = self.loading.as_mut() {
            load.waiting.remove(&client);
            load.completed.retain(|id| *id != client);
        }
        self.maybe_finish_scene_load(now);
    }

    fn scene_ready(&mut self, client: ClientId, scene: &str, now: Instant) {
        if let Some(load) = self.loading.as_mut() {
            if load.name == scene && load.waiting.remove(&client) {
                debug!(client_id = ?client, scene, "Scene acknowledged");
                load.completed.push(client);
                self.maybe_finish_scene_load(now);
                return;
            }
        }

        if self.current_scene.as_deref() == Some(scene) {
            self.orch
                .handle_event(&mut self.session, SessionEvent::SceneSyncCompleted(client), now);
        } else {
            debug!(client_id = ?client, scene, "Ignoring stale scene acknowledgement");
        }
    }

    fn maybe_finish_scene_load(&mut self, now: Instant) {
        if self.loading.as_ref().is_some_and(|l| l.waiting.is_empty()) {
            self.finish_scene_load(now);
        }
    }

    fn finish_scene_load(&mut self, now: Instant) {
        let Some(load) = self.loading.take() else {
            return;
        };
        let timed_out: Vec<ClientId> = load.waiting.into_iter().collect();
        info!(
            scene = %load.name,
            completed = load.completed.len(),
            timed_out = timed_out.len(),
            "Scene load finished"
        );
        self.current_scene = Some(load.name.clone());
        self.orch.handle_event(
            &mut self.session,
            SessionEvent::SceneLoadCompleted {
                scene: load.name,
                completed: load.completed,
                timed_out,
            },
            now,
        );
    }

    fn flush(&mut self) {
        for signal in self.orch.drain_signals() {
            if let Some(msg) = self.signal_to_msg(&signal) {
                self.session.broadcast(&msg);
            }
            self.observers.retain(|tx| tx.send(signal.clone()).is_ok());
        }
    }

    fn signal_to_msg(&self, signal: &SpawnSignal) -> Option<NetMsg> {
        match *signal {
            SpawnSignal::PlayerSpawned {
                client,
                entity,
                position,
                rotation,
            } => Some(NetMsg::EntitySpawn(EntitySpawn {
                id: entity,
                owner: client,
                position,
                rotation,
            })),
            SpawnSignal::PlayerDespawned { entity, .. } => Some(NetMsg::EntityDelete { id: entity }),
            SpawnSignal::FinishedSpawning => Some(NetMsg::SpawningFinished),
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
