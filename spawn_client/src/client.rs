//! Bot client implementation.
//!
//! The connection is split on connect: a background task forwards every
//! inbound frame into a channel, so waiting on the inbox with a timeout never
//! drops a partially read frame.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use spawn_shared::{
    ecs::EntityId,
    net::{ClientId, EntitySpawn, ExternalId, NetMsg, ReliableConn, ReliableWriter, PROTOCOL_VERSION},
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotState {
    /// Handshake done, no scene requested yet.
    Connected,
    /// Server asked for a scene that has not been acknowledged.
    LoadingScene,
    /// Scene acknowledged.
    Ready,
    /// Own entity has been spawned.
    Spawned,
    /// Server closed the connection or told us to leave.
    Disconnected,
}

pub struct BotClient {
    pub client_id: ClientId,
    pub external_id: ExternalId,
    pub state: BotState,
    /// Acknowledge `LoadScene` as soon as it arrives.
    pub auto_ack: bool,
    pub scene: Option<String>,
    /// Every live entity the server announced.
    pub entities: BTreeMap<EntityId, EntitySpawn>,
    /// Set once the server reports everyone spawned.
    pub finished: bool,
    pub disconnect_reason: Option<String>,

    writer: ReliableWriter,
    inbox: mpsc::UnboundedReceiver<NetMsg>,
}

impl BotClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(addr: &str, external_id: ExternalId) -> anyhow::Result<Self> {
        info!(server = %addr, external = %external_id, "Connecting to server");
        let mut conn = ReliableConn::connect(addr).await?;
        conn.send(&NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
            external_id: external_id.clone(),
        })
        .await?;

        let client_id = match conn.recv().await.context("handshake")? {
            NetMsg::Welcome { client_id } => client_id,
            NetMsg::Disconnect { reason } => bail!("server refused connection: {reason}"),
            other => bail!("expected Welcome, got {other:?}"),
        };
        info!(client_id = ?client_id, "Connected");

        let (mut reader, writer) = conn.into_split();
        let (tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(msg) = reader.recv().await {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            client_id,
            external_id,
            state: BotState::Connected,
            auto_ack: true,
            scene: None,
            entities: BTreeMap::new(),
            finished: false,
            disconnect_reason: None,
            writer,
            inbox,
        })
    }

    /// Waits for the next server message and applies it.
    ///
    /// Returns `None` on timeout or once the connection is gone.
    pub async fn poll(&mut self, wait: Duration) -> anyhow::Result<Option<NetMsg>> {
        let msg = match tokio::time::timeout(wait, self.inbox.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                self.state = BotState::Disconnected;
                return Ok(None);
            }
            Err(_) => return Ok(None),
        };
        self.apply(&msg).await?;
        Ok(Some(msg))
    }

    /// Polls until `done` holds or `wait` elapses. Returns whether `done` held.
    pub async fn wait_until<P>(&mut self, wait: Duration, mut done: P) -> anyhow::Result<bool>
    where
        P: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + wait;
        while !done(self) {
            let now = tokio::time::Instant::now();
            if now >= deadline || self.state == BotState::Disconnected {
                return Ok(false);
            }
            self.poll(deadline - now).await?;
        }
        Ok(true)
    }

    /// Acknowledges the pending scene.
    pub async fn ack_scene(&mut self) -> anyhow::Result<()> {
        let Some(name) = self.scene.clone() else {
            bail!("no scene requested");
        };
        self.writer.send(&NetMsg::SceneReady { name }).await?;
        if self.state == BotState::LoadingScene {
            self.state = BotState::Ready;
        }
        Ok(())
    }

    /// The entity this client owns, if spawned.
    pub fn own_entity(&self) -> Option<&EntitySpawn> {
        self.entities.values().find(|e| e.owner == self.client_id)
    }

    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.writer
            .send(&NetMsg::Disconnect {
                reason: "bye".to_string(),
            })
            .await?;
        let _ = self.writer.shutdown().await;
        self.state = BotState::Disconnected;
        Ok(())
    }

    async fn apply(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        match msg {
            NetMsg::LoadScene { name } => {
                debug!(client_id = ?self.client_id, scene = %name, "Scene requested");
                self.scene = Some(name.clone());
                self.state = BotState::LoadingScene;
                if self.auto_ack {
                    self.ack_scene().await?;
                }
            }
            NetMsg::EntitySpawn(spawn) => {
                if spawn.owner == self.client_id {
                    info!(client_id = ?self.client_id, entity = ?spawn.id, position = ?spawn.position, "Spawned");
                    self.state = BotState::Spawned;
                }
                self.entities.insert(spawn.id, spawn.clone());
            }
            NetMsg::EntityDelete { id } => {
                if let Some(gone) = self.entities.remove(id) {
                    if gone.owner == self.client_id {
                        self.state = BotState::Ready;
                    }
                }
            }
            NetMsg::SpawningFinished => self.finished = true,
            NetMsg::Disconnect { reason } => {
                info!(client_id = ?self.client_id, reason = %reason, "Disconnected by server");
                self.disconnect_reason = Some(reason.clone());
                self.state = BotState::Disconnected;
            }
            other => debug!(?other, "Ignoring server message"),
        }
        Ok(())
    }
}
