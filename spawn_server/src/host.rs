//! TCP front end for the spawn service.
//!
//! Each accepted connection performs a `Hello`/`Welcome` handshake and is then
//! split into a reader task (client messages into the service channel) and a
//! writer task (the peer's outbound queue onto the socket).

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use spawn_shared::net::{ClientId, NetMsg, ReliableConn, ReliableListener, PROTOCOL_VERSION};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::service::ServiceInput;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NetHost {
    listener: ReliableListener,
}

impl NetHost {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = ReliableListener::bind(addr).await.context("bind listener")?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, one task pair per peer.
    pub async fn run(self, inputs: mpsc::Sender<ServiceInput>) -> anyhow::Result<()> {
        loop {
            let (conn, peer) = self.listener.accept().await?;
            let inputs = inputs.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_peer(conn, peer, inputs).await {
                    warn!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

async fn serve_peer(
    mut conn: ReliableConn,
    peer: SocketAddr,
    inputs: mpsc::Sender<ServiceInput>,
) -> anyhow::Result<()> {
    let hello = timeout(HANDSHAKE_TIMEOUT, conn.recv())
        .await
        .context("handshake timed out")??;
    let external = match hello {
        NetMsg::Hello {
            protocol,
            external_id,
        } if protocol == PROTOCOL_VERSION => external_id,
        NetMsg::Hello { protocol, .. } => {
            let _ = conn
                .send(&NetMsg::Disconnect {
                    reason: format!("protocol {protocol} unsupported"),
                })
                .await;
            bail!("client protocol {protocol} != {PROTOCOL_VERSION}");
        }
        other => bail!("expected Hello, got {other:?}"),
    };

    let client = ClientId::new_unique();
    conn.send(&NetMsg::Welcome { client_id: client }).await?;
    info!(%peer, client_id = ?client, external = %external, "Handshake complete");

    let (mut reader, mut writer) = conn.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<NetMsg>();
    inputs
        .send(ServiceInput::PeerJoined {
            client,
            external,
            outbound,
        })
        .await
        .context("spawn service stopped")?;

    // Ends when the service drops the peer's queue.
    tokio::spawn(async move {
        while let Some(msg) = queue.recv().await {
            let closing = matches!(msg, NetMsg::Disconnect { .. });
            if let Err(e) = writer.send(&msg).await {
                debug!(client_id = ?client, error = %e, "Write failed");
                break;
            }
            if closing {
                let _ = writer.shutdown().await;
                break;
            }
        }
    });

    loop {
        match reader.recv().await {
            Ok(NetMsg::SceneReady { name }) => {
                if inputs
                    .send(ServiceInput::SceneReady {
                        client,
                        scene: name,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(NetMsg::Disconnect { reason }) => {
                info!(client_id = ?client, reason = %reason, "Client disconnected");
                break;
            }
            Ok(other) => debug!(client_id = ?client, ?other, "Unexpected client message"),
            Err(e) => {
                debug!(client_id = ?client, error = %e, "Connection closed");
                break;
            }
        }
    }

    let _ = inputs.send(ServiceInput::PeerLeft(client)).await;
    Ok(())
}
