//! Networking primitives.
//!
//! Goals:
//! - Identify connections (`ClientId`) and the external membership identity
//!   (`ExternalId`) a lobby knows them by.
//! - Provide a reliable (TCP) length-prefixed channel for the spawn protocol.
//! - Keep serialization explicit and versionable.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::{
    ecs::EntityId,
    math::{Quat, Vec3},
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on a single frame; anything larger is treated as a broken peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a participant in the external membership service (lobby).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        ExternalId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
        external_id: ExternalId,
    },
    Welcome {
        client_id: ClientId,
    },

    // ─── Scene synchronization ───
    /// Server asks the client to load a scene.
    LoadScene {
        name: String,
    },
    /// Client confirms the scene is loaded.
    SceneReady {
        name: String,
    },

    // ─── Entity replication ───
    /// Server materialized an entity.
    EntitySpawn(EntitySpawn),
    /// Server removed an entity.
    EntityDelete {
        id: EntityId,
    },
    /// Every connected participant has been spawned.
    SpawningFinished,

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

/// Entity spawn packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpawn {
    pub id: EntityId,
    pub owner: ClientId,
    pub position: Vec3,
    pub rotation: Quat,
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &NetMsg) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {addr}"))?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read and write halves so a reader task
    /// and a writer task can run side by side.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (r, w) = self.stream.into_split();
        (ReliableReader { half: r }, ReliableWriter { half: w })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    half: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    half: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.half, msg).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.half.shutdown().await.context("tcp shutdown")?;
        Ok(())
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
