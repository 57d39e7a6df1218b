//! Session handle passed into every orchestrator call.
//!
//! The orchestrator never reaches for a global network manager; it reads
//! membership and issues disconnects through this trait.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use spawn_shared::net::{ClientId, ExternalId, NetMsg};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Connection/identity collaborator seen by the orchestrator.
pub trait SpawnSession {
    /// Currently connected clients, in stable order.
    fn connected_clients(&self) -> Vec<ClientId>;

    fn is_connected(&self, client: ClientId) -> bool;

    /// Forcibly terminates a connection.
    fn disconnect_client(&mut self, client: ClientId, reason: &str);

    /// Resolves a membership identity to its connection.
    fn lookup_client(&self, external: &ExternalId) -> Option<ClientId>;

    /// Drops the identity mapping of a cleaned-up client.
    fn forget_client(&mut self, client: ClientId);
}

struct Peer {
    external: ExternalId,
    outbound: mpsc::UnboundedSender<NetMsg>,
}

/// Session backed by the TCP host: one outbound queue per peer.
#[derive(Default)]
pub struct NetSession {
    peers: BTreeMap<ClientId, Peer>,
    identities: HashMap<ExternalId, ClientId>,
}

impl NetSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(
        &mut self,
        client: ClientId,
        external: ExternalId,
        outbound: mpsc::UnboundedSender<NetMsg>,
    ) {
        self.identities.insert(external.clone(), client);
        self.peers.insert(client, Peer { external, outbound });
    }

    /// Returns false if the peer was already gone.
    pub fn remove_peer(&mut self, client: ClientId) -> bool {
        self.peers.remove(&client).is_some()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.peers.keys().copied()
    }

    pub fn external_id(&self, client: ClientId) -> Option<&ExternalId> {
        self.peers.get(&client).map(|p| &p.external)
    }

    pub fn send(&self, client: ClientId, msg: NetMsg) {
        if let Some(peer) = self.peers.get(&client) {
            if peer.outbound.send(msg).is_err() {
                debug!(client_id = ?client, "Peer writer closed");
            }
        }
    }

    pub fn broadcast(&self, msg: &NetMsg) {
        for (id, peer) in &self.peers {
            if peer.outbound.send(msg.clone()).is_err() {
                debug!(client_id = ?id, "Peer writer closed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl SpawnSession for NetSession {
    fn connected_clients(&self) -> Vec<ClientId> {
        self.peers.keys().copied().collect()
    }

    fn is_connected(&self, client: ClientId) -> bool {
        self.peers.contains_key(&client)
    }

    fn disconnect_client(&mut self, client: ClientId, reason: &str) {
        if let Some(peer) = self.peers.remove(&client) {
            info!(client_id = ?client, external = %peer.external, reason, "Disconnecting client");
            let _ = peer.outbound.send(NetMsg::Disconnect {
                reason: reason.to_string(),
            });
        }
    }

    fn lookup_client(&self, external: &ExternalId) -> Option<ClientId> {
        self.identities.get(external).copied()
    }

    fn forget_client(&mut self, client: ClientId) {
        self.identities.retain(|_, id| *id != client);
    }
}

/// In-memory session for hosts that manage connections themselves.
///
/// Records every forced disconnect and forgotten identity so callers can
/// inspect what the orchestrator asked for.
#[derive(Debug, Default)]
pub struct LocalSession {
    connected: BTreeSet<ClientId>,
    identities: HashMap<ExternalId, ClientId>,
    disconnects: Vec<(ClientId, String)>,
    forgotten: Vec<ClientId>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, client: ClientId) {
        self.connected.insert(client);
    }

    pub fn connect_as(&mut self, client: ClientId, external: ExternalId) {
        self.identities.insert(external, client);
        self.connected.insert(client);
    }

    /// Drops the connection without going through the orchestrator.
    pub fn drop_client(&mut self, client: ClientId) {
        self.connected.remove(&client);
    }

    pub fn disconnects(&self) -> &[(ClientId, String)] {
        &self.disconnects
    }

    pub fn forgotten(&self) -> &[ClientId] {
        &self.forgotten
    }
}

impl SpawnSession for LocalSession {
    fn connected_clients(&self) -> Vec<ClientId> {
        self.connected.iter().copied().collect()
    }

    fn is_connected(&self, client: ClientId) -> bool {
        self.connected.contains(&client)
    }

    fn disconnect_client(&mut self, client: ClientId, reason: &str) {
        if self.connected.remove(&client) {
            self.disconnects.push((client, reason.to_string()));
        }
    }

    fn lookup_client(&self, external: &ExternalId) -> Option<ClientId> {
        self.identities.get(external).copied()
    }

    fn forget_client(&mut self, client: ClientId) {
        self.identities.retain(|_, id| *id != client);
        self.forgotten.push(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_notifies_peer_and_drops_it() {
        let mut session = NetSession::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.add_peer(ClientId(1), ExternalId::new("alice"), tx);

        assert_eq!(session.lookup_client(&ExternalId::new("alice")), Some(ClientId(1)));
        session.disconnect_client(ClientId(1), "kicked");

        assert!(!session.is_connected(ClientId(1)));
        assert_eq!(
            rx.try_recv().unwrap(),
            NetMsg::Disconnect {
                reason: "kicked".into()
            }
        );
    }

    #[test]
    fn forget_drops_identity_mapping() {
        let mut session = NetSession::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.add_peer(ClientId(2), ExternalId::new("bob"), tx);
        session.forget_client(ClientId(2));
        assert_eq!(session.lookup_client(&ExternalId::new("bob")), None);
        assert!(session.is_connected(ClientId(2)));
    }
}
