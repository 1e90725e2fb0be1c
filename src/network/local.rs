//! In-process network for simulations
//!
//! Every joined node gets a bounded inbox. Nodes can be switched offline, in
//! which case everything sent to or from them is refused as unreachable.
//! A full inbox drops the message, like a lost datagram.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Inbound, NodeId, PeerChannel, PeerMessage};
use crate::error::NetworkError;

const INBOX_CAPACITY: usize = 4096;

struct Endpoint {
    inbox: mpsc::Sender<Inbound>,
    online: bool,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    endpoints: Arc<RwLock<HashMap<NodeId, Endpoint>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `id` (replacing any previous attachment) and return its channel
    /// and inbox. Every node in `members` other than `id` is a peer.
    pub fn join(&self, id: NodeId, members: &[NodeId]) -> (Arc<LocalChannel>, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints.insert(id, Endpoint { inbox: tx, online: true });
        }
        let channel = LocalChannel {
            id,
            peers: members.iter().copied().filter(|m| *m != id).collect(),
            network: self.clone(),
        };
        (Arc::new(channel), rx)
    }

    pub fn set_online(&self, id: NodeId, online: bool) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            if let Some(endpoint) = endpoints.get_mut(&id) {
                endpoint.online = online;
            }
        }
    }

    pub fn is_online(&self, id: NodeId) -> bool {
        self.endpoints
            .read()
            .map(|endpoints| endpoints.get(&id).is_some_and(|e| e.online))
            .unwrap_or(false)
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: PeerMessage) -> Result<(), NetworkError> {
        let endpoints = self.endpoints.read().map_err(|_| NetworkError::Unreachable(to))?;
        if !endpoints.get(&from).is_some_and(|e| e.online) {
            return Err(NetworkError::Unreachable(to));
        }
        let target = endpoints.get(&to).ok_or(NetworkError::UnknownPeer(to))?;
        if !target.online {
            return Err(NetworkError::Unreachable(to));
        }
        target.inbox.try_send(Inbound { from, message }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull(to),
            mpsc::error::TrySendError::Closed(_) => NetworkError::Unreachable(to),
        })
    }
}

pub struct LocalChannel {
    id: NodeId,
    peers: Vec<NodeId>,
    network: LocalNetwork,
}

#[async_trait]
impl PeerChannel for LocalChannel {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers.clone()
    }

    async fn send(&self, to: NodeId, message: PeerMessage) -> Result<(), NetworkError> {
        self.network.deliver(self.id, to, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemId;

    fn query() -> PeerMessage {
        PeerMessage::ResyncQuery {
            item_id: ItemId::digest(b"q"),
        }
    }

    #[tokio::test]
    async fn test_delivery_between_members() {
        let net = LocalNetwork::new();
        let members = [NodeId(0), NodeId(1)];
        let (a, _a_rx) = net.join(NodeId(0), &members);
        let (_b, mut b_rx) = net.join(NodeId(1), &members);

        assert_eq!(a.peers(), vec![NodeId(1)]);
        a.send(NodeId(1), query()).await.unwrap();
        let inbound = b_rx.recv().await.unwrap();
        assert_eq!(inbound.from, NodeId(0));
        assert_eq!(inbound.message.kind(), "resync_query");
    }

    #[tokio::test]
    async fn test_offline_nodes_are_unreachable() {
        let net = LocalNetwork::new();
        let members = [NodeId(0), NodeId(1)];
        let (a, _a_rx) = net.join(NodeId(0), &members);
        let (b, _b_rx) = net.join(NodeId(1), &members);

        net.set_online(NodeId(1), false);
        assert!(!net.is_online(NodeId(1)));
        assert!(matches!(a.send(NodeId(1), query()).await, Err(NetworkError::Unreachable(_))));
        assert!(b.send(NodeId(0), query()).await.is_err());

        net.set_online(NodeId(1), true);
        assert!(a.send(NodeId(1), query()).await.is_ok());
        assert!(matches!(a.send(NodeId(7), query()).await, Err(NetworkError::UnknownPeer(_))));
    }
}
