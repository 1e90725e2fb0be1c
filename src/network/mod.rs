//! Peer messaging
//!
//! Nodes exchange votes, resync queries and item copies over a
//! [`PeerChannel`]. Two implementations:
//! - [`UdpChannel`]: datagrams with acknowledgement and retransmission
//! - [`LocalNetwork`]: in-process hub used by simulations, with nodes that
//!   can be taken offline

pub mod frame;
pub mod local;
pub mod udp;

pub use local::{LocalChannel, LocalNetwork};
pub use udp::{TransportSettings, UdpChannel};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NetworkError;
use crate::item::ItemId;
use crate::ledger::{Environment, ItemResult};
use crate::vote::Vote;

/// Configured identity of a node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Messages exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// A vote on an item. `parcel` names the parcel the item belongs to, so
    /// a peer that has never seen it knows what to fetch.
    Vote {
        vote: Vote,
        parcel: Option<ItemId>,
        needs_answer: bool,
    },

    /// Ask for the sender's state of an item.
    ResyncQuery { item_id: ItemId },

    ResyncAnswer {
        item_id: ItemId,
        result: ItemResult,
        environment: Option<Environment>,
    },

    GetItem { item_id: ItemId },

    Item { item_id: ItemId, packed: Vec<u8> },

    GetParcel { parcel_id: ItemId },

    Parcel { parcel_id: ItemId, packed: Vec<u8> },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Vote { .. } => "vote",
            PeerMessage::ResyncQuery { .. } => "resync_query",
            PeerMessage::ResyncAnswer { .. } => "resync_answer",
            PeerMessage::GetItem { .. } => "get_item",
            PeerMessage::Item { .. } => "item",
            PeerMessage::GetParcel { .. } => "get_parcel",
            PeerMessage::Parcel { .. } => "parcel",
        }
    }
}

/// A message received from a peer.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: NodeId,
    pub message: PeerMessage,
}

#[async_trait]
pub trait PeerChannel: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    /// Every other node in the network.
    fn peers(&self) -> Vec<NodeId>;

    async fn send(&self, to: NodeId, message: PeerMessage) -> Result<(), NetworkError>;

    /// Send to every peer. Unreachable peers are logged and skipped.
    async fn broadcast(&self, message: PeerMessage) {
        let kind = message.kind();
        let sends = self.peers().into_iter().map(|peer| {
            let message = message.clone();
            async move { (peer, self.send(peer, message).await) }
        });
        for (peer, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                debug!(%peer, kind, error = %e, "Broadcast send failed");
            }
        }
    }
}
