//! UDP peer channel integration tests over loopback

use std::time::Duration;

use ledger_node::item::ItemId;
use ledger_node::network::{NodeId, PeerChannel, PeerMessage, TransportSettings, UdpChannel};
use ledger_node::NetworkError;

fn settings() -> TransportSettings {
    TransportSettings {
        retransmit_interval: Duration::from_millis(20),
        max_retransmits: 3,
        ..TransportSettings::default()
    }
}

fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

#[tokio::test]
async fn test_message_delivered_and_acked() {
    let (a, _a_inbox) = UdpChannel::bind(NodeId(1), loopback(), settings()).await.unwrap();
    let (b, mut b_inbox) = UdpChannel::bind(NodeId(2), loopback(), settings()).await.unwrap();
    a.add_peer(NodeId(2), b.local_addr().unwrap());
    b.add_peer(NodeId(1), a.local_addr().unwrap());
    assert_eq!(a.peers(), vec![NodeId(2)]);

    let item_id = ItemId::digest(b"query");
    a.send(NodeId(2), PeerMessage::ResyncQuery { item_id }).await.unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(2), b_inbox.recv())
        .await
        .expect("message arrives")
        .expect("channel open");
    assert_eq!(inbound.from, NodeId(1));
    assert!(matches!(inbound.message, PeerMessage::ResyncQuery { item_id: got } if got == item_id));

    assert!(wait_until(|| a.unacked() == 0).await, "ack never arrived");
}

#[tokio::test]
async fn test_unknown_peer_is_an_error() {
    let (a, _inbox) = UdpChannel::bind(NodeId(1), loopback(), settings()).await.unwrap();
    let result = a.send(NodeId(7), PeerMessage::GetItem { item_id: ItemId::digest(b"x") }).await;
    assert!(matches!(result, Err(NetworkError::UnknownPeer(NodeId(7)))));
}

#[tokio::test]
async fn test_silent_peer_given_up_after_retransmits() {
    let (a, _inbox) = UdpChannel::bind(NodeId(1), loopback(), settings()).await.unwrap();
    // bound but never answers
    let silent = tokio::net::UdpSocket::bind(loopback()).await.unwrap();
    a.add_peer(NodeId(2), silent.local_addr().unwrap());

    a.send(NodeId(2), PeerMessage::GetItem { item_id: ItemId::digest(b"y") }).await.unwrap();
    assert_eq!(a.unacked(), 1);

    assert!(wait_until(|| a.unacked() == 0).await, "message never abandoned");
}

#[tokio::test]
async fn test_datagrams_from_unknown_senders_dropped() {
    let (a, _a_inbox) = UdpChannel::bind(NodeId(1), loopback(), settings()).await.unwrap();
    let (b, mut b_inbox) = UdpChannel::bind(NodeId(2), loopback(), settings()).await.unwrap();
    // b does not know a
    a.add_peer(NodeId(2), b.local_addr().unwrap());

    a.send(NodeId(2), PeerMessage::GetItem { item_id: ItemId::digest(b"z") }).await.unwrap();

    let received = tokio::time::timeout(Duration::from_millis(300), b_inbox.recv()).await;
    assert!(received.is_err(), "unknown sender delivered");
}
