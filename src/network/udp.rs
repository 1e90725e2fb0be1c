//! UDP peer channel
//!
//! Each data datagram carries a per-peer sequence number and is retransmitted
//! until the peer acknowledges it or `max_retransmits` is exhausted, at which
//! point the peer is treated as unreachable for that message. Receivers ack
//! every data datagram (duplicates included) and suppress duplicates with a
//! per-peer window that is reset when the peer's session changes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::frame::{Envelope, EnvelopeBody, MessageFrame, PROTOCOL_VERSION};
use super::{Inbound, NodeId, PeerChannel, PeerMessage};
use crate::error::NetworkError;

/// Sequence numbers held above the contiguous floor before the oldest gap is
/// given up on.
const WINDOW_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub retransmit_interval: Duration,
    pub max_retransmits: u32,
    pub max_datagram_size: usize,
    pub inbound_queue: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            retransmit_interval: Duration::from_millis(250),
            max_retransmits: 8,
            max_datagram_size: 65_000,
            inbound_queue: 1024,
        }
    }
}

struct Unacked {
    datagram: Vec<u8>,
    addr: SocketAddr,
    attempts: u32,
    last_sent: Instant,
}

#[derive(Default)]
struct Outbound {
    next_seq: HashMap<NodeId, u64>,
    unacked: BTreeMap<(NodeId, u64), Unacked>,
}

/// Sequence numbers seen from one peer session. Everything at or below
/// `floor` has been delivered.
struct ReceiveWindow {
    session: u64,
    floor: u64,
    above: BTreeSet<u64>,
}

impl ReceiveWindow {
    fn new(session: u64) -> Self {
        Self {
            session,
            floor: 0,
            above: BTreeSet::new(),
        }
    }

    fn is_new(&self, seq: u64) -> bool {
        seq > self.floor && !self.above.contains(&seq)
    }

    fn mark(&mut self, seq: u64) {
        if !self.is_new(seq) {
            return;
        }
        self.above.insert(seq);
        while self.above.len() > WINDOW_LIMIT {
            if let Some(oldest) = self.above.pop_first() {
                self.floor = oldest;
            }
        }
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct UdpChannel {
    local: NodeId,
    session: u64,
    socket: Arc<UdpSocket>,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
    settings: TransportSettings,
    outbound: Mutex<Outbound>,
    windows: Mutex<HashMap<NodeId, ReceiveWindow>>,
}

impl UdpChannel {
    /// Bind `listen` and start the receive and retransmit tasks. The tasks
    /// stop once the returned channel is dropped.
    pub async fn bind(
        local: NodeId,
        listen: SocketAddr,
        settings: TransportSettings,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>), NetworkError> {
        let socket = Arc::new(UdpSocket::bind(listen).await?);
        let (tx, rx) = mpsc::channel(settings.inbound_queue.max(1));

        let channel = Arc::new(Self {
            local,
            session: rand::random(),
            socket: socket.clone(),
            peers: RwLock::new(HashMap::new()),
            settings,
            outbound: Mutex::new(Outbound::default()),
            windows: Mutex::new(HashMap::new()),
        });

        info!(node = %local, addr = %socket.local_addr()?, "UDP channel bound");

        tokio::spawn(Self::receive_loop(Arc::downgrade(&channel), socket, tx));
        tokio::spawn(Self::retransmit_loop(Arc::downgrade(&channel)));

        Ok((channel, rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add_peer(&self, id: NodeId, addr: SocketAddr) {
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(id, addr);
        }
    }

    fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.peers.read().ok().and_then(|peers| peers.get(&id).copied())
    }

    /// Messages sent but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        lock(&self.outbound).unacked.len()
    }

    fn encode(&self, body: EnvelopeBody) -> Result<Vec<u8>, NetworkError> {
        let envelope = Envelope {
            version: PROTOCOL_VERSION,
            sender: self.local,
            session: self.session,
            body,
        };
        let datagram = MessageFrame::new(&envelope)?.encode();
        if datagram.len() > self.settings.max_datagram_size {
            return Err(NetworkError::TooLarge {
                size: datagram.len(),
                max: self.settings.max_datagram_size,
            });
        }
        Ok(datagram)
    }

    async fn receive_loop(channel: Weak<Self>, socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
        let mut buf = vec![0u8; 65_536];
        loop {
            let received = socket.recv_from(&mut buf).await;
            let Some(channel) = channel.upgrade() else {
                break;
            };
            match received {
                Ok((len, addr)) => channel.handle_datagram(&buf[..len], addr, &tx).await,
                Err(e) => debug!(error = %e, "UDP receive failed"),
            }
            if tx.is_closed() {
                break;
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], addr: SocketAddr, tx: &mpsc::Sender<Inbound>) {
        let envelope = match MessageFrame::decode(datagram).and_then(MessageFrame::into_envelope) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%addr, error = %e, "Dropping bad datagram");
                return;
            }
        };
        let sender = envelope.sender;
        if self.addr_of(sender).is_none() {
            debug!(%addr, peer = %sender, "Datagram from unknown peer");
            return;
        }

        match envelope.body {
            EnvelopeBody::Ack { seq } => {
                lock(&self.outbound).unacked.remove(&(sender, seq));
            }
            EnvelopeBody::Data { seq, message } => {
                let fresh = {
                    let mut windows = lock(&self.windows);
                    let window = windows
                        .entry(sender)
                        .or_insert_with(|| ReceiveWindow::new(envelope.session));
                    if window.session != envelope.session {
                        debug!(peer = %sender, "Peer restarted, resetting receive window");
                        *window = ReceiveWindow::new(envelope.session);
                    }
                    window.is_new(seq)
                };

                if fresh {
                    match tx.try_send(Inbound { from: sender, message }) {
                        Ok(()) => {
                            if let Some(window) = lock(&self.windows).get_mut(&sender) {
                                window.mark(seq);
                            }
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // unacked, so the sender will retransmit it
                            debug!(peer = %sender, seq, "Inbox full, dropping datagram");
                            return;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
                self.send_ack(sender, seq).await;
            }
        }
    }

    async fn send_ack(&self, to: NodeId, seq: u64) {
        let Some(addr) = self.addr_of(to) else {
            return;
        };
        match self.encode(EnvelopeBody::Ack { seq }) {
            Ok(datagram) => {
                if let Err(e) = self.socket.send_to(&datagram, addr).await {
                    debug!(peer = %to, error = %e, "Ack send failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode ack"),
        }
    }

    async fn retransmit_loop(channel: Weak<Self>) {
        let period = match channel.upgrade() {
            Some(channel) => channel.settings.retransmit_interval,
            None => return,
        };
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(channel) = channel.upgrade() else {
                break;
            };
            channel.retransmit_due().await;
        }
    }

    async fn retransmit_due(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut outbound = lock(&self.outbound);
            let max = self.settings.max_retransmits;
            let period = self.settings.retransmit_interval;
            outbound.unacked.retain(|(peer, seq), pending| {
                if now.duration_since(pending.last_sent) < period {
                    return true;
                }
                if pending.attempts >= max {
                    warn!(peer = %peer, seq, attempts = pending.attempts, "Peer unreachable, giving up on message");
                    return false;
                }
                pending.attempts += 1;
                pending.last_sent = now;
                due.push((pending.addr, pending.datagram.clone()));
                true
            });
        }
        for (addr, datagram) in due {
            if let Err(e) = self.socket.send_to(&datagram, addr).await {
                debug!(%addr, error = %e, "Retransmit failed");
            }
        }
    }
}

#[async_trait]
impl PeerChannel for UdpChannel {
    fn local_id(&self) -> NodeId {
        self.local
    }

    fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .peers
            .read()
            .map(|peers| peers.keys().copied().filter(|id| *id != self.local).collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    async fn send(&self, to: NodeId, message: PeerMessage) -> Result<(), NetworkError> {
        let addr = self.addr_of(to).ok_or(NetworkError::UnknownPeer(to))?;
        let seq = {
            let mut outbound = lock(&self.outbound);
            let next = outbound.next_seq.entry(to).or_insert(0);
            *next += 1;
            *next
        };
        let datagram = self.encode(EnvelopeBody::Data { seq, message })?;

        lock(&self.outbound).unacked.insert(
            (to, seq),
            Unacked {
                datagram: datagram.clone(),
                addr,
                attempts: 0,
                last_sent: Instant::now(),
            },
        );
        self.socket.send_to(&datagram, addr).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_suppresses_duplicates() {
        let mut window = ReceiveWindow::new(1);
        assert!(window.is_new(1));
        window.mark(1);
        assert!(!window.is_new(1));

        window.mark(3);
        assert!(window.is_new(2));
        assert!(!window.is_new(3));
        window.mark(2);
        assert_eq!(window.floor, 3);
        assert!(window.above.is_empty());
    }

    #[test]
    fn test_window_gives_up_on_old_gaps() {
        let mut window = ReceiveWindow::new(1);
        for seq in 2..(WINDOW_LIMIT as u64 + 3) {
            window.mark(seq);
        }
        assert!(window.above.len() <= WINDOW_LIMIT);
        assert!(!window.is_new(1));
    }
}
