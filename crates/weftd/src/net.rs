//! Transport glue
//!
//! Connection establishment, NAT traversal, and peer discovery are
//! external concerns; this module only defines the seam the gossip layer
//! consumes: a [`Transport`] to send bytes to connected peers plus a
//! stream of [`NetEvent`]s for lifecycle and inbound traffic.
//!
//! Two implementations ship here: [`MemoryMesh`] wires nodes together in
//! process (used heavily by protocol tests), and [`TcpNet`] provides plain
//! framed TCP for the daemon.

use crate::wire::{FrameCodec, Message, WireError};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use weft_core::Bytes32;

/// Unique peer identifier: the peer's node public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Bytes32);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("peer not connected: {0}")]
    NotConnected(PeerId),
    #[error("connection closed")]
    Closed,
    #[error("handshake failed")]
    Handshake,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Event from the transport layer.
#[derive(Debug)]
pub enum NetEvent {
    /// New peer connected (with dial hint when known)
    Connected { peer: PeerId, addr: Option<String> },
    /// Peer disconnected
    Disconnected(PeerId),
    /// Message bytes received from a peer
    Message { from: PeerId, bytes: Vec<u8> },
}

/// Outbound half of an established transport.
pub trait Transport: Send + Sync {
    /// Send bytes to a connected peer. Failures are peer-local.
    fn send(&self, to: &PeerId, bytes: Vec<u8>) -> Result<(), NetError>;

    /// Currently connected peer identifiers.
    fn peers(&self) -> Vec<PeerId>;

    /// Tear down every open connection. Peers observe a disconnect.
    /// Idempotent.
    fn close(&self);
}

// =============================================================================
// IN-PROCESS MESH
// =============================================================================

#[derive(Default)]
struct MeshInner {
    inboxes: RwLock<HashMap<PeerId, mpsc::UnboundedSender<NetEvent>>>,
    links: RwLock<HashSet<(PeerId, PeerId)>>,
    /// Messages delivered per directed edge, for protocol assertions.
    sent: RwLock<HashMap<(PeerId, PeerId), u64>>,
}

/// In-process mesh connecting [`MeshNode`] transports.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the mesh. Returns its transport handle and the
    /// event stream the gossip layer consumes.
    pub fn join(&self, id: PeerId) -> (Arc<MeshNode>, mpsc::UnboundedReceiver<NetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inboxes.write().insert(id, tx);
        (
            Arc::new(MeshNode {
                id,
                inner: self.inner.clone(),
            }),
            rx,
        )
    }

    /// Establish a bidirectional link and notify both ends.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        {
            let mut links = self.inner.links.write();
            links.insert((a, b));
            links.insert((b, a));
        }
        let inboxes = self.inner.inboxes.read();
        if let Some(tx) = inboxes.get(&a) {
            let _ = tx.send(NetEvent::Connected { peer: b, addr: None });
        }
        if let Some(tx) = inboxes.get(&b) {
            let _ = tx.send(NetEvent::Connected { peer: a, addr: None });
        }
    }

    /// Tear down a link and notify both ends.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        {
            let mut links = self.inner.links.write();
            links.remove(&(a, b));
            links.remove(&(b, a));
        }
        let inboxes = self.inner.inboxes.read();
        if let Some(tx) = inboxes.get(&a) {
            let _ = tx.send(NetEvent::Disconnected(b));
        }
        if let Some(tx) = inboxes.get(&b) {
            let _ = tx.send(NetEvent::Disconnected(a));
        }
    }

    /// Messages delivered from `from` to `to`.
    pub fn sent_count(&self, from: PeerId, to: PeerId) -> u64 {
        self.inner.sent.read().get(&(from, to)).copied().unwrap_or(0)
    }
}

/// One node's handle into a [`MemoryMesh`].
pub struct MeshNode {
    id: PeerId,
    inner: Arc<MeshInner>,
}

impl Transport for MeshNode {
    fn send(&self, to: &PeerId, bytes: Vec<u8>) -> Result<(), NetError> {
        if !self.inner.links.read().contains(&(self.id, *to)) {
            return Err(NetError::NotConnected(*to));
        }
        let inboxes = self.inner.inboxes.read();
        let tx = inboxes.get(to).ok_or(NetError::NotConnected(*to))?;
        *self.inner.sent.write().entry((self.id, *to)).or_insert(0) += 1;
        tx.send(NetEvent::Message {
            from: self.id,
            bytes,
        })
        .map_err(|_| NetError::Closed)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.inner
            .links
            .read()
            .iter()
            .filter(|(from, _)| *from == self.id)
            .map(|(_, to)| *to)
            .collect()
    }

    fn close(&self) {
        self.inner.inboxes.write().remove(&self.id);
        let peers: Vec<PeerId> = {
            let mut links = self.inner.links.write();
            let peers = links
                .iter()
                .filter(|(from, _)| *from == self.id)
                .map(|(_, to)| *to)
                .collect();
            links.retain(|(from, to)| *from != self.id && *to != self.id);
            peers
        };
        let inboxes = self.inner.inboxes.read();
        for peer in peers {
            if let Some(tx) = inboxes.get(&peer) {
                let _ = tx.send(NetEvent::Disconnected(self.id));
            }
        }
    }
}

// =============================================================================
// TCP GLUE
// =============================================================================

/// Plain framed TCP transport for the daemon.
///
/// Each connection opens with a `Hello` exchange announcing node public
/// keys; after that both directions carry framed gossip messages.
pub struct TcpNet {
    local_id: PeerId,
    conns: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>>,
    events_tx: mpsc::UnboundedSender<NetEvent>,
}

impl TcpNet {
    pub fn new(local_id: PeerId) -> (Arc<Self>, mpsc::UnboundedReceiver<NetEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                local_id,
                conns: RwLock::new(HashMap::new()),
                events_tx,
            }),
            events_rx,
        )
    }

    /// Bind and accept inbound connections until the task is dropped.
    pub async fn listen(
        self: Arc<Self>,
        addr: SocketAddr,
    ) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let net = self;
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let net = net.clone();
                        tokio::spawn(async move {
                            if let Err(e) = net.handle_stream(stream, peer_addr).await {
                                debug!(%peer_addr, "connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {e}");
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    /// Dial a peer and run the connection in the background.
    pub async fn dial(self: Arc<Self>, addr: SocketAddr) -> Result<(), NetError> {
        let stream = TcpStream::connect(addr).await?;
        let net = self;
        tokio::spawn(async move {
            if let Err(e) = net.handle_stream(stream, addr).await {
                debug!(%addr, "connection ended: {e}");
            }
        });
        Ok(())
    }

    async fn handle_stream(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), NetError> {
        let mut framed = Framed::new(stream, FrameCodec);

        framed
            .send(
                Message::Hello {
                    pubkey: self.local_id.0,
                }
                .encode()?,
            )
            .await?;
        let first = framed.next().await.ok_or(NetError::Closed)??;
        let peer = match Message::decode(&first)? {
            Message::Hello { pubkey } => PeerId(pubkey),
            _ => return Err(NetError::Handshake),
        };

        let (tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.conns.write().insert(peer, tx);
        let _ = self.events_tx.send(NetEvent::Connected {
            peer,
            addr: Some(addr.to_string()),
        });

        let (mut sink, mut source) = framed.split();
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    Some(bytes) => {
                        if let Err(e) = sink.send(bytes).await {
                            warn!(%peer, "send failed: {e}");
                            break;
                        }
                    }
                    None => break,
                },
                inbound = source.next() => match inbound {
                    Some(Ok(bytes)) => {
                        let _ = self.events_tx.send(NetEvent::Message { from: peer, bytes });
                    }
                    Some(Err(e)) => {
                        warn!(%peer, "read failed: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.conns.write().remove(&peer);
        let _ = self.events_tx.send(NetEvent::Disconnected(peer));
        Ok(())
    }
}

impl Transport for TcpNet {
    fn send(&self, to: &PeerId, bytes: Vec<u8>) -> Result<(), NetError> {
        let conns = self.conns.read();
        let tx = conns.get(to).ok_or(NetError::NotConnected(*to))?;
        tx.send(bytes).map_err(|_| NetError::Closed)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.conns.read().keys().copied().collect()
    }

    /// Dropping the outbound senders ends each per-connection task,
    /// which closes its stream; the remote side sees the stream end.
    fn close(&self) {
        self.conns.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_send_requires_link() {
        let mesh = MemoryMesh::new();
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let (node_a, _rx_a) = mesh.join(a);
        let (_node_b, mut rx_b) = mesh.join(b);

        assert!(matches!(
            node_a.send(&b, vec![1]),
            Err(NetError::NotConnected(_))
        ));

        mesh.connect(a, b);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            NetEvent::Connected { peer, .. } if peer == a
        ));

        node_a.send(&b, vec![42]).unwrap();
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            NetEvent::Message { from, bytes } if from == a && bytes == vec![42]
        ));
        assert_eq!(mesh.sent_count(a, b), 1);
        assert_eq!(mesh.sent_count(b, a), 0);

        mesh.disconnect(a, b);
        assert!(node_a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_tcp_handshake_and_round_trip() {
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let (net_a, mut rx_a) = TcpNet::new(a);
        let (net_b, mut rx_b) = TcpNet::new(b);

        let (addr, _accept) = net_a
            .clone()
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        net_b.clone().dial(addr).await.unwrap();

        match rx_a.recv().await.unwrap() {
            NetEvent::Connected { peer, addr } => {
                assert_eq!(peer, b);
                assert!(addr.is_some());
            }
            other => panic!("expected connect, got {other:?}"),
        }
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            NetEvent::Connected { peer, .. } if peer == a
        ));

        net_a.send(&b, vec![7, 7]).unwrap();
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            NetEvent::Message { from, bytes } if from == a && bytes == vec![7, 7]
        ));
    }

    #[tokio::test]
    async fn test_tcp_close_tears_down_both_sides() {
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let (net_a, mut rx_a) = TcpNet::new(a);
        let (net_b, mut rx_b) = TcpNet::new(b);

        let (addr, _accept) = net_a
            .clone()
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        net_b.clone().dial(addr).await.unwrap();
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            NetEvent::Connected { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            NetEvent::Connected { .. }
        ));

        net_a.close();
        assert!(net_a.peers().is_empty());

        // Both ends observe the teardown, and the remote can no longer
        // reach the closed node.
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            NetEvent::Disconnected(peer) if peer == b
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            NetEvent::Disconnected(peer) if peer == a
        ));
        assert!(matches!(
            net_b.send(&a, vec![1]),
            Err(NetError::NotConnected(_))
        ));
    }
}
