/// TCP transport for meshdb clusters.
///
/// Frames are a 4-byte big-endian length header followed by a
/// JSON-encoded [`WireMessage`]. A fresh connection opens with an
/// `identify` exchange so each side learns the peer's node id before any
/// replication traffic flows.
///
/// Each established peer gets a write queue and a read loop; the read
/// loops all feed the single ingress event stream, which keeps delivery
/// into the engine serialized.
use super::{PutMessage, Transport, TransportEvent, WireMessage};
use crate::error::{MeshError, MeshResult};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Maximum frame size (16 MB).
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

async fn write_frame(writer: &mut OwnedWriteHalf, message: &WireMessage) -> MeshResult<()> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(MeshError::Transport(format!(
            "frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| MeshError::Transport(format!("failed to write frame length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| MeshError::Transport(format!("failed to write frame body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| MeshError::Transport(format!("failed to flush stream: {}", e)))?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> MeshResult<WireMessage> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| MeshError::Transport(format!("failed to read frame length: {}", e)))?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MeshError::Transport(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| MeshError::Transport(format!("failed to read frame body: {}", e)))?;

    serde_json::from_slice(&bytes).map_err(MeshError::Serialization)
}

/// Strip an optional `tcp://` scheme.
fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

struct TcpInner {
    node_id: NodeId,
    local_url: Mutex<String>,
    peers: DashMap<NodeId, mpsc::UnboundedSender<WireMessage>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TcpInner {
    fn attach_peer(self: &Arc<Self>, peer_id: NodeId, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WireMessage>();

        self.peers.insert(peer_id.clone(), write_tx);
        let _ = self
            .events_tx
            .send(TransportEvent::PeerConnected(peer_id.clone()));

        // Writer task: drain the queue onto the socket.
        let inner = Arc::clone(self);
        let writer_peer = peer_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    queued = write_rx.recv() => {
                        let Some(message) = queued else { break };
                        if let Err(e) = write_frame(&mut writer, &message).await {
                            debug!(peer = %writer_peer, error = %e, "write failed, dropping connection");
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            inner.detach_peer(&writer_peer);
        });

        // Reader task: frames become ingress events.
        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = read_frame(&mut reader) => {
                        match frame {
                            Ok(message) => {
                                let event = TransportEvent::Message {
                                    from: peer_id.clone(),
                                    message,
                                };
                                if inner.events_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(peer = %peer_id, error = %e, "read failed, dropping connection");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            inner.detach_peer(&peer_id);
        });
    }

    fn detach_peer(&self, peer_id: &NodeId) {
        if self.peers.remove(peer_id).is_some() {
            let _ = self
                .events_tx
                .send(TransportEvent::PeerDisconnected(peer_id.clone()));
        }
    }
}

/// Transport speaking length-prefixed JSON over TCP.
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Bind a listener and start accepting peer connections.
    pub async fn bind(node_id: NodeId, bind_addr: SocketAddr) -> MeshResult<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| MeshError::Transport(format!("failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::Transport(format!("failed to get local address: {}", e)))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(TcpInner {
            node_id,
            local_url: Mutex::new(format!("tcp://{}", local_addr)),
            peers: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
        });

        // Accept loop: handshake each incoming connection.
        let accept_inner = Arc::clone(&inner);
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, remote)) = accepted else { continue };
                        let inner = Arc::clone(&accept_inner);
                        tokio::spawn(async move {
                            if let Err(e) = inner.handshake_accept(stream).await {
                                debug!(remote = %remote, error = %e, "inbound handshake failed");
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(Self { inner })
    }

    /// The URL peers can dial to reach this transport.
    pub fn local_url(&self) -> String {
        self.inner.local_url.lock().expect("local url poisoned").clone()
    }

    /// Dial a peer and perform the identify handshake.
    pub async fn connect(&self, url: &str) -> MeshResult<NodeId> {
        let addr = strip_scheme(url);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MeshError::Transport(format!("failed to connect to {}: {}", url, e)))?;

        let (mut reader, mut writer) = stream.into_split();
        write_frame(
            &mut writer,
            &WireMessage::Identify {
                node_id: self.inner.node_id.clone(),
                url: self.local_url(),
            },
        )
        .await?;

        let peer_id = match read_frame(&mut reader).await? {
            WireMessage::Identify { node_id, .. } => node_id,
            other => {
                return Err(MeshError::Transport(format!(
                    "expected identify handshake, got {:?}",
                    other
                )))
            }
        };

        let stream = reader
            .reunite(writer)
            .map_err(|e| MeshError::Transport(format!("failed to reunite stream halves: {}", e)))?;
        self.inner.attach_peer(peer_id.clone(), stream);
        Ok(peer_id)
    }
}

impl TcpInner {
    async fn handshake_accept(self: Arc<Self>, stream: TcpStream) -> MeshResult<()> {
        let (mut reader, mut writer) = stream.into_split();

        let peer_id = match read_frame(&mut reader).await? {
            WireMessage::Identify { node_id, .. } => node_id,
            other => {
                return Err(MeshError::Transport(format!(
                    "expected identify handshake, got {:?}",
                    other
                )))
            }
        };

        let local_url = self.local_url.lock().expect("local url poisoned").clone();
        write_frame(
            &mut writer,
            &WireMessage::Identify {
                node_id: self.node_id.clone(),
                url: local_url,
            },
        )
        .await?;

        let stream = reader
            .reunite(writer)
            .map_err(|e| MeshError::Transport(format!("failed to reunite stream halves: {}", e)))?;
        self.attach_peer(peer_id, stream);
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_to(&self, peer: &NodeId, message: WireMessage) -> MeshResult<()> {
        match self.inner.peers.get(peer) {
            Some(sender) => sender
                .send(message)
                .map_err(|_| MeshError::PeerUnreachable(peer.as_str().to_string())),
            None => Err(MeshError::PeerUnreachable(peer.as_str().to_string())),
        }
    }

    async fn broadcast_put(&self, message: PutMessage) -> MeshResult<()> {
        for entry in self.inner.peers.iter() {
            if entry
                .value()
                .send(WireMessage::Put(message.clone()))
                .is_err()
            {
                warn!(peer = %entry.key(), "broadcast enqueue failed");
            }
        }
        Ok(())
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.inner
            .peers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner
            .events_rx
            .lock()
            .expect("events receiver poisoned")
            .take()
    }

    async fn close(&self) -> MeshResult<()> {
        let _ = self.inner.shutdown_tx.send(());
        self.inner.peers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_handshake_and_peer_registration() {
        let a = TcpTransport::bind(NodeId::new("node-a"), loopback()).await.unwrap();
        let b = TcpTransport::bind(NodeId::new("node-b"), loopback()).await.unwrap();

        let peer = a.connect(&b.local_url()).await.unwrap();
        assert_eq!(peer, NodeId::new("node-b"));

        // Give the acceptor a moment to finish its side of the handshake.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(a.connected_peers(), vec![NodeId::new("node-b")]);
        assert_eq!(b.connected_peers(), vec![NodeId::new("node-a")]);
    }

    #[tokio::test]
    async fn test_message_delivery() {
        let a = TcpTransport::bind(NodeId::new("node-a"), loopback()).await.unwrap();
        let b = TcpTransport::bind(NodeId::new("node-b"), loopback()).await.unwrap();
        let mut b_events = b.take_events().unwrap();

        a.connect(&b.local_url()).await.unwrap();

        a.send_to(
            &NodeId::new("node-b"),
            WireMessage::VectorClockSync {
                clock: crate::clock::VectorClock::new(),
                node_id: NodeId::new("node-a"),
                sync_id: "s1".to_string(),
                timestamp: 1,
            },
        )
        .await
        .unwrap();

        // First event is the connect, then the message.
        loop {
            match b_events.recv().await.unwrap() {
                TransportEvent::Message { from, message } => {
                    assert_eq!(from, NodeId::new("node-a"));
                    assert!(matches!(message, WireMessage::VectorClockSync { .. }));
                    break;
                }
                TransportEvent::PeerConnected(_) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let a = TcpTransport::bind(NodeId::new("node-a"), loopback()).await.unwrap();
        let result = a
            .send_to(
                &NodeId::new("nobody"),
                WireMessage::Identify {
                    node_id: NodeId::new("node-a"),
                    url: a.local_url(),
                },
            )
            .await;
        assert!(matches!(result, Err(MeshError::PeerUnreachable(_))));
    }
}
