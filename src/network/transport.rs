//! Outbound TCP transport between neighbor nodes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::network::wire::{encode_message, Message};
use crate::types::NodeId;

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection attempts when a neighbor link is first opened.
    pub connect_attempts: u32,

    /// Delay between those opening attempts.
    pub connect_retry_delay: Duration,

    /// Send retries before the link is declared dead.
    pub max_retries: u32,

    /// Delay between send retries.
    pub retry_delay: Duration,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Timeout for one framed write.
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_retry_delay: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Delivery seam between the dispatcher and the wire.
///
/// Sends are fire-and-forget. Delivery failures are absorbed by the
/// implementation; the protocol layer never observes them.
pub trait Transport: Send + Sync {
    /// Queue `msg` for delivery to neighbor `to`.
    fn send(&self, to: NodeId, msg: Message);
}

/// Commands for the sender loop.
enum SenderCommand {
    /// Open the connection to a peer, retrying with a fixed delay.
    Connect {
        peer: NodeId,
        done: oneshot::Sender<bool>,
    },

    /// Stop the sender loop, acknowledging when done.
    Shutdown(oneshot::Sender<()>),
}

/// TCP transport with one cached connection per neighbor.
///
/// All writes happen on a single sender task that owns the connection
/// cache. Opening a link retries a bounded number of times; once a
/// link is given up on it stays unusable for the life of the process
/// and further sends to that neighbor are dropped.
pub struct TcpTransport {
    /// This node's ID.
    node_id: NodeId,

    /// Known peer endpoints as `host:port`.
    peers: Arc<RwLock<HashMap<NodeId, String>>>,

    /// Channel to the sender task.
    outgoing_tx: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,

    /// Command channel to the sender task.
    command_tx: mpsc::UnboundedSender<SenderCommand>,
}

impl TcpTransport {
    /// Create a transport with default settings.
    pub fn new(node_id: NodeId) -> Self {
        Self::with_config(node_id, TransportConfig::default())
    }

    /// Create a transport with custom settings.
    pub fn with_config(node_id: NodeId, config: TransportConfig) -> Self {
        let peers = Arc::new(RwLock::new(HashMap::new()));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let loop_peers = Arc::clone(&peers);
        tokio::spawn(Self::sender_loop(loop_peers, outgoing_rx, command_rx, config));

        Self {
            node_id,
            peers,
            outgoing_tx,
            command_tx,
        }
    }

    /// Register a neighbor's endpoint.
    pub fn add_peer(&self, peer: NodeId, endpoint: String) {
        self.peers.write().insert(peer, endpoint);
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Open the connection to `peer`, retrying on failure.
    ///
    /// Returns false when the peer stayed unreachable; the link is then
    /// dead and later sends to it are silently dropped.
    pub async fn connect(&self, peer: NodeId) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        let cmd = SenderCommand::Connect {
            peer,
            done: done_tx,
        };
        if self.command_tx.send(cmd).is_err() {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }

    /// Stop the sender task, waiting for it to drain.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.command_tx.send(SenderCommand::Shutdown(ack_tx)).is_err() {
            return;
        }
        if timeout(Duration::from_secs(5), ack_rx).await.is_err() {
            warn!("timed out waiting for sender loop to stop");
        }
    }

    /// Sender task: owns the connection cache and performs all writes.
    async fn sender_loop(
        peers: Arc<RwLock<HashMap<NodeId, String>>>,
        mut outgoing_rx: mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>,
        mut command_rx: mpsc::UnboundedReceiver<SenderCommand>,
        config: TransportConfig,
    ) {
        let mut connections: HashMap<NodeId, TcpStream> = HashMap::new();
        let mut down: HashSet<NodeId> = HashSet::new();

        loop {
            tokio::select! {
                Some((peer, data)) = outgoing_rx.recv() => {
                    if down.contains(&peer) {
                        debug!(peer, "link down, dropping outbound message");
                        continue;
                    }
                    let addr = { peers.read().get(&peer).cloned() };
                    let Some(addr) = addr else {
                        warn!(peer, "no endpoint registered for peer, dropping message");
                        continue;
                    };

                    let mut attempt = 0;
                    let mut sent = false;
                    while attempt <= config.max_retries && !sent {
                        match Self::send_framed(&mut connections, peer, &addr, &data, &config).await {
                            Ok(()) => sent = true,
                            Err(e) => {
                                debug!(peer, attempt, error = %e, "send attempt failed");
                                connections.remove(&peer);
                                attempt += 1;
                                if attempt <= config.max_retries {
                                    sleep(config.retry_delay).await;
                                }
                            }
                        }
                    }
                    if !sent {
                        error!(peer, addr = %addr, "send failed after retries, marking link down");
                        down.insert(peer);
                    }
                }
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        SenderCommand::Connect { peer, done } => {
                            let ok = Self::establish(&mut connections, &peers, peer, &config).await;
                            if !ok {
                                down.insert(peer);
                            }
                            let _ = done.send(ok);
                        }
                        SenderCommand::Shutdown(ack) => {
                            debug!("sender loop shutting down");
                            let _ = ack.send(());
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    }

    /// Open the link to `peer`, retrying with a fixed delay.
    async fn establish(
        connections: &mut HashMap<NodeId, TcpStream>,
        peers: &Arc<RwLock<HashMap<NodeId, String>>>,
        peer: NodeId,
        config: &TransportConfig,
    ) -> bool {
        let addr = { peers.read().get(&peer).cloned() };
        let Some(addr) = addr else {
            warn!(peer, "connect requested for undeclared peer");
            return false;
        };

        for attempt in 1..=config.connect_attempts {
            match timeout(config.connect_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer, error = %e, "failed to set nodelay");
                    }
                    info!(peer, addr = %addr, "connected to neighbor");
                    connections.insert(peer, stream);
                    return true;
                }
                Ok(Err(e)) => {
                    debug!(peer, addr = %addr, attempt, error = %e, "connection attempt failed");
                }
                Err(_) => {
                    debug!(peer, addr = %addr, attempt, "connection attempt timed out");
                }
            }
            if attempt < config.connect_attempts {
                sleep(config.connect_retry_delay).await;
            }
        }

        error!(peer, addr = %addr, "could not reach neighbor, marking link down");
        false
    }

    /// Write one length-prefixed frame, connecting first if needed.
    async fn send_framed(
        connections: &mut HashMap<NodeId, TcpStream>,
        peer: NodeId,
        addr: &str,
        data: &[u8],
        config: &TransportConfig,
    ) -> Result<()> {
        if !connections.contains_key(&peer) {
            let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TransportError::ConnectionFailed {
                    addr: addr.to_string(),
                    reason: "connect timed out".to_string(),
                })?
                .map_err(|e| TransportError::ConnectionFailed {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
            stream.set_nodelay(true).map_err(TransportError::Io)?;
            debug!(peer, addr = %addr, "connected to peer");
            connections.insert(peer, stream);
        }

        let stream = connections
            .get_mut(&peer)
            .ok_or(TransportError::ConnectionClosed)?;

        let len = data.len() as u32;
        let write = async {
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(data).await?;
            stream.flush().await
        };
        timeout(config.write_timeout, write)
            .await
            .map_err(|_| TransportError::SendFailed("write timed out".to_string()))?
            .map_err(TransportError::Io)?;

        Ok(())
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: NodeId, msg: Message) {
        let data = match encode_message(&msg) {
            Ok(data) => data,
            Err(e) => {
                error!(to, kind = msg.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        if self.outgoing_tx.send((to, data)).is_err() {
            debug!(to, "sender loop stopped, dropping message");
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("node_id", &self.node_id)
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let (ack_tx, _ack_rx) = oneshot::channel();
        let _ = self.command_tx.send(SenderCommand::Shutdown(ack_tx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::wire::{decode_message, MessageBody};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Test peer that accepts connections and records decoded frames.
    struct MockPeer {
        addr: String,
        messages: mpsc::UnboundedReceiver<Message>,
        connections: Arc<AtomicUsize>,
    }

    impl MockPeer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let (tx, rx) = mpsc::unbounded_channel();
            let connections = Arc::new(AtomicUsize::new(0));
            let conn_count = Arc::clone(&connections);

            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    conn_count.fetch_add(1, Ordering::SeqCst);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        loop {
                            let mut len_buf = [0u8; 4];
                            if stream.read_exact(&mut len_buf).await.is_err() {
                                break;
                            }
                            let len = u32::from_be_bytes(len_buf) as usize;
                            let mut data = vec![0u8; len];
                            if stream.read_exact(&mut data).await.is_err() {
                                break;
                            }
                            match decode_message(&data) {
                                Ok(msg) => {
                                    if tx.send(msg).is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
            });

            Self {
                addr,
                messages: rx,
                connections,
            }
        }

        async fn recv(&mut self) -> Message {
            timeout(Duration::from_secs(2), self.messages.recv())
                .await
                .expect("timed out waiting for message")
                .expect("mock peer channel closed")
        }

        fn connection_count(&self) -> usize {
            self.connections.load(Ordering::SeqCst)
        }
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            connect_attempts: 2,
            connect_retry_delay: Duration::from_millis(10),
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let mut peer = MockPeer::start().await;
        let transport = TcpTransport::new(0);
        transport.add_peer(1, peer.addr.clone());

        transport.send(1, Message::application(0, vec![1, 0]));

        let msg = peer.recv().await;
        assert_eq!(msg.sender, 0);
        assert_eq!(msg.clock, vec![1, 0]);
        assert_eq!(msg.kind(), "app");

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_reused_across_sends() {
        let mut peer = MockPeer::start().await;
        let transport = TcpTransport::new(0);
        transport.add_peer(1, peer.addr.clone());

        for i in 0..3 {
            transport.send(1, Message::finished(0, vec![i], i as usize));
        }
        for _ in 0..3 {
            peer.recv().await;
        }

        assert_eq!(peer.connection_count(), 1);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_then_send() {
        let mut peer = MockPeer::start().await;
        let transport = TcpTransport::with_config(0, fast_config());
        transport.add_peer(2, peer.addr.clone());

        assert!(transport.connect(2).await);
        assert_eq!(peer.connection_count(), 1);

        transport.send(2, Message::finished(0, vec![3], 1));
        let msg = peer.recv().await;
        assert_eq!(msg.body, MessageBody::OperationFinished { op_index: 1 });

        // The connection opened up front is the one used for the send.
        assert_eq!(peer.connection_count(), 1);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_gives_up_on_unreachable_peer() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::with_config(0, fast_config());
        transport.add_peer(3, addr);

        assert!(!transport.connect(3).await);

        // The link is dead now; sends are dropped without blocking.
        transport.send(3, Message::application(0, vec![1]));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_undeclared_peer_is_dropped() {
        let transport = TcpTransport::with_config(0, fast_config());
        transport.send(9, Message::application(0, vec![1]));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_to_undeclared_peer_fails() {
        let transport = TcpTransport::with_config(0, fast_config());
        assert!(!transport.connect(7).await);
        transport.shutdown().await;
    }
}
