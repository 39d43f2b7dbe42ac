//! TCP server accepting frames from neighbor nodes.

use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::network::wire::decode_message;
use crate::protocol::{Event, EventSender};
use crate::types::NodeId;

/// Largest accepted frame payload.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Listener feeding decoded neighbor frames into the dispatcher mailbox.
///
/// Binds eagerly so the caller knows the listener is live before any
/// neighbor tries to connect. Each accepted connection gets its own
/// read task; a closed connection ends that task quietly.
pub struct NetworkServer {
    /// Bound listener.
    listener: TcpListener,

    /// This node's ID, for log context.
    node_id: NodeId,

    /// Mailbox of the dispatcher task.
    events: EventSender,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind the listener and return the server plus its shutdown handle.
    pub async fn bind(
        bind_addr: SocketAddr,
        node_id: NodeId,
        events: EventSender,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(TransportError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            node_id,
            events,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(TransportError::Io)?)
    }

    /// Accept connections until shut down.
    pub async fn run(mut self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(node_id = self.node_id, %addr, "listening for neighbors");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "accepted connection");
                            let events = self.events.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, events).await {
                                    debug!(peer = %peer_addr, error = %e, "connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(node_id = self.node_id, "network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read frames off one connection until it closes.
    async fn handle_connection(mut stream: TcpStream, events: EventSender) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // Neighbor closed the connection.
                    return Ok(());
                }
                Err(e) => return Err(TransportError::Io(e).into()),
            }

            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                return Err(TransportError::FrameTooLarge {
                    size: len,
                    max: MAX_FRAME_LEN,
                }
                .into());
            }

            let mut data = vec![0u8; len];
            stream
                .read_exact(&mut data)
                .await
                .map_err(TransportError::Io)?;

            let msg = decode_message(&data)
                .map_err(|e| TransportError::Deserialization(e.to_string()))?;

            if events.send(Event::Inbound(msg)).is_err() {
                // Dispatcher is gone, nothing left to deliver to.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::wire::{frame_message, Message};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    async fn start_server() -> (SocketAddr, mpsc::Sender<()>, mpsc::UnboundedReceiver<Event>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (server, shutdown_tx) = NetworkServer::bind(addr, 0, event_tx).await.unwrap();
        let local = server.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        (local, shutdown_tx, event_rx)
    }

    async fn next_inbound(rx: &mut mpsc::UnboundedReceiver<Event>) -> Message {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        match event {
            Event::Inbound(msg) => msg,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivers_inbound_frames() {
        let (addr, _shutdown, mut events) = start_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let msg = Message::request(2, vec![0, 0, 1], 4, 2);
        stream.write_all(&frame_message(&msg).unwrap()).await.unwrap();

        let received = next_inbound(&mut events).await;
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_multiple_frames_on_one_connection() {
        let (addr, _shutdown, mut events) = start_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let first = Message::application(1, vec![3, 0]);
        let second = Message::finished(1, vec![4, 0], 0);
        stream.write_all(&frame_message(&first).unwrap()).await.unwrap();
        stream.write_all(&frame_message(&second).unwrap()).await.unwrap();

        assert_eq!(next_inbound(&mut events).await, first);
        assert_eq!(next_inbound(&mut events).await, second);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (addr, _shutdown, _events) = start_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        stream.write_all(&len).await.unwrap();

        // The server drops the connection instead of allocating.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (server, shutdown_tx) = NetworkServer::bind(addr, 1, event_tx).await.unwrap();

        let handle = tokio::spawn(async move { server.run().await });

        shutdown_tx.send(()).await.unwrap();
        let result = timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
