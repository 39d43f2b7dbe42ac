//! Node assembly: wires config, engine, transport and server together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::network::{NetworkServer, TcpTransport};
use crate::protocol::{Dispatcher, Engine, Event, EventSender};
use crate::snapshot::FileSnapshotStore;
use crate::types::NodeId;

/// Pause after binding before dialing out, and again after dialing,
/// so every peer's listener is up before protocol traffic starts.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Bounds of the random pause between generated application messages.
const TRAFFIC_MIN_MS: u64 = 500;
const TRAFFIC_MAX_MS: u64 = 2500;

/// One running cluster node.
///
/// Owns the background tasks: the listener, the dispatcher consuming
/// the event mailbox, and the application traffic generator.
pub struct Node {
    node_id: NodeId,
    events: EventSender,
    transport: Arc<TcpTransport>,
    server_shutdown: mpsc::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Boot this node and kick off its schedule.
    pub async fn start(node_id: NodeId, config: ClusterConfig) -> Result<Self> {
        Self::start_with_settle(node_id, config, SETTLE_DELAY).await
    }

    pub(crate) async fn start_with_settle(
        node_id: NodeId,
        config: ClusterConfig,
        settle: Duration,
    ) -> Result<Self> {
        let config = Arc::new(config);
        info!(node_id, neighbors = ?config.neighbors_of(node_id), "starting node");

        let store = Arc::new(FileSnapshotStore::new(&config.snapshot_dir, node_id)?);
        let engine = Engine::new(node_id, Arc::clone(&config), store);

        let transport = Arc::new(TcpTransport::new(node_id));
        let (dispatcher, events) = Dispatcher::new(engine, Arc::clone(&transport) as _);

        // Listener first so neighbors can reach us while we dial them.
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.node_addr(node_id).port));
        let (server, server_shutdown) =
            NetworkServer::bind(bind_addr, node_id, events.clone()).await?;
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "network server failed");
            }
        });

        // Frames arriving during the settle window queue up in the
        // mailbox until the dispatcher catches up.
        let dispatcher_task = tokio::spawn(dispatcher.run());

        sleep(settle).await;

        for &peer in config.neighbors_of(node_id) {
            transport.add_peer(peer, config.node_addr(peer).endpoint());
        }
        for &peer in config.neighbors_of(node_id) {
            if !transport.connect(peer).await {
                warn!(node_id, peer, "starting without a link to neighbor");
            }
        }

        sleep(settle).await;

        let traffic_task = tokio::spawn(Self::traffic_loop(
            node_id,
            Arc::clone(&config),
            events.clone(),
        ));

        // First look at the schedule; later looks are driven by the
        // inter-operation delay timer.
        let _ = events.send(Event::ScheduleTick);

        info!(node_id, "node started");

        Ok(Self {
            node_id,
            events,
            transport,
            server_shutdown,
            tasks: vec![server_task, dispatcher_task, traffic_task],
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Handle for enqueueing events, mainly for tests.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Stop the node: dispatcher first, then listener and transport.
    pub async fn shutdown(self) {
        info!(node_id = self.node_id, "shutting down");

        let _ = self.events.send(Event::Shutdown);
        let _ = self.server_shutdown.send(()).await;
        self.transport.shutdown().await;

        for task in self.tasks {
            task.abort();
        }

        info!(node_id = self.node_id, "node stopped");
    }

    /// Send application chatter to a random neighbor at random
    /// intervals, keeping clocks moving between schedule operations.
    async fn traffic_loop(node_id: NodeId, config: Arc<ClusterConfig>, events: EventSender) {
        let neighbors = config.neighbors_of(node_id).to_vec();
        if neighbors.is_empty() {
            return;
        }

        loop {
            let (pause_ms, target) = {
                let mut rng = rand::rng();
                (
                    rng.random_range(TRAFFIC_MIN_MS..TRAFFIC_MAX_MS),
                    neighbors[rng.random_range(0..neighbors.len())],
                )
            };
            sleep(Duration::from_millis(pause_ms)).await;
            if events.send(Event::SendApplication { to: target }).is_err() {
                break;
            }
        }
    }
}
