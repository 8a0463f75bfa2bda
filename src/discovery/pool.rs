use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc::UnboundedReceiver, Notify},
    task::JoinHandle,
};
use tracing::*;

use crate::{
    core::node::NodeRecord,
    discovery::{admission::Admission, handler::State, manager::DiscoveryManager},
    error::{Error, Result},
};

/// Opens a peering session against a node.
///
/// The returned future should resolve once the session is over: the node stays a connection
/// candidate (and isn't dialed again) until then. Returning [`Error::Disconnect`] records the
/// reason as a local disconnect in the node's statistics.
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, node: &NodeRecord) -> Result<()>;
}

/// A bounded pool of workers opening sessions to the nodes admitted by discovery.
///
/// Connection attempts run on their own tasks and only take the discovery lock briefly to pick a
/// candidate and update its statistics, so a slow dial never delays discovery.
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Clone)]
pub struct ConnectionPool {
    manager: Arc<Mutex<DiscoveryManager>>,
    admission: Arc<Mutex<Admission>>,
    queued: Arc<Notify>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionPool {
    /// Creates a pool picking candidates by the reputations held in the manager.
    pub fn new(manager: Arc<Mutex<DiscoveryManager>>) -> Self {
        Self {
            manager,
            admission: Default::default(),
            queued: Default::default(),
            tasks: Default::default(),
        }
    }

    /// Spawns the configured number of workers dialing candidates through the connector.
    pub fn start<C: Connector>(&self, connector: Arc<C>) {
        let workers = self.manager.lock().config().connection_workers;
        let mut tasks = self.tasks.lock();

        for i in 0..workers.max(1) {
            let pool = self.clone();
            let connector = connector.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    let node = match pool.next_candidate() {
                        Some(node) => node,
                        None => {
                            pool.queued.notified().await;
                            continue;
                        }
                    };

                    debug!("worker {} connecting to {}", i, node);
                    let result = connector.connect(&node).await;
                    pool.session_ended(&node, result);
                }
            }));
        }
    }

    /// Feeds the pool from a stream of node state changes.
    pub fn follow(&self, mut events: UnboundedReceiver<(NodeRecord, State)>) {
        let pool = self.clone();

        self.tasks.lock().push(tokio::spawn(async move {
            while let Some((node, state)) = events.recv().await {
                pool.node_status_changed(&node, state);
            }
        }));
    }

    /// Queues the node for a connection attempt if it just became reachable.
    pub fn node_status_changed(&self, node: &NodeRecord, to: State) {
        if self.admission.lock().node_status_changed(node, to) {
            self.queued.notify_one();
        }
    }

    /// Returns `true` if the node is queued or connected.
    pub fn is_candidate(&self, node: &NodeRecord) -> bool {
        self.admission.lock().is_candidate(node)
    }

    /// The number of nodes waiting for a worker.
    pub fn pending_len(&self) -> usize {
        self.admission.lock().pending_len()
    }

    /// Stops every worker.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn next_candidate(&self) -> Option<NodeRecord> {
        // Lock order: manager, then admission.
        let mut manager = self.manager.lock();
        let node = self
            .admission
            .lock()
            .next_candidate(|node| manager.reputation(node))?;

        if let Some(stats) = manager.statistics_mut(&node) {
            stats.rlpx_connection_attempts += 1;
        }

        Some(node)
    }

    fn session_ended(&self, node: &NodeRecord, result: Result<()>) {
        let mut manager = self.manager.lock();
        if let Some(stats) = manager.statistics_mut(node) {
            match &result {
                Err(Error::Disconnect(reason)) => stats.disconnected_local(*reason),
                _ => stats.disconnected = true,
            }
        }

        match result {
            Ok(()) => debug!("session with {} ended", node),
            Err(e) => debug!("session with {} failed: {}", node, e),
        }

        self.admission.lock().session_terminated(node);
    }
}
