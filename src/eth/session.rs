use std::{collections::HashMap, io, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time,
};
use tokio_util::codec::Framed;
use tracing::*;

use crate::{
    codec::{EthCodec, Framing},
    core::{
        id::NodeId,
        node::NodeRecord,
        statistics::{DisconnectReason, NodeStatistics},
        traits::Chain,
    },
    discovery::{Connector, DiscoveryManager},
    error::{Error, Result},
    eth::{
        coordinator::{Outbound, SyncCoordinator},
        message::{EthMessage, Status},
    },
};

#[derive(Debug)]
enum Command {
    Send(EthMessage),
    Disconnect(DisconnectReason),
}

// Which side ended a session that closed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Local,
    Remote,
}

/// The sync service: a [`SyncCoordinator`] driven over peer sessions.
///
/// Every session reads frames on its own task and feeds them to the coordinator; the messages the
/// coordinator produces are routed to the sessions of their recipients. The coordinator lock is
/// never held across an await.
///
/// With [`with_discovery`](SyncWorker::with_discovery) the sessions feed the statistics of the
/// peers' discovery handlers, from which their reputation is computed.
#[cfg_attr(doc_cfg, doc(cfg(all(feature = "sync", feature = "codec"))))]
pub struct SyncWorker<C> {
    coordinator: Arc<Mutex<SyncCoordinator<C>>>,
    sessions: Arc<Mutex<HashMap<NodeId, UnboundedSender<Command>>>>,
    discovery: Option<Arc<Mutex<DiscoveryManager>>>,
    framing: Framing,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<C> Clone for SyncWorker<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            sessions: self.sessions.clone(),
            discovery: self.discovery.clone(),
            framing: self.framing,
            tasks: self.tasks.clone(),
        }
    }
}

impl<C: Chain + Send + 'static> SyncWorker<C> {
    pub fn new(coordinator: SyncCoordinator<C>, framing: Framing) -> Self {
        Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
            sessions: Default::default(),
            discovery: None,
            framing,
            tasks: Default::default(),
        }
    }

    /// Records the session events of every peer in the statistics held by the manager.
    pub fn with_discovery(mut self, manager: Arc<Mutex<DiscoveryManager>>) -> Self {
        self.discovery = Some(manager);
        self
    }

    /// Runs a closure against the coordinator.
    pub fn with_coordinator<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut SyncCoordinator<C>) -> R,
    {
        f(&mut *self.coordinator.lock())
    }

    /// The number of sessions running.
    pub fn sessions_len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Spawns the maintenance and statistics tasks.
    pub fn start(&self) {
        let (worker_interval, stats_interval) = {
            let coordinator = self.coordinator.lock();
            (
                coordinator.config().worker_interval(),
                coordinator.config().stats_interval(),
            )
        };

        let mut tasks = self.tasks.lock();

        let worker = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(worker_interval);
            loop {
                interval.tick().await;

                let tick = worker.coordinator.lock().maintain(Instant::now());
                worker.dispatch(tick.outbound);
                worker.disconnect(tick.disconnect);
            }
        }));

        let worker = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(stats_interval);
            loop {
                interval.tick().await;
                worker.coordinator.lock().log_stats();
            }
        }));
    }

    /// Accepts inbound TCP sessions until [`shutdown`](SyncWorker::shutdown).
    ///
    /// Without an authenticated transport an inbound peer can't prove an identity, so every
    /// connection gets a fresh one.
    pub fn listen(&self, listener: TcpListener) {
        let worker = self.clone();

        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("couldn't accept a session: {}", e);
                        continue;
                    }
                };

                let peer = NodeId::rand();
                debug!("inbound session from {} as {}", addr, peer.short());

                let session = worker.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.run_session(peer, stream).await {
                        debug!("inbound session from {} failed: {}", addr, e);
                    }
                });
            }
        }));
    }

    /// Runs a session with a peer over an established stream until either side ends it.
    ///
    /// The local status is sent first and the peer's status must be the first frame received.
    /// Hashes in flight with the peer are returned to the queue when the session ends.
    pub async fn run_session<S>(&self, peer: NodeId, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.session(peer, stream).await;

        self.record(&peer, |stats| match &result {
            Ok(Closed::Local) => stats.disconnected_local(DisconnectReason::Requested),
            Ok(Closed::Remote) => stats.disconnected_remote(DisconnectReason::Requested),
            Err(Error::Disconnect(reason)) => stats.disconnected_local(*reason),
            Err(Error::Io(_)) => stats.disconnected_remote(DisconnectReason::TcpError),
            Err(_) => stats.disconnected_local(DisconnectReason::BadProtocol),
        });

        match &result {
            Ok(closed) => debug!("peer {}: session closed ({:?})", peer.short(), closed),
            Err(e) => debug!("peer {}: session ended: {}", peer.short(), e),
        }

        result.map(|_| ())
    }

    /// Ends every session and stops the background tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.sessions.lock().clear();
    }

    async fn session<S>(&self, peer: NodeId, stream: S) -> Result<Closed>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (capability, status) = {
            let coordinator = self.coordinator.lock();
            (coordinator.capability(), coordinator.status())
        };
        let genesis_hash = status.genesis_hash;
        let mut framed = Framed::new(stream, EthCodec::new(capability, self.framing));

        let remote = handshake(&mut framed, status).await?;
        debug!(
            "peer {}: status td {}, best {:?}",
            peer.short(),
            remote.total_difficulty,
            remote.best_hash
        );

        let wrong_fork = remote.genesis_hash != genesis_hash;
        self.record(&peer, |stats| {
            stats.rlpx_auth_messages_sent += 1;
            stats.rlpx_handshakes += 1;
            stats.rlpx_out_messages += 1;
            stats.rlpx_in_messages += 1;
            stats.eth_out_messages += 1;
            stats.eth_in_messages += 1;
            stats.eth_handshake(remote.total_difficulty);
            stats.wrong_fork |= wrong_fork;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&peer) {
                return Err(Error::Disconnect(DisconnectReason::DuplicatePeer));
            }
            sessions.insert(peer, tx);
        }

        let added = self
            .coordinator
            .lock()
            .add_peer(peer, remote, Instant::now());
        let result = match added {
            Ok(out) => {
                self.dispatch(out);
                self.serve(peer, &mut framed, &mut rx).await
            }
            Err(e) => Err(e),
        };

        self.sessions.lock().remove(&peer);
        let out = self.coordinator.lock().remove_peer(&peer, Instant::now());
        self.dispatch(out);

        result
    }

    async fn serve<S>(
        &self,
        peer: NodeId,
        framed: &mut Framed<S, EthCodec>,
        commands: &mut UnboundedReceiver<Command>,
    ) -> Result<Closed>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(message)) => {
                        self.record(&peer, |stats| {
                            stats.rlpx_in_messages += 1;
                            stats.eth_in_messages += 1;
                        });
                        let out = self
                            .coordinator
                            .lock()
                            .on_message(&peer, message, Instant::now());
                        self.dispatch(out?);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(Closed::Remote),
                },
                command = commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        trace!("peer {}: sending {}", peer.short(), message);
                        framed.send(message).await?;
                        self.record(&peer, |stats| {
                            stats.rlpx_out_messages += 1;
                            stats.eth_out_messages += 1;
                        });
                    }
                    Some(Command::Disconnect(reason)) => return Err(Error::Disconnect(reason)),
                    None => return Ok(Closed::Local),
                },
            }
        }
    }

    // Updates the peer's discovery statistics, if the peer has a handler.
    fn record<F>(&self, peer: &NodeId, f: F)
    where
        F: FnOnce(&mut NodeStatistics),
    {
        if let Some(discovery) = &self.discovery {
            if let Some(stats) = discovery.lock().statistics_by_id_mut(peer) {
                f(stats);
            }
        }
    }

    fn disconnect(&self, peers: Vec<(NodeId, DisconnectReason)>) {
        let sessions = self.sessions.lock();
        for (id, reason) in peers {
            if let Some(tx) = sessions.get(&id) {
                debug!("disconnecting {}: {:?}", id.short(), reason);
                let _ = tx.send(Command::Disconnect(reason));
            }
        }
    }

    fn dispatch(&self, outbound: Outbound) {
        if outbound.is_empty() {
            return;
        }

        let sessions = self.sessions.lock();
        for (id, message) in outbound {
            match sessions.get(&id) {
                Some(tx) => {
                    let _ = tx.send(Command::Send(message));
                }
                None => debug!("no session with {} for {}", id.short(), message),
            }
        }
    }
}

async fn handshake<S>(framed: &mut Framed<S, EthCodec>, status: Status) -> Result<Status>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    framed.send(EthMessage::Status(status)).await?;

    match framed.next().await {
        Some(Ok(EthMessage::Status(status))) => Ok(status),
        Some(Ok(message)) => {
            debug!("expected a status, got {}", message);
            Err(Error::Disconnect(DisconnectReason::BadProtocol))
        }
        Some(Err(e)) => Err(e),
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

/// Dials the nodes admitted by discovery over TCP and runs a sync session with them.
#[cfg_attr(doc_cfg, doc(cfg(all(feature = "sync", feature = "codec"))))]
pub struct SessionConnector<C> {
    worker: SyncWorker<C>,
}

impl<C: Chain + Send + 'static> SessionConnector<C> {
    pub fn new(worker: SyncWorker<C>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl<C: Chain + Send + 'static> Connector for SessionConnector<C> {
    async fn connect(&self, node: &NodeRecord) -> Result<()> {
        let stream = TcpStream::connect((node.host(), node.port())).await?;
        self.worker.run_session(node.id(), stream).await
    }
}
