use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Notify,
    },
    task::JoinHandle,
    time,
};
use tracing::*;

use crate::{
    config::DiscoveryConfig,
    core::{id::NodeId, message::Message, node::NodeRecord, traits::Signer},
    crypto::Keypair,
    discovery::{
        handler::State,
        manager::{Action, DiscoveryManager},
        packet::{self, MAX_PACKET_BYTES},
    },
    error::Result,
};

/// The discovery service: a [`DiscoveryManager`] driven over a UDP socket.
///
/// Cloning is cheap and every clone drives the same manager. The manager lock is only held for
/// the synchronous state machine calls, never across a socket operation.
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Clone)]
pub struct SyncDiscovery {
    manager: Arc<Mutex<DiscoveryManager>>,
    socket: Arc<UdpSocket>,
    keypair: Arc<Keypair>,
    // Wakes the timer task when the scheduler may have an earlier deadline.
    timers_changed: Arc<Notify>,
    subscribers: Arc<Mutex<Vec<UnboundedSender<(NodeRecord, State)>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SyncDiscovery {
    /// Binds the discovery socket. Nothing is sent until [`start`](SyncDiscovery::start) is
    /// called.
    pub async fn bind(config: DiscoveryConfig, keypair: Keypair) -> Result<Self> {
        let socket = UdpSocket::bind(&config.bind).await?;
        let local_addr = socket.local_addr()?;

        let host = config
            .external_ip
            .clone()
            .unwrap_or_else(|| local_addr.ip().to_string());
        let home = NodeRecord::new(keypair.node_id(), host, local_addr.port());
        info!("discovery bound to {}, home node {}", local_addr, home);

        Ok(Self {
            manager: Arc::new(Mutex::new(DiscoveryManager::new(home, config))),
            socket: Arc::new(socket),
            keypair: Arc::new(keypair),
            timers_changed: Default::default(),
            subscribers: Default::default(),
            tasks: Default::default(),
        })
    }

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Returns the local node as advertised to other nodes.
    pub fn local_node(&self) -> NodeRecord {
        self.manager.lock().local_node().clone()
    }

    /// Returns the shared manager, for instance to build a
    /// [`ConnectionPool`](crate::discovery::ConnectionPool) on top of it.
    pub fn manager(&self) -> Arc<Mutex<DiscoveryManager>> {
        self.manager.clone()
    }

    /// Runs a closure against the manager.
    pub fn with_manager<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut DiscoveryManager) -> R,
    {
        let result = f(&mut *self.manager.lock());
        self.timers_changed.notify_one();

        result
    }

    /// Returns a stream of the state changes of every node handler.
    pub fn subscribe(&self) -> UnboundedReceiver<(NodeRecord, State)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);

        rx
    }

    /// Contacts the configured predefined peers and boot nodes and spawns the receive, timer,
    /// refresh, discovery and statistics tasks.
    pub async fn start(&self) -> Result<()> {
        let (boot_nodes, active_peers, config) = {
            let manager = self.manager.lock();
            let config = manager.config().clone();
            (config.boot_nodes()?, config.active_peers()?, config)
        };

        let now = Instant::now();
        self.run(|manager| {
            let mut actions = manager.add_predefined(active_peers, now);
            actions.extend(manager.add_boot_nodes(boot_nodes, now));
            actions
        })
        .await;

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_receiver());
        tasks.push(self.spawn_timers());

        // Refresh the buckets towards random targets.
        tasks.push(self.spawn_lookups(config.refresh_interval(), None));
        // Look for the nodes closest to the local node.
        tasks.push(self.spawn_lookups(config.discover_interval(), Some(self.keypair.node_id())));

        let discovery = self.clone();
        let mut stats = time::interval(config.stats_interval().max(Duration::from_millis(1)));
        tasks.push(tokio::spawn(async move {
            loop {
                stats.tick().await;
                let dump = discovery.manager.lock().dump_statistics();
                trace!("node statistics:\n{}", dump);
            }
        }));

        Ok(())
    }

    /// Adds nodes to discover, pinging them.
    pub async fn add_nodes(&self, nodes: Vec<NodeRecord>) {
        self.run(|manager| manager.add_boot_nodes(nodes, Instant::now()))
            .await;
    }

    /// Runs a bounded iterative lookup towards the target.
    pub async fn lookup(&self, target: NodeId) {
        let (mut lookup, round_interval) = {
            let manager = self.manager.lock();
            (
                manager.lookup(target),
                manager.config().lookup_round_interval(),
            )
        };

        loop {
            let actions = self.manager.lock().lookup_round(&mut lookup);
            if actions.is_empty() {
                break;
            }

            self.dispatch(actions).await;
            time::sleep(round_interval).await;
        }

        debug!(
            "lookup towards {} done after {} rounds",
            target.short(),
            lookup.round()
        );
    }

    /// Aborts every task.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_receiver(&self) -> JoinHandle<()> {
        let discovery = self.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_BYTES];

            loop {
                let (len, sender) = match discovery.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("couldn't receive: {}", e);
                        continue;
                    }
                };

                let packet = match packet::decode(&buf[..len], packet::unix_now()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("dropping packet from {}: {}", sender, e);
                        continue;
                    }
                };

                discovery
                    .run(|manager| manager.handle_inbound(packet, sender, Instant::now()))
                    .await;
            }
        })
    }

    fn spawn_timers(&self) -> JoinHandle<()> {
        let discovery = self.clone();

        tokio::spawn(async move {
            loop {
                let deadline = discovery.manager.lock().next_deadline();

                match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = time::sleep_until(time::Instant::from_std(deadline)) => {}
                            _ = discovery.timers_changed.notified() => continue,
                        }
                    }
                    None => {
                        discovery.timers_changed.notified().await;
                        continue;
                    }
                }

                let actions = discovery.manager.lock().poll_timers(Instant::now());
                discovery.dispatch(actions).await;
            }
        })
    }

    fn spawn_lookups(&self, period: Duration, target: Option<NodeId>) -> JoinHandle<()> {
        let discovery = self.clone();
        let mut interval = time::interval(period.max(Duration::from_millis(1)));

        tokio::spawn(async move {
            loop {
                interval.tick().await;
                discovery.lookup(target.unwrap_or_else(NodeId::rand)).await;
            }
        })
    }

    async fn run<F>(&self, f: F)
    where
        F: FnOnce(&mut DiscoveryManager) -> Vec<Action>,
    {
        let actions = self.with_manager(f);
        self.dispatch(actions).await;
    }

    async fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { node, message } => self.send(&node, &message).await,
                Action::StateChanged { node, to, .. } => {
                    self.subscribers
                        .lock()
                        .retain(|subscriber| subscriber.send((node.clone(), to)).is_ok());
                }
            }
        }
    }

    async fn send(&self, node: &NodeRecord, message: &Message) {
        let addr = match node.socket_addr() {
            Some(addr) => addr,
            None => {
                let resolved = lookup_host((node.host(), node.port()))
                    .await
                    .ok()
                    .and_then(|mut addrs| addrs.next());

                match resolved {
                    Some(addr) => addr,
                    None => {
                        debug!("couldn't resolve {}", node);
                        return;
                    }
                }
            }
        };

        let packet = match packet::encode(message, self.keypair.as_ref()) {
            Ok((packet, _hash)) => packet,
            Err(e) => {
                error!("couldn't encode {}: {}", message.variant_as_str(), e);
                return;
            }
        };

        trace!("<=== ({}) {}", addr, message.variant_as_str());
        if let Err(e) = self.socket.send_to(&packet, addr).await {
            debug!("couldn't send {} to {}: {}", message.variant_as_str(), addr, e);
        }
    }
}
