//! Configuration for the discovery and synchronisation services.
//!
//! Every field has a default, so a configuration file only needs the values it changes:
//!
//! ```toml
//! [discovery]
//! bind = "0.0.0.0:30303"
//! boot_nodes = ["enode://<hex id>@10.0.0.1:30303", "10.0.0.2:30303"]
//! ping_timeout_ms = 15000
//! inbound_only_from_known_nodes = true
//!
//! [sync]
//! network_id = 1
//! max_blocks_ask = 64
//! ```

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::{core::node::NodeRecord, error::Result};

/// The complete configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub sync: SyncConfig,
}

impl Config {
    /// Parses a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Peer discovery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// The UDP address the discovery socket binds to.
    pub bind: String,
    /// The address advertised to other nodes, defaults to the bound address.
    pub external_ip: Option<String>,
    /// Nodes contacted on startup, as `enode://` URLs or bare `host:port` endpoints.
    pub boot_nodes: Vec<String>,
    /// Nodes flagged as predefined, which rank first for connections.
    pub active_peers: Vec<String>,
    /// How long to wait for a PONG.
    pub ping_timeout_ms: u64,
    /// How many PINGs are sent before a node is declared unresponsive.
    pub ping_trials: u32,
    /// Rejects packets from nodes without a handler.
    pub inbound_only_from_known_nodes: bool,
    /// Advertises the local node in NEIGHBOURS responses.
    pub public_home_node: bool,
    /// The number of handlers kept when trimming.
    pub max_nodes: usize,
    /// Handlers are trimmed by reputation once more than this many exist.
    pub nodes_trim_threshold: usize,
    /// Interval between random-target lookups.
    pub refresh_interval_secs: u64,
    /// Interval between lookups towards the local identifier.
    pub discover_interval_secs: u64,
    /// The number of nodes queried per lookup round.
    pub alpha: usize,
    /// The maximum number of rounds in a lookup.
    pub max_lookup_rounds: usize,
    /// Delay between two lookup rounds.
    pub lookup_round_interval_ms: u64,
    /// The number of concurrent outbound connection attempts.
    pub connection_workers: usize,
    /// Interval between two statistics dumps.
    pub stats_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:30303".to_string(),
            external_ip: None,
            boot_nodes: vec![],
            active_peers: vec![],
            ping_timeout_ms: 15_000,
            ping_trials: 1,
            inbound_only_from_known_nodes: false,
            public_home_node: true,
            max_nodes: 2000,
            nodes_trim_threshold: 3000,
            refresh_interval_secs: 2 * 60 * 60,
            discover_interval_secs: 30,
            alpha: 3,
            max_lookup_rounds: 8,
            lookup_round_interval_ms: 200,
            connection_workers: 8,
            stats_interval_secs: 60,
        }
    }
}

impl DiscoveryConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn discover_interval(&self) -> Duration {
        Duration::from_secs(self.discover_interval_secs)
    }

    pub fn lookup_round_interval(&self) -> Duration {
        Duration::from_millis(self.lookup_round_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Parses the boot nodes.
    pub fn boot_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.boot_nodes.iter().map(|node| node.parse()).collect()
    }

    /// Parses the predefined peers.
    pub fn active_peers(&self) -> Result<Vec<NodeRecord>> {
        self.active_peers.iter().map(|node| node.parse()).collect()
    }
}

/// Chain synchronisation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// The network peers must announce in their status.
    pub network_id: u64,
    /// The eth protocol version spoken (60 or 61).
    pub protocol_version: u8,
    /// The maximum number of hashes requested per GetBlockHashes.
    pub max_hashes_ask: usize,
    /// The maximum number of blocks requested per GetBlocks.
    pub max_blocks_ask: usize,
    /// Hashes queued beyond this many are refused and hash retrieval waits.
    pub max_queued_hashes: usize,
    /// Blocks waiting for their parents beyond this many are refused and GetBlocks requests
    /// wait.
    pub max_buffered_blocks: usize,
    /// Consecutive empty Blocks responses before a peer is considered lacking.
    pub empty_responses_threshold: u32,
    /// The master is replaced if it hasn't delivered hashes for this long.
    pub master_stuck_timeout_secs: u64,
    /// Interval between two maintenance passes of the coordinator.
    pub worker_interval_ms: u64,
    /// Interval between two statistics logs.
    pub stats_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            protocol_version: 60,
            max_hashes_ask: 10_000,
            max_blocks_ask: 128,
            max_queued_hashes: 1_000_000,
            max_buffered_blocks: 20_000,
            empty_responses_threshold: 5,
            master_stuck_timeout_secs: 60,
            worker_interval_ms: 1000,
            stats_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn master_stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.master_stuck_timeout_secs)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
