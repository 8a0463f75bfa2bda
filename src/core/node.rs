//! Node records.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use crate::{
    core::id::{Id, NodeId},
    error::Error,
};

/// The identity of a remote participant: its node identifier and the endpoint it was seen at.
///
/// Two records are equal if their identifiers, hosts and ports are equal.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    id: NodeId,
    host: String,
    port: u16,
    // Cached Kademlia key of `id`.
    key: Id,
}

impl NodeRecord {
    /// Creates a new record.
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            key: id.key(),
        }
    }

    /// Creates a record for an endpoint whose identifier isn't known yet (a boot node).
    pub fn discovery(host: impl Into<String>, port: u16) -> Self {
        Self::new(NodeId::zero(), host, port)
    }

    /// Creates a record from a socket address.
    pub fn from_socket_addr(id: NodeId, addr: SocketAddr) -> Self {
        Self::new(id, addr.ip().to_string(), addr.port())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the Kademlia key of the node's identifier.
    pub fn key(&self) -> Id {
        self.key
    }

    /// Returns `true` if the node's identifier isn't known.
    pub fn is_discovery_node(&self) -> bool {
        self.id.is_zero()
    }

    /// Returns the node's socket address if its host is an IP literal.
    ///
    /// Host names are never resolved here.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The key the node's handler is stored under: the normalised `ip:port` when the host is an IP
    /// literal, the raw `host:port` otherwise.
    pub fn handler_key(&self) -> String {
        match self.socket_addr() {
            Some(addr) => addr.to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl PartialEq for NodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.host == other.host && self.port == other.port
    }
}

impl Eq for NodeRecord {}

impl Hash for NodeRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_discovery_node() {
            write!(f, "{}", self.handler_key())
        } else {
            write!(f, "enode://{}@{}", self.id, self.handler_key())
        }
    }
}

impl FromStr for NodeRecord {
    type Err = Error;

    /// Parses `enode://<hex id>@<host>:<port>`, or a bare `<host>:<port>` for a node whose
    /// identifier isn't known.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, endpoint) = match s.strip_prefix("enode://") {
            Some(rest) => {
                let (id, endpoint) = rest
                    .split_once('@')
                    .ok_or_else(|| Error::InvalidNode(format!("missing '@' in {s}")))?;
                (id.parse()?, endpoint)
            }
            None => (NodeId::zero(), s),
        };

        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidNode(format!("missing port in {s}")))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidNode(format!("bad port in {s}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if host.is_empty() {
            return Err(Error::InvalidNode(format!("missing host in {s}")));
        }

        Ok(NodeRecord::new(id, host, port))
    }
}
