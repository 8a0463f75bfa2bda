//! Discovery protocol message types.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use primitive_types::H256;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::{
    core::{id::NodeId, node::NodeRecord},
    error::{Error, Result},
};

/// The discovery protocol version sent in PING messages.
pub const DISCOVERY_VERSION: u8 = 4;

/// A UDP/TCP endpoint as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    /// An endpoint listening on the same port for UDP and TCP.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            udp_port: addr.port(),
            tcp_port: addr.port(),
        }
    }

    /// Builds the endpoint of a node record; hosts that aren't IP literals map to the unspecified
    /// address.
    pub fn from_node(node: &NodeRecord) -> Self {
        let ip = node
            .socket_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        Self {
            ip,
            udp_port: node.port(),
            tcp_port: node.port(),
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    fn append_fields(&self, s: &mut RlpStream) {
        let ip = match self.ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };

        s.append(&ip);
        s.append(&self.udp_port);
        s.append(&self.tcp_port);
    }

    fn decode_fields(rlp: &Rlp, offset: usize) -> std::result::Result<Self, DecoderError> {
        let ip: Vec<u8> = rlp.val_at(offset)?;
        let ip = match ip.len() {
            4 => {
                let octets: [u8; 4] = [ip[0], ip[1], ip[2], ip[3]];
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&ip);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(DecoderError::RlpInvalidLength),
        };

        Ok(Self {
            ip,
            udp_port: rlp.val_at(offset + 1)?,
            tcp_port: rlp.val_at(offset + 2)?,
        })
    }
}

impl Encodable for Endpoint {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        self.append_fields(s);
    }
}

impl Decodable for Endpoint {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        Self::decode_fields(rlp, 0)
    }
}

/// A node entry in a NEIGHBOURS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    pub endpoint: Endpoint,
    pub id: NodeId,
}

impl Neighbour {
    pub fn from_node(node: &NodeRecord) -> Self {
        Self {
            endpoint: Endpoint::from_node(node),
            id: node.id(),
        }
    }

    /// Converts the entry into a node record reachable over UDP.
    pub fn to_node(&self) -> NodeRecord {
        NodeRecord::new(self.id, self.endpoint.ip.to_string(), self.endpoint.udp_port)
    }
}

impl Encodable for Neighbour {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        self.endpoint.append_fields(s);
        s.append(&self.id);
    }
}

impl Decodable for Neighbour {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        Ok(Self {
            endpoint: Endpoint::decode_fields(rlp, 0)?,
            id: rlp.val_at(3)?,
        })
    }
}

/// Discovery message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// PING messages require a PONG response and prove the sender is alive.
    Ping(Ping),
    /// PONG is the response to PING, it echoes the hash of the PING packet.
    Pong(Pong),

    /// FIND_NODE queries a peer for the nodes closest to a target identifier.
    FindNode(FindNode),
    /// NEIGHBOURS is the response to FIND_NODE.
    Neighbours(Neighbours),
}

impl Message {
    pub fn variant_as_str(&self) -> &str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::FindNode(_) => "find_node",
            Message::Neighbours(_) => "neighbours",
        }
    }

    /// The packet type byte preceding the message body.
    pub fn packet_type(&self) -> u8 {
        match self {
            Message::Ping(_) => 1,
            Message::Pong(_) => 2,
            Message::FindNode(_) => 3,
            Message::Neighbours(_) => 4,
        }
    }

    /// The unix time (in seconds) after which the message must be ignored.
    pub fn expiration(&self) -> u64 {
        match self {
            Message::Ping(ping) => ping.expiration,
            Message::Pong(pong) => pong.expiration,
            Message::FindNode(find_node) => find_node.expiration,
            Message::Neighbours(neighbours) => neighbours.expiration,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Pong(_) | Message::Neighbours(_))
    }

    /// Encodes the message body (without its type byte).
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Message::Ping(ping) => rlp::encode(ping).to_vec(),
            Message::Pong(pong) => rlp::encode(pong).to_vec(),
            Message::FindNode(find_node) => rlp::encode(find_node).to_vec(),
            Message::Neighbours(neighbours) => rlp::encode(neighbours).to_vec(),
        }
    }

    /// Decodes a message body of the supplied packet type.
    pub fn decode(packet_type: u8, body: &[u8]) -> Result<Self> {
        let message = match packet_type {
            1 => Message::Ping(rlp::decode(body)?),
            2 => Message::Pong(rlp::decode(body)?),
            3 => Message::FindNode(rlp::decode(body)?),
            4 => Message::Neighbours(rlp::decode(body)?),
            other => return Err(Error::UnknownPacket(other)),
        };

        Ok(message)
    }
}

/// The data making up a PING message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u8,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

impl Encodable for Ping {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.version);
        s.append(&self.from);
        s.append(&self.to);
        s.append(&self.expiration);
    }
}

impl Decodable for Ping {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        Ok(Self {
            version: rlp.val_at(0)?,
            from: rlp.val_at(1)?,
            to: rlp.val_at(2)?,
            expiration: rlp.val_at(3)?,
        })
    }
}

/// The data making up a PONG message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    /// The hash of the PING packet this PONG answers.
    pub echo: H256,
    pub expiration: u64,
}

impl Encodable for Pong {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.to);
        s.append(&self.echo);
        s.append(&self.expiration);
    }
}

impl Decodable for Pong {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        Ok(Self {
            to: rlp.val_at(0)?,
            echo: rlp.val_at(1)?,
            expiration: rlp.val_at(2)?,
        })
    }
}

/// The data making up a FIND_NODE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: u64,
}

impl Encodable for FindNode {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.target);
        s.append(&self.expiration);
    }
}

impl Decodable for FindNode {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        Ok(Self {
            target: rlp.val_at(0)?,
            expiration: rlp.val_at(1)?,
        })
    }
}

/// The data making up a NEIGHBOURS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbours {
    pub nodes: Vec<Neighbour>,
    pub expiration: u64,
}

impl Encodable for Neighbours {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.begin_list(self.nodes.len());
        for node in &self.nodes {
            s.append(node);
        }
        s.append(&self.expiration);
    }
}

impl Decodable for Neighbours {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        Ok(Self {
            nodes: rlp.list_at(0)?,
            expiration: rlp.val_at(1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn variant_as_str() {
        let ping = Message::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: endpoint(1),
            to: endpoint(2),
            expiration: 0,
        });
        assert_eq!(ping.variant_as_str(), "ping");
        assert_eq!(ping.packet_type(), 1);
        assert!(!ping.is_response());

        let neighbours = Message::Neighbours(Neighbours {
            nodes: vec![],
            expiration: 0,
        });
        assert_eq!(neighbours.variant_as_str(), "neighbours");
        assert_eq!(neighbours.packet_type(), 4);
        assert!(neighbours.is_response());
    }

    #[test]
    fn ping_body() {
        let ping = Message::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: endpoint(30303),
            to: Endpoint::new("[::1]:30304".parse().unwrap()),
            expiration: 1_700_000_000,
        });

        let body = ping.encode_body();
        assert_eq!(Message::decode(1, &body).unwrap(), ping);
        // The body of a PING doesn't decode as a PONG.
        assert!(Message::decode(2, &body).is_err());
    }

    #[test]
    fn neighbours_body() {
        let nodes: Vec<_> = (0..3)
            .map(|i| Neighbour {
                endpoint: endpoint(30300 + i),
                id: NodeId::rand(),
            })
            .collect();
        let message = Message::Neighbours(Neighbours {
            nodes: nodes.clone(),
            expiration: 42,
        });

        let decoded = Message::decode(4, &message.encode_body()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(nodes[1].to_node().port(), 30301);
    }

    #[test]
    fn unknown_packet_type() {
        assert!(matches!(
            Message::decode(9, &[0xc0]),
            Err(Error::UnknownPacket(9))
        ));
    }

    #[test]
    fn invalid_ip_length() {
        let mut s = RlpStream::new_list(3);
        s.append(&vec![1u8, 2, 3]);
        s.append(&1u16);
        s.append(&1u16);

        assert!(rlp::decode::<Endpoint>(&s.out()).is_err());
    }
}
