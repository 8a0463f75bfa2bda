//! Per-node counters and the reputation derived from them.

use std::{cmp::min, fmt};

use primitive_types::U256;
use time::OffsetDateTime;

/// The reputation bonus granted to configured (predefined) peers.
pub const REPUTATION_PREDEFINED: i64 = 1_000_500;

// Per-counter contributions are capped at this many events.
const COUNTER_CAP: u32 = 10;

/// Session disconnect reasons, with their RLPx wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    Requested = 0x00,
    TcpError = 0x01,
    BadProtocol = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    DuplicatePeer = 0x05,
    IncompatibleProtocol = 0x06,
    NullIdentity = 0x07,
    PeerQuitting = 0x08,
    UnexpectedIdentity = 0x09,
    LocalIdentity = 0x0a,
    PingTimeout = 0x0b,
    UserReason = 0x10,
}

impl DisconnectReason {
    /// Returns the wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns the reason matching a wire code, if any.
    pub fn from_code(code: u8) -> Option<Self> {
        use DisconnectReason::*;

        let reason = match code {
            0x00 => Requested,
            0x01 => TcpError,
            0x02 => BadProtocol,
            0x03 => UselessPeer,
            0x04 => TooManyPeers,
            0x05 => DuplicatePeer,
            0x06 => IncompatibleProtocol,
            0x07 => NullIdentity,
            0x08 => PeerQuitting,
            0x09 => UnexpectedIdentity,
            0x0a => LocalIdentity,
            0x0b => PingTimeout,
            0x10 => UserReason,
            _ => return None,
        };

        Some(reason)
    }
}

/// Counters attached to a node, from which its reputation is computed on demand.
#[derive(Debug, Clone, Default)]
pub struct NodeStatistics {
    // Discovery.
    pub discover_in_ping: u32,
    pub discover_out_ping: u32,
    pub discover_in_pong: u32,
    pub discover_out_pong: u32,
    pub discover_in_find: u32,
    pub discover_out_find: u32,
    pub discover_in_neighbours: u32,
    pub discover_out_neighbours: u32,
    pub last_pong: Option<OffsetDateTime>,

    // RLPx sessions.
    pub rlpx_connection_attempts: u32,
    pub rlpx_auth_messages_sent: u32,
    pub rlpx_handshakes: u32,
    pub rlpx_in_messages: u32,
    pub rlpx_out_messages: u32,
    pub local_disconnect_reason: Option<DisconnectReason>,
    pub remote_disconnect_reason: Option<DisconnectReason>,
    pub disconnected: bool,

    // Eth sub-protocol.
    pub eth_handshakes: u32,
    pub eth_in_messages: u32,
    pub eth_out_messages: u32,
    pub eth_total_difficulty: U256,
    pub wrong_fork: bool,

    pub predefined: bool,
    // Reputation carried over from an earlier run.
    pub persisted_reputation: i64,
}

impl NodeStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the node's reputation.
    pub fn reputation(&self) -> i64 {
        let fair = if self.wrong_fork {
            0
        } else {
            self.discover_reputation() + 100 * self.rlpx_reputation()
        };

        let bonus = if self.predefined {
            REPUTATION_PREDEFINED
        } else {
            0
        };

        self.persisted_reputation / 2 + fair + bonus
    }

    fn discover_reputation(&self) -> i64 {
        let pongs = min(self.discover_in_pong, COUNTER_CAP) as i64;
        let multiplier = if self.discover_out_ping == self.discover_in_pong {
            2
        } else {
            1
        };
        let neighbours = min(self.discover_in_neighbours, COUNTER_CAP) as i64;

        pongs * multiplier + neighbours * 2
    }

    fn rlpx_reputation(&self) -> i64 {
        let mut reputation = 0;
        if self.rlpx_auth_messages_sent > 0 {
            reputation += 10;
        }
        if self.rlpx_handshakes > 0 {
            reputation += 20;
        }
        reputation += min(self.rlpx_in_messages, COUNTER_CAP) as i64 * 3;

        if self.disconnected {
            match (self.local_disconnect_reason, self.remote_disconnect_reason) {
                // Dropped without a reason on either side.
                (None, None) => reputation = reputation * 3 / 10,
                (Some(DisconnectReason::Requested), _) => {}
                (_, Some(DisconnectReason::TooManyPeers)) => reputation = reputation * 8 / 10,
                _ => reputation /= 2,
            }
        }

        reputation
    }

    /// Records a disconnect initiated locally.
    pub fn disconnected_local(&mut self, reason: DisconnectReason) {
        self.local_disconnect_reason = Some(reason);
        self.disconnected = true;
    }

    /// Records a disconnect initiated by the remote.
    pub fn disconnected_remote(&mut self, reason: DisconnectReason) {
        self.remote_disconnect_reason = Some(reason);
        self.disconnected = true;
    }

    /// Records the status a peer announced in its handshake.
    pub fn eth_handshake(&mut self, total_difficulty: U256) {
        self.eth_handshakes += 1;
        self.eth_total_difficulty = total_difficulty;
    }
}

impl fmt::Display for NodeStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reputation: {}, discover: {}/{} ping, {}/{} pong, {}/{} find, {}/{} neighbours, rlpx: {} attempts, {} handshakes, {}/{} messages, eth: {} handshakes, {}/{} messages, td: {}",
            self.reputation(),
            self.discover_in_ping,
            self.discover_out_ping,
            self.discover_in_pong,
            self.discover_out_pong,
            self.discover_in_find,
            self.discover_out_find,
            self.discover_in_neighbours,
            self.discover_out_neighbours,
            self.rlpx_connection_attempts,
            self.rlpx_handshakes,
            self.rlpx_in_messages,
            self.rlpx_out_messages,
            self.eth_handshakes,
            self.eth_in_messages,
            self.eth_out_messages,
            self.eth_total_difficulty,
        )?;

        if self.predefined {
            f.write_str(", predefined")?;
        }
        if let Some(reason) = self.local_disconnect_reason {
            write!(f, ", local disconnect: {reason:?}")?;
        }
        if let Some(reason) = self.remote_disconnect_reason {
            write!(f, ", remote disconnect: {reason:?}")?;
        }

        Ok(())
    }
}
