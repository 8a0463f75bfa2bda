//! Kademlia node discovery and chain synchronisation for Ethereum-style peers.
//!
//! The crate is split in two services sharing the same node identities:
//!
//! 1. [`discovery`]: a Kademlia routing table fed by signed UDP packets (PING, PONG, FIND_NODE and
//!    NEIGHBOURS). Every known node has a handler that checks liveness before the node enters the
//!    table; a full bucket challenges its oldest entry instead of growing. Reachable nodes are
//!    ranked by reputation and handed to a bounded pool of connection workers.
//! 2. [`eth`]: the eth/60 and eth/61 synchronisation protocol. A master peer supplies the hashes
//!    between its head and the local chain, then every peer fetches blocks in parallel. Blocks are
//!    imported into a [`Chain`] implemented by the application.
//!
//! Both services are synchronous state machines: they take events and the current time and return
//! the messages to send. The `sync` feature adds tokio drivers for them and the `codec` feature
//! the stream framing of eth messages.
//!
//! Out of scope: RLPx encryption and the p2p handshake, block validation beyond parent linkage
//! and discovery v5.

#![cfg_attr(doc_cfg, feature(doc_cfg))]

#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod codec;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod eth;

mod core;

pub use crate::{
    core::{
        id::{Id, NodeId},
        message,
        node::NodeRecord,
        routing_table::{RoutingTable, BUCKETS, BUCKET_SIZE},
        statistics::{DisconnectReason, NodeStatistics, REPUTATION_PREDEFINED},
        timer::{Scheduler, TimerToken},
        traits::{Chain, Signer},
    },
    error::{Error, Result},
};
