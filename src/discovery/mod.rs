//! Kademlia-style node discovery over UDP.
//!
//! [`DiscoveryManager`] is the synchronous core: it authenticates nothing and performs no I/O, it
//! takes decoded packets and the current time and returns the messages to send. [`packet`] holds
//! the wire framing and, with the `sync` feature, [`SyncDiscovery`] drives the manager over a
//! tokio UDP socket while [`ConnectionPool`] dials the nodes it admits.

pub mod admission;
pub mod handler;
pub mod lookup;
pub mod manager;
pub mod packet;

#[cfg(feature = "sync")]
mod pool;
#[cfg(feature = "sync")]
mod sync;

pub use admission::Admission;
pub use handler::{NodeHandler, State};
pub use lookup::Lookup;
pub use manager::{Action, DiscoveryManager};

#[cfg(feature = "sync")]
pub use pool::{ConnectionPool, Connector};
#[cfg(feature = "sync")]
pub use sync::SyncDiscovery;
