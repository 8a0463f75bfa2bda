//! Chain synchronisation over the eth sub-protocol.
//!
//! [`SyncCoordinator`] elects a master among the connected peers, walks its chain back to ours
//! and spreads block retrieval over every peer. Like discovery, it performs no I/O: with the
//! `sync` and `codec` features, [`SyncWorker`] runs it over framed peer sessions.

pub mod coordinator;
pub mod message;
pub mod peer;
pub mod queue;

#[cfg(all(feature = "sync", feature = "codec"))]
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Outbound, SyncCoordinator, SyncPhase, Tick};
pub use message::{Block, Capability, EthMessage, Status};
pub use peer::{BlocksOutcome, SyncPeer, SyncState, SyncStats};
pub use queue::{BlockQueue, ImportSummary};

#[cfg(all(feature = "sync", feature = "codec"))]
pub use session::{SessionConnector, SyncWorker};
