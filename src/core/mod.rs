//! Foundational and often-reused types.

pub(crate) mod id;
pub mod message;
pub(crate) mod node;
pub(crate) mod routing_table;
pub(crate) mod statistics;
pub(crate) mod timer;
pub(crate) mod traits;
