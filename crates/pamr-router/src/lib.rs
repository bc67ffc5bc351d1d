//! PAMR router.
//!
//! A [`Router`] accepts agent connections, runs the registration handshake,
//! keeps the live AgentID table and relays frames between agents by id.

pub mod allocator;
pub mod router;
pub mod table;

pub use allocator::AgentIdAllocator;
pub use router::Router;
pub use table::{Activity, AgentEntry, AgentTable, Registered};
