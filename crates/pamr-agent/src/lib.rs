//! PAMR agent.
//!
//! An [`Agent`] keeps one connection to a router, registers under an
//! [`AgentId`](pamr_types::AgentId), delivers inbound messages to a
//! [`MessageHandler`] and correlates two-way calls with their replies.
//!
//! - [`agent`]: connection lifecycle, `send`, reconnection
//! - [`pending`]: in-flight two-way calls keyed by message id
//! - [`socket`]: pluggable transports (plain TCP, SSH tunnel, plain-then-SSH)
//! - [`tunnel`]: shared SSH tunnels with idle garbage collection
//! - [`retry`]: backoff policy for connects and not-yet-registered destinations

pub mod agent;
pub mod pending;
pub mod retry;
pub mod socket;
pub mod tunnel;

pub use agent::{Agent, IncomingMessage, MessageHandler, MAX_CONCURRENT_REQUESTS};
pub use socket::{socket_factory, BoxedStream, PlainSocketFactory, SocketFactory};
pub use tunnel::{TunnelConnector, TunnelPool};
