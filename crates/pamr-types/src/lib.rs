//! Core types for the PAMR message routing overlay.
//!
//! This crate defines the shared identifiers, error values and configuration
//! used by the router, the agent and the wire codec. It contains no network
//! logic.

pub mod agent_id;
pub mod config;
pub mod error;
pub mod loader;

pub use agent_id::{AgentId, MagicCookie};
pub use error::{PamrError, PamrResult};
