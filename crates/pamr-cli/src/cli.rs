//! Clap CLI definitions for PAMR.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  pamr router                          Run a router on 0.0.0.0:33647
  pamr echo --id 10 --cookie abc       Serve AgentID 10, echoing every message
  pamr send 10 hello                   Send \"hello\" to agent 10 and print the reply
  pamr list --router relay:33647       Show the agents registered on a router

\x1b[1;36mEnvironment:\x1b[0m
  PAMR_ROUTER_ADDRESS, PAMR_ROUTER_PORT, PAMR_AGENT_ID, PAMR_MAGIC_COOKIE,
  PAMR_SOCKET_FACTORY (plain | ssh | ssh+plain), PAMR_SSH_* tunnel settings.
  RUST_LOG overrides the log filter.";

/// PAMR: message routing for agents behind NATs and firewalls.
#[derive(Parser)]
#[command(name = "pamr", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a router until Ctrl+C.
    Router {
        /// Listen address (overrides router.listen_addr).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Print the agents registered on a router.
    List {
        /// Router to query as HOST:PORT.
        #[arg(long)]
        router: Option<String>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Send a message and print the reply.
    Send {
        /// Destination AgentID.
        dest: u32,
        /// Payload, sent as UTF-8 bytes.
        payload: String,
        /// Do not wait for a reply.
        #[arg(long)]
        one_way: bool,
        /// Give up waiting for the reply after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Router to use as HOST:PORT.
        #[arg(long)]
        router: Option<String>,
    },
    /// Run an agent that echoes every payload back to its sender.
    Echo {
        /// Reservable AgentID to claim (0-4095). Dynamic when omitted.
        #[arg(long)]
        id: Option<u32>,
        /// Magic cookie guarding the id.
        #[arg(long)]
        cookie: Option<String>,
    },
}
