//! PAMR CLI: run a router, run an echo agent, or talk to agents from the
//! shell.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands};
use clap::Parser;
use pamr_types::loader::load_config;

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);

    match cli.command {
        Commands::Router { listen } => cmd::router::cmd_router(config, listen),
        Commands::List { router, json } => cmd::agent::cmd_list(config, router, json),
        Commands::Send {
            dest,
            payload,
            one_way,
            timeout_ms,
            router,
        } => cmd::agent::cmd_send(config, dest, payload, one_way, timeout_ms, router),
        Commands::Echo { id, cookie } => cmd::agent::cmd_echo(config, id, cookie),
    }
}
