//! Command implementations.

pub mod agent;
pub mod router;

use pamr_types::config::AgentConfig;

/// Print an error and exit with status 1.
pub fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(format!("cannot start runtime: {e}")))
}

/// Split `HOST:PORT`. IPv6 hosts may be bracketed.
pub fn parse_router_address(address: &str) -> Result<(String, u16), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got '{address}'"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(format!("missing host in '{address}'"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in '{address}'"))?;
    Ok((host.to_string(), port))
}

/// Point `config` at `address` when one was given on the command line.
pub fn apply_router_override(config: &mut AgentConfig, address: Option<&str>) {
    if let Some(address) = address {
        let (host, port) = parse_router_address(address).unwrap_or_else(|e| fail(e));
        config.router_host = host;
        config.router_port = port;
    }
}
