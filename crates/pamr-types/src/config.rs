//! Configuration types for the router, the agent and the SSH tunnel layer.
//!
//! All durations are expressed in milliseconds, matching the property names
//! operators already use. A value of `0` disables the feature where noted.

use crate::agent_id::{AgentId, MagicCookie};
use crate::error::PamrError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default router TCP port.
pub const DEFAULT_ROUTER_PORT: u16 = 33647;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PamrConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Router settings.
    pub router: RouterConfig,
    /// Agent settings.
    pub agent: AgentConfig,
}

impl Default for PamrConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            router: RouterConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// An operator reservation: a reservable id bound to a cookie at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedAgent {
    pub id: u32,
    pub cookie: MagicCookie,
}

/// Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Address the router listens on.
    pub listen_addr: String,
    /// Interval between router heartbeats (0 disables heartbeats).
    pub heartbeat_period_ms: u64,
    /// Connections silent for longer than this are closed.
    pub heartbeat_timeout_ms: u64,
    /// Forget disconnected dynamic bindings after this long (0 = never).
    pub eviction_timeout_ms: u64,
    /// Ids pre-bound to cookies.
    pub reserved: Vec<ReservedAgent>,
    /// Outbound frame queue depth per connection.
    pub queue_depth: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_ROUTER_PORT}"),
            heartbeat_period_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            eviction_timeout_ms: 0,
            reserved: Vec::new(),
            queue_depth: 1024,
        }
    }
}

impl RouterConfig {
    pub fn heartbeat_period(&self) -> Option<Duration> {
        non_zero_ms(self.heartbeat_period_ms)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.heartbeat_timeout_ms)
    }

    pub fn eviction_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.eviction_timeout_ms)
    }

    /// Check reservations are in range and unique.
    pub fn validate(&self) -> Result<(), PamrError> {
        let mut seen = HashSet::new();
        for entry in &self.reserved {
            AgentId::reserved(entry.id)?;
            if !seen.insert(entry.id) {
                return Err(PamrError::Config(format!(
                    "agent id {} is reserved twice",
                    entry.id
                )));
            }
        }
        if self.queue_depth == 0 {
            return Err(PamrError::Config("queue_depth must be positive".into()));
        }
        Ok(())
    }
}

/// Which transport an agent uses to reach the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SocketFactoryKind {
    /// Direct TCP connection.
    #[default]
    #[serde(rename = "plain")]
    Plain,
    /// Always go through an SSH tunnel.
    #[serde(rename = "ssh")]
    Ssh,
    /// Try direct TCP first, fall back to an SSH tunnel.
    #[serde(rename = "ssh+plain")]
    SshWithPlainFirst,
}

impl fmt::Display for SocketFactoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Ssh => write!(f, "ssh"),
            Self::SshWithPlainFirst => write!(f, "ssh+plain"),
        }
    }
}

impl FromStr for SocketFactoryKind {
    type Err = PamrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "plain" => Ok(Self::Plain),
            "ssh" => Ok(Self::Ssh),
            "ssh+plain" => Ok(Self::SshWithPlainFirst),
            other => Err(PamrError::Config(format!(
                "unknown socket factory '{other}' (expected plain, ssh or ssh+plain)"
            ))),
        }
    }
}

/// Agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Router host name or address.
    pub router_host: String,
    /// Router port.
    pub router_port: u16,
    /// Reservable id to request; dynamic when absent.
    pub agent_id: Option<u32>,
    /// Cookie guarding the id; generated when absent.
    pub magic_cookie: Option<MagicCookie>,
    /// Give up connecting after this long (0 = retry forever).
    pub connect_timeout_ms: u64,
    /// Declare the router dead after this much silence. 0 derives the limit
    /// from the heartbeat period the router advertises at registration, and
    /// disables it against a router that sends no heartbeats.
    pub heartbeat_timeout_ms: u64,
    /// Default bound for two-way calls (0 = wait for reply or disconnect).
    pub call_timeout_ms: u64,
    /// Transport selector.
    pub socket_factory: SocketFactoryKind,
    /// SSH tunnel settings, used by the tunneled socket factories.
    pub tunnel: TunnelConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            router_host: "localhost".to_string(),
            router_port: DEFAULT_ROUTER_PORT,
            agent_id: None,
            magic_cookie: None,
            connect_timeout_ms: 30_000,
            heartbeat_timeout_ms: 0,
            call_timeout_ms: 0,
            socket_factory: SocketFactoryKind::Plain,
            tunnel: TunnelConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.connect_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.heartbeat_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.call_timeout_ms)
    }

    /// `host:port` of the router, for logs and errors.
    pub fn router_address(&self) -> String {
        format!("{}:{}", self.router_host, self.router_port)
    }

    /// The requested reservable id, validated.
    pub fn requested_id(&self) -> Result<Option<AgentId>, PamrError> {
        self.agent_id.map(AgentId::reserved).transpose()
    }

    pub fn validate(&self) -> Result<(), PamrError> {
        self.requested_id()?;
        if self.router_host.trim().is_empty() {
            return Err(PamrError::Config("router_host must not be empty".into()));
        }
        Ok(())
    }
}

/// SSH tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Directory holding private keys.
    pub key_dir: PathBuf,
    /// Known-hosts file used to verify host keys.
    pub known_hosts: PathBuf,
    /// Interval between GC sweeps (0 disables GC).
    pub gc_period_ms: u64,
    /// Idle tunnels older than this are torn down by the sweep.
    pub gc_idle_ms: u64,
    /// Bound on tunnel establishment.
    pub connect_timeout_ms: u64,
    /// Remote user name override.
    pub username: Option<String>,
    /// Remote SSH port.
    pub port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".ssh");
        Self {
            known_hosts: ssh_dir.join("known_hosts"),
            key_dir: ssh_dir,
            gc_period_ms: 10_000,
            gc_idle_ms: 10_000,
            connect_timeout_ms: 60_000,
            username: None,
            port: 22,
        }
    }
}

impl TunnelConfig {
    pub fn gc_period(&self) -> Option<Duration> {
        non_zero_ms(self.gc_period_ms)
    }

    pub fn gc_idle(&self) -> Duration {
        Duration::from_millis(self.gc_idle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = PamrConfig::default();
        assert_eq!(config.agent.router_port, 33647);
        assert_eq!(config.agent.connect_timeout_ms, 30_000);
        assert_eq!(config.agent.socket_factory, SocketFactoryKind::Plain);
        assert!(config.router.listen_addr.ends_with(":33647"));
    }

    #[test]
    fn test_zero_disables() {
        let agent = AgentConfig {
            connect_timeout_ms: 0,
            ..AgentConfig::default()
        };
        assert!(agent.connect_timeout().is_none());
        let tunnel = TunnelConfig {
            gc_period_ms: 0,
            ..TunnelConfig::default()
        };
        assert!(tunnel.gc_period().is_none());
    }

    #[test]
    fn test_socket_factory_parsing() {
        assert_eq!("plain".parse::<SocketFactoryKind>().unwrap(), SocketFactoryKind::Plain);
        assert_eq!(
            "ssh+plain".parse::<SocketFactoryKind>().unwrap(),
            SocketFactoryKind::SshWithPlainFirst
        );
        assert!("http".parse::<SocketFactoryKind>().is_err());
    }

    #[test]
    fn test_requested_id_must_be_reservable() {
        let agent = AgentConfig {
            agent_id: Some(5000),
            ..AgentConfig::default()
        };
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_duplicate_reservation_rejected() {
        let cookie = MagicCookie::new("abc").unwrap();
        let router = RouterConfig {
            reserved: vec![
                ReservedAgent { id: 3, cookie: cookie.clone() },
                ReservedAgent { id: 3, cookie },
            ],
            ..RouterConfig::default()
        };
        assert!(router.validate().is_err());
    }

    #[test]
    fn test_toml_sections() {
        let config: PamrConfig = toml::from_str(
            r#"
            [router]
            listen_addr = "127.0.0.1:4000"
            reserved = [{ id = 10, cookie = "abc" }]

            [agent]
            agent_id = 10
            socket_factory = "ssh"

            [agent.tunnel]
            gc_period_ms = 0
        "#,
        )
        .unwrap();
        assert_eq!(config.router.listen_addr, "127.0.0.1:4000");
        assert_eq!(config.router.reserved[0].cookie.as_str(), "abc");
        assert_eq!(config.agent.socket_factory, SocketFactoryKind::Ssh);
        assert_eq!(config.agent.tunnel.gc_period_ms, 0);
        assert_eq!(config.agent.tunnel.port, 22);
    }
}
