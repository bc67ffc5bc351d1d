//! Configuration loading from `~/.pamr/config.toml` with defaults.
//!
//! Supports config includes: the `include` field lists additional TOML files
//! that are deep-merged before the root config (root overrides includes).
//! Environment variables (`PAMR_*`) are applied last.

use crate::agent_id::MagicCookie;
use crate::config::PamrConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load configuration from a TOML file, then apply `PAMR_*` overrides.
///
/// A missing or unparsable file falls back to defaults with a warning.
pub fn load_config(path: Option<&Path>) -> PamrConfig {
    let mut config = load_file(path);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn load_file(path: Option<&Path>) -> PamrConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return PamrConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to read config file, using defaults");
            return PamrConfig::default();
        }
    };

    let mut root_value = match toml::from_str::<toml::Value>(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to parse config, using defaults");
            return PamrConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));

    if let Err(e) = resolve_config_includes(&mut root_value, &config_dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }
    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
    }

    match root_value.try_into::<PamrConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to deserialize config, using defaults");
            PamrConfig::default()
        }
    }
}

/// Resolve includes by deep-merging included files under the root value.
///
/// Rejects absolute paths, `..` components and circular references.
fn resolve_config_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes = match root_value {
        toml::Value::Table(tbl) => match tbl.get("include") {
            Some(toml::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<Vec<_>>(),
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };

    let mut merged_base = toml::Value::Table(toml::map::Map::new());

    for include in &includes {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return Err(format!("Config include rejects absolute path: {include}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("Config include rejects path traversal: {include}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("Config include '{include}' cannot be resolved: {e}"))?;
        if !visited.insert(canonical.clone()) {
            return Err(format!("Circular config include detected: {include}"));
        }

        info!(include = %include, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{include}': {e}"))?;
        let mut include_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{include}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_config_includes(&mut include_value, &include_dir, visited, depth + 1)?;
        if let toml::Value::Table(ref mut tbl) = include_value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged_base, &include_value);
    }

    let mut root_without_include = root_value.clone();
    if let toml::Value::Table(ref mut tbl) = root_without_include {
        tbl.remove("include");
    }
    deep_merge_toml(&mut merged_base, &root_without_include);
    *root_value = merged_base;
    Ok(())
}

/// Deep-merge two TOML values. `overlay` values override `base` values.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                if let Some(base_val) = base_tbl.get_mut(key) {
                    deep_merge_toml(base_val, overlay_val);
                } else {
                    base_tbl.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Apply `PAMR_*` environment overrides. Invalid values are logged and skipped.
pub fn apply_env_overrides<F>(config: &mut PamrConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let agent = &mut config.agent;

    if let Some(v) = lookup("PAMR_ROUTER_ADDRESS") {
        agent.router_host = v;
    }
    if let Some(v) = parsed(&lookup, "PAMR_ROUTER_PORT") {
        agent.router_port = v;
    }
    if let Some(v) = parsed(&lookup, "PAMR_AGENT_ID") {
        agent.agent_id = Some(v);
    }
    if let Some(v) = lookup("PAMR_MAGIC_COOKIE") {
        match MagicCookie::new(v) {
            Ok(cookie) => agent.magic_cookie = Some(cookie),
            Err(e) => warn!(error = %e, "Ignoring PAMR_MAGIC_COOKIE"),
        }
    }
    if let Some(v) = parsed(&lookup, "PAMR_CONNECT_TIMEOUT") {
        agent.connect_timeout_ms = v;
    }
    if let Some(v) = parsed(&lookup, "PAMR_SOCKET_FACTORY") {
        agent.socket_factory = v;
    }

    let tunnel = &mut agent.tunnel;
    if let Some(v) = lookup("PAMR_SSH_KEY_DIR") {
        tunnel.key_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("PAMR_SSH_KNOWN_HOSTS") {
        tunnel.known_hosts = PathBuf::from(v);
    }
    if let Some(v) = parsed(&lookup, "PAMR_SSH_GC_PERIOD") {
        tunnel.gc_period_ms = v;
    }
    if let Some(v) = parsed(&lookup, "PAMR_SSH_GC_IDLETIME") {
        tunnel.gc_idle_ms = v;
    }
    if let Some(v) = parsed(&lookup, "PAMR_SSH_CONNECT_TIMEOUT") {
        tunnel.connect_timeout_ms = v;
    }
    if let Some(v) = lookup("PAMR_SSH_USERNAME") {
        tunnel.username = Some(v);
    }
    if let Some(v) = parsed(&lookup, "PAMR_SSH_PORT") {
        tunnel.port = v;
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring invalid environment override");
            None
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    pamr_home().join("config.toml")
}

/// Get the default PAMR home directory.
pub fn pamr_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".pamr")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketFactoryKind;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_file(Some(Path::new("/nonexistent/pamr.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.agent.router_port, 33647);
    }

    #[test]
    fn test_basic_include() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        let root = dir.path().join("config.toml");

        let mut f = std::fs::File::create(&base).unwrap();
        writeln!(f, "[agent]").unwrap();
        writeln!(f, "router_host = \"gateway.example\"").unwrap();
        writeln!(f, "router_port = 4000").unwrap();
        drop(f);

        let mut f = std::fs::File::create(&root).unwrap();
        writeln!(f, "include = [\"base.toml\"]").unwrap();
        writeln!(f, "[agent]").unwrap();
        writeln!(f, "router_port = 5000").unwrap();
        drop(f);

        let config = load_file(Some(&root));
        assert_eq!(config.agent.router_host, "gateway.example");
        assert_eq!(config.agent.router_port, 5000);
    }

    #[test]
    fn test_circular_include_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        let b = dir.path().join("b.toml");
        std::fs::write(&a, "include = [\"b.toml\"]\nlog_level = \"debug\"\n").unwrap();
        std::fs::write(&b, "include = [\"a.toml\"]\n").unwrap();

        let config = load_file(Some(&a));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_path_traversal_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        std::fs::write(&root, "include = [\"../etc/passwd\"]\n").unwrap();
        let config = load_file(Some(&root));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value =
            toml::from_str("[agent]\nrouter_host = \"a\"\nrouter_port = 1\n").unwrap();
        let overlay: toml::Value = toml::from_str("[agent]\nrouter_port = 2\n").unwrap();
        deep_merge_toml(&mut base, &overlay);
        let agent = base["agent"].as_table().unwrap();
        assert_eq!(agent["router_host"].as_str(), Some("a"));
        assert_eq!(agent["router_port"].as_integer(), Some(2));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PamrConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PAMR_ROUTER_ADDRESS", "router.internal"),
                ("PAMR_ROUTER_PORT", "4100"),
                ("PAMR_AGENT_ID", "10"),
                ("PAMR_MAGIC_COOKIE", "abc"),
                ("PAMR_SOCKET_FACTORY", "ssh+plain"),
                ("PAMR_SSH_GC_PERIOD", "0"),
            ]),
        );
        assert_eq!(config.agent.router_host, "router.internal");
        assert_eq!(config.agent.router_port, 4100);
        assert_eq!(config.agent.agent_id, Some(10));
        assert_eq!(config.agent.magic_cookie.unwrap().as_str(), "abc");
        assert_eq!(
            config.agent.socket_factory,
            SocketFactoryKind::SshWithPlainFirst
        );
        assert_eq!(config.agent.tunnel.gc_period_ms, 0);
    }

    #[test]
    fn test_invalid_env_override_ignored() {
        let mut config = PamrConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[("PAMR_ROUTER_PORT", "not-a-port"), ("PAMR_MAGIC_COOKIE", "")]),
        );
        assert_eq!(config.agent.router_port, 33647);
        assert!(config.agent.magic_cookie.is_none());
    }
}
