//! Process configuration from `CHARGE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use charge_collab::server::ServerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub sync_addr: String,
    pub http_addr: String,
    pub storage_path: Option<PathBuf>,
    pub broadcast_capacity: usize,
    pub max_peers_per_room: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync_addr: "127.0.0.1:9090".to_string(),
            http_addr: "127.0.0.1:3000".to_string(),
            storage_path: None,
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            sync_addr: lookup("CHARGE_SYNC_ADDR").unwrap_or(defaults.sync_addr),
            http_addr: lookup("CHARGE_HTTP_ADDR").unwrap_or(defaults.http_addr),
            storage_path: lookup("CHARGE_STORAGE_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            broadcast_capacity: parse_or(&lookup, "CHARGE_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            max_peers_per_room: parse_or(&lookup, "CHARGE_MAX_PEERS_PER_ROOM", defaults.max_peers_per_room)?,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.sync_addr.clone(),
            max_peers_per_room: self.max_peers_per_room,
            broadcast_capacity: self.broadcast_capacity,
            storage_path: self.storage_path.clone(),
            ..ServerConfig::default()
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.server_config().storage_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("CHARGE_SYNC_ADDR", "0.0.0.0:7000"),
            ("CHARGE_STORAGE_PATH", "/var/lib/charge"),
            ("CHARGE_MAX_PEERS_PER_ROOM", "8"),
        ]))
        .unwrap();
        let server = config.server_config();
        assert_eq!(server.bind_addr, "0.0.0.0:7000");
        assert_eq!(server.max_peers_per_room, 8);
        assert_eq!(server.storage_path, Some(PathBuf::from("/var/lib/charge")));
        assert_eq!(server.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_invalid_number_fails_with_key() {
        let err = AppConfig::from_lookup(lookup(&[("CHARGE_BROADCAST_CAPACITY", "lots")])).unwrap_err();
        assert!(err.to_string().contains("CHARGE_BROADCAST_CAPACITY"));
    }
}
