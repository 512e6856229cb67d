//! Configuration for the Cairn daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub pubsub: PubsubConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the Ed25519 identity key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Addresses to listen on. Port 0 = OS-assigned.
    pub listen_addrs: Vec<SocketAddr>,
    /// Noise handshake deadline in seconds.
    pub handshake_timeout_secs: u64,
    /// Mplex channel idle timeout in seconds. 0 = never.
    pub channel_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubsubConfig {
    /// Router variant: "floodsub" or "gossipsub".
    pub router: String,
    /// Topics to subscribe at startup.
    pub topics: Vec<String>,
    /// Sign outgoing messages with the identity key.
    pub sign: bool,
    /// Verify signatures on incoming messages that carry a key.
    pub verify: bool,
    /// Per-send timeout in seconds.
    pub send_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            pubsub: PubsubConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("identity.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["0.0.0.0:0".parse().expect("static addr")],
            handshake_timeout_secs: 60,
            channel_idle_timeout_secs: 300,
        }
    }
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            router: "floodsub".to_string(),
            topics: Vec::new(),
            sign: true,
            verify: true,
            send_timeout_secs: 10,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("cairn");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("cairn");
    }
    PathBuf::from(".cairn")
}

impl CairnConfig {
    /// Load configuration with the documented resolution order.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var("CAIRN_CONFIG") {
            Ok(p) => PathBuf::from(p),
            Err(_) => config_dir().join("config.toml"),
        };

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addrs) = std::env::var("CAIRN_LISTEN") {
            let parsed: Vec<SocketAddr> =
                addrs.split(',').filter_map(|a| a.trim().parse().ok()).collect();
            if !parsed.is_empty() {
                self.network.listen_addrs = parsed;
            }
        }
        if let Ok(path) = std::env::var("CAIRN_KEYPAIR") {
            self.identity.keypair_path = PathBuf::from(path);
        }
        if let Ok(topics) = std::env::var("CAIRN_TOPICS") {
            self.pubsub.topics = topics
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = CairnConfig::default();
        assert_eq!(c.network.handshake_timeout_secs, 60);
        assert_eq!(c.pubsub.router, "floodsub");
        assert!(c.pubsub.sign);
    }

    #[test]
    fn toml_roundtrip() {
        let c = CairnConfig::default();
        let raw = toml::to_string(&c).unwrap();
        let back: CairnConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.network.listen_addrs, c.network.listen_addrs);
        assert_eq!(back.pubsub.router, c.pubsub.router);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let c: CairnConfig = toml::from_str("[pubsub]\nrouter = \"gossipsub\"\n").unwrap();
        assert_eq!(c.pubsub.router, "gossipsub");
        assert_eq!(c.network.handshake_timeout_secs, 60);
    }
}
