//! Configuration loading and persistence.
//!
//! Settings live in `config.json` inside the config directory; every field
//! can be overridden from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::handshake::DappInfo;
use crate::multiplexer::MultiplexerOptions;
use crate::transport::WebSocketConnector;

const CONFIG_FILE: &str = "config.json";

/// Public WalletLink relay.
pub const DEFAULT_RELAY_URL: &str = "wss://www.walletlink.org/rpc";

/// Configuration for the WalletLink client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Relay used for new pairings.
    pub relay_url: String,
    /// Seconds a handshake may take (0 = no limit).
    pub handshake_timeout: u64,
    /// Seconds between outbound heartbeats (0 = none).
    pub heartbeat_interval: u64,
    /// Request ids remembered for de-duplication.
    pub dedup_capacity: usize,
    /// Local user the sessions belong to.
    pub user_id: String,
    /// DApp name shown in the wallet.
    pub app_name: String,
    /// DApp logo shown in the wallet.
    pub app_logo_url: String,
    /// Origin sent with requests.
    pub origin: String,
}

impl Default for Config {
    fn default() -> Self {
        let dapp = DappInfo::default();
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            handshake_timeout: 30,
            heartbeat_interval: 10,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            user_id: "default".to_string(),
            app_name: dapp.app_name,
            app_logo_url: dapp.app_logo_url,
            origin: dapp.origin,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `WALLETLINK_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("WALLETLINK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("walletlink")
        };
        fs::create_dir_all(&dir).with_context(|| format!("Could not create {}", dir.display()))?;
        Ok(dir)
    }

    /// Load from the config directory, then apply environment overrides.
    /// A missing or unreadable file yields the defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from(&dir).unwrap_or_else(|e| {
            log::debug!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read `config.json` from `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let content = fs::read_to_string(&path).with_context(|| format!("Could not read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `WALLETLINK_*` overrides looked up through `var`.
    /// Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("WALLETLINK_RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(secs) = var("WALLETLINK_HANDSHAKE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.handshake_timeout = secs;
        }
        if let Some(secs) = var("WALLETLINK_HEARTBEAT_INTERVAL").and_then(|v| v.parse().ok()) {
            self.heartbeat_interval = secs;
        }
        if let Some(capacity) = var("WALLETLINK_DEDUP_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
            if capacity > 0 {
                self.dedup_capacity = capacity;
            }
        }
        if let Some(user_id) = var("WALLETLINK_USER_ID") {
            self.user_id = user_id;
        }
        if let Some(name) = var("WALLETLINK_APP_NAME") {
            self.app_name = name;
        }
        if let Some(origin) = var("WALLETLINK_ORIGIN") {
            self.origin = origin;
        }
    }

    /// Persist to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Write `config.json` into `dir` (owner read/write only on unix).
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Could not write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// DApp description for handshakes.
    #[must_use]
    pub fn dapp_info(&self) -> DappInfo {
        DappInfo {
            app_name: self.app_name.clone(),
            app_logo_url: self.app_logo_url.clone(),
            origin: self.origin.clone(),
        }
    }

    /// Multiplexer settings derived from this config.
    #[must_use]
    pub fn multiplexer_options(&self) -> MultiplexerOptions {
        MultiplexerOptions {
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            dedup_capacity: self.dedup_capacity.max(1),
            dapp: self.dapp_info(),
            ..MultiplexerOptions::default()
        }
    }

    /// WebSocket connector using this config's heartbeat and origin.
    #[must_use]
    pub fn connector(&self) -> WebSocketConnector {
        WebSocketConnector::new()
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval))
            .with_origin(self.origin.clone())
    }
}
