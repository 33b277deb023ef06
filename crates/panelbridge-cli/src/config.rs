//! Bridge configuration – reads/writes `~/.panelbridge/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use panelbridge_hal::TeensyConfig;
use panelbridge_types::BridgeError;
use tracing::warn;

/// Which simulator the bridge talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangeConfig {
    /// Listen for the simulator plugin's TCP connection.
    InetSocket {
        #[serde(default = "default_exchange_bind")]
        bind: SocketAddr,
    },
    /// Connect to a Telemachus websocket.
    Telemachus {
        url: String,
        #[serde(default = "default_reconnect_secs")]
        reconnect_secs: u64,
        /// How often the server pushes subscribed values.
        #[serde(default = "default_rate_ms")]
        rate_ms: u64,
    },
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig::InetSocket {
            bind: default_exchange_bind(),
        }
    }
}

/// One panel driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PanelConfig {
    InetSocket {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default = "default_panel_bind")]
        bind: SocketAddr,
    },
    Teensy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default = "default_vid")]
        vid: u16,
        #[serde(default = "default_pid")]
        pid: u16,
        #[serde(default = "default_usage")]
        usage: u16,
        #[serde(default = "default_usage_page")]
        usage_page: u16,
    },
}

impl PanelConfig {
    /// Configured name, or the kind when none was given.
    pub fn name(&self) -> &str {
        match self {
            PanelConfig::InetSocket { name, .. } => name.as_deref().unwrap_or("inet_socket"),
            PanelConfig::Teensy { name, .. } => name.as_deref().unwrap_or("teensy"),
        }
    }
}

/// Persisted configuration stored in `~/.panelbridge/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default = "default_panels")]
    pub panels: Vec<PanelConfig>,
}

fn default_exchange_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1565))
}
fn default_panel_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1566))
}
fn default_reconnect_secs() -> u64 {
    5
}
fn default_rate_ms() -> u64 {
    200
}
fn default_vid() -> u16 {
    TeensyConfig::default().vendor_id
}
fn default_pid() -> u16 {
    TeensyConfig::default().product_id
}
fn default_usage() -> u16 {
    TeensyConfig::default().usage
}
fn default_usage_page() -> u16 {
    TeensyConfig::default().usage_page
}
fn default_panels() -> Vec<PanelConfig> {
    vec![PanelConfig::InetSocket {
        name: None,
        bind: default_panel_bind(),
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            panels: default_panels(),
        }
    }
}

/// Return the config path: `$PANELBRIDGE_CONFIG`, else
/// `~/.panelbridge/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PANELBRIDGE_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".panelbridge").join("config.toml")
}

/// Load the config from disk with environment overrides applied.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, BridgeError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `PANELBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Effect |
/// |---|---|
/// | `PANELBRIDGE_EXCHANGE_BIND` | bind address of the `inet_socket` exchange |
/// | `PANELBRIDGE_TELEMACHUS_URL` | switch the exchange to Telemachus at this URL |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("PANELBRIDGE_EXCHANGE_BIND") {
        match (v.parse::<SocketAddr>(), &mut cfg.exchange) {
            (Ok(addr), ExchangeConfig::InetSocket { bind }) => *bind = addr,
            (Ok(_), ExchangeConfig::Telemachus { .. }) => {
                warn!(value = %v, "PANELBRIDGE_EXCHANGE_BIND ignored for the telemachus exchange");
            }
            (Err(e), _) => warn!(value = %v, error = %e, "ignoring invalid PANELBRIDGE_EXCHANGE_BIND"),
        }
    }
    if let Ok(url) = std::env::var("PANELBRIDGE_TELEMACHUS_URL") {
        let (reconnect_secs, rate_ms) = match cfg.exchange {
            ExchangeConfig::Telemachus {
                reconnect_secs,
                rate_ms,
                ..
            } => (reconnect_secs, rate_ms),
            ExchangeConfig::InetSocket { .. } => (default_reconnect_secs(), default_rate_ms()),
        };
        cfg.exchange = ExchangeConfig::Telemachus {
            url,
            reconnect_secs,
            rate_ms,
        };
    }
}

/// Save the config to disk, creating `~/.panelbridge/` if necessary.
pub fn save(cfg: &Config) -> Result<PathBuf, BridgeError> {
    let path = config_path();
    save_to(cfg, &path)?;
    Ok(path)
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BridgeError::Config(format!("failed to create config directory: {e}"))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        BridgeError::Config(format!("failed to write config at {}: {e}", path.display()))
    })
}
