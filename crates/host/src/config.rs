//! Host daemon configuration management

use crate::busid::{BusId, MAX_BUSID};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub busid: BusIdSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub helpers: HelperSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
    #[serde(default)]
    pub service_mode: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            service_mode: false,
        }
    }
}

/// Bus ids registered for export at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusIdSettings {
    #[serde(default)]
    pub exported: Vec<String>,
}

/// Capacities of the process-wide object caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "PoolSettings::default_request_capacity")]
    pub request_cache_capacity: usize,
    #[serde(default = "PoolSettings::default_wrapper_capacity")]
    pub wrapper_cache_capacity: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            request_cache_capacity: Self::default_request_capacity(),
            wrapper_cache_capacity: Self::default_wrapper_capacity(),
        }
    }
}

impl PoolSettings {
    fn default_request_capacity() -> usize {
        1024
    }

    fn default_wrapper_capacity() -> usize {
        1024
    }
}

/// Unix socket endpoints of the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Directory holding the sockets (`~` is expanded)
    #[serde(default = "ControlSettings::default_socket_dir")]
    pub socket_dir: String,
    #[serde(default = "ControlSettings::default_attribute_socket")]
    pub attribute_socket: String,
    #[serde(default = "ControlSettings::default_command_socket")]
    pub command_socket: String,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            socket_dir: Self::default_socket_dir(),
            attribute_socket: Self::default_attribute_socket(),
            command_socket: Self::default_command_socket(),
        }
    }
}

impl ControlSettings {
    fn default_socket_dir() -> String {
        if let Some(runtime_dir) = dirs::runtime_dir() {
            runtime_dir.join("mausb-host").display().to_string()
        } else {
            "/run/mausb-host".to_string()
        }
    }

    fn default_attribute_socket() -> String {
        "match_busid".to_string()
    }

    fn default_command_socket() -> String {
        "mausb_bind".to_string()
    }

    pub fn socket_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.socket_dir).as_ref())
    }

    pub fn attribute_path(&self) -> PathBuf {
        self.socket_dir().join(&self.attribute_socket)
    }

    pub fn command_path(&self) -> PathBuf {
        self.socket_dir().join(&self.command_socket)
    }
}

/// Helper programs run by the command channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    pub mausb: PathBuf,
    pub upnp_server: PathBuf,
    pub upnp_client: PathBuf,
    pub mausbd: PathBuf,
    pub busybox: PathBuf,
    /// Bus id passed to `mausb bind` / `mausb unbind`
    pub busid: String,
    /// Complete environment of every helper, as `NAME=value`
    pub env: Vec<String>,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            mausb: PathBuf::from("/data/mausb"),
            upnp_server: PathBuf::from("/data/upnp-server"),
            upnp_client: PathBuf::from("/data/upnp-client"),
            mausbd: PathBuf::from("/data/mausbd"),
            busybox: PathBuf::from("/data/busybox20_0"),
            busid: "1-1".to_string(),
            env: [
                "HOME=/data",
                "TERM=linux",
                "SHELL=/system/bin/sh",
                "LD_LIBRARY_PATH=/vendor/lib:/system/lib",
                "MKSH=/system/bin/sh",
                "PATH=/sbin:/vendor/bin:/system/sbin:/system/bin:/system/xbin",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl HelperSettings {
    /// Environment as name/value pairs; validated entries always split
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/mausb-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("mausb-host").join("host.toml")
        } else {
            PathBuf::from(".config/mausb-host/host.toml")
        }
    }

    /// Bus ids to register at startup
    pub fn exported_busids(&self) -> Result<Vec<BusId>> {
        self.busid
            .exported
            .iter()
            .map(|id| BusId::new(id.as_str()).map_err(|e| anyhow!("Invalid exported bus id: {}", e)))
            .collect()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        let exported = self.exported_busids()?;
        if exported.len() > MAX_BUSID {
            return Err(anyhow!(
                "{} exported bus ids configured, at most {} fit the table",
                exported.len(),
                MAX_BUSID
            ));
        }

        if self.pool.request_cache_capacity == 0 || self.pool.wrapper_cache_capacity == 0 {
            return Err(anyhow!("Pool cache capacities must be greater than 0"));
        }

        if self.control.attribute_socket.is_empty() || self.control.command_socket.is_empty() {
            return Err(anyhow!("Control socket names must not be empty"));
        }
        if self.control.attribute_socket == self.control.command_socket {
            return Err(anyhow!(
                "Attribute and command sockets share the name '{}'",
                self.control.attribute_socket
            ));
        }

        BusId::new(self.helpers.busid.as_str())
            .map_err(|e| anyhow!("Invalid helper bus id: {}", e))?;

        for entry in &self.helpers.env {
            match entry.split_once('=') {
                Some((name, _)) if !name.is_empty() => {}
                _ => {
                    return Err(anyhow!(
                        "Invalid helper environment entry '{}', expected NAME=value",
                        entry
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
