//! Server configuration: TOML file + CLI overrides.

use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub map: MapSection,
    #[serde(default)]
    pub registration: RegistrationSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Public URL clients reach the server at; used in auth URLs.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_noise_private_key_path")]
    pub noise_private_key_path: String,
    #[serde(default = "default_read_header_timeout")]
    pub read_header_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            server_url: default_server_url(),
            noise_private_key_path: default_noise_private_key_path(),
            read_header_timeout_secs: default_read_header_timeout(),
        }
    }
}

/// `[map]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MapSection {
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default)]
    pub domain: String,
}

impl Default for MapSection {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            domain: String::new(),
        }
    }
}

/// `[registration]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationSection {
    #[serde(default)]
    pub preauth_keys: Vec<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_server_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_noise_private_key_path() -> String {
    "~/.ts2021/noise_private.key".to_string()
}
fn default_read_header_timeout() -> u64 {
    10
}
fn default_keepalive_interval() -> u64 {
    60
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub server_url: String,
    pub noise_private_key_path: PathBuf,
    pub read_header_timeout: Duration,
    pub keepalive_interval: Duration,
    pub domain: String,
    pub preauth_keys: Vec<String>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen_addr: Option<&str>,
        cli_server_url: Option<&str>,
        cli_noise_key: Option<&str>,
    ) -> ServerResult<Self> {
        // Load base config from file
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| ServerError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_listen_addr, cli_server_url, cli_noise_key)
    }

    /// Merge CLI overrides into a parsed config file.
    pub fn resolve(
        file_config: ConfigFile,
        cli_listen_addr: Option<&str>,
        cli_server_url: Option<&str>,
        cli_noise_key: Option<&str>,
    ) -> ServerResult<Self> {
        let listen_str = cli_listen_addr
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.listen_addr);
        let listen_addr = listen_str
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::Config(format!("invalid listen_addr {listen_str:?}: {e}")))?;

        let server_url = cli_server_url
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.server_url);
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(ServerError::Config(format!(
                "server_url must start with http:// or https://, got {server_url:?}"
            )));
        }

        let key_str = cli_noise_key
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.noise_private_key_path);

        if file_config.server.read_header_timeout_secs == 0 {
            return Err(ServerError::Config("read_header_timeout_secs must be positive".into()));
        }
        if file_config.map.keepalive_interval_secs == 0 {
            return Err(ServerError::Config("keepalive_interval_secs must be positive".into()));
        }

        Ok(Self {
            listen_addr,
            server_url,
            noise_private_key_path: expand_tilde_str(&key_str),
            read_header_timeout: Duration::from_secs(file_config.server.read_header_timeout_secs),
            keepalive_interval: Duration::from_secs(file_config.map.keepalive_interval_secs),
            domain: file_config.map.domain,
            preauth_keys: file_config.registration.preauth_keys,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
