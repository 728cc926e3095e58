//! Server configuration.
//!
//! Settings come from a JSON file. A local override file is used when it
//! exists, otherwise the shared default file; with neither the server refuses
//! to start. A few settings can also be overridden on the command line.

use crate::error::ConfigError;
use crate::metrics::MetricsSettings;
use clap::Parser;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use shared::{distribution_fits, MAX_DATAGRAM_SIZE};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "./server/config.json";
pub const LOCAL_CONFIG_PATH: &str = "./server/config_local.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "World gateway game server")]
pub struct Args {
    /// Local configuration file, preferred over the default one
    #[arg(default_value = LOCAL_CONFIG_PATH)]
    pub config: PathBuf,

    /// Fallback configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub default_config: PathBuf,

    /// Override the bind address from the configuration file
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Override the port from the configuration file
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl Args {
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameServer {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub nb_worlds: usize,
    pub nb_players_per_world: usize,

    pub metrics_enabled: bool,
    pub metrics_host: String,
    pub metrics_port: u16,
    /// This server's name in the shared metrics store
    pub server_name: String,
    /// Every server contributing to the total player count
    pub game_servers: Vec<GameServer>,

    /// "error", "info" or "debug"; anything else means "info"
    pub debug_level: String,

    pub population_interval_ms: u64,
    pub metrics_timeout_ms: u64,
    pub client_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            nb_worlds: 5,
            nb_players_per_world: 200,
            metrics_enabled: false,
            metrics_host: "127.0.0.1".to_string(),
            metrics_port: 8090,
            server_name: "server1".to_string(),
            game_servers: Vec::new(),
            debug_level: "info".to_string(),
            population_interval_ms: 1000,
            metrics_timeout_ms: 500,
            client_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Reads one configuration file. A missing file is `Ok(None)`.
    pub fn from_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Loads the local file if present, else the default one. The logger is
    /// not up yet at this point, so nothing here logs.
    pub fn load(default_path: &Path, local_path: &Path) -> Result<Self, ConfigError> {
        let config = match Self::from_file(local_path)? {
            Some(config) => config,
            None => match Self::from_file(default_path)? {
                Some(config) => config,
                None => {
                    return Err(ConfigError::Missing(vec![
                        local_path.to_path_buf(),
                        default_path.to_path_buf(),
                    ]))
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nb_worlds == 0 {
            return Err(ConfigError::Invalid("nb_worlds must be at least 1".into()));
        }
        if self.nb_players_per_world == 0 {
            return Err(ConfigError::Invalid(
                "nb_players_per_world must be at least 1".into(),
            ));
        }
        if self.metrics_enabled && self.server_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server_name is required when metrics are enabled".into(),
            ));
        }
        if self.population_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "population_interval_ms must be positive".into(),
            ));
        }
        if self.metrics_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "metrics_timeout_ms must be positive".into(),
            ));
        }
        if !self.worst_distribution_fits() {
            return Err(ConfigError::Invalid(format!(
                "{} worlds of {} players do not fit in one status datagram",
                self.nb_worlds, self.nb_players_per_world
            )));
        }
        Ok(())
    }

    /// Checks the distribution with every world full against the datagram
    /// limit.
    fn worst_distribution_fits(&self) -> bool {
        // Digits plus a separator per world, plus the brackets
        let digits = self.nb_players_per_world.to_string().len();
        let json_len = self.nb_worlds.saturating_mul(digits + 1).saturating_add(1);
        if json_len > MAX_DATAGRAM_SIZE {
            return false;
        }

        let worst = vec![self.nb_players_per_world; self.nb_worlds];
        serde_json::to_string(&worst)
            .map(|json| distribution_fits(&self.server_name, &json))
            .unwrap_or(false)
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.debug_level.as_str() {
            "error" => LevelFilter::Error,
            "debug" => LevelFilter::Debug,
            _ => LevelFilter::Info,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_address(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }

    pub fn population_interval(&self) -> Duration {
        Duration::from_millis(self.population_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn metrics_settings(&self) -> MetricsSettings {
        MetricsSettings {
            server_name: self.server_name.clone(),
            game_servers: self
                .game_servers
                .iter()
                .map(|server| server.name.clone())
                .collect(),
            request_timeout: Duration::from_millis(self.metrics_timeout_ms),
        }
    }
}
