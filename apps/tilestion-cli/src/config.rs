//! CLI configuration.
//!
//! Resolved in three layers: built-in defaults, then the JSON file at
//! `~/.config/tilestion/config.json`, then `TILESTION_*` environment
//! variables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tilestion_connection::ConnectionConfig;
use tilestion_protocol::channels::{APP_NAME, DEFAULT_CAPACITY};
use tilestion_telemetry::{AggregatorConfig, DEFAULT_TICK};

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub bus_url: String,
    pub username: String,
    pub password: String,
    /// Application part of the client name.
    pub app_name: String,
    /// Points retained per channel.
    pub capacity: usize,
    /// Coalescing tick for printed updates, in milliseconds.
    pub tick_ms: u64,
    /// Publish synthetic values on the default channels.
    pub simulate: bool,
    pub simulate_interval_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bus_url: "nats://localhost:4222".into(),
            username: String::new(),
            password: String::new(),
            app_name: APP_NAME.into(),
            capacity: DEFAULT_CAPACITY,
            tick_ms: DEFAULT_TICK.as_millis() as u64,
            simulate: true,
            simulate_interval_ms: 50,
        }
    }
}

impl fmt::Debug for CliConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliConfig")
            .field("bus_url", &self.bus_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("app_name", &self.app_name)
            .field("capacity", &self.capacity)
            .field("tick_ms", &self.tick_ms)
            .field("simulate", &self.simulate)
            .field("simulate_interval_ms", &self.simulate_interval_ms)
            .finish()
    }
}

impl CliConfig {
    /// Loads defaults, the config file and the environment, in that order.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match config_path() {
            Ok(path) => Self::from_file(&path)?,
            Err(e) => {
                tracing::debug!(error = %e, "no config directory, using defaults");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.sanitize();
        Ok(config)
    }

    /// Reads `path` over the defaults. A missing file yields the defaults; an
    /// unparseable one is logged and ignored.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Applies `TILESTION_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TILESTION_BUS_URL") {
            self.bus_url = v;
        }
        if let Some(v) = lookup("TILESTION_USER") {
            self.username = v;
        }
        if let Some(v) = lookup("TILESTION_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = lookup("TILESTION_APP_NAME") {
            self.app_name = v;
        }
        parse_env(&lookup, "TILESTION_CAPACITY", &mut self.capacity);
        parse_env(&lookup, "TILESTION_TICK_MS", &mut self.tick_ms);
        parse_env(&lookup, "TILESTION_SIMULATE", &mut self.simulate);
        parse_env(
            &lookup,
            "TILESTION_SIMULATE_INTERVAL_MS",
            &mut self.simulate_interval_ms,
        );
    }

    fn sanitize(&mut self) {
        if self.capacity == 0 {
            tracing::warn!("capacity 0 is invalid, using {DEFAULT_CAPACITY}");
            self.capacity = DEFAULT_CAPACITY;
        }
        if self.simulate_interval_ms == 0 {
            self.simulate_interval_ms = 1;
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            app_name: self.app_name.clone(),
            ..ConnectionConfig::default()
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            capacity: self.capacity,
            tick: Duration::from_millis(self.tick_ms),
        }
    }

    pub fn simulate_interval(&self) -> Duration {
        Duration::from_millis(self.simulate_interval_ms)
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("tilestion").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")?;
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg));
        }
        let home = std::env::var("HOME")?;
        Ok(PathBuf::from(home).join(".config"))
    }
}
