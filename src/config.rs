use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::relay::history::{DEFAULT_HISTORY_CAPACITY, DEFAULT_REPLAY_LIMIT};
use crate::relay::streaming::DEFAULT_CHUNK_SIZE;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "HOST")]
    pub host: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelaySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Tunables for the relay core.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RelaySettings {
    /// Messages kept per room before the oldest are evicted.
    pub history_capacity: usize,
    /// Messages replayed to a session when it joins a room.
    pub replay_limit: usize,
    /// Characters per streamed chunk.
    pub chunk_size: usize,
    /// Delay between chunks.
    pub chunk_interval_ms: u64,
    /// Delay between thinking updates.
    pub thinking_interval_ms: u64,
    /// Capacity of each session's outbound queue.
    pub outbound_buffer: usize,
    /// How long shutdown waits for interrupted streams to wind down.
    pub shutdown_grace_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_interval_ms: 50,
            thinking_interval_ms: 400,
            outbound_buffer: 256,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl RelaySettings {
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Layering, lowest to highest: defaults, config file, `RELAY_*`
    /// environment, CLI flags (which clap also fills from `PORT`/`HOST`).
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let relay = RelaySettings::default();
        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.cors_origins", Vec::<String>::new())?
            .set_default("relay.history_capacity", relay.history_capacity as u64)?
            .set_default("relay.replay_limit", relay.replay_limit as u64)?
            .set_default("relay.chunk_size", relay.chunk_size as u64)?
            .set_default("relay.chunk_interval_ms", relay.chunk_interval_ms)?
            .set_default("relay.thinking_interval_ms", relay.thinking_interval_ms)?
            .set_default("relay.outbound_buffer", relay.outbound_buffer as u64)?
            .set_default("relay.shutdown_grace_ms", relay.shutdown_grace_ms)?;

        // An explicit file must exist; the cwd fallback is optional.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        // E.g. RELAY_SERVER__PORT=8000, RELAY_SERVER__CORS_ORIGINS=a,b
        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_port_overrides_default() {
        let config = AppConfig::load_from_args(["context-relay", "--port", "4100"]).unwrap();
        assert_eq!(config.server.port, 4100);
    }

    #[test]
    fn test_relay_defaults() {
        let settings = RelaySettings::default();
        assert_eq!(settings.history_capacity, 1000);
        assert_eq!(settings.replay_limit, 50);
        assert_eq!(settings.chunk_size, 20);
        assert_eq!(settings.shutdown_grace(), Duration::from_secs(5));
    }
}
