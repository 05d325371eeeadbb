//! Engine configuration: per-coin daemon connection settings and logging
//! verbosity, loaded from YAML with environment-variable overrides for
//! secrets. Everything outside of what [`crate::engine::PaymentEngine`]
//! itself needs to start (the RPC surface, TLS termination, the store's
//! connection string) is out of scope here.

use std::collections::HashMap;
use std::env::{self, VarError};
use std::fs::File;
use std::io::{self, ErrorKind as IoErrorKind};
use std::path::Path;
use std::time::Duration;

use hyper::Uri;
use log::LevelFilter;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationSeconds};
use thiserror::Error;

use crate::types::{CoinType, NetworkType};

/// Top-level configuration for a [`crate::engine::PaymentEngine`].
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// One entry per coin the engine should watch. A coin absent here is
    /// rejected by `PaymentEngine::create_invoice` with `CoinUnsupported`.
    pub coins: HashMap<CoinType, CoinConfig>,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Reads configuration from `path`, then applies `<COIN>_PASSWORD`
    /// environment variable overrides (e.g. `BTC_PASSWORD`, `XMR_PASSWORD`)
    /// on top of it.
    pub fn read(path: &Path) -> Result<EngineConfig, ConfigError> {
        Self::from_file(path)?.apply_env_overrides()
    }

    fn from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == IoErrorKind::NotFound {
                ConfigError::NotFound(path.display().to_string())
            } else {
                ConfigError::Io(e)
            }
        })?;
        Ok(serde_yaml::from_reader(file)?)
    }

    fn apply_env_overrides(mut self) -> Result<EngineConfig, ConfigError> {
        for (coin, config) in &mut self.coins {
            let var = format!("{coin}_PASSWORD");
            match env::var(&var) {
                Ok(password) => {
                    if let Some(login) = config.login.as_mut() {
                        login.password = Some(Secret::new(password));
                    } else {
                        log::warn!(
                            "environment variable {var} was set, but {coin} has no username configured"
                        );
                    }
                }
                Err(VarError::NotPresent) => {}
                Err(e) => return Err(ConfigError::Env(e)),
            }
        }
        Ok(self)
    }

    /// Validates that every configured coin with login credentials has a
    /// password set. Panics on an invalid configuration, matching this
    /// core's fail-fast startup convention.
    pub fn validate(&self) {
        for (coin, config) in &self.coins {
            if let Some(login) = config.login.as_ref() {
                assert!(
                    login.password.is_some(),
                    "{coin} has daemon login credentials configured but no password; set it via the {coin}_PASSWORD environment variable"
                );
            }
        }
    }
}

/// Per-coin daemon connection settings.
#[serde_as]
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct CoinConfig {
    /// URL of the coin's daemon/node JSON-RPC endpoint.
    #[serde_as(as = "DisplayFromStr")]
    pub url: Uri,
    /// Which network this daemon is configured against (mainnet, a testnet,
    /// ...), used for address derivation and encoding.
    pub network: NetworkType,
    /// Login credentials, if the endpoint requires authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<CoinLoginConfig>,
    /// Timeout for RPC calls to the daemon.
    #[serde_as(as = "DurationSeconds")]
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,
    /// Timeout for establishing an RPC connection to the daemon.
    #[serde_as(as = "DurationSeconds")]
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Interval between the watcher's catch-up polls of this daemon. Mempool
    /// is polled at half this interval. Tests set this much lower than the
    /// production default so invoice transitions arrive quickly.
    #[serde_as(as = "DurationSeconds")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
}

impl PartialEq for CoinConfig {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
            && self.network == other.network
            && self.login == other.login
            && self.rpc_timeout == other.rpc_timeout
            && self.connection_timeout == other.connection_timeout
            && self.poll_interval == other.poll_interval
    }
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    crate::watcher::SYNC_INTERVAL
}

/// Username and (optionally) password for a coin daemon.
#[derive(Deserialize, Serialize, Debug)]
pub struct CoinLoginConfig {
    /// RPC username.
    pub username: String,
    /// RPC password. For best security, set this via the `<COIN>_PASSWORD`
    /// environment variable rather than the config file.
    #[serde(skip_serializing)]
    pub password: Option<Secret<String>>,
}

impl PartialEq for CoinLoginConfig {
    fn eq(&self, other: &Self) -> bool {
        let usernames_match = self.username == other.username;
        let passwords_match = match (self.password.as_ref(), other.password.as_ref()) {
            (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
            (None, None) => true,
            _ => false,
        };
        usernames_match && passwords_match
    }
}

/// Logging verbosity configuration.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Maximum log level emitted.
    #[serde(with = "level_filter_serde")]
    pub verbosity: LevelFilter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { verbosity: LevelFilter::Info }
    }
}

mod level_filter_serde {
    use std::str::FromStr;

    use log::LevelFilter;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
        let s = String::deserialize(deserializer)?;
        LevelFilter::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Failure loading or validating [`EngineConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No file exists at the given path.
    #[error("config file not found: {0}")]
    NotFound(String),
    /// Failed to read an environment variable override.
    #[error("failed to read config value from environment: {0}")]
    Env(#[from] VarError),
    /// Filesystem error reading the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// Failed to parse the config file as YAML.
    #[error("error deserializing config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let err = EngineConfig::read(Path::new("/nonexistent/paygate.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn reads_yaml_and_applies_password_override() {
        let yaml = r#"
coins:
  BTC:
    url: "http://127.0.0.1:8332"
    network: BitcoinMainnet
    login:
      username: "rpcuser"
logging:
  verbosity: debug
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        env::set_var("BTC_PASSWORD", "hunter2");
        let config = EngineConfig::read(file.path()).unwrap();
        env::remove_var("BTC_PASSWORD");

        let btc = config.coins.get(&CoinType::BTC).unwrap();
        assert_eq!(
            btc.login.as_ref().unwrap().password.as_ref().unwrap().expose_secret(),
            "hunter2"
        );
        assert_eq!(config.logging.verbosity, LevelFilter::Debug);
        config.validate();
    }
}
