//! Environment-variable driven configuration.

use std::env;

use thiserror::Error;
use tokio::time::Duration;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Endpoint validation failed: {0}")]
    InvalidEndpoint(String),
}

/// How the process runs after configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve the event listener, optionally with a periodic sync timer.
    Serve,
    /// Run one full sync and exit 0/1 on aggregate success/failure.
    Sync,
}

/// Main configuration for the bridge.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster-wide Consul endpoint: KV store, node catalog, and the
    /// fallback target for registrations.
    pub consul_endpoint: String,
    pub marathon_endpoint: String,
    /// Identity written into the `consular-reg-id=` tag of every
    /// registration this instance owns.
    pub registration_id: String,
    /// Retry failed agent registrations once against the cluster endpoint.
    pub enable_fallback: bool,
    /// Timeout for cluster-wide Marathon/Consul requests.
    pub default_timeout: Duration,
    /// Timeout for node-local agent requests (also used for the fallback
    /// retry). Shorter than the default so a dead worker does not stall a
    /// full reconciliation.
    pub agent_timeout: Duration,
    pub debug: bool,
    /// Host advertised in the event callback URL; also the listen interface.
    pub host: String,
    pub port: u16,
    /// Seconds between periodic full syncs in serve mode. `None` disables
    /// the timer.
    pub sync_interval: Option<Duration>,
    /// Run the purge phases (dead services, dead app labels) during syncs.
    pub purge: bool,
    pub mode: Mode,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let consul_endpoint = env_required("CONSUL_ENDPOINT")?
            .trim_end_matches('/')
            .to_string();
        let marathon_endpoint = env_required("MARATHON_ENDPOINT")?
            .trim_end_matches('/')
            .to_string();
        let registration_id = env_required("REGISTRATION_ID")?;

        let enable_fallback = env_bool("ENABLE_FALLBACK", true);
        let default_timeout = Duration::from_secs(env_parse_or("DEFAULT_TIMEOUT", 5u64)?);
        let agent_timeout = Duration::from_secs(env_parse_or("AGENT_TIMEOUT", 2u64)?);
        let debug = env_bool("DEBUG", false);

        let host = env::var("HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = env_parse_or("PORT", 7000)?;

        let sync_interval_secs: u64 = env_parse_or("SYNC_INTERVAL", 0u64)?;
        let sync_interval = if sync_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(sync_interval_secs))
        };
        let purge = env_bool("PURGE", false);

        let mode = match env::var("MODE").as_deref() {
            Ok("sync") => Mode::Sync,
            Ok("serve") | Err(_) => Mode::Serve,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "MODE".into(),
                    message: format!("Unknown mode '{}'. Valid options: serve, sync", other),
                })
            }
        };

        let config = Config {
            consul_endpoint,
            marathon_endpoint,
            registration_id,
            enable_fallback,
            default_timeout,
            agent_timeout,
            debug,
            host,
            port,
            sync_interval,
            purge,
            mode,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, endpoint) in [
            ("CONSUL_ENDPOINT", &self.consul_endpoint),
            ("MARATHON_ENDPOINT", &self.marathon_endpoint),
        ] {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        if self.registration_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "REGISTRATION_ID".into(),
                message: "Must not be empty".into(),
            });
        }

        if self.default_timeout.is_zero() || self.agent_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "DEFAULT_TIMEOUT / AGENT_TIMEOUT".into(),
                message: "Timeouts must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// The URL Marathon posts task events to, including the registration
    /// id so concurrent bridge instances can tell their callbacks apart.
    pub fn events_url(&self) -> String {
        format!(
            "http://{}:{}/events?registration={}",
            self.host, self.port, self.registration_id
        )
    }

    /// Creates a default Config for testing purposes.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            consul_endpoint: "http://localhost:8500".into(),
            marathon_endpoint: "http://localhost:8080".into(),
            registration_id: "the-uuid".into(),
            enable_fallback: true,
            default_timeout: Duration::from_secs(5),
            agent_timeout: Duration::from_secs(2),
            debug: false,
            host: "localhost".into(),
            port: 7000,
            sync_interval: None,
            purge: false,
            mode: Mode::Serve,
        }
    }
}
