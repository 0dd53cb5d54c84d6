//! Call Service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::config::{parse_bool, DatabaseConfig, ObservabilityConfig, DEFAULT_DB_MAX_CONNECTIONS};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for the signaling websocket and history API.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default time an unanswered call rings before it is marked missed.
pub const DEFAULT_RING_TIMEOUT_SECONDS: u64 = 45;

/// Upper bound accepted for `CS_RING_TIMEOUT_SECONDS`.
pub const MAX_RING_TIMEOUT_SECONDS: u64 = 600;

/// Default time a settled call actor lingers to answer late transitions.
pub const DEFAULT_TERMINAL_RETENTION_SECONDS: u64 = 60;

/// Default limit on concurrently tracked calls.
pub const DEFAULT_MAX_ACTIVE_CALLS: usize = 10_000;

/// Default per-session outbound queue capacity.
pub const DEFAULT_SESSION_OUTBOX_CAPACITY: usize = 256;

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "call_service=debug,tower_http=debug";

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "cs";

/// Call Service configuration.
#[derive(Clone)]
pub struct Config {
    /// Signaling websocket and history API bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Postgres settings. `None` selects the in-memory call store.
    pub database: Option<DatabaseConfig>,

    /// Seconds an unanswered call rings (default: 45).
    pub ring_timeout_seconds: u64,

    /// Seconds a settled call actor lingers (default: 60).
    pub terminal_retention_seconds: u64,

    /// Maximum concurrently tracked calls.
    pub max_active_calls: usize,

    /// Outbound queue capacity per transport session.
    pub session_outbox_capacity: usize,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field(
                "database",
                &self.database.as_ref().map(|db| {
                    format!("[REDACTED] (max_connections={})", db.max_connections)
                }),
            )
            .field("ring_timeout_seconds", &self.ring_timeout_seconds)
            .field(
                "terminal_retention_seconds",
                &self.terminal_retention_seconds,
            )
            .field("max_active_calls", &self.max_active_calls)
            .field("session_outbox_capacity", &self.session_outbox_capacity)
            .field("instance_id", &self.instance_id)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("CS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("CS_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let database = match vars.get("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            Some(url) => Some(DatabaseConfig {
                url: SecretString::from(url.clone()),
                max_connections: parse_var(
                    vars,
                    "CS_DB_MAX_CONNECTIONS",
                    DEFAULT_DB_MAX_CONNECTIONS,
                )?,
            }),
            None => None,
        };

        let ring_timeout_seconds =
            parse_var(vars, "CS_RING_TIMEOUT_SECONDS", DEFAULT_RING_TIMEOUT_SECONDS)?;
        if ring_timeout_seconds == 0 || ring_timeout_seconds > MAX_RING_TIMEOUT_SECONDS {
            return Err(ConfigError::InvalidValue(format!(
                "CS_RING_TIMEOUT_SECONDS must be between 1 and {MAX_RING_TIMEOUT_SECONDS}, got {ring_timeout_seconds}"
            )));
        }

        let terminal_retention_seconds = parse_var(
            vars,
            "CS_TERMINAL_RETENTION_SECONDS",
            DEFAULT_TERMINAL_RETENTION_SECONDS,
        )?;

        let max_active_calls = parse_var(vars, "CS_MAX_ACTIVE_CALLS", DEFAULT_MAX_ACTIVE_CALLS)?;
        if max_active_calls == 0 {
            return Err(ConfigError::InvalidValue(
                "CS_MAX_ACTIVE_CALLS must be at least 1".to_string(),
            ));
        }

        let session_outbox_capacity = parse_var(
            vars,
            "CS_SESSION_OUTBOX_CAPACITY",
            DEFAULT_SESSION_OUTBOX_CAPACITY,
        )?;
        if session_outbox_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "CS_SESSION_OUTBOX_CAPACITY must be at least 1".to_string(),
            ));
        }

        let instance_id = vars.get("CS_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let observability = ObservabilityConfig {
            log_filter: vars
                .get("CS_LOG_FILTER")
                .cloned()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            json_logs: vars.get("CS_JSON_LOGS").is_some_and(|v| parse_bool(v)),
        };

        Ok(Config {
            bind_address,
            health_bind_address,
            database,
            ring_timeout_seconds,
            terminal_retention_seconds,
            max_active_calls,
            session_outbox_capacity,
            instance_id,
            observability,
        })
    }

    /// Ring timeout as a `Duration`.
    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_seconds)
    }

    /// Terminal retention as a `Duration`.
    #[must_use]
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_seconds)
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.database.is_none());
        assert_eq!(config.ring_timeout_seconds, DEFAULT_RING_TIMEOUT_SECONDS);
        assert_eq!(config.ring_timeout(), Duration::from_secs(45));
        assert_eq!(
            config.terminal_retention_seconds,
            DEFAULT_TERMINAL_RETENTION_SECONDS
        );
        assert_eq!(config.max_active_calls, DEFAULT_MAX_ACTIVE_CALLS);
        assert_eq!(
            config.session_outbox_capacity,
            DEFAULT_SESSION_OUTBOX_CAPACITY
        );
        assert_eq!(config.observability.log_filter, DEFAULT_LOG_FILTER);
        assert!(!config.observability.json_logs);
        assert!(config.instance_id.starts_with("cs-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("CS_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string()),
            (
                "CS_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:9001".to_string(),
            ),
            (
                "DATABASE_URL".to_string(),
                "postgres://calls:pw@localhost/calls".to_string(),
            ),
            ("CS_DB_MAX_CONNECTIONS".to_string(), "4".to_string()),
            ("CS_RING_TIMEOUT_SECONDS".to_string(), "30".to_string()),
            ("CS_TERMINAL_RETENTION_SECONDS".to_string(), "5".to_string()),
            ("CS_MAX_ACTIVE_CALLS".to_string(), "100".to_string()),
            ("CS_SESSION_OUTBOX_CAPACITY".to_string(), "16".to_string()),
            ("CS_INSTANCE_ID".to_string(), "cs-test-001".to_string()),
            ("CS_JSON_LOGS".to_string(), "true".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.health_bind_address, "127.0.0.1:9001");
        let db = config.database.as_ref().expect("database configured");
        assert_eq!(db.url.expose_secret(), "postgres://calls:pw@localhost/calls");
        assert_eq!(db.max_connections, 4);
        assert_eq!(config.ring_timeout_seconds, 30);
        assert_eq!(config.terminal_retention(), Duration::from_secs(5));
        assert_eq!(config.max_active_calls, 100);
        assert_eq!(config.session_outbox_capacity, 16);
        assert_eq!(config.instance_id, "cs-test-001");
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_ring_timeout_out_of_range() {
        for value in ["0", "601"] {
            let vars = HashMap::from([("CS_RING_TIMEOUT_SECONDS".to_string(), value.to_string())]);
            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(_))),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn test_unparsable_value_rejected() {
        let vars = HashMap::from([("CS_MAX_ACTIVE_CALLS".to_string(), "lots".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("CS_MAX_ACTIVE_CALLS")));
    }

    #[test]
    fn test_zero_outbox_capacity_rejected() {
        let vars = HashMap::from([("CS_SESSION_OUTBOX_CAPACITY".to_string(), "0".to_string())]);
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let vars = HashMap::from([(
            "DATABASE_URL".to_string(),
            "postgres://calls:hunter2@db/calls".to_string(),
        )]);
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("postgres://"));
    }
}
