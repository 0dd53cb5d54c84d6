//! Common configuration types for Ringline components.

use crate::secret::SecretString;
use serde::Deserialize;

/// Default Postgres pool size.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string (redacted in Debug output)
    pub url: SecretString,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

/// Parse a boolean flag the way operators tend to write them.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::secret::ExposeSecret;

    #[test]
    fn test_database_config_keeps_url_out_of_debug() {
        let json = r#"{"url": "postgres://calls:pw-123@db/calls", "max_connections": 4}"#;
        let config: DatabaseConfig = serde_json::from_str(json).expect("deserialize");

        assert_eq!(config.url.expose_secret(), "postgres://calls:pw-123@db/calls");
        assert_eq!(config.max_connections, 4);

        let debug = format!("{config:?}");
        assert!(debug.contains("max_connections: 4"));
        assert!(!debug.contains("pw-123"));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool(" ON "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
