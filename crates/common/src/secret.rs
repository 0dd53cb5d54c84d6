//! Redacting wrappers for credentials carried in configuration.
//!
//! The database URL embeds the store's password, so it travels as a
//! [`SecretString`]: `Debug` prints a placeholder and reading it takes an
//! explicit `expose_secret()`.

pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url_is_redacted() {
        let url = SecretString::from("postgres://calls:hunter2@db:5432/calls");

        let debug_str = format!("{url:?}");
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));

        assert_eq!(url.expose_secret(), "postgres://calls:hunter2@db:5432/calls");
    }
}
