//! Common utilities and types shared across Ringline components.

#![warn(clippy::pedantic)]

/// Module for identifier types shared by the service, protocol and client
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
