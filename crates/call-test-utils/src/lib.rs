//! # Call Service Test Utilities
//!
//! Shared fakes and fixtures for Call Service integration tests.
//!
//! ## Modules
//!
//! - `recording_store` - Call record store that records every patch and can
//!   be told to fail
//! - `recording_notifier` - Notifier that captures notifications
//! - `fixtures` - A wired-up dispatcher plus fake client sessions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     let mut alice = harness.session("alice").await;
//!     let mut bob = harness.session("bob").await;
//!
//!     alice.initiate("c1", &["bob"]).await;
//!     assert_eq!(bob.next().await.name(), "incoming-call");
//! }
//! ```

pub mod fixtures;
pub mod recording_notifier;
pub mod recording_store;

pub use fixtures::{TestHarness, TestSession};
pub use recording_notifier::RecordingNotifier;
pub use recording_store::{FailMode, RecordedPatch, RecordingStore};
