//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Supervisor | < 100  | 100-500 | > 500    |
//! | Call       | < 16   | 16-64   | > 64     |
//!
//! A call actor sees a handful of messages per participant, so its
//! thresholds are much lower than the supervisor's.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SUPERVISOR_MAILBOX_NORMAL: usize = 100;
pub const SUPERVISOR_MAILBOX_WARNING: usize = 500;

pub const CALL_MAILBOX_NORMAL: usize = 16;
pub const CALL_MAILBOX_WARNING: usize = 64;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `CallSupervisorActor` (singleton).
    Supervisor,
    /// `CallActor` (one per call).
    Call,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Supervisor => "supervisor",
            ActorType::Call => "call",
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Supervisor => SUPERVISOR_MAILBOX_NORMAL,
            ActorType::Call => CALL_MAILBOX_NORMAL,
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Supervisor => SUPERVISOR_MAILBOX_WARNING,
            ActorType::Call => CALL_MAILBOX_WARNING,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth for one actor.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message taken off the channel. `depth` counts it plus
    /// everything still queued behind it.
    pub fn record_received(&self, depth: usize) {
        let previous = self.depth.swap(depth, Ordering::Relaxed);
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);

        match self.level_for_depth(depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "cs.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if previous <= self.actor_type.normal_threshold() => {
                debug!(
                    target: "cs.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
    }

    /// Record a message handled; `remaining` is the backlog left behind it.
    pub fn record_handled(&self, remaining: usize) {
        self.depth.store(remaining, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), remaining);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated counters for the actor system.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Calls with a live actor.
    pub active_calls: AtomicUsize,
    /// Calls that reached a terminal status.
    pub calls_settled: AtomicU64,
    /// Actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_started(&self) {
        let count = self.active_calls.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_calls_active(count);
    }

    pub fn call_removed(&self) {
        let previous = self
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .unwrap_or(0);
        metrics::set_calls_active(previous.saturating_sub(1));
    }

    pub fn call_settled(&self) {
        self.calls_settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        metrics::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "cs.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = self.actor_panics.load(Ordering::Relaxed),
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.active_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn settled_count(&self) -> u64 {
        self.calls_settled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_thresholds() {
        assert_eq!(ActorType::Call.as_str(), "call");
        assert_eq!(ActorType::Supervisor.as_str(), "supervisor");
        assert!(ActorType::Call.warning_threshold() < ActorType::Supervisor.warning_threshold());
    }

    #[test]
    fn test_mailbox_levels_and_peak() {
        let monitor = MailboxMonitor::new(ActorType::Call, "c1");

        monitor.record_received(CALL_MAILBOX_NORMAL + 1);
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        monitor.record_received(CALL_MAILBOX_WARNING + 1);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);

        monitor.record_handled(3);
        assert_eq!(monitor.current_depth(), 3);
        monitor.record_received(3);
        monitor.record_handled(0);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);
        assert_eq!(monitor.peak_depth(), CALL_MAILBOX_WARNING + 1);
        assert_eq!(monitor.messages_processed(), 2);
    }

    #[test]
    fn test_call_count_never_underflows() {
        let metrics = ActorMetrics::new();
        metrics.call_started();
        metrics.call_removed();
        metrics.call_removed();
        assert_eq!(metrics.call_count(), 0);
    }

    #[test]
    fn test_record_panic_counts() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Call);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 1);
    }
}
