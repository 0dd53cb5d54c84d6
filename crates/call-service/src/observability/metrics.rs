//! Metrics for the Call Service.
//!
//! All metrics use the `cs_` prefix, `_total` for counters and `_seconds`
//! for duration histograms.
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `transition`: call lifecycle edges (~8 values)
//! - `kind`: relayed signal kinds (7 values)
//! - `outcome`: delivered, dropped
//! - `reason`: drop reasons (outbox_full, outbox_closed)
//! - `operation`: store operations (6 values)
//! - `event`: client event names (~13 values)
//!
//! User, call and session ids never appear as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the render handle.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Store latency buckets - DB round trips
        .set_buckets_for_metric(
            Matcher::Prefix("cs_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        // Call duration buckets - seconds to hours
        .set_buckets_for_metric(
            Matcher::Prefix("cs_call_duration".to_string()),
            &[
                5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
            ],
        )
        .map_err(|e| format!("Failed to set call duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `cs_calls_active` (calls with a live actor, including ringing).
pub fn set_calls_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_calls_active").set(count as f64);
}

/// Metric: `cs_sessions_active`.
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_sessions_active").set(count as f64);
}

/// Metric: `cs_actor_mailbox_depth`, labelled by `actor_type`.
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Call lifecycle
// ============================================================================

/// Record a call lifecycle transition.
///
/// Metric: `cs_call_transitions_total`
/// Labels: `transition` (created, accepted, rejected, cancelled, missed, ended)
pub fn record_call_transition(transition: &str) {
    counter!("cs_call_transitions_total", "transition" => transition.to_string()).increment(1);
}

/// Metric: `cs_call_duration_seconds` (answered calls only).
pub fn record_call_duration(seconds: u64) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("cs_call_duration_seconds").record(seconds as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record a relayed signaling payload.
///
/// Metric: `cs_signals_relayed_total`
/// Labels: `kind`, `outcome` (delivered, dropped)
pub fn record_signal_relayed(kind: &str, outcome: &str) {
    counter!(
        "cs_signals_relayed_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a server event dropped on a session outbox.
///
/// Metric: `cs_events_dropped_total`
/// Labels: `reason` (outbox_full, outbox_closed)
pub fn record_event_dropped(reason: &str) {
    counter!("cs_events_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `cs_client_events_total`, labelled by client `event` name.
pub fn record_client_event(event: &str) {
    counter!("cs_client_events_total", "event" => event.to_string()).increment(1);
}

/// Record a request that was answered with an error.
///
/// Metric: `cs_errors_total`
/// Labels: `event`, `error_type`, `code`
pub fn record_error(event: &str, error_type: &str, code: i32) {
    counter!(
        "cs_errors_total",
        "event" => event.to_string(),
        "error_type" => error_type.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

// ============================================================================
// Store & actors
// ============================================================================

/// Record call store latency.
///
/// Metric: `cs_store_latency_seconds`
/// Labels: `operation`, `status` (success, error)
pub fn record_store_latency(operation: &str, status: &str, duration: Duration) {
    histogram!(
        "cs_store_latency_seconds",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Metric: `cs_store_retries_total`, labelled by `operation`.
pub fn record_store_retry(operation: &str) {
    counter!("cs_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record an actor panic. Any non-zero value is a bug.
///
/// Metric: `cs_actor_panics_total`
pub fn record_actor_panic(actor_type: &str) {
    counter!("cs_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::DebuggingRecorder;
    use std::collections::HashSet;

    #[test]
    fn test_all_metrics_are_recorded_with_cs_prefix() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_calls_active(3);
            set_sessions_active(12);
            set_actor_mailbox_depth("call", 4);
            record_call_transition("accepted");
            record_call_duration(30);
            record_signal_relayed("offer", "delivered");
            record_event_dropped("outbox_full");
            record_client_event("initiate-call");
            record_error("accept-call", "conflict", 5);
            record_store_latency("patch_call", "success", Duration::from_millis(3));
            record_store_retry("patch_call");
            record_actor_panic("call");
        });

        let names: HashSet<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "cs_calls_active",
            "cs_sessions_active",
            "cs_actor_mailbox_depth",
            "cs_call_transitions_total",
            "cs_call_duration_seconds",
            "cs_signals_relayed_total",
            "cs_events_dropped_total",
            "cs_client_events_total",
            "cs_errors_total",
            "cs_store_latency_seconds",
            "cs_store_retries_total",
            "cs_actor_panics_total",
        ] {
            assert!(names.contains(expected), "missing metric {expected}");
        }
        assert!(names.iter().all(|n| n.starts_with("cs_")));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        // No recorder installed: calls must not panic.
        record_call_transition("missed");
        record_store_latency("get_call", "error", Duration::from_secs(1));
    }
}
