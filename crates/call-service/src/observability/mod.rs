//! Observability for the Call Service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit safe
//! fields. Log targets follow `cs.<area>`: `cs.actor.call`,
//! `cs.actor.supervisor`, `cs.registry`, `cs.relay`, `cs.store`,
//! `cs.transport`, `cs.api`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `cs_calls_active` | Gauge | none |
//! | `cs_sessions_active` | Gauge | none |
//! | `cs_call_transitions_total` | Counter | `transition` |
//! | `cs_call_duration_seconds` | Histogram | none |
//! | `cs_signals_relayed_total` | Counter | `kind`, `outcome` |
//! | `cs_events_dropped_total` | Counter | `reason` |
//! | `cs_store_latency_seconds` | Histogram | `operation`, `status` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
