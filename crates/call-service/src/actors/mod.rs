//! Actor model for the call lifecycle.
//!
//! ```text
//! CallSupervisorActor (singleton per instance)
//! └── supervises N CallActors
//!     └── CallActor (one per call id, single writer for that call)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per call**: every transition is a message to the call's
//!   actor, so the first transition wins and later ones see `Conflict`
//! - **Persist, then announce**: a call-level transition is written to the
//!   store before any lifecycle event leaves the actor
//! - **CancellationToken propagation**: call actors run on child tokens of the
//!   supervisor's root token and settle their call when cancelled
//!
//! # Modules
//!
//! - [`supervisor`] - `CallSupervisorActor`, owns the call id map
//! - [`call`] - `CallActor` per call, owns state and timers
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod call;
pub mod messages;
pub mod metrics;
pub mod supervisor;

pub use call::{CallActor, CallActorHandle, CallContext, CallSettings};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use supervisor::{CallSupervisorActor, CallSupervisorHandle};
