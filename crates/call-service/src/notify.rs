//! Notification boundary.
//!
//! Out-of-band notifications (push, email) for invitees who may not have a
//! live session. Delivery is fire-and-forget: failures are logged and never
//! affect the call lifecycle.

use call_protocol::CallType;
use common::types::{CallId, GroupId, UserId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// What happened, from the recipient's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotification {
    IncomingCall {
        call_id: CallId,
        from: UserId,
        call_type: CallType,
        group_id: Option<GroupId>,
    },
    MissedCall {
        call_id: CallId,
        from: UserId,
    },
}

impl CallNotification {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CallNotification::IncomingCall { .. } => "incoming_call",
            CallNotification::MissedCall { .. } => "missed_call",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Sends notifications to a user outside the signaling transport.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient: &UserId,
        notification: CallNotification,
    ) -> Result<(), NotifyError>;
}

/// Default notifier: records the notification in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        recipient: &UserId,
        notification: CallNotification,
    ) -> Result<(), NotifyError> {
        info!(
            target: "cs.notify",
            recipient = %recipient,
            kind = notification.kind(),
            "Notification"
        );
        Ok(())
    }
}

/// Send a notification on a background task.
pub fn notify_detached(
    notifier: &Arc<dyn Notifier>,
    recipient: UserId,
    notification: CallNotification,
) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        let kind = notification.kind();
        match notifier.notify(&recipient, notification).await {
            Ok(()) => {
                debug!(target: "cs.notify", recipient = %recipient, kind, "Notification sent");
            }
            Err(e) => {
                warn!(
                    target: "cs.notify",
                    recipient = %recipient,
                    kind,
                    error = %e,
                    "Notification failed"
                );
            }
        }
    });
}
