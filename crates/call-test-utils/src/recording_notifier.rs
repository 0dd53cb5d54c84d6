//! Notifier that captures every notification.

use call_service::notify::{CallNotification, Notifier, NotifyError};
use common::types::UserId;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(UserId, CallNotification)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(UserId, CallNotification)> {
        self.sent.lock().unwrap().clone()
    }

    /// Notification kinds delivered to `user`, in order.
    pub fn kinds_for(&self, user: &str) -> Vec<&'static str> {
        self.sent()
            .iter()
            .filter(|(recipient, _)| recipient.as_str() == user)
            .map(|(_, n)| n.kind())
            .collect()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        recipient: &UserId,
        notification: CallNotification,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.clone(), notification));
        Ok(())
    }
}
