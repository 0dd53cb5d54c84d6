//! Outbound signaling seam.

use crate::errors::ClientError;
use call_protocol::ClientEvent;
use tokio::sync::mpsc;

/// Hands client frames to the transport.
#[async_trait::async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, event: ClientEvent) -> Result<(), ClientError>;
}

/// Sink backed by the channel a websocket writer task drains.
#[derive(Debug, Clone)]
pub struct ChannelSignaling {
    tx: mpsc::Sender<ClientEvent>,
}

impl ChannelSignaling {
    #[must_use]
    pub fn new(tx: mpsc::Sender<ClientEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl SignalingSink for ChannelSignaling {
    async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.tx
            .send(event)
            .await
            .map_err(|e| ClientError::Signaling(format!("transport closed: {e}")))
    }
}
