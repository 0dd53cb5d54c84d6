//! Connection quality classification.

/// ICE connectivity of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Media is flowing.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

/// Coarse quality signal shown to the user. Ordered worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    #[must_use]
    pub const fn from_ice_state(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::Completed => ConnectionQuality::Excellent,
            IceConnectionState::Connected => ConnectionQuality::Good,
            IceConnectionState::New | IceConnectionState::Checking => ConnectionQuality::Fair,
            IceConnectionState::Disconnected
            | IceConnectionState::Failed
            | IceConnectionState::Closed => ConnectionQuality::Poor,
        }
    }

    /// Worst link wins; `None` without links.
    pub fn aggregate(links: impl IntoIterator<Item = ConnectionQuality>) -> Option<Self> {
        links.into_iter().min()
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
        }
    }
}
