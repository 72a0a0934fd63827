use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

/// Change notifications emitted by the administrative write path. Every event
/// is published only after the corresponding store write has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A domain rule was created, changed or removed.
    TenantRoutes,
    /// Non-routing attributes of one tenant changed.
    TenantMetadata(String),
    /// Route rules of one tenant changed.
    Routes(String),
}

#[derive(Debug, Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "published change event"),
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "change event dropped, no subscribers")
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
