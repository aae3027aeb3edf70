//! Engine event bus.

use p2pcommons_meta::{EBusyError, ModuleType};
use tokio::sync::broadcast;

/// Something that happened to a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A module was created on this peer.
    ModuleCreated {
        /// Hex module key.
        key: String,
        /// Module type.
        module_type: ModuleType,
    },
    /// A local module was persisted at a new version.
    ModuleUpdated {
        /// Hex module key.
        key: String,
        /// New version.
        version: u64,
    },
    /// A remote module was fetched into the local index.
    ModuleCloned {
        /// Hex module key.
        key: String,
        /// Fetched version.
        version: u64,
    },
    /// A module was removed from the local index.
    ModuleDeleted {
        /// Hex module key.
        key: String,
    },
    /// A non-fatal problem, such as a busy file during refresh.
    Warning(EBusyError),
}

/// Broadcast channel for [`EngineEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `event`; returns how many subscribers received it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        if self.sender.receiver_count() == 0 {
            return 0;
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
