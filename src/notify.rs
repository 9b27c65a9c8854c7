use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Notice, ResourceKey};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking and waitlist notices, one channel per resource.
pub struct NotifyHub {
    channels: DashMap<ResourceKey, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource: ResourceKey) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(resource)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, resource: ResourceKey, notice: &Notice) {
        if let Some(sender) = self.channels.get(&resource) {
            let _ = sender.send(notice.clone());
        }
    }
}
