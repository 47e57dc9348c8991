use std::sync::Arc;

use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::relay::RelayHandle;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration store
    pub config: Arc<ConfigStore>,
    /// Handle to the signaling relay loop
    pub relay: RelayHandle,
    /// Event bus for observers
    pub events: Arc<EventBus>,
}

impl AppState {
    pub fn new(config: Arc<ConfigStore>, relay: RelayHandle, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            relay,
            events,
        })
    }

    /// Outstanding-byte ceiling for a freshly opened peer channel
    pub fn channel_ceiling(&self) -> u64 {
        self.config.get().transport.max_outstanding_bytes
    }
}
