//! Connected/reading status with change notification.

use crate::observer::{ObserverList, SubscriptionId};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub reading: bool,
    pub last_message: String,
}

/// Delivered to connection observers on every status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
    pub connected: bool,
    pub message: String,
    pub reading: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    state: Mutex<ConnectionState>,
    // Serializes store-then-notify so observers see updates in the order
    // they were stored. Reentrant so an observer may call `update` itself.
    delivery: ReentrantMutex<()>,
    observers: ObserverList<ConnectionEvent>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Records a new status and notifies observers. Concurrent updates are
    /// delivered in the order they were stored, so the last event an
    /// observer sees matches [`state`](Self::state).
    pub fn update<S: Into<String>>(&self, connected: bool, reading: bool, message: S) {
        let _delivery = self.delivery.lock();
        let event = {
            let mut state = self.state.lock();
            state.connected = connected;
            state.reading = reading;
            state.last_message = message.into();
            ConnectionEvent {
                connected,
                message: state.last_message.clone(),
                reading,
            }
        };
        log::debug!(
            "Connection status: connected={} reading={} ({})",
            event.connected,
            event.reading,
            event.message
        );
        self.observers.notify(&event);
    }

    /// Marks disconnected without notifying.
    pub fn mark_disconnected(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.reading = false;
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_reading(&self) -> bool {
        self.state.lock().reading
    }
}
