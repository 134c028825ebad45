//! Event bus: broadcast of runtime events with a history ring buffer.

use netron_types::event::NetronEvent;
use std::collections::VecDeque;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum events retained in the history ring buffer.
const HISTORY_SIZE: usize = 1000;

/// Capacity of the broadcast channel.
const CHANNEL_CAPACITY: usize = 1024;

/// Delivers every [`NetronEvent`] once to each subscriber.
pub struct EventBus {
    sender: broadcast::Sender<NetronEvent>,
    history: RwLock<VecDeque<NetronEvent>>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: RwLock::new(VecDeque::with_capacity(HISTORY_SIZE)),
        }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: NetronEvent) {
        debug!(event = event.kind(), "Publishing event");

        {
            let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
            if history.len() >= HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NetronEvent> {
        self.sender.subscribe()
    }

    /// Most recent events, newest first.
    pub fn history(&self, limit: usize) -> Vec<NetronEvent> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
