//! Engine event bus.
//!
//! Containers announce state transitions — locked, unlocked, ACL changed,
//! secret changed — on a session-wide bus. Subscribers receive events over
//! `crossbeam` channels; a dropped receiver is pruned on the next publish.
//!
//! The lock transition contract matters to subscribers: a container emits
//! exactly one [`EngineEvent::Locked`] per unlocked→locked transition, and
//! locking an already-locked container emits nothing.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

/// A state transition announced by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A container transitioned from unlocked to locked.
    Locked {
        container: String,
        at: DateTime<Utc>,
    },

    /// A container transitioned from locked to unlocked.
    Unlocked {
        container: String,
        at: DateTime<Utc>,
    },

    /// A container's ACL changed in a way cached copies must re-fetch.
    AclChanged {
        container: String,
        at: DateTime<Utc>,
    },

    /// A container's master secret was changed.
    SecretChanged {
        container: String,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The container this event concerns.
    pub fn container(&self) -> &str {
        match self {
            Self::Locked { container, .. }
            | Self::Unlocked { container, .. }
            | Self::AclChanged { container, .. }
            | Self::SecretChanged { container, .. } => container,
        }
    }
}

/// Cheaply cloneable publish/subscribe bus for [`EngineEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Publish an event to every live subscriber, pruning dead ones.
    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        tracing::trace!(event = ?event, receivers = subscribers.len(), "event published");
    }

    /// Number of live subscribers (after the last publish pruned).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_receive() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(EngineEvent::Locked {
            container: "login".into(),
            at: Utc::now(),
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.container(), "login");
        assert!(matches!(event, EngineEvent::Locked { .. }));
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _live = bus.subscribe();
        drop(rx);

        bus.publish(EngineEvent::AclChanged {
            container: "login".into(),
            at: Utc::now(),
        });

        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(EngineEvent::SecretChanged {
            container: "db".into(),
            at: Utc::now(),
        });

        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
    }
}
