//! Cache invalidation events.
//!
//! Every synchronous invalidation also publishes an event on a broadcast
//! channel. In-process subscribers can mirror the invalidation into other
//! caches; cross-process fan-out is a subscriber concern, not handled here.
//! A lagging subscriber never blocks or fails the invalidation itself.

use crate::membership::models::{AcademyId, RoleId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What was invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// One membership pair: coarse entry plus its fine permission entries.
    Membership {
        user_id: UserId,
        academy_id: AcademyId,
    },

    /// Everything cached for one user, across academies.
    User { user_id: UserId },

    /// Everything cached for one academy, across users.
    Academy { academy_id: AcademyId },

    /// All fine permission entries (role catalog changed).
    RoleCatalog {
        #[serde(skip_serializing_if = "Option::is_none")]
        role_id: Option<RoleId>,
    },

    /// Full flush.
    All,
}

/// Broadcast publisher for invalidation events.
#[derive(Debug)]
pub struct InvalidationPublisher {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Send errors (no subscribers) are ignored; the
    /// synchronous invalidation has already happened.
    pub fn publish(&self, event: InvalidationEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to future invalidation events.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let publisher = InvalidationPublisher::new(16);
        let mut rx = publisher.subscribe();

        publisher.publish(InvalidationEvent::Membership {
            user_id: UserId::new("7"),
            academy_id: AcademyId::new("3"),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            InvalidationEvent::Membership {
                user_id: UserId::new("7"),
                academy_id: AcademyId::new("3"),
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let publisher = InvalidationPublisher::new(16);
        publisher.publish(InvalidationEvent::All);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = InvalidationEvent::Academy {
            academy_id: AcademyId::new("9"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"academy\""));

        let back: InvalidationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
