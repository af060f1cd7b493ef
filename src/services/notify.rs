//! Owner-addressed notifications.
//!
//! Delivery is best-effort: a notification sent while the owner has no open
//! event stream is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const HUB_CAPACITY: usize = 256;

/// Receives "your upload finished" style messages.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, owner_id: Uuid, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub owner_id: Uuid,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Fan-out of notifications to every open event stream; each stream filters
/// for its own owner.
#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for NotificationHub {
    fn notify(&self, owner_id: Uuid, message: &str) {
        let notification = Notification {
            owner_id,
            message: message.to_string(),
            sent_at: Utc::now(),
        };
        match self.tx.send(notification) {
            Ok(receivers) => debug!(owner = %owner_id, receivers, "notification sent"),
            Err(_) => debug!(owner = %owner_id, "no open event streams, notification dropped"),
        }
    }
}
