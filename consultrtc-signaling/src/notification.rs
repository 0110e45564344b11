//! Notification bus
//!
//! An independent duplex channel that delivers asynchronous notifications
//! into a [`NotificationStore`]. It shares the reconnect discipline of the
//! signaling channel but knows nothing about calls.

use crate::channel::{Connector, DuplexChannel, WebSocketConnector};
use crate::protocol::{NotificationFrame, NotificationPayload, NotificationType};
use chrono::{DateTime, Utc};
use consultrtc_core::{ChannelState, ConsultRtcError, ReconnectPolicy, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Default interval between keepalive pings
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);

/// A delivered notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Server id, or a locally generated `local-<uuid>` when absent
    pub id: String,
    /// Sender, when known
    pub sender_id: Option<String>,
    /// Category
    pub notification_type: NotificationType,
    /// Text
    pub message: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Read flag, only ever goes from false to true
    pub read: bool,
}

impl Notification {
    /// Build from an inbound payload, assigning a local id if the server sent none
    pub fn from_payload(payload: NotificationPayload) -> Self {
        let id = payload
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("local-{}", Uuid::new_v4()));
        Self {
            id,
            sender_id: payload.sender_id,
            notification_type: payload.notification_type,
            message: payload.message,
            timestamp: payload.timestamp,
            read: false,
        }
    }
}

/// In-memory notification list, newest first
#[derive(Debug, Default, Clone)]
pub struct NotificationStore {
    items: Vec<Notification>,
    unread: usize,
}

impl NotificationStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the front. Returns false for a duplicate id.
    pub fn add(&mut self, notification: Notification) -> bool {
        if self.items.iter().any(|n| n.id == notification.id) {
            return false;
        }
        if !notification.read {
            self.unread += 1;
        }
        self.items.insert(0, notification);
        true
    }

    /// Mark one notification read. No-op if unknown or already read.
    pub fn mark_as_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(item) if !item.read => {
                item.read = true;
                self.unread -= 1;
                true
            }
            _ => false,
        }
    }

    /// Mark every notification read
    pub fn mark_all_as_read(&mut self) {
        for item in &mut self.items {
            item.read = true;
        }
        self.unread = 0;
    }

    /// Remove a notification, returning it if it was present
    pub fn remove(&mut self, id: &str) -> Option<Notification> {
        let position = self.items.iter().position(|n| n.id == id)?;
        let removed = self.items.remove(position);
        if !removed.read {
            self.unread -= 1;
        }
        Some(removed)
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.items.clear();
        self.unread = 0;
    }

    /// Number of unread notifications
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Look up by id
    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    /// All notifications, newest first
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    /// Number of notifications
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Store change published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    /// A new notification arrived
    Received(Notification),
    /// A notification was marked read
    Read {
        /// Notification id
        id: String,
    },
    /// Every notification was marked read
    AllRead,
    /// A notification was removed
    Removed {
        /// Notification id
        id: String,
    },
    /// The store was cleared on logout
    Cleared,
}

/// Notification channel plus the store it feeds
#[derive(Clone)]
pub struct NotificationBus {
    user_id: String,
    channel: DuplexChannel,
    store: Arc<RwLock<NotificationStore>>,
    events: broadcast::Sender<NotificationEvent>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("user_id", &self.user_id)
            .field("channel", &self.channel)
            .field("unread", &self.unread_count())
            .finish()
    }
}

impl NotificationBus {
    /// Connect for `user_id` at `{base_url}/{user_id}` over WebSocket
    pub fn connect(base_url: &str, user_id: impl Into<String>) -> Self {
        Self::connect_with(
            Arc::new(WebSocketConnector::default()),
            base_url,
            user_id,
            ReconnectPolicy::default(),
            DEFAULT_KEEPALIVE,
        )
    }

    /// Connect with an explicit transport, reconnect policy and keepalive interval
    pub fn connect_with(
        connector: Arc<dyn Connector>,
        base_url: &str,
        user_id: impl Into<String>,
        policy: ReconnectPolicy,
        keepalive: Duration,
    ) -> Self {
        let user_id = user_id.into();
        let url = format!("{}/{}", base_url.trim_end_matches('/'), user_id);
        let (channel, inbound) = DuplexChannel::open("notifications", url, connector, policy);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let bus = Self {
            user_id,
            channel,
            store: Arc::new(RwLock::new(NotificationStore::new())),
            events,
        };

        tokio::spawn(dispatch(bus.clone(), inbound));
        tokio::spawn(keepalive_loop(bus.channel.clone(), keepalive));
        bus
    }

    /// User this bus belongs to
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Mark one notification read; idempotent
    pub fn mark_as_read(&self, id: &str) {
        if self.store.write().mark_as_read(id) {
            let _ = self.events.send(NotificationEvent::Read { id: id.to_string() });
        }
    }

    /// Mark all notifications read
    pub fn mark_all_as_read(&self) {
        self.store.write().mark_all_as_read();
        let _ = self.events.send(NotificationEvent::AllRead);
    }

    /// Remove a notification
    pub fn remove_notification(&self, id: &str) -> Option<Notification> {
        let removed = self.store.write().remove(id);
        if removed.is_some() {
            let _ = self.events.send(NotificationEvent::Removed { id: id.to_string() });
        }
        removed
    }

    /// Send a notification to `target_id`. Fails unless the channel is open.
    pub fn send_notification(
        &self,
        target_id: &str,
        message: &str,
        notification_type: NotificationType,
    ) -> Result<()> {
        let frame = NotificationFrame::Notification(NotificationPayload {
            id: None,
            sender_id: None,
            receiver_id: Some(target_id.to_string()),
            notification_type,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        let text = serde_json::to_string(&frame).map_err(|e| ConsultRtcError::InvalidMessage {
            message: "notification".to_string(),
            source: e.into(),
        })?;
        self.channel.send_text(text)?;
        debug!(target = target_id, "Sent notification");
        Ok(())
    }

    /// Clear the store and close the channel, on user logout
    pub fn clear_on_logout(&self) {
        self.store.write().clear();
        self.channel.close();
        let _ = self.events.send(NotificationEvent::Cleared);
        info!(user_id = %self.user_id, "Notifications cleared on logout");
    }

    /// Snapshot of all notifications, newest first
    pub fn notifications(&self) -> Vec<Notification> {
        self.store.read().items().to_vec()
    }

    /// Number of unread notifications
    pub fn unread_count(&self) -> usize {
        self.store.read().unread_count()
    }

    /// Subscribe to store changes
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Watch channel state changes
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.channel.state_watch()
    }

    /// `connecting`, `connected` or `disconnected`
    pub fn connection_status(&self) -> &'static str {
        self.channel.state().connection_status()
    }

    /// Underlying channel, for lifecycle events
    pub fn channel(&self) -> &DuplexChannel {
        &self.channel
    }

    /// Reset the backoff and reconnect
    pub fn reconnect(&self) -> Result<()> {
        self.channel.reconnect()
    }

    /// Wait until the channel is open
    pub async fn wait_until_open(&self) -> Result<()> {
        self.channel.wait_for_state(ChannelState::Open).await
    }

    /// Close the channel without clearing the store
    pub fn close(&self) {
        self.channel.close();
    }

    fn deliver(&self, payload: NotificationPayload) {
        let notification = Notification::from_payload(payload);
        if self.store.write().add(notification.clone()) {
            debug!(id = %notification.id, "Notification received");
            let _ = self.events.send(NotificationEvent::Received(notification));
        } else {
            debug!(id = %notification.id, "Duplicate notification ignored");
        }
    }
}

async fn dispatch(bus: NotificationBus, mut inbound: mpsc::Receiver<String>) {
    while let Some(text) = inbound.recv().await {
        match serde_json::from_str::<NotificationFrame>(&text) {
            Ok(NotificationFrame::Notification(payload)) => bus.deliver(payload),
            Ok(NotificationFrame::Ping) => {
                if let Ok(pong) = serde_json::to_string(&NotificationFrame::Pong) {
                    if let Err(e) = bus.channel.send_text(pong) {
                        debug!("Pong not sent: {}", e);
                    }
                }
            }
            Ok(NotificationFrame::Pong) => debug!("Keepalive pong"),
            Err(e) => warn!("Dropping unparsable notification frame: {}", e),
        }
    }
}

async fn keepalive_loop(channel: DuplexChannel, period: Duration) {
    let ping = match serde_json::to_string(&NotificationFrame::Ping) {
        Ok(ping) => ping,
        Err(_) => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match channel.state() {
            ChannelState::Closed => break,
            ChannelState::Open => {
                if let Err(e) = channel.send_text(ping.clone()) {
                    debug!("Keepalive ping not sent: {}", e);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(id: &str) -> Notification {
        Notification {
            id: id.to_string(),
            sender_id: Some("doc1".to_string()),
            notification_type: NotificationType::Message,
            message: format!("message {}", id),
            timestamp: Utc::now(),
            read: false,
        }
    }

    #[test]
    fn test_newest_first_and_dedup() {
        let mut store = NotificationStore::new();
        assert!(store.add(notification("a")));
        assert!(store.add(notification("b")));
        assert!(!store.add(notification("a")));
        assert_eq!(store.items()[0].id, "b");
        assert_eq!(store.unread_count(), 2);
    }

    #[test]
    fn test_mark_as_read_is_idempotent() {
        let mut store = NotificationStore::new();
        store.add(notification("a"));
        store.add(notification("b"));
        assert!(store.mark_as_read("a"));
        assert!(!store.mark_as_read("a"));
        assert!(!store.mark_as_read("missing"));
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_mark_all_as_read() {
        let mut store = NotificationStore::new();
        for id in ["a", "b", "c"] {
            store.add(notification(id));
        }
        store.mark_as_read("b");
        store.mark_all_as_read();
        assert_eq!(store.unread_count(), 0);
        assert!(store.items().iter().all(|n| n.read));

        store.mark_all_as_read();
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_remove_twice_does_not_double_decrement() {
        let mut store = NotificationStore::new();
        store.add(notification("a"));
        store.add(notification("b"));
        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert_eq!(store.unread_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_read_item_keeps_unread_count() {
        let mut store = NotificationStore::new();
        store.add(notification("a"));
        store.add(notification("b"));
        store.mark_as_read("a");
        store.remove("a");
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_local_id_assigned() {
        let payload = NotificationPayload {
            id: None,
            sender_id: Some("doc1".to_string()),
            receiver_id: None,
            notification_type: NotificationType::Reminder,
            message: "Appointment in 10 minutes".to_string(),
            timestamp: Utc::now(),
        };
        let first = Notification::from_payload(payload.clone());
        let second = Notification::from_payload(payload);
        assert!(first.id.starts_with("local-"));
        assert_ne!(first.id, second.id);
        assert!(!first.read);
    }
}
