//! Per-user signaling channel
//!
//! Wraps a [`DuplexChannel`] with the call-control protocol. Inbound frames
//! are parsed and dispatched by a single task, so handlers and subscribers
//! observe messages strictly in arrival order.

use crate::channel::{Connector, DuplexChannel, WebSocketConnector};
use crate::protocol::{MessageKind, SignalingMessage};
use consultrtc_core::{ChannelState, ConsultRtcError, ReconnectPolicy, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

const SUBSCRIBER_CAPACITY: usize = 256;

/// Handle returned by [`SignalingChannel::on`], used to unregister
pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&SignalingMessage) + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    next_id: AtomicU64,
    entries: RwLock<Vec<(HandlerId, MessageKind, Handler)>>,
}

impl HandlerTable {
    fn matching(&self, kind: MessageKind) -> Vec<Handler> {
        self.entries
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect()
    }
}

/// Persistent duplex channel to the signaling relay for one user
#[derive(Clone)]
pub struct SignalingChannel {
    user_id: String,
    channel: DuplexChannel,
    handlers: Arc<HandlerTable>,
    messages: broadcast::Sender<SignalingMessage>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("user_id", &self.user_id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl SignalingChannel {
    /// Open the channel for `user_id` at `{base_url}/{user_id}` over WebSocket
    pub fn connect(base_url: &str, user_id: impl Into<String>) -> Self {
        Self::connect_with(
            Arc::new(WebSocketConnector::default()),
            base_url,
            user_id,
            ReconnectPolicy::default(),
        )
    }

    /// Open the channel with an explicit transport and reconnect policy
    pub fn connect_with(
        connector: Arc<dyn Connector>,
        base_url: &str,
        user_id: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        let user_id = user_id.into();
        let url = format!("{}/{}", base_url.trim_end_matches('/'), user_id);
        let (channel, inbound) = DuplexChannel::open("signaling", url, connector, policy);
        let handlers = Arc::new(HandlerTable::default());
        let (messages, _) = broadcast::channel(SUBSCRIBER_CAPACITY);

        tokio::spawn(dispatch(inbound, handlers.clone(), messages.clone()));

        Self {
            user_id,
            channel,
            handlers,
            messages,
        }
    }

    /// User this channel belongs to
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Send a message. Fails with `ChannelNotReady` unless open; nothing is queued.
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        let text = message
            .to_json()
            .map_err(|e| ConsultRtcError::InvalidMessage {
                message: message.kind().to_string(),
                source: e.into(),
            })?;
        self.channel.send_text(text)?;
        debug!(
            kind = %message.kind(),
            target = message.target_id().unwrap_or(""),
            "Sent signaling message"
        );
        Ok(())
    }

    /// Register a handler for one message type
    pub fn on<F>(&self, kind: MessageKind, handler: F) -> HandlerId
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entries
            .write()
            .push((id, kind, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut entries = self.handlers.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _, _)| *entry_id != id);
        entries.len() != before
    }

    /// Subscribe to every inbound message, in arrival order
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.messages.subscribe()
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

    /// Reset the backoff and reconnect, e.g. after the user logs in again
    pub fn reconnect(&self) -> Result<()> {
        self.channel.reconnect()
    }

    /// Wait until the channel is open
    pub async fn wait_until_open(&self) -> Result<()> {
        self.channel.wait_for_state(ChannelState::Open).await
    }

    /// Close the channel and release its tasks
    pub fn close(&self) {
        self.channel.close();
    }
}

async fn dispatch(
    mut inbound: mpsc::Receiver<String>,
    handlers: Arc<HandlerTable>,
    messages: broadcast::Sender<SignalingMessage>,
) {
    while let Some(text) = inbound.recv().await {
        let message = match serde_json::from_str::<SignalingMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparsable signaling frame: {}", e);
                continue;
            }
        };
        debug!(
            kind = %message.kind(),
            sender = message.sender_id().unwrap_or(""),
            "Received signaling message"
        );

        for handler in handlers.matching(message.kind()) {
            handler(&message);
        }
        let _ = messages.send(message);
    }
}
