//! Relay server
//!
//! Routes `/ws/create_signaling/{user_id}` and `/ws/notifications/{user_id}`.
//! Signaling frames are forwarded verbatim to their `targetId` and the
//! sender receives a `message-ack`. Notifications are stamped with a server
//! id, the sender and the delivery time before being pushed to the receiver.

use crate::protocol::{NotificationFrame, NotificationPayload};
use chrono::Utc;
use consultrtc_core::{ConsultRtcError, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SIGNALING_PREFIX: &str = "/ws/create_signaling/";
const NOTIFICATION_PREFIX: &str = "/ws/notifications/";

/// Which relay a connection joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Call-control relay
    Signaling(String),
    /// Notification relay
    Notifications(String),
}

impl Route {
    /// Parse a request path
    pub fn parse(path: &str) -> Option<Route> {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        if let Some(user) = path.strip_prefix(SIGNALING_PREFIX) {
            return valid_user(user).map(Route::Signaling);
        }
        if let Some(user) = path.strip_prefix(NOTIFICATION_PREFIX) {
            return valid_user(user).map(Route::Notifications);
        }
        None
    }
}

fn valid_user(user: &str) -> Option<String> {
    if user.is_empty() || user.contains('/') {
        None
    } else {
        Some(user.to_string())
    }
}

struct Peer {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RelayState {
    signaling: DashMap<String, Peer>,
    notifications: DashMap<String, Peer>,
}

impl RelayState {
    fn table(&self, route: &Route) -> &DashMap<String, Peer> {
        match route {
            Route::Signaling(_) => &self.signaling,
            Route::Notifications(_) => &self.notifications,
        }
    }
}

/// WebSocket relay for signaling and notifications
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

/// Handle to a running relay
#[derive(Clone)]
pub struct RelayHandle {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the relay to `addr`; port 0 picks a free port
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConsultRtcError::ServerStartFailed {
                address: addr,
                source: e.into(),
            })?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState::default()),
        })
    }

    /// Address the relay listens on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ConsultRtcError::ServerStartFailed {
                address: SocketAddr::from(([0, 0, 0, 0], 0)),
                source: e.into(),
            })
    }

    /// Run the accept loop on a background task
    pub fn spawn(self) -> Result<(RelayHandle, JoinHandle<()>)> {
        let handle = RelayHandle {
            local_addr: self.local_addr()?,
            state: self.state.clone(),
        };
        let task = tokio::spawn(self.run());
        Ok((handle, task))
    }

    /// Accept connections until the task is aborted
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Relay listening on {}", addr);
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    tokio::spawn(handle_connection(self.state.clone(), stream));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

impl RelayHandle {
    /// Address the relay listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL for signaling channels
    pub fn signaling_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, SIGNALING_PREFIX.trim_end_matches('/'))
    }

    /// Base URL for notification channels
    pub fn notification_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, NOTIFICATION_PREFIX.trim_end_matches('/'))
    }

    /// Whether `user_id` has an open signaling connection
    pub fn is_signaling_connected(&self, user_id: &str) -> bool {
        self.state.signaling.contains_key(user_id)
    }

    /// Whether `user_id` has an open notification connection
    pub fn is_notification_connected(&self, user_id: &str) -> bool {
        self.state.notifications.contains_key(user_id)
    }

    /// Close every connection of `user_id` with a normal close frame
    pub fn disconnect_user(&self, user_id: &str) {
        for table in [&self.state.signaling, &self.state.notifications] {
            if let Some(peer) = table.get(user_id) {
                let _ = peer.sender.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Cow::Borrowed("server closed"),
                })));
            }
        }
    }
}

async fn handle_connection(state: Arc<RelayState>, stream: TcpStream) {
    let mut route = None;
    let callback = |request: &Request, response: Response| {
        match Route::parse(request.uri().path()) {
            Some(parsed) => {
                route = Some(parsed);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("unknown route".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let Some(route) = route else {
        return;
    };

    let (mut sink, mut source) = ws_stream.split();
    let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();
    let connection_id = Uuid::new_v4();
    let user_id = match &route {
        Route::Signaling(user) | Route::Notifications(user) => user.clone(),
    };

    // A newer connection for the same user replaces the older one
    state.table(&route).insert(
        user_id.clone(),
        Peer {
            connection_id,
            sender: sender.clone(),
        },
    );
    info!(user_id = %user_id, route = ?route, "Peer connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match &route {
                Route::Signaling(_) => relay_signaling(&state, &user_id, &sender, &text),
                Route::Notifications(_) => relay_notification(&state, &user_id, &sender, &text),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(user_id = %user_id, "Connection error: {}", e);
                break;
            }
        }
    }

    state
        .table(&route)
        .remove_if(&user_id, |_, peer| peer.connection_id == connection_id);
    writer.abort();
    info!(user_id = %user_id, route = ?route, "Peer disconnected");
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn relay_signaling(
    state: &RelayState,
    user_id: &str,
    reply: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(user_id = %user_id, "Invalid signaling frame: {}", e);
            return;
        }
    };
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let Some(target) = value.get("targetId").and_then(id_value) else {
        warn!(user_id = %user_id, message_type = %message_type, "Signaling frame without targetId");
        return;
    };

    let delivered = match state.signaling.get(&target) {
        Some(peer) => peer.sender.send(Message::Text(text.to_string())).is_ok(),
        None => false,
    };

    if delivered {
        debug!(from = %user_id, to = %target, message_type = %message_type, "Forwarded");
        let ack = json!({
            "type": "message-ack",
            "originalType": message_type,
            "status": "delivered",
            "to": target,
        });
        let _ = reply.send(Message::Text(ack.to_string()));
    } else {
        warn!(from = %user_id, to = %target, message_type = %message_type, "Target not connected");
    }
}

fn relay_notification(
    state: &RelayState,
    user_id: &str,
    reply: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let frame = match serde_json::from_str::<NotificationFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(user_id = %user_id, "Invalid notification frame: {}", e);
            return;
        }
    };

    match frame {
        NotificationFrame::Ping => {
            if let Ok(pong) = serde_json::to_string(&NotificationFrame::Pong) {
                let _ = reply.send(Message::Text(pong));
            }
        }
        NotificationFrame::Pong => {}
        NotificationFrame::Notification(payload) => {
            let Some(receiver) = payload.receiver_id.clone() else {
                warn!(user_id = %user_id, "Notification without receiver_id");
                return;
            };
            let delivery = NotificationFrame::Notification(NotificationPayload {
                id: Some(Uuid::new_v4().to_string()),
                sender_id: Some(user_id.to_string()),
                receiver_id: None,
                notification_type: payload.notification_type,
                message: payload.message,
                timestamp: Utc::now(),
            });
            let Ok(text) = serde_json::to_string(&delivery) else {
                return;
            };
            match state.notifications.get(&receiver) {
                Some(peer) => {
                    let _ = peer.sender.send(Message::Text(text));
                    debug!(from = %user_id, to = %receiver, "Notification delivered");
                }
                None => debug!(from = %user_id, to = %receiver, "Receiver offline, dropped"),
            }
        }
    }
}
