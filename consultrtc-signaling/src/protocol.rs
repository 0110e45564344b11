//! Signaling and notification wire protocol
//!
//! Both channels carry JSON text frames tagged by a `type` field. Call
//! control uses kebab-case types with camelCase ids (except
//! `consultation_id`); notifications use snake_case fields.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use consultrtc_core::{IceCandidate, SessionDescription};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Call-control messages exchanged through the signaling relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Caller offers a call
    #[serde(rename_all = "camelCase")]
    CallInitiate {
        /// Party being called
        #[serde(deserialize_with = "de_id")]
        target_id: String,
        /// Calling party
        #[serde(deserialize_with = "de_id")]
        sender_id: String,
        /// Consultation the call belongs to
        #[serde(rename = "consultation_id", deserialize_with = "de_id")]
        consultation_id: String,
        /// SDP offer
        offer: SessionDescription,
    },
    /// Callee answers the offer
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        /// Calling party
        #[serde(deserialize_with = "de_id")]
        target_id: String,
        /// Answering party
        #[serde(deserialize_with = "de_id")]
        sender_id: String,
        /// SDP answer
        answer: SessionDescription,
    },
    /// Trickled ICE candidate
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Receiving party
        #[serde(deserialize_with = "de_id")]
        target_id: String,
        /// Sending party
        #[serde(deserialize_with = "de_id")]
        sender_id: String,
        /// The candidate
        candidate: IceCandidate,
    },
    /// Either party hangs up
    #[serde(rename_all = "camelCase")]
    CallEnd {
        /// Receiving party (the relay strips it when forwarding)
        #[serde(default, deserialize_with = "de_id")]
        target_id: String,
        /// Party hanging up
        #[serde(deserialize_with = "de_id")]
        sender_id: String,
        /// Role of the party hanging up, e.g. `user` or `doctor`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    /// Callee declines the call
    #[serde(rename_all = "camelCase")]
    CallRejected {
        /// Calling party
        #[serde(deserialize_with = "de_id")]
        target_id: String,
        /// Declining party
        #[serde(deserialize_with = "de_id")]
        sender_id: String,
    },
    /// Relay confirms a forwarded message reached its target
    #[serde(rename_all = "camelCase")]
    MessageAck {
        /// `type` of the acknowledged message
        original_type: String,
        /// Delivery status, `delivered` on success
        status: String,
        /// Target the message was forwarded to
        #[serde(deserialize_with = "de_id")]
        to: String,
    },
}

/// Discriminant of a [`SignalingMessage`], used to register handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `call-initiate`
    CallInitiate,
    /// `call-answer`
    CallAnswer,
    /// `ice-candidate`
    IceCandidate,
    /// `call-end`
    CallEnd,
    /// `call-rejected`
    CallRejected,
    /// `message-ack`
    MessageAck,
}

impl MessageKind {
    /// Wire name of the message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::CallInitiate => "call-initiate",
            MessageKind::CallAnswer => "call-answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::CallEnd => "call-end",
            MessageKind::CallRejected => "call-rejected",
            MessageKind::MessageAck => "message-ack",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalingMessage {
    /// Message type
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::CallInitiate { .. } => MessageKind::CallInitiate,
            SignalingMessage::CallAnswer { .. } => MessageKind::CallAnswer,
            SignalingMessage::IceCandidate { .. } => MessageKind::IceCandidate,
            SignalingMessage::CallEnd { .. } => MessageKind::CallEnd,
            SignalingMessage::CallRejected { .. } => MessageKind::CallRejected,
            SignalingMessage::MessageAck { .. } => MessageKind::MessageAck,
        }
    }

    /// Originating party, `None` for relay-generated messages
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::CallInitiate { sender_id, .. }
            | SignalingMessage::CallAnswer { sender_id, .. }
            | SignalingMessage::IceCandidate { sender_id, .. }
            | SignalingMessage::CallEnd { sender_id, .. }
            | SignalingMessage::CallRejected { sender_id, .. } => Some(sender_id),
            SignalingMessage::MessageAck { .. } => None,
        }
    }

    /// Party the relay should deliver to, `None` when absent
    pub fn target_id(&self) -> Option<&str> {
        let target = match self {
            SignalingMessage::CallInitiate { target_id, .. }
            | SignalingMessage::CallAnswer { target_id, .. }
            | SignalingMessage::IceCandidate { target_id, .. }
            | SignalingMessage::CallEnd { target_id, .. }
            | SignalingMessage::CallRejected { target_id, .. } => target_id.as_str(),
            SignalingMessage::MessageAck { to, .. } => to.as_str(),
        };
        if target.is_empty() {
            None
        } else {
            Some(target)
        }
    }

    /// Build a `call-end`
    pub fn call_end(sender_id: &str, target_id: &str) -> Self {
        SignalingMessage::CallEnd {
            target_id: target_id.to_string(),
            sender_id: sender_id.to_string(),
            sender: None,
        }
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Notification category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    /// Chat or direct message
    Message,
    /// Appointment booked or changed
    Appointment,
    /// Upcoming appointment reminder
    Reminder,
    /// System announcement
    System,
}

/// Notification body, shared by inbound and outbound frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Server-issued id, when the server provides one
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    /// Sender, set by the relay on delivery
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_id")]
    pub sender_id: Option<String>,
    /// Recipient, set by the client on send
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_id")]
    pub receiver_id: Option<String>,
    /// Category
    pub notification_type: NotificationType,
    /// Text shown to the user
    pub message: String,
    /// Creation time
    #[serde(default = "Utc::now", deserialize_with = "de_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Frames carried by the notification channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationFrame {
    /// A notification
    Notification(NotificationPayload),
    /// Keepalive probe
    Ping,
    /// Keepalive reply
    Pong,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(i64),
}

impl From<IdRepr> for String {
    fn from(id: IdRepr) -> Self {
        match id {
            IdRepr::Text(text) => text,
            IdRepr::Number(n) => n.to_string(),
        }
    }
}

// Ids arrive as strings from native clients and as numbers from the web client
fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdRepr::deserialize(deserializer).map(String::from)
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(String::from))
}

// RFC 3339, or a naive ISO-8601 timestamp taken as UTC
fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_call_initiate_wire_shape() {
        let message = SignalingMessage::CallInitiate {
            target_id: "doc1".to_string(),
            sender_id: "patient1".to_string(),
            consultation_id: "c100".to_string(),
            offer: SessionDescription::offer("v=0"),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "call-initiate");
        assert_eq!(json["targetId"], "doc1");
        assert_eq!(json["senderId"], "patient1");
        assert_eq!(json["consultation_id"], "c100");
        assert_eq!(json["offer"]["type"], "offer");
        assert_eq!(json["offer"]["sdp"], "v=0");
    }

    #[test]
    fn test_numeric_ids_accepted() {
        let raw = r#"{"type":"call-answer","targetId":42,"senderId":"7","answer":{"type":"answer","sdp":"v=0"}}"#;
        let message: SignalingMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.kind(), MessageKind::CallAnswer);
        assert_eq!(message.target_id(), Some("42"));
        assert_eq!(message.sender_id(), Some("7"));
    }

    #[test]
    fn test_forwarded_call_end_without_target() {
        let raw = r#"{"type":"call-end","senderId":"doc1","sender":"doctor"}"#;
        let message: SignalingMessage = serde_json::from_str(raw).unwrap();
        match &message {
            SignalingMessage::CallEnd { sender, .. } => {
                assert_eq!(sender.as_deref(), Some("doctor"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(message.target_id(), None);
        assert_eq!(message.sender_id(), Some("doc1"));
    }

    #[test]
    fn test_message_ack() {
        let raw = r#"{"type":"message-ack","originalType":"call-initiate","status":"delivered","to":"doc1"}"#;
        let message: SignalingMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            message,
            SignalingMessage::MessageAck {
                original_type: "call-initiate".to_string(),
                status: "delivered".to_string(),
                to: "doc1".to_string(),
            }
        );
        assert_eq!(message.sender_id(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"screen-share","targetId":"a","senderId":"b"}"#;
        assert!(serde_json::from_str::<SignalingMessage>(raw).is_err());
    }

    #[test]
    fn test_inbound_notification_naive_timestamp() {
        let raw = r#"{"type":"notification","sender_id":12,"notification_type":"appointment","message":"Booked","timestamp":"2024-05-01T09:30:00.123456"}"#;
        let frame: NotificationFrame = serde_json::from_str(raw).unwrap();
        match frame {
            NotificationFrame::Notification(payload) => {
                assert_eq!(payload.sender_id.as_deref(), Some("12"));
                assert_eq!(payload.notification_type, NotificationType::Appointment);
                assert_eq!(payload.timestamp.hour(), 9);
                assert!(payload.id.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_frames() {
        assert_eq!(
            serde_json::to_string(&NotificationFrame::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
        let pong: NotificationFrame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, NotificationFrame::Pong);
    }
}
