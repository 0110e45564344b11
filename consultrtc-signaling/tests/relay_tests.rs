//! Relay integration tests
//!
//! A real relay runs on a loopback port and clients connect over
//! WebSocket, verifying:
//! - signaling frames reach their target verbatim
//! - the sender receives a `message-ack`
//! - notifications are stamped and delivered to the receiver
//! - a normal server close leaves the client disconnected

use consultrtc_core::{ChannelState, ReconnectPolicy, SessionDescription};
use consultrtc_signaling::{
    MessageKind, NotificationBus, NotificationEvent, NotificationType, RelayHandle, RelayServer,
    SignalingChannel, SignalingMessage, WebSocketConnector,
};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> RelayHandle {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    let server = RelayServer::bind(addr).await.unwrap();
    let (handle, _task) = server.spawn().unwrap();
    handle
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("timed out")
}

async fn wait_registered(relay: &RelayHandle, user: &str) {
    within(async {
        while !relay.is_signaling_connected(user) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_call_initiate_forwarded_and_acked() {
    let relay = start_relay().await;
    let patient = SignalingChannel::connect(&relay.signaling_url(), "patient1");
    let doctor = SignalingChannel::connect(&relay.signaling_url(), "doc1");
    let mut patient_inbound = patient.subscribe();
    let mut doctor_inbound = doctor.subscribe();

    assert_ok!(within(patient.wait_until_open()).await);
    assert_ok!(within(doctor.wait_until_open()).await);
    wait_registered(&relay, "doc1").await;

    let offer = SignalingMessage::CallInitiate {
        target_id: "doc1".to_string(),
        sender_id: "patient1".to_string(),
        consultation_id: "c100".to_string(),
        offer: SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n"),
    };
    assert_ok!(patient.send(&offer));

    let received = within(doctor_inbound.recv()).await.unwrap();
    assert_eq!(received, offer);

    let ack = within(patient_inbound.recv()).await.unwrap();
    assert_eq!(
        ack,
        SignalingMessage::MessageAck {
            original_type: "call-initiate".to_string(),
            status: "delivered".to_string(),
            to: "doc1".to_string(),
        }
    );

    patient.close();
    doctor.close();
}

#[tokio::test]
async fn test_offline_target_gets_no_ack() {
    let relay = start_relay().await;
    let patient = SignalingChannel::connect(&relay.signaling_url(), "patient2");
    let mut inbound = patient.subscribe();
    assert_ok!(within(patient.wait_until_open()).await);

    assert_ok!(patient.send(&SignalingMessage::call_end("patient2", "nobody")));
    let nothing = timeout(Duration::from_millis(300), inbound.recv()).await;
    assert!(nothing.is_err());
    patient.close();
}

#[tokio::test]
async fn test_handlers_see_forwarded_answer() {
    let relay = start_relay().await;
    let patient = SignalingChannel::connect(&relay.signaling_url(), "patient3");
    let doctor = SignalingChannel::connect(&relay.signaling_url(), "doc3");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    patient.on(MessageKind::CallAnswer, move |message| {
        let _ = tx.send(message.clone());
    });

    assert_ok!(within(patient.wait_until_open()).await);
    assert_ok!(within(doctor.wait_until_open()).await);
    wait_registered(&relay, "patient3").await;

    assert_ok!(doctor.send(&SignalingMessage::CallAnswer {
        target_id: "patient3".to_string(),
        sender_id: "doc3".to_string(),
        answer: SessionDescription::answer("v=0"),
    }));
    let answer = within(rx.recv()).await.unwrap();
    assert_eq!(answer.sender_id(), Some("doc3"));

    patient.close();
    doctor.close();
}

#[tokio::test]
async fn test_notification_delivery() {
    let relay = start_relay().await;
    let sender = NotificationBus::connect(&relay.notification_url(), "doc4");
    let receiver = NotificationBus::connect(&relay.notification_url(), "patient4");
    let mut events = receiver.subscribe();

    assert_ok!(within(sender.wait_until_open()).await);
    assert_ok!(within(receiver.wait_until_open()).await);
    within(async {
        while !relay.is_notification_connected("patient4") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert_ok!(sender.send_notification(
        "patient4",
        "Your appointment is confirmed",
        NotificationType::Appointment
    ));

    let notification = match within(events.recv()).await.unwrap() {
        NotificationEvent::Received(notification) => notification,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(notification.sender_id.as_deref(), Some("doc4"));
    assert_eq!(notification.notification_type, NotificationType::Appointment);
    assert!(!notification.id.starts_with("local-"));
    assert_eq!(receiver.unread_count(), 1);

    receiver.mark_as_read(&notification.id);
    receiver.mark_as_read(&notification.id);
    assert_eq!(receiver.unread_count(), 0);

    receiver.clear_on_logout();
    assert!(receiver.notifications().is_empty());
    assert_eq!(receiver.state(), ChannelState::Closed);
    assert!(receiver
        .send_notification("doc4", "hello", NotificationType::Message)
        .is_err());
    sender.close();
}

#[tokio::test]
async fn test_server_normal_close_leaves_channel_disconnected() {
    let relay = start_relay().await;
    let channel = SignalingChannel::connect_with(
        Arc::new(WebSocketConnector::default()),
        &relay.signaling_url(),
        "patient5",
        ReconnectPolicy::default(),
    );
    assert_ok!(within(channel.wait_until_open()).await);
    wait_registered(&relay, "patient5").await;

    relay.disconnect_user("patient5");
    assert_ok!(within(channel.channel().wait_for_state(ChannelState::Disconnected)).await);
    assert_eq!(channel.connection_status(), "disconnected");

    assert_ok!(channel.reconnect());
    assert_ok!(within(channel.wait_until_open()).await);
    channel.close();
}
