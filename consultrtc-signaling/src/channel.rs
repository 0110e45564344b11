//! Reconnecting duplex text channel
//!
//! A [`DuplexChannel`] owns one logical connection to a relay. A driver task
//! connects through a [`Connector`], pumps inbound frames to a single
//! consumer in arrival order and re-enters [`ChannelState::Connecting`]
//! after unexpected loss, following the [`ReconnectPolicy`]. Sends never
//! queue: they fail with [`ConsultRtcError::ChannelNotReady`] unless the
//! channel is open.

use async_trait::async_trait;
use consultrtc_core::{Backoff, ChannelState, ConsultRtcError, ReconnectPolicy, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
};
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 32;

/// Event produced by an established transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame
    Text(String),
    /// The transport closed; `normal` when the peer sent close code 1000
    Closed {
        /// Whether the close was a normal closure
        normal: bool,
    },
}

/// An established transport: an outbound text sender and an inbound event stream.
///
/// Dropping `outbound` closes the transport.
#[derive(Debug)]
pub struct Connection {
    /// Text frames to write
    pub outbound: mpsc::Sender<String>,
    /// Frames read from the peer, ending with [`TransportEvent::Closed`]
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens transports to a relay URL
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open one transport to `url`
    async fn connect(&self, url: &str) -> Result<Connection>;
}

/// WebSocket transport built on tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector with the given handshake timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        let connect_error = |reason: String| ConsultRtcError::ChannelConnect {
            channel: "websocket".to_string(),
            url: url.to_string(),
            reason,
        };

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| connect_error(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let normal = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.code == CloseCode::Normal).unwrap_or(false);
                    }
                    Some(Ok(_)) => {
                        // Binary and control frames are not part of the protocol
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket read failed: {}", e);
                        break false;
                    }
                    None => break false,
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed { normal }).await;
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Lifecycle events of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel opened
    Opened,
    /// A reconnect attempt is scheduled after `delay`
    ReconnectScheduled {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// The server closed the channel normally; no reconnect follows
    ClosedByServer,
    /// Reconnect attempts are exhausted
    GaveUp {
        /// Attempts made
        attempts: u32,
    },
    /// The owner closed the channel
    Closed,
}

#[derive(Debug)]
enum Control {
    Reconnect,
    Close,
}

enum PumpOutcome {
    CloseRequested,
    Lost { normal: bool },
}

enum WaitOutcome {
    Retry,
    Close,
}

struct Shared {
    name: String,
    url: String,
    state: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl Shared {
    fn set_state(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            // Closed is terminal
            if *current == ChannelState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == ChannelState::Closed
    }
}

/// Reconnecting duplex text channel
#[derive(Clone)]
pub struct DuplexChannel {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("name", &self.shared.name)
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

impl DuplexChannel {
    /// Start connecting to `url`.
    ///
    /// Returns the channel handle and the receiver of inbound text frames,
    /// in arrival order. Must be called inside a tokio runtime.
    pub fn open(
        name: impl Into<String>,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<String>) {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let shared = Arc::new(Shared {
            name: name.into(),
            url: url.into(),
            state: state_tx,
            outbound: Mutex::new(None),
            events: events_tx,
        });

        tokio::spawn(drive(
            shared.clone(),
            connector,
            Backoff::new(policy),
            control_rx,
            inbound_tx,
        ));

        (
            Self {
                shared,
                control: control_tx,
            },
            inbound_rx,
        )
    }

    /// Channel name used in logs and errors
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Relay URL
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Watch state changes
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Send a text frame. Fails unless the channel is open.
    pub fn send_text(&self, text: String) -> Result<()> {
        let state = self.state();
        let sender = self.shared.outbound.lock().clone();
        match sender {
            Some(sender) if state.is_open() => {
                sender.try_send(text).map_err(|e| ConsultRtcError::ChannelNotReady {
                    channel: self.shared.name.clone(),
                    state: format!("{} ({})", state, e),
                })
            }
            _ => Err(ConsultRtcError::ChannelNotReady {
                channel: self.shared.name.clone(),
                state: state.to_string(),
            }),
        }
    }

    /// Reset the attempt counter and reconnect now. No-op while open.
    pub fn reconnect(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ConsultRtcError::ChannelClosed {
                channel: self.shared.name.clone(),
            });
        }
        self.control
            .send(Control::Reconnect)
            .map_err(|_| ConsultRtcError::ChannelClosed {
                channel: self.shared.name.clone(),
            })
    }

    /// Close the channel. Idempotent; later sends fail.
    pub fn close(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.outbound.lock().take();
        self.shared.set_state(ChannelState::Closed);
        let _ = self.control.send(Control::Close);
    }

    /// Wait until the channel reaches `state`
    pub async fn wait_for_state(&self, state: ChannelState) -> Result<()> {
        let mut watch = self.state_watch();
        watch
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| ConsultRtcError::ChannelClosed {
                channel: self.shared.name.clone(),
            })
    }
}

async fn drive(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    mut backoff: Backoff,
    mut control: mpsc::UnboundedReceiver<Control>,
    inbound: mpsc::Sender<String>,
) {
    loop {
        if shared.is_closed() {
            break;
        }
        shared.set_state(ChannelState::Connecting);
        debug!(channel = %shared.name, url = %shared.url, "Connecting");

        let connected = tokio::select! {
            biased;
            ctrl = control.recv() => match ctrl {
                Some(Control::Reconnect) => {
                    backoff.reset();
                    continue;
                }
                Some(Control::Close) | None => break,
            },
            result = connector.connect(&shared.url) => result,
        };

        match connected {
            Ok(mut connection) => {
                backoff.reset();
                *shared.outbound.lock() = Some(connection.outbound.clone());
                if shared.is_closed() {
                    shared.outbound.lock().take();
                    break;
                }
                shared.set_state(ChannelState::Open);
                shared.emit(ChannelEvent::Opened);
                info!(channel = %shared.name, "Channel open");

                let outcome = pump(&shared, &mut connection, &mut control, &inbound).await;
                shared.outbound.lock().take();

                match outcome {
                    PumpOutcome::CloseRequested => break,
                    PumpOutcome::Lost { normal: true } => {
                        info!(channel = %shared.name, "Channel closed by server");
                        shared.set_state(ChannelState::Disconnected);
                        shared.emit(ChannelEvent::ClosedByServer);
                        match wait_for_reconnect(&mut control).await {
                            WaitOutcome::Retry => {
                                backoff.reset();
                                continue;
                            }
                            WaitOutcome::Close => break,
                        }
                    }
                    PumpOutcome::Lost { normal: false } => {
                        warn!(channel = %shared.name, "Channel lost unexpectedly");
                    }
                }
            }
            Err(e) => {
                warn!(channel = %shared.name, "Connect failed: {}", e);
            }
        }

        match backoff.next_delay() {
            Some((attempt, delay)) => {
                shared.set_state(ChannelState::Connecting);
                shared.emit(ChannelEvent::ReconnectScheduled { attempt, delay });
                info!(
                    channel = %shared.name,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Reconnect scheduled"
                );
                tokio::select! {
                    biased;
                    ctrl = control.recv() => match ctrl {
                        Some(Control::Reconnect) => backoff.reset(),
                        Some(Control::Close) | None => break,
                    },
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                let attempts = backoff.attempts();
                warn!(channel = %shared.name, attempts, "Reconnect attempts exhausted");
                shared.set_state(ChannelState::Disconnected);
                shared.emit(ChannelEvent::GaveUp { attempts });
                match wait_for_reconnect(&mut control).await {
                    WaitOutcome::Retry => backoff.reset(),
                    WaitOutcome::Close => break,
                }
            }
        }
    }

    shared.outbound.lock().take();
    shared.set_state(ChannelState::Closed);
    shared.emit(ChannelEvent::Closed);
    info!(channel = %shared.name, "Channel closed");
}

async fn pump(
    shared: &Shared,
    connection: &mut Connection,
    control: &mut mpsc::UnboundedReceiver<Control>,
    inbound: &mpsc::Sender<String>,
) -> PumpOutcome {
    loop {
        tokio::select! {
            biased;
            ctrl = control.recv() => match ctrl {
                Some(Control::Reconnect) => {
                    debug!(channel = %shared.name, "Reconnect ignored, channel is open");
                }
                Some(Control::Close) | None => return PumpOutcome::CloseRequested,
            },
            event = connection.inbound.recv() => match event {
                Some(TransportEvent::Text(text)) => {
                    if inbound.send(text).await.is_err() {
                        return PumpOutcome::CloseRequested;
                    }
                }
                Some(TransportEvent::Closed { normal }) => return PumpOutcome::Lost { normal },
                None => return PumpOutcome::Lost { normal: false },
            },
        }
    }
}

async fn wait_for_reconnect(control: &mut mpsc::UnboundedReceiver<Control>) -> WaitOutcome {
    match control.recv().await {
        Some(Control::Reconnect) => WaitOutcome::Retry,
        Some(Control::Close) | None => WaitOutcome::Close,
    }
}
