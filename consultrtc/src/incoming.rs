//! Incoming call invitations

use consultrtc_core::{Result, SessionDescription};
use consultrtc_signaling::{SignalingChannel, SignalingMessage};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{info, warn};

/// Stream of `call-initiate` messages addressed to the local user
pub struct IncomingCalls {
    signaling: SignalingChannel,
    inbound: broadcast::Receiver<SignalingMessage>,
    queued: VecDeque<SignalingMessage>,
}

impl IncomingCalls {
    /// Start listening. Only offers received from now on are reported.
    pub fn new(signaling: SignalingChannel) -> Self {
        let inbound = signaling.subscribe();
        Self {
            signaling,
            inbound,
            queued: VecDeque::new(),
        }
    }

    async fn recv(&mut self) -> Option<SignalingMessage> {
        if let Some(message) = self.queued.pop_front() {
            return Some(message);
        }
        loop {
            match self.inbound.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Incoming call listener lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Receiver for an accepted call plus everything queued before it.
    /// The listener keeps its own position so later offers still arrive.
    fn fork(&mut self) -> (broadcast::Receiver<SignalingMessage>, VecDeque<SignalingMessage>) {
        let tail = self.inbound.resubscribe();
        loop {
            match self.inbound.try_recv() {
                Ok(message) => self.queued.push_back(message),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Incoming call listener lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        (tail, self.queued.clone())
    }

    /// Next invitation, or `None` once the signaling channel is gone
    pub async fn next(&mut self) -> Option<Invitation> {
        loop {
            if let SignalingMessage::CallInitiate {
                sender_id,
                consultation_id,
                offer,
                ..
            } = self.recv().await?
            {
                info!(caller = %sender_id, consultation_id = %consultation_id, "Incoming call");
                let (inbound, backlog) = self.fork();
                return Some(Invitation {
                    signaling: self.signaling.clone(),
                    caller_id: sender_id,
                    consultation_id,
                    offer,
                    inbound,
                    backlog,
                });
            }
        }
    }
}

impl fmt::Debug for IncomingCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCalls")
            .field("user_id", &self.signaling.user_id())
            .finish()
    }
}

/// A call offered to the local user
pub struct Invitation {
    signaling: SignalingChannel,
    caller_id: String,
    consultation_id: String,
    offer: SessionDescription,
    inbound: broadcast::Receiver<SignalingMessage>,
    backlog: VecDeque<SignalingMessage>,
}

impl Invitation {
    /// Calling user
    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// Consultation the call belongs to
    pub fn consultation_id(&self) -> &str {
        &self.consultation_id
    }

    /// The caller's offer
    pub fn offer(&self) -> &SessionDescription {
        &self.offer
    }

    /// Decline the call
    pub fn reject(self) -> Result<()> {
        info!(caller = %self.caller_id, "Rejecting call");
        self.signaling.send(&SignalingMessage::CallRejected {
            target_id: self.caller_id.clone(),
            sender_id: self.signaling.user_id().to_string(),
        })
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        String,
        SessionDescription,
        broadcast::Receiver<SignalingMessage>,
        VecDeque<SignalingMessage>,
    ) {
        (
            self.caller_id,
            self.consultation_id,
            self.offer,
            self.inbound,
            self.backlog,
        )
    }
}

impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invitation")
            .field("caller_id", &self.caller_id)
            .field("consultation_id", &self.consultation_id)
            .finish()
    }
}
