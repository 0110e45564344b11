//! Reconnect discipline shared by the signaling and notification channels
//!
//! A channel that closes unexpectedly re-enters [`ChannelState::Connecting`]
//! and waits `min(2^attempt, cap)` seconds before the next attempt. The
//! attempt counter resets when the channel opens. Once `max_attempts`
//! reconnects have failed the channel stays [`ChannelState::Disconnected`]
//! until its owner explicitly asks it to reconnect.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Exponential backoff policy for channel reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Base unit that is doubled per attempt
    pub base: Duration,
    /// Upper bound for a single delay
    pub cap: Duration,
    /// Maximum number of reconnect attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Returns `None` when `attempt` exceeds `max_attempts`, meaning no
    /// further attempt is scheduled.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor);
        Some(delay.min(self.cap))
    }

    /// All delays this policy will ever schedule, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .filter_map(|attempt| self.delay_for(attempt))
            .collect()
    }
}

/// Tracks the attempt counter of a reconnecting channel
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Create a fresh counter for `policy`
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advance to the next attempt, returning its number and delay.
    /// `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        let next = self.attempt + 1;
        let delay = self.policy.delay_for(next)?;
        self.attempt = next;
        Some((next, delay))
    }

    /// Reset after a successful open or an explicit reconnect request
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Policy in use
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

/// Lifecycle state of a duplex channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Connecting, or waiting out a backoff delay before the next attempt
    Connecting,
    /// Open and able to send
    Open,
    /// Gave up (or closed normally by the server); waits for an explicit reconnect
    Disconnected,
    /// Closed by the owner, terminal
    Closed,
}

impl ChannelState {
    /// Connection status string as shown to the user
    pub fn connection_status(&self) -> &'static str {
        match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "connected",
            ChannelState::Disconnected | ChannelState::Closed => "disconnected",
        }
    }

    /// Whether a send would be accepted
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Disconnected => "disconnected",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = ReconnectPolicy::default();
        let secs: Vec<u64> = policy.schedule().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32]);
        assert_eq!(policy.delay_for(6), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_cap_applies() {
        let policy = ReconnectPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: 8,
        };
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for(8), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_backoff_resets() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        assert_eq!(backoff.next_delay(), Some((1, Duration::from_secs(2))));
        assert_eq!(backoff.next_delay(), Some((2, Duration::from_secs(4))));
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some((1, Duration::from_secs(2))));
    }

    #[test]
    fn test_backoff_exhausts() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        for _ in 0..5 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_connection_status_strings() {
        assert_eq!(ChannelState::Connecting.connection_status(), "connecting");
        assert_eq!(ChannelState::Open.connection_status(), "connected");
        assert_eq!(ChannelState::Disconnected.connection_status(), "disconnected");
        assert_eq!(ChannelState::Closed.connection_status(), "disconnected");
    }
}
