//! Listener state machine for the clustered signal bus.
//!
//! The clustered bus keeps one dedicated `LISTEN` connection to the
//! database. This module decides what that connection should do next;
//! the server crate performs the actual I/O. Transitions are pure, so the
//! reconnect policy is testable without a database.
//!
//! A notification may be lost while the connection is down, so every
//! successful reconnect emits [`ListenerAction::NotifyAll`] to wake every
//! local subscriber.

use std::time::Duration;

/// Listener state machine. No I/O, just transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Not listening and not trying to.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting {
        /// Failed attempts before this one.
        attempt: u32,
        /// Whether this attempt follows a lost or failed connection.
        recovering: bool,
    },
    /// Connected and receiving notifications.
    Listening,
    /// Waiting for the reconnect timer.
    Reconnecting {
        /// Number of consecutive failures so far.
        attempt: u32,
    },
}

impl ListenerState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(
        self,
        event: ListenerEvent,
        policy: &BackoffPolicy,
    ) -> (Self, Vec<ListenerAction>) {
        match (self, event) {
            (Self::Disconnected, ListenerEvent::StartRequested) => (
                Self::Connecting {
                    attempt: 0,
                    recovering: false,
                },
                vec![ListenerAction::Connect],
            ),

            (Self::Connecting { recovering, .. }, ListenerEvent::ConnectSucceeded) => {
                let actions = if recovering {
                    vec![ListenerAction::NotifyAll]
                } else {
                    vec![]
                };
                (Self::Listening, actions)
            }
            (Self::Connecting { attempt, .. }, ListenerEvent::ConnectFailed { .. }) => {
                let next = attempt.saturating_add(1);
                (
                    Self::Reconnecting { attempt: next },
                    vec![ListenerAction::StartReconnectTimer {
                        delay: policy.delay(next),
                    }],
                )
            }

            (Self::Listening, ListenerEvent::IdleTimeout) => {
                (Self::Listening, vec![ListenerAction::Ping])
            }
            (Self::Listening, ListenerEvent::ConnectionLost { .. })
            | (Self::Listening, ListenerEvent::PingFailed { .. }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    ListenerAction::Close,
                    ListenerAction::StartReconnectTimer {
                        delay: policy.delay(1),
                    },
                ],
            ),

            (Self::Reconnecting { attempt }, ListenerEvent::ReconnectTimer) => (
                Self::Connecting {
                    attempt,
                    recovering: true,
                },
                vec![ListenerAction::Connect],
            ),

            (Self::Disconnected, ListenerEvent::StopRequested) => (Self::Disconnected, vec![]),
            (_, ListenerEvent::StopRequested) => (Self::Disconnected, vec![ListenerAction::Close]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently receiving notifications.
    pub fn is_listening(&self) -> bool {
        matches!(self, Self::Listening)
    }
}

impl Default for ListenerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that drive the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The bus was started.
    StartRequested,
    /// The listen connection is up and subscribed.
    ConnectSucceeded,
    /// Opening the listen connection failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The listen connection dropped.
    ConnectionLost {
        /// Error message describing the failure.
        error: String,
    },
    /// No notification arrived within the idle window.
    IdleTimeout,
    /// The keepalive ping failed.
    PingFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Reconnect timer fired.
    ReconnectTimer,
    /// The bus is shutting down.
    StopRequested,
}

/// Actions the listener driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    /// Open the listen connection and subscribe to the channel.
    Connect,
    /// Send a keepalive query on the listen connection.
    Ping,
    /// Wake every local subscription.
    NotifyAll,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Drop the listen connection.
    Close,
}

/// Exponential reconnect backoff with bounded jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub min: Duration,
    /// Upper bound for the exponential part.
    pub max: Duration,
}

impl BackoffPolicy {
    /// Create a policy.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Formula: min(max, min * 2^(attempt-1)) + random(0..=min/4)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.min.saturating_mul(1u32 << exponent).min(self.max);
        let jitter_bound = (self.min.as_millis() / 4) as u64;
        base + Duration::from_millis(random_jitter_ms(jitter_bound))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60))
    }
}

/// Random value in `0..=bound`. Falls back to no jitter if the OS RNG fails.
fn random_jitter_ms(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes) % (bound + 1)
}
