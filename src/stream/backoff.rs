//! Reconnect policy and the connection state machine.
//!
//! The runtime loop in `pipeline` never touches the attempt counter directly; it feeds
//! [`ConnectionEvent`]s into [`ConnectionMachine::apply`] and sleeps for whatever delay comes back.

use crate::stream::types::{
    ConnectionState, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_ATTEMPT, DEFAULT_BACKOFF_MAX_MS,
};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempt: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            max_delay_ms: DEFAULT_BACKOFF_MAX_MS,
            max_attempt: DEFAULT_BACKOFF_MAX_ATTEMPT,
        }
    }
}

impl BackoffPolicy {
    /// `min(max_delay, base * 2^attempt)`, saturating instead of overflowing.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectStarted,
    Opened,
    /// Connect refused, transport error or remote close.
    Failed,
    Disposed,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    policy: BackoffPolicy,
    live: bool,
}

impl ConnectionMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            policy,
            live: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Applies one event and returns the new state, or `None` when the event is ignored.
    ///
    /// After `Disposed` every event is ignored.
    pub fn apply(&mut self, event: ConnectionEvent) -> Option<ConnectionState> {
        if !self.live {
            return None;
        }

        let next = match (self.state, event) {
            (_, ConnectionEvent::Disposed) => {
                self.live = false;
                ConnectionState::Closed
            }
            (
                ConnectionState::Idle | ConnectionState::Reconnecting { .. },
                ConnectionEvent::ConnectStarted,
            ) => ConnectionState::Connecting,
            (ConnectionState::Connecting, ConnectionEvent::Opened) => {
                self.attempt = 0;
                ConnectionState::Open
            }
            (ConnectionState::Connecting | ConnectionState::Open, ConnectionEvent::Failed) => {
                self.attempt = self.attempt.saturating_add(1).min(self.policy.max_attempt);
                ConnectionState::Reconnecting {
                    attempt: self.attempt,
                    delay_ms: self.policy.delay_ms(self.attempt),
                }
            }
            _ => return None,
        };

        self.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_the_cap() {
        let policy = BackoffPolicy::default();
        let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
        for (attempt, expected_ms) in expected.into_iter().enumerate() {
            assert_eq!(policy.delay_ms(attempt as u32), expected_ms);
        }
        assert_eq!(policy.delay_ms(30), 30_000);
        assert_eq!(policy.delay_ms(200), 30_000);
    }

    #[test]
    fn failures_grow_the_attempt_and_open_resets_it() {
        let mut machine = ConnectionMachine::new(BackoffPolicy::default());

        for attempt in 1..=4_u32 {
            assert_eq!(
                machine.apply(ConnectionEvent::ConnectStarted),
                Some(ConnectionState::Connecting)
            );
            assert_eq!(
                machine.apply(ConnectionEvent::Failed),
                Some(ConnectionState::Reconnecting {
                    attempt,
                    delay_ms: 30_000_u64.min(1_000 * 2_u64.pow(attempt)),
                })
            );
        }

        machine.apply(ConnectionEvent::ConnectStarted);
        assert_eq!(machine.apply(ConnectionEvent::Opened), Some(ConnectionState::Open));
        assert_eq!(machine.attempt(), 0);

        assert_eq!(
            machine.apply(ConnectionEvent::Failed),
            Some(ConnectionState::Reconnecting {
                attempt: 1,
                delay_ms: 2_000,
            })
        );
    }

    #[test]
    fn attempt_stops_at_the_ceiling() {
        let policy = BackoffPolicy {
            max_attempt: 3,
            ..BackoffPolicy::default()
        };
        let mut machine = ConnectionMachine::new(policy);
        for _ in 0..10 {
            machine.apply(ConnectionEvent::ConnectStarted);
            machine.apply(ConnectionEvent::Failed);
        }
        assert_eq!(machine.attempt(), 3);
        assert_eq!(
            machine.state(),
            ConnectionState::Reconnecting {
                attempt: 3,
                delay_ms: 8_000,
            }
        );
    }

    #[test]
    fn disposal_freezes_the_machine() {
        let mut machine = ConnectionMachine::new(BackoffPolicy::default());
        machine.apply(ConnectionEvent::ConnectStarted);
        machine.apply(ConnectionEvent::Failed);

        assert_eq!(
            machine.apply(ConnectionEvent::Disposed),
            Some(ConnectionState::Closed)
        );
        assert!(!machine.is_live());
        assert_eq!(machine.apply(ConnectionEvent::ConnectStarted), None);
        assert_eq!(machine.apply(ConnectionEvent::Disposed), None);
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[test]
    fn ignores_out_of_order_events() {
        let mut machine = ConnectionMachine::new(BackoffPolicy::default());
        assert_eq!(machine.apply(ConnectionEvent::Opened), None);
        assert_eq!(machine.apply(ConnectionEvent::Failed), None);
        assert_eq!(machine.state(), ConnectionState::Idle);
    }
}
