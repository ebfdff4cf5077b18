//! Pure reconnection decisions and state transitions
//!
//! The supervisor task in [`super::client`] asks these functions what to do
//! next; keeping them free of I/O lets the retry policy be tested without a
//! broker.

use super::connection::{ConnectFailure, ConnectionState, FailureKind, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Whether the session has been up at least once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// No CONNACK seen yet
    Initial,
    /// At least one CONNACK seen
    Established,
}

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what follows a failed or lost connection
    ///
    /// `attempts_so_far` counts reconnection attempts since the last
    /// successful CONNACK.
    pub fn should_attempt_reconnection(
        attempts_so_far: u32,
        failure: &ConnectFailure,
        phase: ConnectPhase,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if Self::is_fatal(failure.kind, phase) {
            return ReconnectionDecision::AbortFatal(failure.clone());
        }

        if let Some(max_attempts) = config.max_attempts {
            if attempts_so_far >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = attempts_so_far + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: config.calculate_backoff_delay(attempt),
        }
    }

    /// Failures no amount of retrying will fix
    ///
    /// A rejected upgrade before the first CONNACK means the request itself
    /// is wrong; once established it is treated like any other drop.
    pub fn is_fatal(kind: FailureKind, phase: ConnectPhase) -> bool {
        match kind {
            FailureKind::AuthorizerRejected | FailureKind::SessionExpired => true,
            FailureKind::TransportRejected => phase == ConnectPhase::Initial,
            FailureKind::Network => false,
        }
    }

    /// Determine next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(failure) => ConnectionState::Failed(failure),
            ConnectionEvent::Closed => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log a connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker session established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "Reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
                warn!("Broker connection lost");
            }
            (_, ConnectionState::Failed(failure)) => {
                error!(kind = ?failure.kind, reason = %failure.message, "Broker connection failed permanently");
            }
            _ => {
                info!("Broker connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then run reconnection attempt `attempt`
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
    /// The failure cannot be fixed by retrying
    AbortFatal(ConnectFailure),
}

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    ReconnectionStarted(u32),
    PermanentFailure(ConnectFailure),
    Closed,
}
