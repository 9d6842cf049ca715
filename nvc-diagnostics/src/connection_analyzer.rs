//! Connection state analysis and diagnostics

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

const HISTORY_LIMIT: usize = 32;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectionState {
    /// Disconnected
    Disconnected,
    /// Connecting
    Connecting,
    /// Connected
    Connected,
    /// Reconnecting
    Reconnecting {
        /// Attempt number within the current connect cycle
        attempt: u32,
    },
    /// Gave up reconnecting
    Failed,
}

impl ConnectionState {
    /// Whether a session is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting ({})", attempt),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Connection information snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Signaling URL
    pub url: Option<String>,
    /// Current state
    pub state: ConnectionState,
    /// When the current session came up
    pub connected_since: Option<DateTime<Utc>>,
    /// Successful connections so far
    pub connections: u32,
    /// Reconnect attempts so far
    pub reconnect_attempts: u32,
    /// Most recent error
    pub last_error: Option<String>,
    /// Most recent handshake latency in milliseconds
    pub handshake_ms: Option<u64>,
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// When it happened
    pub at: DateTime<Utc>,
    /// Previous state
    pub from: ConnectionState,
    /// New state
    pub to: ConnectionState,
}

#[derive(Debug)]
struct AnalyzerState {
    info: ConnectionInfo,
    history: VecDeque<StateTransition>,
}

/// Tracks connection state changes
#[derive(Debug)]
pub struct ConnectionAnalyzer {
    state: RwLock<AnalyzerState>,
}

impl ConnectionAnalyzer {
    /// Analyzer starting out disconnected
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AnalyzerState {
                info: ConnectionInfo {
                    url: None,
                    state: ConnectionState::Disconnected,
                    connected_since: None,
                    connections: 0,
                    reconnect_attempts: 0,
                    last_error: None,
                    handshake_ms: None,
                },
                history: VecDeque::new(),
            }),
        }
    }

    /// Set the signaling URL
    pub fn set_url(&self, url: &str) {
        self.state.write().info.url = Some(url.to_string());
    }

    /// Move to `to`, returning `false` when already there
    pub fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.state.write();
        let from = state.info.state;
        if from == to {
            return false;
        }

        match to {
            ConnectionState::Connected => {
                state.info.connected_since = Some(Utc::now());
                state.info.connections += 1;
            }
            ConnectionState::Reconnecting { .. } => {
                state.info.connected_since = None;
                state.info.reconnect_attempts += 1;
            }
            _ => state.info.connected_since = None,
        }
        state.info.state = to;

        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(StateTransition {
            at: Utc::now(),
            from,
            to,
        });
        tracing::debug!(from = %from, to = %to, "Connection state changed");
        true
    }

    /// Record the latest error
    pub fn record_error(&self, error: impl fmt::Display) {
        self.state.write().info.last_error = Some(error.to_string());
    }

    /// Record how long a handshake took
    pub fn record_handshake(&self, elapsed: Duration) {
        self.state.write().info.handshake_ms = Some(elapsed.as_millis() as u64);
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state.read().info.state
    }

    /// Snapshot of the connection information
    pub fn info(&self) -> ConnectionInfo {
        self.state.read().info.clone()
    }

    /// Recent transitions, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.state.read().history.iter().cloned().collect()
    }

    /// Time connected in the current session
    pub fn uptime(&self) -> Option<Duration> {
        let since = self.state.read().info.connected_since?;
        (Utc::now() - since).to_std().ok()
    }

    /// Forget counters and history, keeping the URL
    pub fn reset(&self) {
        let mut state = self.state.write();
        let url = state.info.url.take();
        *state = Self::new().state.into_inner();
        state.info.url = url;
    }
}

impl Default for ConnectionAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let analyzer = ConnectionAnalyzer::new();
        analyzer.set_url("ws://localhost:8080");

        assert!(analyzer.transition(ConnectionState::Connecting));
        assert!(!analyzer.transition(ConnectionState::Connecting));
        assert!(analyzer.transition(ConnectionState::Connected));
        assert!(analyzer.uptime().is_some());
        assert!(analyzer.transition(ConnectionState::Reconnecting { attempt: 1 }));
        assert!(analyzer.transition(ConnectionState::Reconnecting { attempt: 2 }));
        assert!(analyzer.transition(ConnectionState::Failed));

        let info = analyzer.info();
        assert_eq!(info.connections, 1);
        assert_eq!(info.reconnect_attempts, 2);
        assert_eq!(info.state, ConnectionState::Failed);
        assert!(info.connected_since.is_none());
        assert_eq!(analyzer.history().len(), 5);
    }

    #[test]
    fn test_history_is_bounded() {
        let analyzer = ConnectionAnalyzer::new();
        for attempt in 1..=100 {
            analyzer.transition(ConnectionState::Reconnecting { attempt });
        }
        assert_eq!(analyzer.history().len(), HISTORY_LIMIT);

        analyzer.record_error("connection refused");
        analyzer.reset();
        assert!(analyzer.history().is_empty());
        assert!(analyzer.info().last_error.is_none());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(ConnectionState::Reconnecting { attempt: 3 }).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["attempt"], 3);
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
