use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Connection state of a streaming client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport, or the transport closed
    Disconnected,
    /// Waiting for the TLS handshake
    Connecting,
    /// Handshake complete; see `Connection::is_open` for liveness
    Connected,
    /// Tearing down for a reconnect
    Reconnecting,
    /// The last connect attempt failed
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Counters for one connection
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    messages_sent: Arc<AtomicU64>,
    messages_received: Arc<AtomicU64>,
    /// Inbound messages the CoT parser rejected
    decode_errors: Arc<AtomicU64>,
    /// Transport and write failures
    errors: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    last_activity: Arc<RwLock<SystemTime>>,
    connected_at: Arc<RwLock<Option<SystemTime>>>,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            messages_sent: Arc::new(AtomicU64::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            reconnects: Arc::new(AtomicU64::new(0)),
            last_activity: Arc::new(RwLock::new(SystemTime::now())),
            connected_at: Arc::new(RwLock::new(None)),
        }
    }

    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.update_last_activity();
    }

    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.update_last_activity();
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_last_activity(&self) {
        *self.last_activity.write() = SystemTime::now();
    }

    pub fn mark_connected(&self) {
        *self.connected_at.write() = Some(SystemTime::now());
    }

    pub fn mark_disconnected(&self) {
        *self.connected_at.write() = None;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> SystemTime {
        *self.last_activity.read()
    }

    pub fn connected_at(&self) -> Option<SystemTime> {
        *self.connected_at.read()
    }

    /// Time since bytes last moved in either direction
    pub fn time_since_last_activity(&self) -> Duration {
        self.last_activity()
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            messages_sent: self.messages_sent(),
            messages_received: self.messages_received(),
            decode_errors: self.decode_errors(),
            errors: self.errors(),
            reconnects: self.reconnects(),
            last_activity: self.last_activity(),
            connected_at: self.connected_at(),
        }
    }
}

/// Snapshot of connection metrics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub decode_errors: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub last_activity: SystemTime,
    pub connected_at: Option<SystemTime>,
}

impl MetricsSnapshot {
    /// Fraction of inbound messages that failed to decode
    pub fn decode_error_rate(&self) -> f64 {
        let total = self.messages_received + self.decode_errors;
        if total > 0 {
            self.decode_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Combined connection state and metrics
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    state: Arc<RwLock<ConnectionState>>,
    metrics: ConnectionMetrics,
    error_message: Arc<RwLock<Option<String>>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            metrics: ConnectionMetrics::new(),
            error_message: Arc::new(RwLock::new(None)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    /// Records a failed connect attempt
    pub fn set_error(&self, error: String) {
        *self.error_message.write() = Some(error);
        self.set_state(ConnectionState::Failed);
    }

    pub fn clear_error(&self) {
        *self.error_message.write() = None;
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }
}
