//! Error types for the takstream client.
//!
//! Configuration problems are caught at connect time. Transport failures,
//! protocol-state violations (writing without a connection) and timeouts are
//! returned or delivered on the connection's `error` signal. Per-message
//! decode failures belong to `takstream-cot` and never surface here. All of
//! these errors are serializable so they can be logged as structured values.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using TakStreamError as the error type.
pub type Result<T> = std::result::Result<T, TakStreamError>;

/// Top-level error type for all takstream operations.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum TakStreamError {
    /// Transport and connection-state errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Configuration and credential errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Certificate loading and verification errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(#[from] TimeoutError),
}

impl TakStreamError {
    /// Returns true if the failure came from writing while no transport was active.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, TakStreamError::Connection(ConnectionError::NotConnected))
    }

    /// Returns true if a later `reconnect()` has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            TakStreamError::Connection(e) => e.is_transient(),
            TakStreamError::Io(_) | TakStreamError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true if retrying with the same settings cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            TakStreamError::Connection(e) => e.is_permanent(),
            TakStreamError::Config(_) | TakStreamError::Certificate(_) => true,
            _ => false,
        }
    }
}

/// Errors raised by a transport or by the connection engine's state checks.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ConnectionError {
    /// Failed to establish the TCP connection
    #[error("Failed to connect to {host}:{port}: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {reason}")]
    TlsHandshakeFailed { reason: String },

    /// The server certificate did not match any pinned fingerprint
    #[error("Server certificate fingerprint {fingerprint} is not pinned")]
    PinMismatch { fingerprint: String },

    /// No transport is active, or it has not finished connecting
    #[error("A connection must be established before it can be written to")]
    NotConnected,

    /// The connection was destroyed while an operation was pending
    #[error("Connection destroyed")]
    Destroyed,
}

impl ConnectionError {
    /// Creates a connection failed error.
    pub fn failed(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    /// Creates a TLS handshake failed error.
    pub fn tls_handshake_failed(reason: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Returns true if this error is transient and the operation can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed { .. } | ConnectionError::NotConnected
        )
    }

    /// Returns true if this error is permanent and retrying won't help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConnectionError::PinMismatch { .. } | ConnectionError::TlsHandshakeFailed { .. }
        )
    }
}

/// Errors detected before any socket is opened.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// A credential the scheme requires is absent or empty
    #[error("auth.{field} required")]
    MissingCredential { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// The connection URL could not be parsed
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// URL scheme other than `ssl`
    #[error("Unknown TAK Server Protocol: {scheme}")]
    UnsupportedProtocol { scheme: String },

    /// Duplicate server name
    #[error("Duplicate server name: {name}")]
    DuplicateServerName { name: String },

    /// No servers configured
    #[error("No servers configured")]
    NoServers,
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates a missing credential error.
    pub fn missing_credential(field: impl Into<String>) -> Self {
        Self::MissingCredential {
            field: field.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors related to client certificates and trust anchors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum CertificateError {
    /// Certificate file not found
    #[error("Certificate file not found: {path}")]
    CertificateNotFound { path: String },

    /// Failed to load certificate
    #[error("Failed to load certificate from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// PEM data could not be parsed
    #[error("Invalid PEM data for {what}: {reason}")]
    InvalidPem { what: String, reason: String },

    /// Private key error
    #[error("Private key error: {reason}")]
    PrivateKeyError { reason: String },

    /// The private key is encrypted and no usable passphrase applies to it
    #[error("Private key is encrypted and cannot be loaded (passphrase provided: {passphrase_provided})")]
    EncryptedKey { passphrase_provided: bool },

    /// Building the TLS configuration from the certificates failed
    #[error("Certificate validation failed: {reason}")]
    ValidationFailed { reason: String },
}

impl CertificateError {
    /// Creates a certificate not found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::CertificateNotFound { path: path.into() }
    }

    /// Creates a certificate load failed error.
    pub fn load_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid PEM error.
    pub fn invalid_pem(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPem {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Creates a validation failed error.
    pub fn validation_failed(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }
}

/// Wrapper for I/O errors to make them serializable.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct IoError {
    pub kind: IoErrorKind,
    pub message: String,
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for TakStreamError {
    fn from(err: io::Error) -> Self {
        TakStreamError::Io(err.into())
    }
}

/// Serializable version of std::io::ErrorKind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    NotConnected,
    BrokenPipe,
    InvalidInput,
    InvalidData,
    TimedOut,
    WriteZero,
    Interrupted,
    UnexpectedEof,
    Other,
}

impl From<io::ErrorKind> for IoErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => IoErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionRefused => IoErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => IoErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => IoErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected => IoErrorKind::NotConnected,
            io::ErrorKind::BrokenPipe => IoErrorKind::BrokenPipe,
            io::ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
            io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
            io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
            io::ErrorKind::WriteZero => IoErrorKind::WriteZero,
            io::ErrorKind::Interrupted => IoErrorKind::Interrupted,
            io::ErrorKind::UnexpectedEof => IoErrorKind::UnexpectedEof,
            _ => IoErrorKind::Other,
        }
    }
}

/// Timeout errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum TimeoutError {
    /// The TLS handshake did not complete in time
    #[error("Handshake with {host} did not complete within {timeout_secs}s")]
    Handshake { host: String, timeout_secs: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credential_message() {
        let err = ConfigError::missing_credential("cert");
        assert_eq!(err.to_string(), "auth.cert required");
    }

    #[test]
    fn test_not_connected_classification() {
        let err: TakStreamError = ConnectionError::NotConnected.into();
        assert!(err.is_not_connected());
        assert!(err.is_transient());
    }

    #[test]
    fn test_pin_mismatch_is_permanent() {
        let err = ConnectionError::PinMismatch {
            fingerprint: "ab:cd".to_string(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_transient());

        let err: TakStreamError = CertificateError::EncryptedKey {
            passphrase_provided: false,
        }
        .into();
        assert!(err.is_permanent());
        let err: TakStreamError = ConnectionError::failed("tak.example.com", 8089, "refused").into();
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_error_serialization() {
        let err = TakStreamError::Connection(ConnectionError::failed(
            "tak.example.com",
            8089,
            "connection refused",
        ));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Connection"));
        assert!(json.contains("tak.example.com"));
    }

    #[test]
    fn test_unsupported_protocol_is_config_error() {
        let err: TakStreamError = ConfigError::UnsupportedProtocol {
            scheme: "tcp".to_string(),
        }
        .into();
        assert!(matches!(err, TakStreamError::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: TakStreamError = io_err.into();
        match err {
            TakStreamError::Io(inner) => assert_eq!(inner.kind, IoErrorKind::ConnectionReset),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
