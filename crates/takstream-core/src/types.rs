//! Core types shared by the takstream crates.
//!
//! This module defines connection identifiers and the generators that produce
//! them, the TLS credential bundle handed to transports, and the parsed
//! server URL.

use crate::error::{ConfigError, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;

/// URL scheme accepted by [`ServerUrl`] for streaming connections.
pub const SSL_SCHEME: &str = "ssl";

/// Default TAK streaming TLS port.
pub const DEFAULT_TLS_PORT: u16 = 8089;

/// Identifier of one streaming connection.
///
/// Callers may pick their own identifier (a server name, a database id);
/// otherwise one is drawn from an [`IdGenerator`].
///
/// # Examples
///
/// ```
/// use takstream_core::types::ConnectionId;
///
/// let id = ConnectionId::from("tak-primary");
/// assert_eq!(id.as_str(), "tak-primary");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a new identifier with the given generator.
    pub fn generate(generator: &dyn IdGenerator) -> Self {
        Self(generator.generate())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Source of fresh connection identifiers.
pub trait IdGenerator: Send + Sync {
    /// Returns a new identifier. Identifiers from one generator must not repeat
    /// in practice.
    fn generate(&self) -> String;
}

/// UUID v4 identifiers drawn from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// `tak-<base36>` identifiers from a seedable, non-cryptographic PRNG.
///
/// Used where an OS entropy source is unavailable, or where tests need
/// reproducible identifiers.
#[derive(Debug)]
pub struct PseudoRandomIdGenerator {
    rng: Mutex<StdRng>,
}

impl PseudoRandomIdGenerator {
    /// Creates a generator seeded from the current time.
    pub fn new() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        Self::with_seed(seed)
    }

    /// Creates a generator with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for PseudoRandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for PseudoRandomIdGenerator {
    fn generate(&self) -> String {
        let value: u64 = self.rng.lock().gen();
        format!("tak-{}", to_base36(value))
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Client certificate bundle for a mutually authenticated TLS connection.
///
/// All material is PEM text. The bundle is immutable once built and is reused
/// across reconnects of the same connection.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TakAuth {
    /// Client certificate chain (PEM)
    pub cert: String,
    /// Client private key (PEM)
    pub key: String,
    /// Passphrase protecting the private key
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Trust anchors for the server certificate (PEM)
    #[serde(default)]
    pub ca: Option<String>,
    /// Verify the server certificate chain and hostname.
    ///
    /// Defaults to `false`: TAK servers commonly present certificates signed by
    /// a private CA the client was never given.
    #[serde(default)]
    pub reject_unauthorized: Option<bool>,
}

impl TakAuth {
    /// Creates a bundle from a certificate and key.
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    /// Sets the CA bundle.
    pub fn with_ca(mut self, ca: impl Into<String>) -> Self {
        self.ca = Some(ca.into());
        self
    }

    /// Sets the key passphrase.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Enables or disables server certificate verification.
    pub fn with_reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = Some(reject);
        self
    }

    /// Whether the server certificate must be verified.
    pub fn verify_server(&self) -> bool {
        self.reject_unauthorized.unwrap_or(false)
    }

    /// Checks the fields mutual TLS cannot work without.
    pub fn validate(&self) -> Result<()> {
        if self.cert.trim().is_empty() {
            return Err(ConfigError::missing_credential("cert").into());
        }
        if self.key.trim().is_empty() {
            return Err(ConfigError::missing_credential("key").into());
        }
        Ok(())
    }
}

impl fmt::Debug for TakAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TakAuth")
            .field("cert", &format_args!("<{} bytes>", self.cert.len()))
            .field("key", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("ca", &self.ca.as_ref().map(|ca| ca.len()))
            .field("reject_unauthorized", &self.reject_unauthorized)
            .finish()
    }
}

/// A parsed TAK server URL such as `ssl://tak.example.com:8089`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl(Url);

impl ServerUrl {
    /// Parses a URL. Any scheme is accepted here; the connection engine
    /// rejects the ones it cannot speak.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| ConfigError::InvalidUrl {
            url: input.to_string(),
            reason: e.to_string(),
        })?;

        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidUrl {
                url: input.to_string(),
                reason: "missing host".to_string(),
            }
            .into());
        }

        Ok(Self(url))
    }

    /// URL scheme without the trailing colon.
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Port, falling back to the TAK TLS default.
    pub fn port(&self) -> u16 {
        self.0.port().unwrap_or(DEFAULT_TLS_PORT)
    }

    /// `host:port` for socket connects.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// Returns true for the `ssl` scheme.
    pub fn is_ssl(&self) -> bool {
        self.scheme() == SSL_SCHEME
    }

    /// Returns the underlying URL.
    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ServerUrl {
    type Err = crate::error::TakStreamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
