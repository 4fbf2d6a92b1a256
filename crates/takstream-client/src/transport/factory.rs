use super::{NativeTransport, Transport, TransportParams};
use std::fmt;
use std::sync::Arc;
use takstream_core::Result;

/// Builds a fresh transport for every connect and reconnect.
pub type TransportFactory = Arc<dyn Fn(TransportParams) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// The built-in transport implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// rustls
    Native,
    /// native-tls with certificate pinning
    #[cfg(feature = "platform-tls")]
    Platform,
}

impl TransportKind {
    /// Picks the implementation for the platform this binary was built for:
    /// the platform stack on Android and iOS, rustls everywhere else.
    pub fn detect() -> Self {
        #[cfg(all(feature = "platform-tls", any(target_os = "android", target_os = "ios")))]
        {
            TransportKind::Platform
        }
        #[cfg(not(all(feature = "platform-tls", any(target_os = "android", target_os = "ios"))))]
        {
            TransportKind::Native
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Native => write!(f, "native"),
            #[cfg(feature = "platform-tls")]
            TransportKind::Platform => write!(f, "platform"),
        }
    }
}

/// Factory that always builds `kind`.
pub fn transport_factory(kind: TransportKind) -> TransportFactory {
    Arc::new(move |params: TransportParams| -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Native => Arc::new(NativeTransport::new(params)),
            #[cfg(feature = "platform-tls")]
            TransportKind::Platform => Arc::new(super::PlatformTransport::new(params)),
        };
        Ok(transport)
    })
}

/// Factory used when a connection is not given one.
pub fn default_transport_factory() -> TransportFactory {
    transport_factory(TransportKind::detect())
}
