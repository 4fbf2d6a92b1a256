//! # takstream-client
//!
//! Streaming client for TAK servers: one long-lived, mutually authenticated
//! TLS session carrying Cursor on Target messages in both directions.
//!
//! - **Transports**: rustls on desktop and server hosts, the platform TLS
//!   stack with certificate pinning on mobile (feature `platform-tls`)
//! - **Framing**: inbound text is cut into `<event>` messages, tolerating
//!   noise and partial reads
//! - **Write queue**: outbound messages are written one at a time, in order
//! - **Engine**: heartbeat, liveness and version tracking, reconnect, and an
//!   event bus for everything the server sends
//!
//! ## Example
//!
//! ```rust,no_run
//! use takstream_client::{ConnectOptions, Connection, Signal, StreamEvent};
//! use takstream_core::TakAuth;
//!
//! #[tokio::main]
//! async fn main() -> takstream_core::Result<()> {
//!     let auth = TakAuth::new(
//!         std::fs::read_to_string("client.pem")?,
//!         std::fs::read_to_string("client.key")?,
//!     );
//!
//!     let connection = Connection::new("ssl://tak.example.com:8089", auth, ConnectOptions::default())?;
//!     connection.on(Signal::Cot, |event| {
//!         if let StreamEvent::Cot(cot) = event {
//!             println!("{} {}", cot.uid, cot.event_type);
//!         }
//!     });
//!     connection.start().await?;
//!
//!     connection.ping()?;
//!     tokio::signal::ctrl_c().await?;
//!     connection.destroy();
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod decode;
pub mod events;
pub mod frame;
pub mod queue;
pub mod state;
pub mod transport;

pub use connection::{ConnectOptions, Connection, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL};
pub use decode::Utf8StreamDecoder;
pub use events::{EventBus, Listener, ListenerId, Signal, StreamEvent};
pub use frame::{drain_messages, find_cot, PartialCot};
pub use queue::{yield_to_scheduler, WriteQueue};
pub use state::{ConnectionMetrics, ConnectionState, ConnectionStatus, MetricsSnapshot};
#[cfg(feature = "platform-tls")]
pub use transport::PlatformTransport;
pub use transport::{
    default_transport_factory, transport_factory, NativeTransport, Transport, TransportEvent,
    TransportFactory, TransportHandlers, TransportKind, TransportOptions, TransportParams,
};
