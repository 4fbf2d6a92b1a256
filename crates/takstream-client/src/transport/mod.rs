//! Byte-stream transports underneath a [`Connection`](crate::Connection).
//!
//! A transport owns one TLS session. It reports what happens on the socket
//! through [`TransportHandlers`] and accepts outbound text through
//! [`Transport::send`]. Two implementations exist:
//!
//! - [`NativeTransport`]: rustls over a tokio `TcpStream`
//! - `PlatformTransport`: the operating system's TLS stack through
//!   `native-tls`, with certificate pinning (feature `platform-tls`)
//!
//! The engine never names a concrete transport. It asks a
//! [`TransportFactory`] for one, which lets tests substitute a fake.

mod factory;
mod native;
#[cfg(feature = "platform-tls")]
mod platform;

pub use factory::{default_transport_factory, transport_factory, TransportFactory, TransportKind};
pub use native::NativeTransport;
#[cfg(feature = "platform-tls")]
pub use platform::PlatformTransport;

use crate::decode::Utf8StreamDecoder;
use async_trait::async_trait;
use bytes::BytesMut;
use std::future::Future;
use std::time::Duration;
use takstream_core::{ConnectionError, ConnectionId, Result, ServerUrl, TakAuth, TakStreamError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Size of one socket read
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Something that happened on a transport's socket.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// TCP connection established
    Connect,
    /// TLS handshake completed
    SecureConnect,
    /// Decoded inbound text
    Data(String),
    /// No inbound traffic for the configured idle period
    Timeout,
    /// Socket or handshake failure
    Error(TakStreamError),
    /// The peer closed the stream
    End,
}

/// Sink for [`TransportEvent`]s.
///
/// Cloned into whatever task reads the socket. Events sent after the engine
/// stopped listening are dropped silently.
#[derive(Debug, Clone)]
pub struct TransportHandlers {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportHandlers {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    /// Creates a handler set together with the receiving end of its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn connect(&self) {
        self.emit(TransportEvent::Connect);
    }

    pub fn secure_connect(&self) {
        self.emit(TransportEvent::SecureConnect);
    }

    pub fn data(&self, text: String) {
        if !text.is_empty() {
            self.emit(TransportEvent::Data(text));
        }
    }

    pub fn timeout(&self) {
        self.emit(TransportEvent::Timeout);
    }

    pub fn error(&self, error: TakStreamError) {
        self.emit(TransportEvent::Error(error));
    }

    pub fn end(&self) {
        self.emit(TransportEvent::End);
    }

    /// Returns true once nobody is listening any more.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }
}

/// Transport-level knobs that are not part of the credential bundle.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// SHA-256 fingerprints the server's leaf certificate must match, in any
    /// case and with or without colons. Empty means no pinning. Only the
    /// platform transport enforces pins.
    pub pins: Vec<String>,
    /// Fire [`TransportEvent::Timeout`] after this long without inbound data.
    pub idle_timeout: Option<Duration>,
}

/// Everything a factory needs to build a transport.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub id: ConnectionId,
    pub url: ServerUrl,
    pub auth: TakAuth,
    pub options: TransportOptions,
}

/// One TLS session to a TAK server.
///
/// Implementations use interior mutability: the engine holds them as
/// `Arc<dyn Transport>` and may call `send` from a drain task while another
/// task calls `destroy`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Installs the sink for socket events. Called once, before `connect`.
    fn set_handlers(&self, handlers: TransportHandlers);

    /// Opens the socket and completes the TLS handshake.
    ///
    /// Emits `connect` once TCP is up and `secure_connect` once the handshake
    /// is done, then resolves. A handshake failure is both returned and sent
    /// to the `error` handler.
    async fn connect(&self) -> Result<()>;

    /// Writes `payload` and flushes it.
    ///
    /// Fails with `NotConnected` before `connect` resolved or after `destroy`.
    async fn send(&self, payload: &str) -> Result<()>;

    /// Detaches the handlers and closes the session. Idempotent.
    fn destroy(&self);
}

/// Runs `write` until it completes or `closed` flips to true.
///
/// A write blocked on a peer that stopped reading is dropped on destroy and
/// reported as `NotConnected`.
pub(crate) async fn write_until_closed<F>(closed: &watch::Sender<bool>, write: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let mut closed = closed.subscribe();
    tokio::select! {
        biased;
        _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::NotConnected.into()),
        result = write => result,
    }
}

/// Reads the socket until it closes, forwarding decoded text.
///
/// A zero-byte read fires `end`. A read error fires `error` then `end`.
pub(crate) async fn read_loop<R>(mut reader: R, handlers: TransportHandlers, idle: Option<Duration>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut decoder = Utf8StreamDecoder::new();

    loop {
        buffer.clear();

        let read = match idle {
            Some(period) => match timeout(period, reader.read_buf(&mut buffer)).await {
                Ok(read) => read,
                Err(_) => {
                    handlers.timeout();
                    continue;
                }
            },
            None => reader.read_buf(&mut buffer).await,
        };

        match read {
            Ok(0) => {
                handlers.data(decoder.finish());
                debug!("Stream closed by remote");
                handlers.end();
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "Read from socket");
                handlers.data(decoder.decode(&buffer[..n]));
            }
            Err(e) => {
                debug!(error = %e, "Error reading from socket");
                handlers.error(e.into());
                handlers.end();
                break;
            }
        }
    }
}

/// PBES2-encrypted PEM of a PKCS#8 key, for credential tests.
#[cfg(test)]
pub(crate) fn encrypted_pkcs8_pem(pkcs8_der: &[u8], passphrase: &str) -> String {
    use pkcs8::der::pem::LineEnding;
    use pkcs8::pkcs5::pbes2;

    let info = pkcs8::PrivateKeyInfo::try_from(pkcs8_der).expect("Failed to parse PKCS#8 key");
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(2048, b"takstream-salt-2", &[3u8; 16])
        .expect("Failed to build PBES2 parameters");
    info.encrypt_with_params(params, passphrase)
        .expect("Failed to encrypt key")
        .to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
        .expect("Failed to encode key")
        .as_str()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_loop_decodes_and_ends() {
        let (mut client, server) = tokio::io::duplex(64);
        let (handlers, mut rx) = TransportHandlers::channel();
        let task = tokio::spawn(read_loop(server, handlers, None));

        // The euro sign is split across two writes
        client.write_all(b"<event>\xE2\x82").await.unwrap();
        client.write_all(b"\xAC</event>").await.unwrap();
        drop(client);
        task.await.unwrap();

        let mut text = String::new();
        let mut ended = false;
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Data(chunk) => text.push_str(&chunk),
                TransportEvent::End => ended = true,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(text, "<event>€</event>");
        assert!(ended);
    }

    #[tokio::test]
    async fn test_read_loop_reports_error_then_end() {
        let reader = tokio_test::io::Builder::new()
            .read(b"<event></event>")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (handlers, mut rx) = TransportHandlers::channel();
        read_loop(reader, handlers, None).await;

        assert!(matches!(rx.recv().await, Some(TransportEvent::Data(ref s)) if s == "<event></event>"));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(ref e)) if e.is_transient()));
        assert!(matches!(rx.recv().await, Some(TransportEvent::End)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_reports_idle_timeout() {
        let (client, server) = tokio::io::duplex(64);
        let (handlers, mut rx) = TransportHandlers::channel();
        let task = tokio::spawn(read_loop(server, handlers, Some(Duration::from_secs(30))));

        assert!(matches!(rx.recv().await, Some(TransportEvent::Timeout)));

        drop(client);
        assert!(matches!(rx.recv().await, Some(TransportEvent::End)));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handlers_forward_events_in_order() {
        let (handlers, mut rx) = TransportHandlers::channel();
        handlers.connect();
        handlers.secure_connect();
        handlers.data("<event>".to_string());
        handlers.data(String::new());
        handlers.end();

        assert!(matches!(rx.recv().await, Some(TransportEvent::Connect)));
        assert!(matches!(rx.recv().await, Some(TransportEvent::SecureConnect)));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Data(ref s)) if s == "<event>"));
        assert!(matches!(rx.recv().await, Some(TransportEvent::End)));
    }

    #[tokio::test]
    async fn test_write_until_closed_cancels_blocked_write() {
        let (closed, _) = watch::channel(false);
        let closed = std::sync::Arc::new(closed);

        let blocked = {
            let closed = std::sync::Arc::clone(&closed);
            tokio::spawn(async move { write_until_closed(&closed, std::future::pending::<Result<()>>()).await })
        };
        tokio::task::yield_now().await;
        closed.send_replace(true);

        let err = blocked.await.unwrap().unwrap_err();
        assert!(err.is_not_connected());

        // Already closed: fails without waiting on the write
        let err = write_until_closed(&closed, std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_write_until_closed_passes_result_through() {
        let (closed, _) = watch::channel(false);
        assert!(write_until_closed(&closed, async { Ok(()) }).await.is_ok());
    }

    #[test]
    fn test_handlers_survive_dropped_receiver() {
        let (handlers, rx) = TransportHandlers::channel();
        drop(rx);
        assert!(handlers.is_closed());
        handlers.end();
    }
}
