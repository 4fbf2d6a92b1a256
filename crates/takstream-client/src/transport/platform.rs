use super::{read_loop, write_until_closed, Transport, TransportHandlers, TransportParams};
use async_trait::async_trait;
use bytes::Bytes;
use native_tls::{Certificate, Identity};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use takstream_cert::{fingerprint_sha256, normalize_fingerprint, parse_certs, plain_private_key_pem};
use takstream_core::{CertificateError, ConnectionError, Result, TakAuth, TakStreamError};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_native_tls::TlsStream;
use tracing::{debug, info, instrument, warn};

type PlatformWriter = WriteHalf<TlsStream<TcpStream>>;

/// Transport on the operating system's TLS stack (SChannel, Security.framework,
/// OpenSSL), the one available to mobile runtimes.
///
/// The server's leaf certificate can be pinned by SHA-256 fingerprint; the
/// pin is checked after the handshake and before `secure_connect` fires.
pub struct PlatformTransport {
    params: TransportParams,
    pins: Vec<String>,
    handlers: Mutex<Option<TransportHandlers>>,
    writer: tokio::sync::Mutex<Option<PlatformWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    /// Flipped by `destroy` to cancel a send in flight
    closed: watch::Sender<bool>,
}

impl PlatformTransport {
    pub fn new(params: TransportParams) -> Self {
        let pins = params
            .options
            .pins
            .iter()
            .map(|pin| normalize_fingerprint(pin))
            .collect();

        Self {
            params,
            pins,
            handlers: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            closed: watch::channel(false).0,
        }
    }

    fn handlers(&self) -> Option<TransportHandlers> {
        self.handlers.lock().clone()
    }

    /// Drops the write half, closing the session once the reader is gone.
    /// A send holding the writer releases it when `closed` cancels it.
    fn release_writer(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn report(&self, error: TakStreamError) -> TakStreamError {
        if let Some(handlers) = self.handlers() {
            handlers.error(error.clone());
        }
        error
    }

    fn check_pin(&self, stream: &TlsStream<TcpStream>) -> Result<()> {
        if self.pins.is_empty() {
            return Ok(());
        }

        let der = stream
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()
            .and_then(|cert| cert.to_der().ok());

        let fingerprint = match der {
            Some(der) => fingerprint_sha256(&der),
            None => {
                return Err(ConnectionError::PinMismatch {
                    fingerprint: "<no peer certificate>".to_string(),
                }
                .into())
            }
        };

        if self.pins.contains(&fingerprint) {
            debug!(fingerprint = %fingerprint, "Server certificate matches pin");
            Ok(())
        } else {
            Err(ConnectionError::PinMismatch { fingerprint }.into())
        }
    }
}

/// Builds the platform TLS connector for a credential bundle.
///
/// A CA bundle replaces the built-in roots. With verification off, chain and
/// hostname checks are skipped; pins still apply.
pub fn build_connector(auth: &TakAuth) -> Result<native_tls::TlsConnector> {
    auth.validate()?;

    let key = plain_private_key_pem(auth)?;
    let identity = Identity::from_pkcs8(auth.cert.as_bytes(), key.as_bytes()).map_err(|e| {
        CertificateError::PrivateKeyError {
            reason: e.to_string(),
        }
    })?;

    let mut builder = native_tls::TlsConnector::builder();
    builder.identity(identity);

    if let Some(ca) = &auth.ca {
        for der in parse_certs(ca.as_bytes(), "CA bundle")? {
            let cert = Certificate::from_der(&der)
                .map_err(|e| CertificateError::invalid_pem("CA bundle", e.to_string()))?;
            builder.add_root_certificate(cert);
        }
        builder.disable_built_in_roots(true);
    }

    if !auth.verify_server() {
        warn!("Server certificate verification is disabled");
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    builder
        .build()
        .map_err(|e| ConnectionError::tls_handshake_failed(e.to_string()).into())
}

#[async_trait]
impl Transport for PlatformTransport {
    fn set_handlers(&self, handlers: TransportHandlers) {
        *self.handlers.lock() = Some(handlers);
    }

    #[instrument(skip(self), fields(connection_id = %self.params.id, server = %self.params.url.authority()))]
    async fn connect(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Destroyed.into());
        }

        let connector = build_connector(&self.params.auth).map_err(|e| self.report(e))?;
        let url = &self.params.url;

        let tcp_stream = TcpStream::connect(url.authority()).await.map_err(|e| {
            self.report(ConnectionError::failed(url.host(), url.port(), e.to_string()).into())
        })?;
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        if let Some(handlers) = self.handlers() {
            handlers.connect();
        }

        let tls_stream = tokio_native_tls::TlsConnector::from(connector)
            .connect(url.host(), tcp_stream)
            .await
            .map_err(|e| self.report(ConnectionError::tls_handshake_failed(e.to_string()).into()))?;

        self.check_pin(&tls_stream).map_err(|e| self.report(e))?;

        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Destroyed.into());
        }

        info!("Platform TLS handshake successful");

        let (reader, writer) = tokio::io::split(tls_stream);
        *self.writer.lock().await = Some(writer);

        if let Some(handlers) = self.handlers() {
            handlers.secure_connect();
            let task = tokio::spawn(read_loop(reader, handlers, self.params.options.idle_timeout));
            if let Some(previous) = self.reader.lock().replace(task) {
                previous.abort();
            }
        }

        Ok(())
    }

    async fn send(&self, payload: &str) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected.into());
        }

        let mut view = Bytes::copy_from_slice(payload.as_bytes());
        let result = write_until_closed(&self.closed, async {
            let mut writer = self.writer.lock().await;
            let stream = writer.as_mut().ok_or(ConnectionError::NotConnected)?;
            stream.write_all_buf(&mut view).await?;
            stream.flush().await?;
            Ok::<(), TakStreamError>(())
        })
        .await;

        if self.destroyed.load(Ordering::SeqCst) {
            self.release_writer();
        }
        result
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.handlers.lock().take();
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        self.closed.send_replace(true);
        self.release_writer();

        debug!(connection_id = %self.params.id, "Platform transport destroyed");
    }
}

impl Drop for PlatformTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportEvent, TransportOptions};
    use takstream_core::ServerUrl;

    fn params(auth: TakAuth, pins: Vec<String>) -> TransportParams {
        TransportParams {
            id: "platform-test".into(),
            url: ServerUrl::parse("ssl://127.0.0.1:1").unwrap(),
            auth,
            options: TransportOptions {
                pins,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_pins_are_normalized() {
        let transport = PlatformTransport::new(params(TakAuth::new("c", "k"), vec!["ab:cd".into(), "EF01".into()]));
        assert_eq!(transport.pins, vec!["AB:CD".to_string(), "EF:01".to_string()]);
    }

    #[test]
    fn test_connector_from_generated_credentials() {
        let certified = rcgen::generate_simple_self_signed(vec!["takstream-client".to_string()]).unwrap();
        let auth = TakAuth::new(certified.cert.pem(), certified.key_pair.serialize_pem())
            .with_ca(certified.cert.pem());
        assert!(build_connector(&auth).is_ok());
    }

    #[test]
    fn test_encrypted_key_with_passphrase() {
        let certified = rcgen::generate_simple_self_signed(vec!["takstream-client".to_string()]).unwrap();
        let key = crate::transport::encrypted_pkcs8_pem(&certified.key_pair.serialize_der(), "atakatak");

        let auth = TakAuth::new(certified.cert.pem(), key);
        let err = build_connector(&auth).unwrap_err();
        assert!(err.to_string().contains("passphrase provided: false"));

        assert!(build_connector(&auth.with_passphrase("atakatak")).is_ok());
    }

    #[tokio::test]
    async fn test_bad_identity_fails_connect_and_reaches_error_handler() {
        let transport = PlatformTransport::new(params(TakAuth::new("not pem", "not pem"), Vec::new()));
        let (handlers, mut rx) = TransportHandlers::channel();
        transport.set_handlers(handlers);

        assert!(transport.connect().await.is_err());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(_))));
    }
}
