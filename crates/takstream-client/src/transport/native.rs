use super::{read_loop, write_until_closed, Transport, TransportHandlers, TransportParams};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use takstream_cert::CertificateBundle;
use takstream_core::{CertificateError, ConnectionError, Result, TakAuth, TakStreamError};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};

type TlsWriter = WriteHalf<TlsStream<TcpStream>>;

/// rustls transport for desktop and server hosts.
pub struct NativeTransport {
    params: TransportParams,
    handlers: Mutex<Option<TransportHandlers>>,
    writer: tokio::sync::Mutex<Option<TlsWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    /// Flipped by `destroy` to cancel a send in flight
    closed: watch::Sender<bool>,
}

impl NativeTransport {
    pub fn new(params: TransportParams) -> Self {
        Self {
            params,
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

    /// Forwards a handshake-phase failure to the `error` handler and hands it
    /// back for the caller to return.
    fn report(&self, error: TakStreamError) -> TakStreamError {
        if let Some(handlers) = self.handlers() {
            handlers.error(error.clone());
        }
        error
    }
}

/// Builds the rustls client configuration for a credential bundle.
///
/// With verification on, the CA bundle is the only trust root when present;
/// otherwise the webpki roots are used. With verification off any server
/// certificate is accepted.
pub fn build_tls_config(auth: &TakAuth) -> Result<ClientConfig> {
    let bundle = CertificateBundle::from_auth(auth)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CertificateError::validation_failed(e.to_string()))?;

    let builder = if auth.verify_server() {
        let mut root_store = RootCertStore::empty();
        match &bundle.ca_certs {
            Some(ca_certs) => {
                for cert in ca_certs {
                    root_store
                        .add(cert.clone())
                        .map_err(|e| CertificateError::validation_failed(e.to_string()))?;
                }
                debug!("Trusting {} CA certificate(s) from the bundle", ca_certs.len());
            }
            None => {
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                debug!("Trusting webpki root certificates");
            }
        }
        builder.with_root_certificates(root_store)
    } else {
        warn!("Server certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
    };

    builder
        .with_client_auth_cert(bundle.certs, bundle.private_key)
        .map_err(|e| {
            CertificateError::PrivateKeyError {
                reason: e.to_string(),
            }
            .into()
        })
}

#[async_trait]
impl Transport for NativeTransport {
    fn set_handlers(&self, handlers: TransportHandlers) {
        *self.handlers.lock() = Some(handlers);
    }

    #[instrument(skip(self), fields(connection_id = %self.params.id, server = %self.params.url.authority()))]
    async fn connect(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Destroyed.into());
        }

        let tls_config = build_tls_config(&self.params.auth).map_err(|e| self.report(e))?;
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

        let server_name = ServerName::try_from(url.host().to_string()).map_err(|e| {
            self.report(ConnectionError::tls_handshake_failed(format!("invalid server name: {}", e)).into())
        })?;

        let connector = TlsConnector::from(Arc::new(tls_config));
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| self.report(ConnectionError::tls_handshake_failed(e.to_string()).into()))?;

        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Destroyed.into());
        }

        info!("TLS handshake successful");

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

        let result = write_until_closed(&self.closed, async {
            let mut writer = self.writer.lock().await;
            let stream = writer.as_mut().ok_or(ConnectionError::NotConnected)?;
            stream.write_all(payload.as_bytes()).await?;
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

        debug!(connection_id = %self.params.id, "Native transport destroyed");
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
    }
}

/// Accepts any server certificate. Installed when `reject_unauthorized` is
/// off, which is the default for TAK deployments with private CAs.
#[derive(Debug)]
struct InsecureCertVerifier;

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportEvent, TransportOptions};
    use takstream_core::ServerUrl;

    fn params(auth: TakAuth) -> TransportParams {
        TransportParams {
            id: "native-test".into(),
            url: ServerUrl::parse("ssl://127.0.0.1:1").unwrap(),
            auth,
            options: TransportOptions::default(),
        }
    }

    #[test]
    fn test_tls_config_from_generated_credentials() {
        let certified = rcgen::generate_simple_self_signed(vec!["takstream-client".to_string()]).unwrap();
        let auth = TakAuth::new(certified.cert.pem(), certified.key_pair.serialize_pem());
        assert!(build_tls_config(&auth).is_ok());

        let verified = auth
            .with_ca(certified.cert.pem())
            .with_reject_unauthorized(true);
        assert!(build_tls_config(&verified).is_ok());
    }

    #[test]
    fn test_tls_config_decrypts_key_with_passphrase() {
        let certified = rcgen::generate_simple_self_signed(vec!["takstream-client".to_string()]).unwrap();
        let key = crate::transport::encrypted_pkcs8_pem(&certified.key_pair.serialize_der(), "atakatak");
        let auth = TakAuth::new(certified.cert.pem(), key);

        assert!(matches!(
            build_tls_config(&auth),
            Err(TakStreamError::Certificate(CertificateError::EncryptedKey { .. }))
        ));
        assert!(build_tls_config(&auth.clone().with_passphrase("wrong")).is_err());
        assert!(build_tls_config(&auth.with_passphrase("atakatak")).is_ok());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_connected() {
        let transport = NativeTransport::new(params(TakAuth::new("c", "k")));
        let err = transport.send("<event/>").await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_bad_credentials_fail_connect_and_reach_error_handler() {
        let transport = NativeTransport::new(params(TakAuth::new("not pem", "not pem")));
        let (handlers, mut rx) = TransportHandlers::channel();
        transport.set_handlers(handlers);

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TakStreamError::Certificate(_)));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(TakStreamError::Certificate(_)))));
    }

    #[tokio::test]
    async fn test_destroy_cancels_send_in_flight() {
        let transport = Arc::new(NativeTransport::new(params(TakAuth::new("c", "k"))));
        let held = transport.writer.lock().await;

        let sending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send("<event/>").await })
        };
        tokio::task::yield_now().await;
        assert!(!sending.is_finished());

        transport.destroy();
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), sending)
            .await
            .expect("send still blocked after destroy")
            .unwrap()
            .unwrap_err();
        assert!(err.is_not_connected());
        drop(held);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_blocks_connect() {
        let transport = NativeTransport::new(params(TakAuth::new("c", "k")));
        transport.destroy();
        transport.destroy();

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TakStreamError::Connection(ConnectionError::Destroyed)));
        assert!(transport.send("x").await.unwrap_err().is_not_connected());
    }
}
