//! WebSocket Transport
//!
//! Single responsibility: connect to a WebSocket endpoint and exchange text frames.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        error::ProtocolError,
        protocol::{frame::coding::CloseCode, CloseFrame, Message},
        Error as WsError,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use super::{Dialer, FrameSink, FrameStream, TlsConfig, TransportError};

type WsConnection = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials `ws://` and `wss://` endpoints with tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsDialer;

impl WsDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        endpoint: &str,
        tls: &TlsConfig,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        debug!(endpoint = %redact(endpoint), "Connecting to WebSocket");

        let connector = build_connector(tls)?;
        let (ws, _) = connect_async_tls_with_config(endpoint, None, false, connector)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let (sink, stream) = ws.split();

        debug!(endpoint = %redact(endpoint), "WebSocket connected");
        Ok((Box::new(WsSink { sink }), Box::new(WsStream { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsConnection, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(map_ws_error)
    }
}

struct WsStream {
    stream: SplitStream<WsConnection>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn recv(&mut self) -> Result<String, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map_err(|e| TransportError::Protocol(format!("Binary frame is not UTF-8: {}", e)))
                }
                Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Err(TransportError::Closed),
            }
        }
    }
}

fn build_connector(tls: &TlsConfig) -> Result<Option<Connector>, TransportError> {
    if !tls.accept_invalid_certs && tls.root_ca_pem.is_none() {
        return Ok(None);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = if tls.accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(pem) = &tls.root_ca_pem {
            add_pem_roots(&mut roots, pem)?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(Some(Connector::Rustls(Arc::new(config))))
}

fn add_pem_roots(roots: &mut RootCertStore, pem: &[u8]) -> Result<(), TransportError> {
    let mut added = 0;
    for cert in CertificateDer::pem_slice_iter(pem) {
        let cert = cert.map_err(|e| TransportError::Tls(format!("Invalid root CA: {:?}", e)))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("Invalid root CA: {}", e)))?;
        added += 1;
    }
    if added == 0 {
        return Err(TransportError::Tls("Root CA file holds no certificate".into()));
    }
    Ok(())
}

/// Certificate verifier for `accept_invalid_certs`. Signatures are still
/// checked; the chain and host name are not.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn close_error(frame: Option<CloseFrame<'static>>) -> TransportError {
    match frame {
        Some(frame) if frame.code == CloseCode::Abnormal => {
            TransportError::AbnormalClose(frame.reason.into_owned())
        }
        _ => TransportError::Closed,
    }
}

fn map_ws_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => TransportError::AbnormalClose(e.to_string()),
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::AbnormalClose("reset without closing handshake".into())
        }
        WsError::Tls(e) => TransportError::Tls(e.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

/// Strip the query string (it carries the credential) before logging.
fn redact(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}
