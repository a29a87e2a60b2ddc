//! Duplex Transport Layer
//!
//! Single responsibility: dial an endpoint and move text frames in both directions.
//! No knowledge of request correlation, reconnection or the message schema.
//!
//! | Module      | Responsibility                                  |
//! |-------------|-------------------------------------------------|
//! | `websocket` | tokio-tungstenite dialer (ws:// and wss://)     |
//! | `memory`    | In-process connection pairs for tests/embedding |
//!
//! A dial yields two halves. The [`FrameStream`] is owned by exactly one read
//! loop; the [`FrameSink`] is shared behind a lock so requests, filter updates
//! and shutdown can write to (or close) the connection concurrently.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryDialer, MemoryServer, PeerConnection};
pub use websocket::WsDialer;

/// Errors produced by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Dial failed: {0}")]
    Dial(String),

    /// The peer went away without a closing handshake.
    #[error("Connection closed abnormally: {0}")]
    AbnormalClose(String),

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl TransportError {
    /// True when the connection dropped without a closing handshake.
    pub fn is_abnormal_close(&self) -> bool {
        matches!(self, TransportError::AbnormalClose(_))
    }

    /// True when nothing more can be read from this connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::AbnormalClose(_) | TransportError::Closed
        )
    }
}

/// TLS settings applied when dialing `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Skip certificate verification (development only)
    pub accept_invalid_certs: bool,
    /// Extra PEM-encoded root certificate to trust
    pub root_ca_pem: Option<Vec<u8>>,
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the connection. Pending reads on the paired stream fail.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next text frame.
    async fn recv(&mut self) -> Result<String, TransportError>;
}

/// Something that can open duplex connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(
        &self,
        endpoint: &str,
        tls: &TlsConfig,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}
