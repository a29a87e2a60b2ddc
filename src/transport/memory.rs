//! In-process Transport
//!
//! Connection pairs backed by tokio channels. The client side implements
//! [`Dialer`]; every successful dial hands a [`PeerConnection`] to the
//! [`MemoryServer`], which plays the remote service.
//!
//! Dial failures can be scripted with [`MemoryDialer::fail_next`] or
//! [`MemoryDialer::set_refusing`], and abrupt disconnects with
//! [`PeerConnection::abort`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Dialer, FrameSink, FrameStream, TlsConfig, TransportError};

/// Create a connected dialer/server pair.
pub fn pair() -> (MemoryDialer, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let dialer = MemoryDialer {
        accept_tx,
        refusing: Arc::new(AtomicBool::new(false)),
        failures_left: Arc::new(AtomicU32::new(0)),
        attempts: Arc::new(AtomicU32::new(0)),
    };
    (dialer, MemoryServer { accept_rx })
}

/// Client side of the in-process transport.
#[derive(Clone)]
pub struct MemoryDialer {
    accept_tx: mpsc::UnboundedSender<PeerConnection>,
    refusing: Arc<AtomicBool>,
    failures_left: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl MemoryDialer {
    /// Refuse every dial until switched back off.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Fail the next `count` dials.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of dial attempts made so far, successful or not.
    pub fn dial_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(
        &self,
        endpoint: &str,
        _tls: &TlsConfig,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Dial(format!(
                "connection refused (attempt {})",
                attempt
            )));
        }

        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(TransportError::Dial(format!(
                "scripted failure (attempt {})",
                attempt
            )));
        }

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));

        let peer = PeerConnection {
            endpoint: endpoint.to_string(),
            inbound: to_server_rx,
            outbound: Some(to_client_tx),
            closes: Arc::clone(&closes),
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::Dial("memory server is gone".into()))?;

        let sink = MemorySink {
            tx: Some(to_server_tx),
            closes,
        };
        let stream = MemoryStream { rx: to_client_rx };
        Ok((Box::new(sink), Box::new(stream)))
    }
}

/// Server side of the in-process transport.
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<PeerConnection>,
}

impl MemoryServer {
    /// Wait for the next dialed connection.
    pub async fn accept(&mut self) -> Option<PeerConnection> {
        self.accept_rx.recv().await
    }
}

/// The remote end of one dialed connection.
pub struct PeerConnection {
    /// Endpoint the client dialed
    pub endpoint: String,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    closes: Arc<AtomicUsize>,
}

impl PeerConnection {
    /// Push a frame to the client. Returns false once the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Ok(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Make the client's next read fail with `error`.
    pub fn fail(&self, error: TransportError) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Drop the connection without a closing handshake.
    pub fn abort(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Err(TransportError::AbnormalClose(
                "peer aborted connection".into(),
            )));
        }
    }

    /// Next frame written by the client, or None once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// How many times the client closed this connection.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame)
            .map_err(|_| TransportError::Io("broken pipe".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.tx.take().is_none() {
            return Err(TransportError::Closed);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<String, TransportError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }
}
