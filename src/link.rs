//! Resilient Link
//!
//! Single responsibility: keep one logical connection alive, feeding every
//! inbound frame to a [`LinkHandler`] and replacing the connection when it dies.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    ResilientLink                        │
//! │  - owns the read half, one read loop per connection     │
//! │  - installs each new write half in the shared SinkSlot  │
//! │  - dials through the ConnectionSupervisor               │
//! └────────────────────────────────────────────────────────┘
//!                            │ callbacks
//!               ┌────────────┴────────────┐
//!               ▼                         ▼
//!       InboundDispatcher          EventSubscription
//!    (invalidate on reconnect)   (notify + recover on reconnect)
//! ```
//!
//! The handler decides what a frame means and whether a read error is worth
//! a reconnect; the link decides when and how to reconnect.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DuplexError;
use crate::supervisor::{Connection, ConnectionSupervisor, Connector};
use crate::transport::{FrameSink, FrameStream, TransportError};

/// The write half of the current connection, shared with writers.
///
/// `None` before the first connection and after the link gave up or was
/// closed.
pub type SinkSlot = Arc<Mutex<Option<Box<dyn FrameSink>>>>;

pub fn empty_slot() -> SinkSlot {
    Arc::new(Mutex::new(None))
}

/// Why a connection came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    Initial,
    Reconnection,
}

/// What to do after a read error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Keep reading the same connection.
    Continue,
    /// Drop the connection and dial a new one.
    Reconnect,
}

/// Per-link behavior plugged into the read loop.
#[async_trait]
pub trait LinkHandler: Send {
    /// A new connection is being installed. Writers are locked out until
    /// this returns, so nothing can be written to the new connection yet.
    fn on_installing(&mut self, _kind: ConnectKind) {}

    /// A connection was installed and is about to be read.
    async fn on_connected(&mut self, kind: ConnectKind);

    /// A frame arrived. Must not block.
    fn on_frame(&mut self, frame: String);

    /// A read failed while the link was not stopped.
    fn on_read_error(&mut self, error: TransportError) -> ReadOutcome;

    /// The connection was dropped and a reconnect is about to start.
    fn on_disconnected(&mut self) {}

    /// The supervisor exhausted its retry budget. The link is terminating.
    async fn on_dial_exhausted(&mut self, error: DuplexError);
}

/// A connection that replaces itself when it fails.
pub struct ResilientLink<C> {
    supervisor: ConnectionSupervisor,
    connector: C,
    sink: SinkSlot,
    label: &'static str,
}

impl<C: Connector> ResilientLink<C> {
    pub fn new(
        label: &'static str,
        supervisor: ConnectionSupervisor,
        connector: C,
        sink: SinkSlot,
    ) -> Self {
        Self {
            supervisor,
            connector,
            sink,
            label,
        }
    }

    /// Run until stopped or until the retry budget is exhausted.
    ///
    /// `installed` is the read half of a connection the caller already put
    /// in the sink slot; without one the link dials first.
    pub async fn run<H: LinkHandler>(
        self,
        installed: Option<Box<dyn FrameStream>>,
        mut handler: H,
    ) {
        let first = match installed {
            Some(stream) => Some(stream),
            None => self.dial(ConnectKind::Initial, &mut handler).await,
        };
        let Some(mut stream) = first else {
            return self.finish();
        };

        handler.on_connected(ConnectKind::Initial).await;

        loop {
            let error = tokio::select! {
                biased;
                _ = self.supervisor.stopped() => return self.finish(),
                result = stream.recv() => match result {
                    Ok(frame) => {
                        handler.on_frame(frame);
                        continue;
                    }
                    Err(e) => e,
                },
            };

            if self.supervisor.is_stopped() {
                return self.finish();
            }

            if handler.on_read_error(error) == ReadOutcome::Continue {
                continue;
            }

            handler.on_disconnected();

            stream = match self.dial(ConnectKind::Reconnection, &mut handler).await {
                Some(stream) => stream,
                None => return self.finish(),
            };

            info!(link = self.label, "Connection restored");
            handler.on_connected(ConnectKind::Reconnection).await;
        }
    }

    async fn dial<H: LinkHandler>(
        &self,
        kind: ConnectKind,
        handler: &mut H,
    ) -> Option<Box<dyn FrameStream>> {
        match self.supervisor.connect(&self.connector).await {
            Ok(Some(connection)) => self.install(connection, kind, handler).await,
            Ok(None) => None,
            Err(e) => {
                // Writers must not keep using a connection nobody reads.
                self.sink.lock().await.take();
                handler.on_dial_exhausted(e).await;
                None
            }
        }
    }

    /// Make `connection` the live one, unless the link was stopped meanwhile.
    ///
    /// The old write half is dropped here; the two never coexist.
    async fn install<H: LinkHandler>(
        &self,
        connection: Connection,
        kind: ConnectKind,
        handler: &mut H,
    ) -> Option<Box<dyn FrameStream>> {
        let Connection { mut sink, stream } = connection;

        let mut slot = self.sink.lock().await;
        if self.supervisor.is_stopped() {
            drop(slot);
            let _ = sink.close().await;
            return None;
        }
        handler.on_installing(kind);
        *slot = Some(sink);

        Some(stream)
    }

    fn finish(&self) {
        debug!(link = self.label, "Read loop ended");
    }
}
