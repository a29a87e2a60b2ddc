//! Inbound Dispatcher
//!
//! Read side of the RPC connection. Every response frame is handed to the
//! [`RequestCorrelator`]; everything else is logged and dropped.
//!
//! Reconnection invalidates all in-flight state: the registry is cleared
//! while the new connection is installed, so a response arriving on the new
//! connection can never complete a request written to the old one.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, trace, warn};

use crate::correlator::RequestCorrelator;
use crate::error::DuplexError;
use crate::link::{ConnectKind, LinkHandler, ReadOutcome};
use crate::protocol::Frame;
use crate::transport::TransportError;

pub struct InboundDispatcher {
    correlator: Arc<RequestCorrelator>,
}

impl InboundDispatcher {
    pub fn new(correlator: Arc<RequestCorrelator>) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl LinkHandler for InboundDispatcher {
    fn on_installing(&mut self, kind: ConnectKind) {
        if kind == ConnectKind::Reconnection {
            let dropped = self.correlator.reset_all();
            if dropped > 0 {
                warn!(dropped, "Connection replaced with requests in flight");
            }
        }
    }

    async fn on_connected(&mut self, kind: ConnectKind) {
        if kind == ConnectKind::Initial {
            info!("RPC connection ready");
        }
    }

    fn on_frame(&mut self, frame: String) {
        match Frame::decode(&frame) {
            Ok(Frame::Response(response)) => {
                let id = response.request_id.clone();
                if self.correlator.deliver(&id, response) {
                    trace!(request_id = %id, "Response delivered");
                }
            }
            Ok(Frame::Event(event)) => {
                debug!(identity = %event.identity, "Ignoring event on RPC connection");
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
            }
        }
    }

    fn on_read_error(&mut self, error: TransportError) -> ReadOutcome {
        warn!(error = %error, "Connection died. Reconnecting...");
        ReadOutcome::Reconnect
    }

    async fn on_dial_exhausted(&mut self, error: DuplexError) {
        error!(error = %error, "Giving up on RPC connection");
        self.correlator.reset_all();
    }
}
