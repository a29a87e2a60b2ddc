//! Duplex Sender
//!
//! Write side of the RPC connection: send a request, wait for its response.
//!
//! ```text
//! send(request)
//!   ├─ lock sink ─ register id ─ write frame ─ unlock
//!   └─ wait on the pending response (timeout)
//!        ├─ status 200..=300 → Ok(response)
//!        └─ otherwise        → Err(Application)
//! ```
//!
//! The id is registered while the sink is locked, so the registry cannot be
//! reset between the registration and the write. A response can never arrive
//! before its waiter exists.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::correlator::RequestCorrelator;
use crate::error::{DuplexError, Result};
use crate::link::SinkSlot;
use crate::protocol::{decode_errors, Request, Response};
use crate::supervisor::ConnectionSupervisor;

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct DuplexSender {
    sink: SinkSlot,
    correlator: Arc<RequestCorrelator>,
    supervisor: ConnectionSupervisor,
    timeout: Duration,
}

impl DuplexSender {
    pub fn new(
        sink: SinkSlot,
        correlator: Arc<RequestCorrelator>,
        supervisor: ConnectionSupervisor,
        timeout: Duration,
    ) -> Self {
        Self {
            sink,
            correlator,
            supervisor,
            timeout,
        }
    }

    /// Send `request` and wait for the matching response.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        if self.supervisor.is_stopped() {
            return Err(DuplexError::Disconnected("Client is closed".into()));
        }

        let frame = serde_json::to_string(request)?;

        let mut pending = {
            let mut slot = self.sink.lock().await;
            let sink = slot
                .as_mut()
                .ok_or_else(|| DuplexError::Disconnected("No live connection".into()))?;

            let pending = self.correlator.register(&request.id)?;
            if let Err(e) = sink.send(frame).await {
                // `pending` drops here and unregisters the id
                if self.supervisor.is_stopped() {
                    return Err(DuplexError::Disconnected("Client is closed".into()));
                }
                debug!(
                    request_id = %request.id,
                    operation = ?request.operation,
                    identity = %request.identity,
                    error = %e,
                    "Failed to write request"
                );
                return Err(DuplexError::CannotCommunicate(e.to_string()));
            }
            pending
        };

        let response = match tokio::time::timeout(self.timeout, pending.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(request_id = %request.id, "Request timed out");
                return Err(DuplexError::Timeout(self.timeout));
            }
        };

        if !response.is_success() {
            return Err(decode_errors(&response));
        }

        Ok(response)
    }
}
