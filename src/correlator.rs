//! Request Correlator
//!
//! Single responsibility: match responses arriving on the read loop with the
//! callers waiting for them.
//!
//! Each outstanding request owns a [`PendingResponse`] holding the receiving
//! end of a oneshot channel. The registry only holds the sending end, so:
//!
//! - delivery removes the entry, and a response reaches at most one waiter
//! - a response for an unknown (or abandoned) id is dropped silently
//! - clearing the registry wakes every waiter with a closed channel
//!
//! Dropping a `PendingResponse` unregisters it, whichever way the wait ended.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::DuplexError;
use crate::protocol::Response;

/// Registry of requests awaiting a response.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: DashMap<String, oneshot::Sender<Response>>,
}

impl RequestCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `id` and return the handle its response will arrive on.
    ///
    /// Fails if `id` is already awaiting a response.
    pub fn register(self: &Arc<Self>, id: &str) -> Result<PendingResponse, DuplexError> {
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(DuplexError::DuplicateRequest(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        Ok(PendingResponse {
            id: id.to_string(),
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Hand `response` to the waiter registered under `id`.
    ///
    /// Returns false (and drops the response) when nobody is waiting.
    pub fn deliver(&self, id: &str, response: Response) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = %id, "Dropping response with no waiter");
                false
            }
        }
    }

    /// Remove `id` from the registry. Returns whether it was still present.
    pub fn unregister(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Forget every outstanding request. Returns how many were dropped.
    pub fn reset_all(&self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A registered request waiting for its response.
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<Response>,
    correlator: Arc<RequestCorrelator>,
}

impl PendingResponse {
    /// Wait for the response.
    ///
    /// Fails with `CannotCommunicate` if the registry was reset before a
    /// response arrived.
    pub async fn wait(&mut self) -> Result<Response, DuplexError> {
        (&mut self.rx).await.map_err(|_| {
            DuplexError::CannotCommunicate(
                "Connection was replaced before the response arrived".into(),
            )
        })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.correlator.unregister(&self.id);
    }
}
