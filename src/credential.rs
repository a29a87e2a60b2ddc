//! Credential Store and Renewal
//!
//! The credential sent with every request (and in the connection URL) is
//! owned by a [`CredentialStore`]. An external actor replaces it when the
//! token is renewed; [`spawn_renewal`] is that actor when a [`TokenIssuer`]
//! is available.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::DuplexError;

/// Shared, swappable credential.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    token: Arc<RwLock<String>>,
}

impl CredentialStore {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.into())),
        }
    }

    /// Replace the current credential.
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    /// The credential to use for the next request or dial.
    pub fn current(&self) -> String {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Issues fresh tokens. Implemented by the authentication service client.
#[async_trait]
pub trait TokenIssuer: Send + Sync + 'static {
    async fn issue(&self) -> Result<String, DuplexError>;
}

/// Renew the credential in `store` every `interval` until `stop` is cancelled.
///
/// A failed renewal keeps the previous token and is retried on the next tick.
pub fn spawn_renewal(
    store: CredentialStore,
    issuer: Arc<dyn TokenIssuer>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the current token is still fresh.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Credential renewal stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match issuer.issue().await {
                Ok(token) => {
                    store.set(token);
                    info!("Credential refreshed");
                }
                Err(e) => {
                    error!(error = %e, "Unable to renew credential");
                }
            }
        }
    })
}
