//! Connection Supervisor
//!
//! Single responsibility: turn a [`Connector`] into a live [`Connection`],
//! retrying with a fixed delay, and own the stop flag shared by every loop
//! working on that connection.
//!
//! # Retry Policy
//!
//! - Fixed delay between attempts (no backoff)
//! - [`RetryLimit::Unlimited`] retries until stopped
//! - [`RetryLimit::Attempts`] gives up after exactly that many failures and
//!   returns the last error wrapped in [`DuplexError::DialFailure`]
//!
//! A stop aborts the loop immediately, including a pending delay or an
//! attempt still in progress, and is reported as `Ok(None)` rather than as
//! an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DuplexError;
use crate::transport::{Dialer, FrameSink, FrameStream, TlsConfig};

/// A live connection: the shared write half and the read half.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Produces new connections for a supervisor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn establish(&self) -> Result<Connection, DuplexError>;
}

/// Dials a fixed endpoint with a fixed TLS configuration.
pub struct DialConnector {
    dialer: Arc<dyn Dialer>,
    endpoint: String,
    tls: TlsConfig,
}

impl DialConnector {
    pub fn new(dialer: Arc<dyn Dialer>, endpoint: impl Into<String>, tls: TlsConfig) -> Self {
        Self {
            dialer,
            endpoint: endpoint.into(),
            tls,
        }
    }
}

#[async_trait]
impl Connector for DialConnector {
    async fn establish(&self) -> Result<Connection, DuplexError> {
        let (sink, stream) = self.dialer.dial(&self.endpoint, &self.tls).await?;
        Ok(Connection { sink, stream })
    }
}

/// How many failed dials to tolerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Unlimited,
    Attempts(u32),
}

impl RetryLimit {
    /// Interpret a configured cap: any negative value is unlimited, 0 is
    /// treated as a single attempt.
    pub fn from_cap(cap: i64) -> Self {
        if cap < 0 {
            RetryLimit::Unlimited
        } else {
            RetryLimit::Attempts(u32::try_from(cap).unwrap_or(u32::MAX).max(1))
        }
    }

    fn exhausted(&self, failures: u32) -> bool {
        match self {
            RetryLimit::Unlimited => false,
            RetryLimit::Attempts(max) => failures >= *max,
        }
    }
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub limit: RetryLimit,
}

impl RetryPolicy {
    pub fn new(delay: Duration, limit: RetryLimit) -> Self {
        Self { delay, limit }
    }
}

/// Owns the stop flag and the dial/retry loop for one logical connection.
///
/// Cloning yields a handle to the same stop flag.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    stop: CancellationToken,
    policy: RetryPolicy,
    label: &'static str,
}

impl ConnectionSupervisor {
    pub fn new(label: &'static str, policy: RetryPolicy) -> Self {
        Self {
            stop: CancellationToken::new(),
            policy,
            label,
        }
    }

    /// Set the stop flag. Idempotent; the flag never clears.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the stop flag is set.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Establish a connection, retrying per the policy.
    ///
    /// Returns `Ok(None)` if stopped before a connection could be made.
    pub async fn connect<C>(&self, connector: &C) -> Result<Option<Connection>, DuplexError>
    where
        C: Connector + ?Sized,
    {
        let mut failures = 0u32;

        loop {
            if self.is_stopped() {
                return Ok(None);
            }

            // A handshake can hang for the whole request timeout
            let attempt = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(None),
                attempt = connector.establish() => attempt,
            };

            let error = match attempt {
                Ok(connection) => {
                    debug!(link = self.label, attempts = failures + 1, "Connection established");
                    return Ok(Some(connection));
                }
                Err(e) => e,
            };

            failures += 1;

            if self.is_stopped() {
                return Ok(None);
            }

            if self.policy.limit.exhausted(failures) {
                return Err(DuplexError::DialFailure {
                    attempts: failures,
                    source: Box::new(error),
                });
            }

            warn!(
                link = self.label,
                attempt = failures,
                error = %error,
                "Could not connect. Retrying in {:?}",
                self.policy.delay
            );

            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay) => {}
                _ = self.stop.cancelled() => return Ok(None),
            }
        }
    }
}
