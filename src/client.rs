//! Duplex Client
//!
//! Request/response access to the object API over one persistent WebSocket,
//! plus event subscriptions on their own connections.
//!
//! ```text
//! DuplexClient
//!   ├─ DuplexSender ───────── write ──┐
//!   ├─ RequestCorrelator ◄── deliver ─┤ /wsapi   (ResilientLink + InboundDispatcher)
//!   ├─ CredentialStore                │
//!   └─ subscribe() ───────────────────┘ /events  (one ResilientLink per Subscription)
//! ```
//!
//! The RPC connection is established synchronously by [`DuplexClient::connect`];
//! after that, a background task keeps it alive. Requests in flight when the
//! connection is replaced fail with `CannotCommunicate` and must be re-issued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::correlator::RequestCorrelator;
use crate::credential::CredentialStore;
use crate::dispatcher::InboundDispatcher;
use crate::endpoint::{make_url, RPC_PATH};
use crate::error::{DuplexError, Result};
use crate::link::{ResilientLink, SinkSlot};
use crate::protocol::{decode_errors, Frame, Operation, PushFilter, Request, Response};
use crate::sender::{DuplexSender, DEFAULT_REQUEST_TIMEOUT};
use crate::subscription::{RecoveryHandler, SubscriberOptions, Subscription};
use crate::supervisor::{Connection, ConnectionSupervisor, Connector, RetryLimit, RetryPolicy};
use crate::transport::{Dialer, TlsConfig, WsDialer};

/// Delay between RPC reconnect attempts.
pub const RPC_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Delay between event reconnect attempts.
pub const EVENTS_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Runtime configuration of a [`DuplexClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the object API (http, https, ws or wss)
    pub url: String,
    pub namespace: String,
    pub recursive: bool,
    pub tls: TlsConfig,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Retry policy of subscriptions opened with default options
    pub events_retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            namespace: String::new(),
            recursive: false,
            tls: TlsConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::new(RPC_RECONNECT_DELAY, RetryLimit::Unlimited),
            events_retry: RetryPolicy::new(EVENTS_RECONNECT_DELAY, RetryLimit::Unlimited),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Subscriber options sharing this configuration's endpoint and TLS.
    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            url: self.url.clone(),
            namespace: self.namespace.clone(),
            recursive: self.recursive,
            tls: self.tls.clone(),
            retry: self.events_retry,
        }
    }
}

/// Dials `/wsapi` and waits for the server's greeting.
struct RpcConnector {
    dialer: Arc<dyn Dialer>,
    credentials: CredentialStore,
    config: ClientConfig,
}

#[async_trait]
impl Connector for RpcConnector {
    async fn establish(&self) -> Result<Connection> {
        let endpoint = make_url(
            &self.config.url,
            RPC_PATH,
            &self.config.namespace,
            &self.credentials.current(),
            self.config.recursive,
        )?;
        let (mut sink, mut stream) = self.dialer.dial(&endpoint, &self.config.tls).await?;

        let greeting = match tokio::time::timeout(self.config.request_timeout, stream.recv()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return Err(DuplexError::CannotCommunicate(e.to_string())),
            Err(_) => {
                let _ = sink.close().await;
                return Err(DuplexError::CannotCommunicate(
                    "No greeting from server".into(),
                ));
            }
        };

        let response = match Frame::decode(&greeting) {
            Ok(Frame::Response(response)) => response,
            Ok(Frame::Event(_)) => {
                let _ = sink.close().await;
                return Err(DuplexError::Protocol(
                    "Expected a greeting response, got an event".into(),
                ));
            }
            Err(e) => {
                let _ = sink.close().await;
                return Err(e);
            }
        };

        if response.status_code != 200 {
            let _ = sink.close().await;
            return Err(decode_errors(&response));
        }

        Ok(Connection { sink, stream })
    }
}

/// Client for the object API's duplex endpoints.
pub struct DuplexClient {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    credentials: CredentialStore,
    supervisor: ConnectionSupervisor,
    sink: SinkSlot,
    correlator: Arc<RequestCorrelator>,
    sender: DuplexSender,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DuplexClient {
    /// Connect to the RPC endpoint, retrying per `config.retry`.
    pub async fn connect(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
        credentials: CredentialStore,
    ) -> Result<Self> {
        let supervisor = ConnectionSupervisor::new("rpc", config.retry);
        let connector = RpcConnector {
            dialer: Arc::clone(&dialer),
            credentials: credentials.clone(),
            config: config.clone(),
        };

        let connection = supervisor
            .connect(&connector)
            .await?
            .ok_or_else(|| DuplexError::Disconnected("Stopped while connecting".into()))?;
        info!(url = %config.url, namespace = %config.namespace, "Connected to object API");

        // Installed before returning so the first send finds a connection
        let Connection { sink: first, stream } = connection;
        let sink: SinkSlot = Arc::new(Mutex::new(Some(first)));
        let correlator = RequestCorrelator::new();
        let sender = DuplexSender::new(
            Arc::clone(&sink),
            Arc::clone(&correlator),
            supervisor.clone(),
            config.request_timeout,
        );

        let link = ResilientLink::new("rpc", supervisor.clone(), connector, Arc::clone(&sink));
        let dispatcher = InboundDispatcher::new(Arc::clone(&correlator));
        let reader = tokio::spawn(link.run(Some(stream), dispatcher));

        Ok(Self {
            config,
            dialer,
            credentials,
            supervisor,
            sink,
            correlator,
            sender,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// [`connect`](Self::connect) over real WebSockets.
    pub async fn connect_websocket(config: ClientConfig, credentials: CredentialStore) -> Result<Self> {
        Self::connect(config, Arc::new(WsDialer::new()), credentials).await
    }

    /// A request pre-filled with this client's namespace and credential.
    pub fn request(&self, operation: Operation, identity: impl Into<String>) -> Request {
        Request::new(operation, identity)
            .with_namespace(self.config.namespace.clone())
            .with_credential(self.credentials.current())
    }

    /// Send `request` and wait for its response.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        self.sender.send(request).await
    }

    /// Replace the credential used for new requests and dials.
    pub fn set_credential(&self, token: impl Into<String>) {
        self.credentials.set(token);
    }

    pub fn current_credential(&self) -> String {
        self.credentials.current()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Outstanding requests, for diagnostics.
    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// Open an event subscription on the same API.
    ///
    /// `options` defaults to this client's endpoint, namespace and TLS.
    /// `filter` is applied on every connection before it is announced.
    pub fn subscribe(
        &self,
        options: Option<SubscriberOptions>,
        filter: Option<PushFilter>,
        recovery: Option<Arc<dyn RecoveryHandler>>,
    ) -> Subscription {
        let options = options.unwrap_or_else(|| self.config.subscriber_options());
        Subscription::spawn(
            options,
            Arc::clone(&self.dialer),
            self.credentials.clone(),
            filter,
            recovery,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.supervisor.is_stopped()
    }

    /// Stop the client: later sends fail with `Disconnected`.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.supervisor.stop();

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "RPC connection was already closed");
            }
        }

        let reader = self.reader.lock().await.take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                debug!(error = %e, "RPC reader ended abnormally");
            }
            info!("Disconnected from object API");
        }
        Ok(())
    }
}

impl Drop for DuplexClient {
    fn drop(&mut self) {
        // Ends the background link; the connection goes with it
        self.supervisor.stop();
    }
}
