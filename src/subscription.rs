//! Event Subscription
//!
//! Single responsibility: stream push events from the `/events` endpoint to a
//! consumer, surviving disconnects.
//!
//! # Channels
//!
//! | Channel  | Capacity | Carries                                  |
//! |----------|----------|------------------------------------------|
//! | events   | 1024     | [`Event`]                                |
//! | errors   | 64       | protocol, application and dial errors    |
//! | status   | 8        | [`SubscriberStatus`] transitions         |
//!
//! Every publish is a `try_send`. A slow consumer loses the newest items
//! instead of stalling the read loop.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──ok──► Streaming ──abnormal close──► Reconnecting ──ok──► Streaming
//!     │                  │                              │
//!     └─ retries exhausted / unsubscribe ───────────────┴──────────────► Stopped
//! ```
//!
//! The server starts every connection unfiltered. The current push filter is
//! written first on each new connection, before its status is published. A
//! [`RecoveryHandler`] is called after every reconnect for any other state.
//!
//! Dropping the [`Subscription`] and every [`SubscriptionHandle`] stops it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::credential::CredentialStore;
use crate::endpoint::{make_url, EVENTS_PATH};
use crate::error::{DuplexError, Result};
use crate::link::{empty_slot, ConnectKind, LinkHandler, ReadOutcome, ResilientLink, SinkSlot};
use crate::protocol::{decode_errors, Event, Frame, PushFilter};
use crate::supervisor::{Connection, ConnectionSupervisor, Connector, RetryPolicy};
use crate::transport::{Dialer, FrameSink, TlsConfig, TransportError};

pub const EVENT_CHANNEL_SIZE: usize = 1024;
pub const ERROR_CHANNEL_SIZE: usize = 64;
pub const STATUS_CHANNEL_SIZE: usize = 8;

/// Connection state changes reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberStatus {
    InitialConnection,
    Reconnection,
    Disconnection,
}

/// Where and how to subscribe.
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Base URL of the object API (http, https, ws or wss)
    pub url: String,
    pub namespace: String,
    /// Also receive events from child namespaces
    pub recursive: bool,
    pub tls: TlsConfig,
    pub retry: RetryPolicy,
}

/// Writes push filters on the live event connection and keeps the latest
/// one for the connections that follow.
#[derive(Clone)]
pub struct FilterUpdater {
    sink: SinkSlot,
    current: Arc<Mutex<Option<PushFilter>>>,
}

impl FilterUpdater {
    fn new(sink: SinkSlot, filter: Option<PushFilter>) -> Self {
        Self {
            sink,
            current: Arc::new(Mutex::new(filter)),
        }
    }

    /// Replace the server-side filter. No acknowledgement is awaited.
    ///
    /// Once written, the filter is also applied to every later connection.
    /// An update that finds no live connection fails and is not kept.
    pub async fn update_filter(&self, filter: &PushFilter) -> Result<()> {
        let frame = serde_json::to_string(filter)?;

        // Lock order: sink, then filter
        let mut slot = self.sink.lock().await;
        write_frame(&mut slot, frame).await?;
        *self.current.lock().await = Some(filter.clone());
        Ok(())
    }

    /// Write the kept filter, if any, to the live connection.
    async fn reapply(&self) -> Result<bool> {
        let mut slot = self.sink.lock().await;
        let Some(filter) = self.current.lock().await.clone() else {
            return Ok(false);
        };

        write_frame(&mut slot, serde_json::to_string(&filter)?).await?;
        Ok(true)
    }
}

async fn write_frame(slot: &mut Option<Box<dyn FrameSink>>, frame: String) -> Result<()> {
    let sink = slot
        .as_mut()
        .ok_or_else(|| DuplexError::Disconnected("Subscription has no live connection".into()))?;
    sink.send(frame)
        .await
        .map_err(|e| DuplexError::CannotCommunicate(e.to_string()))
}

/// Re-establishes consumer state after a reconnect.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(&self, updater: FilterUpdater);
}

#[async_trait]
impl<F, Fut> RecoveryHandler for F
where
    F: Fn(FilterUpdater) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn recover(&self, updater: FilterUpdater) {
        (self)(updater).await
    }
}

/// Stops the subscription once the last owner is gone.
struct StopOnDrop(ConnectionSupervisor);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if !self.0.is_stopped() {
            debug!("Subscription dropped without unsubscribing");
            self.0.stop();
        }
    }
}

/// Cloneable control handle for a running subscription.
///
/// Each handle keeps the subscription running, like the [`Subscription`]
/// itself.
#[derive(Clone)]
pub struct SubscriptionHandle {
    supervisor: ConnectionSupervisor,
    updater: FilterUpdater,
    _owner: Arc<StopOnDrop>,
}

impl SubscriptionHandle {
    pub async fn update_filter(&self, filter: &PushFilter) -> Result<()> {
        if self.supervisor.is_stopped() {
            return Err(DuplexError::Disconnected("Subscription is stopped".into()));
        }
        self.updater.update_filter(filter).await
    }

    pub fn filter_updater(&self) -> FilterUpdater {
        self.updater.clone()
    }

    /// Stop the subscription and close its connection.
    ///
    /// Safe to call repeatedly; the connection is closed at most once.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.supervisor.stop();

        let sink = self.updater.sink.lock().await.take();
        if let Some(mut sink) = sink {
            info!("Unsubscribing");
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Event connection was already closed");
            }
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.supervisor.is_stopped()
    }
}

/// A running event subscription and its consumer-facing channels.
pub struct Subscription {
    handle: SubscriptionHandle,
    events: mpsc::Receiver<Event>,
    errors: mpsc::Receiver<DuplexError>,
    status: mpsc::Receiver<SubscriberStatus>,
}

impl Subscription {
    /// Start subscribing in the background.
    ///
    /// Returns immediately; the first connection is reported on the status
    /// channel, and a dial that exhausts its retries on the error channel.
    /// `filter`, if given, is written on every connection before it is
    /// reported.
    pub fn spawn(
        options: SubscriberOptions,
        dialer: Arc<dyn Dialer>,
        credentials: CredentialStore,
        filter: Option<PushFilter>,
        recovery: Option<Arc<dyn RecoveryHandler>>,
    ) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (errors_tx, errors) = mpsc::channel(ERROR_CHANNEL_SIZE);
        let (status_tx, status) = mpsc::channel(STATUS_CHANNEL_SIZE);

        let supervisor = ConnectionSupervisor::new("events", options.retry);
        let updater = FilterUpdater::new(empty_slot(), filter);
        let sink = Arc::clone(&updater.sink);

        let connector = EventConnector {
            dialer,
            credentials,
            options,
        };
        let handler = EventHandler {
            events: events_tx,
            errors: errors_tx,
            status: status_tx,
            recovery,
            updater: updater.clone(),
        };

        let link = ResilientLink::new("events", supervisor.clone(), connector, sink);
        tokio::spawn(link.run(None, handler));

        Self {
            handle: SubscriptionHandle {
                _owner: Arc::new(StopOnDrop(supervisor.clone())),
                supervisor,
                updater,
            },
            events,
            errors,
            status,
        }
    }

    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events
    }

    pub fn errors(&mut self) -> &mut mpsc::Receiver<DuplexError> {
        &mut self.errors
    }

    pub fn status(&mut self) -> &mut mpsc::Receiver<SubscriberStatus> {
        &mut self.status
    }

    /// Next event, or None once the subscription has ended and the buffer
    /// is drained.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Split into the control handle and the three receivers, so each can be
    /// polled independently. The handle keeps the subscription running.
    pub fn into_parts(
        self,
    ) -> (
        SubscriptionHandle,
        mpsc::Receiver<Event>,
        mpsc::Receiver<DuplexError>,
        mpsc::Receiver<SubscriberStatus>,
    ) {
        (self.handle, self.events, self.errors, self.status)
    }

    pub async fn update_filter(&self, filter: &PushFilter) -> Result<()> {
        self.handle.update_filter(filter).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.handle.unsubscribe().await
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }
}

/// Dials the events endpoint with whatever credential is current.
struct EventConnector {
    dialer: Arc<dyn Dialer>,
    credentials: CredentialStore,
    options: SubscriberOptions,
}

#[async_trait]
impl Connector for EventConnector {
    async fn establish(&self) -> Result<Connection> {
        let endpoint = make_url(
            &self.options.url,
            EVENTS_PATH,
            &self.options.namespace,
            &self.credentials.current(),
            self.options.recursive,
        )?;
        let (sink, stream) = self.dialer.dial(&endpoint, &self.options.tls).await?;
        Ok(Connection { sink, stream })
    }
}

struct EventHandler {
    events: mpsc::Sender<Event>,
    errors: mpsc::Sender<DuplexError>,
    status: mpsc::Sender<SubscriberStatus>,
    recovery: Option<Arc<dyn RecoveryHandler>>,
    updater: FilterUpdater,
}

impl EventHandler {
    fn publish_status(&self, status: SubscriberStatus) {
        if self.status.try_send(status).is_err() {
            debug!(?status, "Status channel full, dropping notification");
        }
    }

    fn publish_error(&self, error: DuplexError) {
        if let Err(e) = self.errors.try_send(error) {
            debug!(error = %e.into_inner(), "Error channel full, dropping error");
        }
    }
}

#[async_trait]
impl LinkHandler for EventHandler {
    async fn on_connected(&mut self, kind: ConnectKind) {
        match self.updater.reapply().await {
            Ok(true) => debug!("Push filter applied"),
            Ok(false) => {}
            // A dead connection shows up on the next read
            Err(e) => {
                warn!(error = %e, "Could not apply push filter");
                self.publish_error(e);
            }
        }

        match kind {
            ConnectKind::Initial => {
                info!("Event subscription connected");
                self.publish_status(SubscriberStatus::InitialConnection);
            }
            ConnectKind::Reconnection => {
                self.publish_status(SubscriberStatus::Reconnection);
                if let Some(recovery) = &self.recovery {
                    recovery.recover(self.updater.clone()).await;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: String) {
        match Frame::decode(&frame) {
            Ok(Frame::Event(event)) => {
                if self.events.try_send(event).is_err() {
                    debug!("Event channel full, dropping event");
                }
            }
            Ok(Frame::Response(response)) => {
                if !response.is_success() {
                    self.publish_error(decode_errors(&response));
                }
            }
            Err(e) => self.publish_error(e),
        }
    }

    fn on_read_error(&mut self, error: TransportError) -> ReadOutcome {
        if error.is_disconnect() {
            warn!(error = %error, "Event connection lost. Reconnecting...");
            return ReadOutcome::Reconnect;
        }
        self.publish_error(DuplexError::Protocol(error.to_string()));
        ReadOutcome::Continue
    }

    fn on_disconnected(&mut self) {
        self.publish_status(SubscriberStatus::Disconnection);
    }

    async fn on_dial_exhausted(&mut self, error: DuplexError) {
        error!(error = %error, "Event subscription gave up");
        // Last message of the subscription: wait for room rather than drop it
        if self.errors.send(error).await.is_err() {
            debug!("Subscription dropped before its final error");
        }
    }
}
