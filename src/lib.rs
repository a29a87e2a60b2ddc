//! Elohim Duplex - resilient duplex client for the object API
//!
//! Talks to the object API over persistent WebSockets instead of one HTTP
//! round-trip per call, and streams push events from it.
//!
//! ## Architecture
//!
//! - **RPC channel** (`/wsapi`): JSON requests written on one connection,
//!   responses matched back to their callers by request id
//! - **Event channel** (`/events`): push events filtered server-side, one
//!   connection per subscription
//! - Both channels reconnect on their own with a fixed delay
//!
//! ## Modules
//!
//! | Module         | Responsibility                                     |
//! |----------------|----------------------------------------------------|
//! | `transport`    | Dial endpoints, move text frames                   |
//! | `supervisor`   | Dial with fixed-delay retry, own the stop flag     |
//! | `link`         | Keep one logical connection alive                  |
//! | `correlator`   | Match responses to waiting requests                |
//! | `sender`       | Write a request, wait for its response             |
//! | `dispatcher`   | RPC read loop                                      |
//! | `subscription` | Event read loop and consumer channels              |
//! | `client`       | `DuplexClient` facade                              |
//! | `credential`   | Swappable credential and renewal task              |
//! | `config`       | TOML + environment configuration                   |
//!
//! ## Reconnection semantics
//!
//! | Channel | On reconnect                                                |
//! |---------|-------------------------------------------------------------|
//! | RPC     | In-flight requests fail with `CannotCommunicate`            |
//! | Events  | Filter rewritten, status published, recovery called         |

pub mod client;
pub mod config;
pub mod correlator;
pub mod credential;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod protocol;
pub mod sender;
pub mod subscription;
pub mod supervisor;
pub mod transport;

// Re-exports
pub use client::{ClientConfig, DuplexClient};
pub use config::Config;
pub use correlator::{PendingResponse, RequestCorrelator};
pub use credential::{spawn_renewal, CredentialStore, TokenIssuer};
pub use error::{DuplexError, Result};
pub use protocol::{ApiError, Event, EventType, Operation, PushFilter, Request, Response};
pub use subscription::{
    FilterUpdater, RecoveryHandler, SubscriberOptions, SubscriberStatus, Subscription,
    SubscriptionHandle,
};
pub use supervisor::{ConnectionSupervisor, RetryLimit, RetryPolicy};
pub use transport::{Dialer, TlsConfig, TransportError};
