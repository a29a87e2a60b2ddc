//! Configuration
//!
//! TOML file layout, every key optional:
//!
//! ```toml
//! url = "https://api.example.com"
//! namespace = "/acme"
//! recursive = false
//!
//! [tls]
//! accept_invalid_certs = false
//! ca_file = "/etc/ssl/private-ca.pem"
//!
//! [rpc]
//! request_timeout_secs = 30
//! reconnect_delay_secs = 3
//! max_connection_retries = -1        # -1 retries forever
//!
//! [events]
//! reconnect_delay_secs = 5
//! max_connection_retries = -1
//! ```
//!
//! `DUPLEX_URL`, `DUPLEX_NAMESPACE` and `DUPLEX_TOKEN` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::error::{DuplexError, Result};
use crate::subscription::SubscriberOptions;
use crate::supervisor::{RetryLimit, RetryPolicy};
use crate::transport::TlsConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub url: String,
    pub namespace: String,
    pub recursive: bool,
    /// Initial credential; usually supplied through `DUPLEX_TOKEN`
    pub token: String,
    pub tls: TlsSection,
    pub rpc: RpcSection,
    pub events: EventsSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            namespace: String::new(),
            recursive: false,
            token: String::new(),
            tls: TlsSection::default(),
            rpc: RpcSection::default(),
            events: EventsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub accept_invalid_certs: bool,
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    pub request_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_connection_retries: i64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            reconnect_delay_secs: 3,
            max_connection_retries: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub reconnect_delay_secs: u64,
    pub max_connection_retries: i64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            max_connection_retries: -1,
        }
    }
}

impl Config {
    /// Parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| DuplexError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DuplexError::Config(e.to_string()))
    }

    /// Overlay the `DUPLEX_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DUPLEX_URL") {
            self.url = url;
        }
        if let Ok(namespace) = std::env::var("DUPLEX_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(token) = std::env::var("DUPLEX_TOKEN") {
            self.token = token;
        }
    }

    /// TLS settings, reading the CA file if one is configured.
    pub fn tls_config(&self) -> Result<TlsConfig> {
        let root_ca_pem = match &self.tls.ca_file {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                DuplexError::Config(format!("Cannot read CA file {}: {}", path.display(), e))
            })?),
            None => None,
        };
        Ok(TlsConfig {
            accept_invalid_certs: self.tls.accept_invalid_certs,
            root_ca_pem,
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        Ok(ClientConfig {
            url: self.url.clone(),
            namespace: self.namespace.clone(),
            recursive: self.recursive,
            tls: self.tls_config()?,
            request_timeout: Duration::from_secs(self.rpc.request_timeout_secs),
            retry: RetryPolicy::new(
                Duration::from_secs(self.rpc.reconnect_delay_secs),
                RetryLimit::from_cap(self.rpc.max_connection_retries),
            ),
            events_retry: self.events_retry(),
        })
    }

    pub fn subscriber_options(&self) -> Result<SubscriberOptions> {
        Ok(SubscriberOptions {
            url: self.url.clone(),
            namespace: self.namespace.clone(),
            recursive: self.recursive,
            tls: self.tls_config()?,
            retry: self.events_retry(),
        })
    }

    fn events_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.events.reconnect_delay_secs),
            RetryLimit::from_cap(self.events.max_connection_retries),
        )
    }
}
