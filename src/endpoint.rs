//! Endpoint URLs
//!
//! The object API is configured with its HTTP base URL. Duplex connections use
//! the same host with a WebSocket scheme, a channel path, and the credential and
//! namespace in the query string.

use url::Url;

use crate::error::DuplexError;

/// Path of the request/response channel.
pub const RPC_PATH: &str = "wsapi";

/// Path of the push event channel.
pub const EVENTS_PATH: &str = "events";

/// Build the WebSocket URL for `path` on the API at `base`.
///
/// `http://` becomes `ws://` and `https://` becomes `wss://`; WebSocket URLs
/// are kept as they are. `recursive` asks for events from child namespaces
/// too (`mode=all`).
pub fn make_url(
    base: &str,
    path: &str,
    namespace: &str,
    token: &str,
    recursive: bool,
) -> Result<String, DuplexError> {
    let mut url = Url::parse(base)
        .map_err(|e| DuplexError::Config(format!("Invalid API URL '{}': {}", base, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(DuplexError::Config(format!(
                "Unsupported URL scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| DuplexError::Config(format!("Cannot use scheme '{}' for {}", scheme, base)))?;

    url.path_segments_mut()
        .map_err(|_| DuplexError::Config(format!("API URL cannot be a base: {}", base)))?
        .pop_if_empty()
        .push(path);

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("token", token);
        if !namespace.is_empty() {
            query.append_pair("namespace", namespace);
        }
        if recursive {
            query.append_pair("mode", "all");
        }
    }

    Ok(url.into())
}
