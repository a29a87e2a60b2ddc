//! Shared helpers: an in-process object API driven by hand from each test.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use elohim_duplex::transport::memory::{self, MemoryDialer, MemoryServer, PeerConnection};
use elohim_duplex::{
    ClientConfig, CredentialStore, DuplexClient, Request, RetryLimit, RetryPolicy,
    SubscriberOptions, TlsConfig,
};
use serde_json::{json, Value};

pub const API_URL: &str = "http://api.test";

pub fn client_config() -> ClientConfig {
    ClientConfig {
        url: API_URL.to_string(),
        namespace: "/acme".to_string(),
        request_timeout: Duration::from_secs(30),
        retry: RetryPolicy::new(Duration::from_secs(3), RetryLimit::Unlimited),
        ..Default::default()
    }
}

pub fn subscriber_options(limit: RetryLimit) -> SubscriberOptions {
    SubscriberOptions {
        url: API_URL.to_string(),
        namespace: "/acme".to_string(),
        recursive: false,
        tls: TlsConfig::default(),
        retry: RetryPolicy::new(Duration::from_secs(5), limit),
    }
}

/// Accept the next RPC connection and greet it.
pub async fn accept_rpc(server: &mut MemoryServer) -> PeerConnection {
    let peer = server.accept().await.expect("dialer dropped");
    assert!(peer.send(json!({"requestID": "", "statusCode": 200}).to_string()));
    peer
}

/// Connect a client, playing the server side of the handshake.
pub async fn connect(config: ClientConfig) -> (DuplexClient, PeerConnection, MemoryDialer, MemoryServer) {
    let (dialer, mut server) = memory::pair();
    let credentials = CredentialStore::new("token-1");

    let (client, peer) = tokio::join!(
        DuplexClient::connect(config, Arc::new(dialer.clone()), credentials),
        accept_rpc(&mut server)
    );

    (client.expect("connect failed"), peer, dialer, server)
}

/// Read the next request written by the client.
pub async fn next_request(peer: &mut PeerConnection) -> Request {
    let frame = peer.recv().await.expect("client closed the connection");
    serde_json::from_str(&frame).expect("frame is not a request")
}

pub fn response_frame(request_id: &str, status_code: u16, payload: Value) -> String {
    json!({
        "requestID": request_id,
        "statusCode": status_code,
        "total": 1,
        "payload": payload,
    })
    .to_string()
}

pub fn event_frame(event_type: &str, identity: &str, id: usize) -> String {
    json!({
        "type": event_type,
        "identity": identity,
        "entity": {"id": id},
    })
    .to_string()
}
