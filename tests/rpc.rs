//! RPC channel integration tests
//!
//! Drives `DuplexClient` against the in-process transport: correlation,
//! timeouts, reconnection and shutdown.

mod common;

use std::time::Duration;

use common::*;
use elohim_duplex::{DuplexError, Operation, RetryLimit, RetryPolicy};
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde_json::json;

// =============================================================================
// Correlation
// =============================================================================

#[tokio::test]
async fn test_concurrent_requests_resolve_out_of_order() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;

    let requests: Vec<_> = (0..5)
        .map(|i| client.request(Operation::Retrieve, "host").with_object_id(format!("h{}", i)))
        .collect();

    let server = async {
        let mut received = Vec::new();
        for _ in 0..requests.len() {
            received.push(next_request(&mut peer).await);
        }
        // Answer newest first
        for request in received.iter().rev() {
            let object_id = request.object_id.clone().unwrap_or_default();
            peer.send(response_frame(&request.id, 200, json!({"id": object_id})));
        }
    };

    let (results, _) = tokio::join!(join_all(requests.iter().map(|r| client.send(r))), server);

    for (request, result) in requests.iter().zip(results) {
        let response = result.expect("request failed");
        assert_eq!(response.request_id, request.id);
        assert_eq!(response.payload["id"], json!(request.object_id.clone().unwrap()));
    }
    assert!(client.correlator().is_empty());
}

#[tokio::test]
async fn test_first_send_goes_out_without_yielding() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;
    let request = client.request(Operation::Info, "root");

    // One poll, before the background reader has had a chance to run
    let attempt = client.send(&request).now_or_never();
    assert!(attempt.is_none(), "send ended without an answer: {:?}", attempt);

    let received = next_request(&mut peer).await;
    assert_eq!(received.id, request.id);
}

#[tokio::test]
async fn test_request_carries_namespace_and_credential() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;
    client.set_credential("token-2");

    let request = client.request(Operation::Info, "root");
    let server = async {
        let received = next_request(&mut peer).await;
        peer.send(response_frame(&received.id, 200, json!({})));
        received
    };

    let (result, received) = tokio::join!(client.send(&request), server);

    result.unwrap();
    assert_eq!(received.namespace, "/acme");
    assert_eq!(received.credential, "token-2");
    assert_eq!(client.current_credential(), "token-2");
}

#[tokio::test]
async fn test_duplicate_response_is_delivered_once() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;
    let request = client.request(Operation::Retrieve, "host");

    let server = async {
        let received = next_request(&mut peer).await;
        peer.send(response_frame(&received.id, 200, json!({"copy": 1})));
        peer.send(response_frame(&received.id, 200, json!({"copy": 2})));
    };

    let (result, _) = tokio::join!(client.send(&request), server);

    assert_eq!(result.unwrap().payload["copy"], json!(1));
    assert!(client.correlator().is_empty());

    // The connection keeps working after the stray duplicate
    let next = client.request(Operation::Info, "root");
    let server = async {
        let received = next_request(&mut peer).await;
        peer.send(response_frame(&received.id, 200, json!({"ok": true})));
    };
    let (result, _) = tokio::join!(client.send(&next), server);
    assert_eq!(result.unwrap().payload["ok"], json!(true));
}

#[tokio::test]
async fn test_error_status_is_decoded() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;
    let request = client.request(Operation::Create, "host");

    let server = async {
        let received = next_request(&mut peer).await;
        peer.send(response_frame(
            &received.id,
            422,
            json!([
                {"code": 422, "title": "Validation Error", "description": "name is required", "subject": "api"},
                {"code": 422, "title": "Validation Error", "description": "port out of range", "subject": "api"}
            ]),
        ));
    };

    let (result, _) = tokio::join!(client.send(&request), server);

    match result {
        Err(DuplexError::Application { status_code, errors }) => {
            assert_eq!(status_code, 422);
            assert_eq!(errors.len(), 2);
            assert_eq!(errors[1].description, "port out of range");
        }
        other => panic!("expected application error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_status_300_is_success() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;
    let request = client.request(Operation::Retrieve, "host");

    let server = async {
        let received = next_request(&mut peer).await;
        peer.send(response_frame(&received.id, 300, json!({})));
    };

    let (result, _) = tokio::join!(client.send(&request), server);
    assert_eq!(result.unwrap().status_code, 300);
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let mut config = client_config();
    config.request_timeout = Duration::from_secs(5);
    let (client, mut peer, _dialer, _server) = connect(config).await;
    let request = client.request(Operation::Retrieve, "host");

    let started = tokio::time::Instant::now();
    let (result, received) = tokio::join!(client.send(&request), next_request(&mut peer));

    assert!(
        matches!(result, Err(DuplexError::Timeout(d)) if d == Duration::from_secs(5)),
        "expected timeout, got {:?}",
        result
    );
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(received.id, request.id);
    assert!(client.correlator().is_empty(), "timed out request must be unregistered");

    // A late answer is dropped
    peer.send(response_frame(&request.id, 200, json!({})));
    tokio::task::yield_now().await;
    assert!(client.correlator().is_empty());
}

#[tokio::test]
async fn test_abandoned_send_unregisters() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;
    let request = client.request(Operation::Retrieve, "host");

    {
        let send = client.send(&request);
        tokio::pin!(send);
        tokio::select! {
            _ = &mut send => panic!("nobody answered"),
            received = next_request(&mut peer) => assert_eq!(received.id, request.id),
        }
        assert_eq!(client.correlator().len(), 1);
    }

    assert!(client.correlator().is_empty());
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test]
async fn test_stale_response_after_reconnect_is_not_delivered() {
    let (client, mut peer, _dialer, mut server) = connect(client_config()).await;
    let request = client.request(Operation::Retrieve, "host");

    let replace_connection = async {
        let received = next_request(&mut peer).await;
        peer.abort();
        let fresh = accept_rpc(&mut server).await;
        (received, fresh)
    };

    let (result, (received, mut fresh)) = tokio::join!(client.send(&request), replace_connection);

    assert!(
        matches!(result, Err(DuplexError::CannotCommunicate(_))),
        "in-flight request must fail when its connection is replaced, got {:?}",
        result
    );
    assert!(client.correlator().is_empty());

    // The old request's answer shows up on the new connection
    fresh.send(response_frame(&received.id, 200, json!({"stale": true})));

    let retry = client.request(Operation::Retrieve, "host");
    let server = async {
        let received = next_request(&mut fresh).await;
        fresh.send(response_frame(&received.id, 200, json!({"stale": false})));
    };
    let (result, _) = tokio::join!(client.send(&retry), server);

    assert_eq!(result.unwrap().payload["stale"], json!(false));
    assert!(client.correlator().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_uses_current_credential() {
    let (client, mut peer, dialer, mut server) = connect(client_config()).await;
    assert!(peer.endpoint.contains("token=token-1"));
    assert!(peer.endpoint.starts_with("ws://api.test/wsapi?"));

    client.set_credential("token-2");
    dialer.fail_next(2);
    peer.abort();

    let started = tokio::time::Instant::now();
    let fresh = accept_rpc(&mut server).await;

    assert!(fresh.endpoint.contains("token=token-2"));
    assert_eq!(dialer.dial_attempts(), 4);
    // Two failed dials, two fixed delays
    assert!(started.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnect_fails_later_sends() {
    let mut config = client_config();
    config.retry = RetryPolicy::new(Duration::from_secs(3), RetryLimit::Attempts(2));
    let (client, mut peer, dialer, _server) = connect(config).await;

    dialer.set_refusing(true);
    peer.abort();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(dialer.dial_attempts(), 3);
    let result = client.send(&client.request(Operation::Info, "root")).await;
    assert!(
        matches!(result, Err(DuplexError::Disconnected(_))),
        "got {:?}",
        result
    );
}

// =============================================================================
// Handshake and shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rejected_handshake_is_application_error() {
    let (dialer, mut server) = elohim_duplex::transport::memory::pair();
    let mut config = client_config();
    config.retry = RetryPolicy::new(Duration::from_secs(3), RetryLimit::Attempts(2));

    let server_side = async {
        for _ in 0..2 {
            let peer = server.accept().await.unwrap();
            peer.send(response_frame(
                "",
                401,
                json!([{"code": 401, "title": "Unauthorized", "description": "token expired"}]),
            ));
        }
    };

    let (result, _) = tokio::join!(
        elohim_duplex::DuplexClient::connect(
            config,
            std::sync::Arc::new(dialer.clone()),
            elohim_duplex::CredentialStore::new("expired")
        ),
        server_side
    );

    match result {
        Err(DuplexError::DialFailure { attempts, source }) => {
            assert_eq!(attempts, 2);
            assert_eq!(source.status_code(), Some(401));
        }
        Err(e) => panic!("unexpected error {:?}", e),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_interrupts_stalled_handshake() {
    let (client, mut peer, _dialer, mut server) = connect(client_config()).await;

    peer.abort();
    // Redial accepted, greeting never sent
    let _silent = server.accept().await.unwrap();

    let started = tokio::time::Instant::now();
    client.close().await.unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(1),
        "close waited {:?} on the handshake",
        started.elapsed()
    );
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_send_after_close_is_disconnected() {
    let (client, mut peer, _dialer, _server) = connect(client_config()).await;

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert!(client.is_closed());
    assert_eq!(peer.close_count(), 1);
    assert!(peer.recv().await.is_none());

    let result = client.send(&client.request(Operation::Info, "root")).await;
    assert!(
        matches!(result, Err(DuplexError::Disconnected(_))),
        "got {:?}",
        result
    );
}
