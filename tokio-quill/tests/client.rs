// Copyright (C) 2024, The quill Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

mod common;

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use common::ServerBehavior;
use common::TestConnect;
use tokio_quill::Client;
use tokio_quill::ClientConfig;
use tokio_quill::ClientError;
use tokio_quill::Request;

const ORIGIN: &str = "svc.test:443";

fn client_with(
    behavior: ServerBehavior, config: ClientConfig,
) -> (Client<TestConnect>, Arc<ServerBehavior>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (connect, behavior) = TestConnect::new(behavior);

    (Client::with_connector(connect, config), behavior)
}

#[tokio::test]
async fn request_round_trip() {
    let (client, behavior) =
        client_with(ServerBehavior::default(), ClientConfig::new());

    let response = client.send(Request::get(ORIGIN, "/")).await.unwrap();

    assert_eq!(response.status(), Some(200));
    assert_eq!(response.body, b"ok");
    assert_eq!(behavior.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(behavior.connections.load(Ordering::SeqCst), 1);
}

#[rstest]
#[case::blocking(false)]
#[case::handle(true)]
#[tokio::test]
async fn header_size_limit_fails_without_retry(#[case] use_handle: bool) {
    let behavior = ServerBehavior {
        max_field_section_size: Some(256),
        ..Default::default()
    };

    let (client, behavior) = client_with(behavior, ClientConfig::new());

    let request =
        Request::get(ORIGIN, "/").with_header(b"x-big", &[b'x'; 512]);

    let result = if use_handle {
        client.send_async(request).await.unwrap().await
    } else {
        client.send(request).await
    };

    assert!(matches!(result, Err(ClientError::HeaderSizeExceeded)));

    // Failed locally: the server never saw it, and nothing was retried.
    assert_eq!(behavior.accepted.load(Ordering::SeqCst), 0);
    assert_eq!(behavior.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn goaway_retries_exactly_the_unaccepted() {
    let behavior = ServerBehavior {
        goaway_after_first: true,
        ..Default::default()
    };

    let (client, behavior) = client_with(behavior, ClientConfig::new());

    // Accepted on the first connection.
    let first = client.send(Request::get(ORIGIN, "/a")).await.unwrap();
    assert_eq!(first.status(), Some(200));

    // Rejected with GOAWAY on the first connection, replayed on a fresh
    // one.
    let second = client.send(Request::get(ORIGIN, "/b")).await.unwrap();
    assert_eq!(second.status(), Some(200));

    assert_eq!(behavior.accepted.load(Ordering::SeqCst), 2);
    assert_eq!(behavior.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn keep_alive_outlives_transport_idle() {
    let behavior = ServerBehavior {
        idle_ms: 500,
        ..Default::default()
    };

    let mut config = ClientConfig::new();
    config.set_keep_alive(Duration::from_secs(30));

    let (client, behavior) = client_with(behavior, config);

    let first = client.send(Request::get(ORIGIN, "/")).await.unwrap();
    assert_eq!(first.status(), Some(200));

    // Well past the transport idle timeout; PINGs keep the connection up.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let second = client.send(Request::get(ORIGIN, "/")).await.unwrap();
    assert_eq!(second.status(), Some(200));

    assert_eq!(behavior.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idle_connection_without_keep_alive_is_replaced() {
    let behavior = ServerBehavior {
        idle_ms: 300,
        ..Default::default()
    };

    // No application keep-alive: the connection is allowed to idle out.
    let (client, behavior) = client_with(behavior, ClientConfig::new());

    client.send(Request::get(ORIGIN, "/")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;

    let second = client.send(Request::get(ORIGIN, "/")).await.unwrap();
    assert_eq!(second.status(), Some(200));

    assert_eq!(behavior.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn literal_insertion_cap_aborts_request() {
    let mut config = ClientConfig::new();
    config.set_qpack_max_literal_insertions(0, false);

    let (client, behavior) = client_with(ServerBehavior::default(), config);

    let result = client.send(Request::get(ORIGIN, "/")).await;

    assert!(matches!(result, Err(ClientError::TooManyLiteralInsertions)));
    assert_eq!(behavior.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_resolves_exactly_once() {
    let behavior = ServerBehavior {
        stall: true,
        ..Default::default()
    };

    let (client, _behavior) = client_with(behavior, ClientConfig::new());

    let handle = client.send_async(Request::get(ORIGIN, "/")).await.unwrap();

    // Racing duplicate cancels must still produce a single resolution.
    handle.cancel();
    handle.cancel();

    let result = handle.await;
    assert!(matches!(result, Err(ClientError::Cancelled)));
}

#[tokio::test]
async fn always_rejected_surfaces_not_processed() {
    let behavior = ServerBehavior {
        reject_budget: AtomicU32::new(u32::MAX),
        ..Default::default()
    };

    let (client, behavior) = client_with(behavior, ClientConfig::new());

    let err = client.send(Request::get(ORIGIN, "/")).await.unwrap_err();

    assert!(err.to_string().contains("request not processed by peer"));

    // The final underlying cause travels with the exhaustion error.
    match err {
        ClientError::RetriesExhausted(cause) => {
            assert!(matches!(*cause, ClientError::NotProcessed));
        },
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(behavior.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn intermittent_rejection_eventually_succeeds() {
    let behavior = ServerBehavior {
        reject_budget: AtomicU32::new(2),
        ..Default::default()
    };

    let (client, behavior) = client_with(behavior, ClientConfig::new());

    let response = client.send(Request::get(ORIGIN, "/")).await.unwrap();

    assert_eq!(response.status(), Some(200));
    assert_eq!(behavior.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_cap_drains_the_connection() {
    let mut config = ClientConfig::new();
    config.set_max_requests_per_connection(1);

    let (client, behavior) = client_with(ServerBehavior::default(), config);

    let first = client.send(Request::get(ORIGIN, "/")).await.unwrap();
    let second = client.send(Request::get(ORIGIN, "/")).await.unwrap();

    assert_eq!(first.status(), Some(200));
    assert_eq!(second.status(), Some(200));

    // The cap forces each request onto its own connection.
    assert_eq!(behavior.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn preconnect_is_reused() {
    let (client, behavior) =
        client_with(ServerBehavior::default(), ClientConfig::new());

    client.connect(ORIGIN).await.unwrap();

    let response = client.send(Request::get(ORIGIN, "/")).await.unwrap();

    assert_eq!(response.status(), Some(200));
    assert_eq!(behavior.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn post_body_round_trip() {
    let (client, behavior) =
        client_with(ServerBehavior::default(), ClientConfig::new());

    let response = client
        .send(Request::post(ORIGIN, "/upload", vec![b'q'; 20_000]))
        .await
        .unwrap();

    assert_eq!(response.status(), Some(200));
    assert_eq!(behavior.accepted.load(Ordering::SeqCst), 1);
}
