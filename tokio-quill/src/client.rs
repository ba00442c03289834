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

//! Request dispatch, retry policy, and connection establishment.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use quill::h3;
use quill::h3::Header;
use quill::h3::NameValue;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::driver;
use crate::driver::Command;
use crate::driver::Driver;
use crate::driver::Response;
use crate::error::ClientError;
use crate::pool::ConnectionHandle;
use crate::pool::Pool;
use crate::transport::Transport;
use crate::transport::UdpTransport;

/// How HTTP/3 endpoints are discovered for an origin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Dial the origin directly over HTTP/3.
    #[default]
    Http3Only,

    /// Dial the origin directly, but treat HTTP/3 support as unverified
    /// until the first response arrives: connection attempts to an
    /// unverified origin are serialized.
    Upgrade,

    /// Prefer an alternative endpoint learned from `alt-svc` response
    /// headers, falling back to the origin.
    AltSvc,
}

/// Establishes transports for origins.
pub trait Connect: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self, authority: &str,
    ) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// The default connector, dialing `host:port` authorities over UDP.
#[derive(Default)]
pub struct UdpConnect;

impl Connect for UdpConnect {
    type Transport = UdpTransport;

    async fn connect(&self, authority: &str) -> io::Result<UdpTransport> {
        UdpTransport::connect(authority).await
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) discovery: DiscoveryMode,

    pub(crate) max_retries: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) max_retry_backoff: Duration,

    pub(crate) connect_timeout: Duration,
    pub(crate) max_connect_timeout: Duration,

    pub(crate) idle_timeout: Duration,
    pub(crate) keep_alive: Option<Duration>,

    pub(crate) max_requests_per_connection: u64,

    pub(crate) max_field_section_size: Option<u64>,
    pub(crate) qpack_max_table_capacity: u64,
    pub(crate) qpack_blocked_streams: u64,
    pub(crate) qpack_max_literal_insertions: Option<(u64, bool)>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            discovery: DiscoveryMode::Http3Only,
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_millis(200),
            max_connect_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(30),
            keep_alive: None,
            max_requests_per_connection: 100,
            max_field_section_size: None,
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 16,
            qpack_max_literal_insertions: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig::default()
    }

    pub fn set_discovery(&mut self, mode: DiscoveryMode) {
        self.discovery = mode;
    }

    /// Retries for safely replayable failures. Backoff doubles from
    /// `backoff` up to `max_backoff`.
    pub fn set_retries(
        &mut self, max_retries: u32, backoff: Duration, max_backoff: Duration,
    ) {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self.max_retry_backoff = max_backoff;
    }

    /// Initial handshake flight timeout and the overall connect bound.
    pub fn set_connect_timeout(&mut self, initial: Duration, max: Duration) {
        self.connect_timeout = initial;
        self.max_connect_timeout = max;
    }

    pub fn set_idle_timeout(&mut self, v: Duration) {
        self.idle_timeout = v;
    }

    /// Keeps connections alive with PINGs when this exceeds the
    /// negotiated transport idle timeout.
    pub fn set_keep_alive(&mut self, v: Duration) {
        self.keep_alive = Some(v);
    }

    /// Requests dispatched onto one connection before it is drained with
    /// a self-initiated GOAWAY.
    pub fn set_max_requests_per_connection(&mut self, v: u64) {
        self.max_requests_per_connection = v;
    }

    pub fn set_max_field_section_size(&mut self, v: u64) {
        self.max_field_section_size = Some(v);
    }

    pub fn set_qpack_max_table_capacity(&mut self, v: u64) {
        self.qpack_max_table_capacity = v;
    }

    pub fn set_qpack_blocked_streams(&mut self, v: u64) {
        self.qpack_blocked_streams = v;
    }

    pub fn set_qpack_max_literal_insertions(&mut self, v: u64, fallback: bool) {
        self.qpack_max_literal_insertions = Some((v, fallback));
    }
}

/// An HTTP/3 request.
#[derive(Clone, Debug)]
pub struct Request {
    method: String,
    authority: String,
    path: String,
    headers: Vec<Header>,
    body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: &str, authority: &str, path: &str) -> Request {
        Request {
            method: method.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(authority: &str, path: &str) -> Request {
        Request::new("GET", authority, path)
    }

    pub fn post(authority: &str, path: &str, body: Vec<u8>) -> Request {
        let mut req = Request::new("POST", authority, path);
        req.body = Some(body);
        req
    }

    pub fn with_header(mut self, name: &[u8], value: &[u8]) -> Request {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Request {
        self.body = Some(body);
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Whether replaying the request cannot change its outcome.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method.as_str(),
            "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS" | "TRACE"
        )
    }

    fn field_section(&self) -> Vec<Header> {
        let mut headers = vec![
            Header::new(b":method", self.method.as_bytes()),
            Header::new(b":scheme", b"https"),
            Header::new(b":authority", self.authority.as_bytes()),
            Header::new(b":path", self.path.as_bytes()),
        ];

        headers.extend(self.headers.iter().cloned());
        headers
    }
}

/// A request that has been handed to a connection driver.
///
/// Resolves exactly once, either with the response, with the failure, or
/// with [`ClientError::Cancelled`] after [`cancel()`](Self::cancel).
pub struct InflightHandle {
    token: u64,
    commands: mpsc::UnboundedSender<Command>,
    response: oneshot::Receiver<Result<Response, ClientError>>,
}

impl InflightHandle {
    /// Asks the driver to abandon the request. The handle still resolves,
    /// with whichever outcome wins the race.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel { token: self.token });
    }
}

impl Future for InflightHandle {
    type Output = Result<Response, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.response)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ClientError::ConnectionGone)))
    }
}

/// An HTTP/3 client with per-origin connection pooling and a retry policy
/// for requests the peer provably did not process.
pub struct Client<C: Connect = UdpConnect> {
    connector: C,
    config: ClientConfig,
    pool: Pool,
    next_token: AtomicU64,

    /// Alternative endpoints learned from `alt-svc` headers.
    alt_endpoints: parking_lot::Mutex<HashMap<String, String>>,

    /// Origins with at least one completed HTTP/3 exchange.
    verified: parking_lot::Mutex<HashSet<String>>,

    /// Serializes first-time dials in `Upgrade` mode.
    dial_lock: tokio::sync::Mutex<()>,
}

impl Client<UdpConnect> {
    pub fn new(config: ClientConfig) -> Client<UdpConnect> {
        Client::with_connector(UdpConnect, config)
    }
}

impl<C: Connect> Client<C> {
    pub fn with_connector(connector: C, config: ClientConfig) -> Client<C> {
        Client {
            connector,
            config,
            pool: Pool::default(),
            next_token: AtomicU64::new(0),
            alt_endpoints: parking_lot::Mutex::new(HashMap::new()),
            verified: parking_lot::Mutex::new(HashSet::new()),
            dial_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Establishes (or reuses) a connection to the origin without sending
    /// a request, leaving it pooled for later use.
    pub async fn connect(&self, origin: &str) -> Result<(), ClientError> {
        let handle = self.connection(origin).await?;

        // No request follows; give the reserved slot back.
        handle.checked_out.fetch_sub(1, Ordering::Relaxed);

        Ok(())
    }

    /// Sends a request, retrying per the configured policy when the
    /// failure is safe to replay.
    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        let idempotent = request.is_idempotent();

        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;

        loop {
            match self.send_once(&request).await {
                Ok(resp) => {
                    self.record_success(&request, &resp);
                    return Ok(resp);
                },

                Err(e) => {
                    let retriable = e.is_unprocessed() ||
                        (idempotent && e.is_retriable_for_idempotent());

                    if !retriable {
                        return Err(e);
                    }

                    if attempt >= self.config.max_retries {
                        return Err(ClientError::RetriesExhausted(Box::new(e)));
                    }

                    attempt += 1;
                    debug!(
                        "retrying after {e:?} (attempt {attempt}, backoff {backoff:?})"
                    );

                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_retry_backoff);
                },
            }
        }
    }

    /// Dispatches a request without retries and returns a handle that
    /// resolves with its outcome.
    pub async fn send_async(
        &self, request: Request,
    ) -> Result<InflightHandle, ClientError> {
        self.dispatch(&request).await
    }

    /// Cancels a dispatched request.
    pub fn cancel(&self, handle: &InflightHandle) {
        handle.cancel();
    }

    async fn send_once(&self, request: &Request) -> Result<Response, ClientError> {
        self.dispatch(request).await?.await
    }

    async fn dispatch(
        &self, request: &Request,
    ) -> Result<InflightHandle, ClientError> {
        let headers = request.field_section();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        // A handle may die between checkout and dispatch; take another.
        for _ in 0..3 {
            let handle = self.connection(&request.authority).await?;

            let (tx, rx) = oneshot::channel();

            let cmd = Command::Request {
                headers: headers.clone(),
                body: request.body.clone(),
                token,
                completer: tx,
            };

            if handle.commands.send(cmd).is_ok() {
                return Ok(InflightHandle {
                    token,
                    commands: handle.commands.clone(),
                    response: rx,
                });
            }
        }

        Err(ClientError::NotProcessed)
    }

    async fn connection(
        &self, origin: &str,
    ) -> Result<ConnectionHandle, ClientError> {
        let cap = self.config.max_requests_per_connection;

        if let Some(handle) = self.pool.checkout(origin, cap) {
            return Ok(handle);
        }

        let _serialized = if self.config.discovery == DiscoveryMode::Upgrade &&
            !self.verified.lock().contains(origin)
        {
            let guard = self.dial_lock.lock().await;

            // Another task may have finished dialing while we waited.
            if let Some(handle) = self.pool.checkout(origin, cap) {
                return Ok(handle);
            }

            Some(guard)
        } else {
            None
        };

        let target = self.resolve_target(origin);

        let mut transport = tokio::time::timeout(
            self.config.max_connect_timeout,
            self.connector.connect(&target),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;

        let mut conn = quill::connect(Some(origin), &mut self.quic_config()?)
            .map_err(ClientError::Handshake)?;

        driver::handshake(&mut conn, &mut transport).await?;

        let h3_conn =
            h3::Connection::with_transport(&mut conn, &self.h3_config()?)
                .map_err(ClientError::H3)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let draining = Arc::new(AtomicBool::new(false));

        let driver = Driver::new(
            transport,
            conn,
            h3_conn,
            rx,
            Arc::clone(&draining),
            cap,
            self.config.keep_alive,
        );

        tokio::spawn(driver.run());

        info!("connected to {target} for origin {origin}");

        let handle = ConnectionHandle::new(tx, draining);
        self.pool.insert(origin, handle.clone());

        Ok(handle)
    }

    fn quic_config(&self) -> Result<quill::Config, ClientError> {
        let mut config = quill::Config::new().map_err(ClientError::Handshake)?;

        config.set_max_idle_timeout(self.config.idle_timeout.as_millis() as u64);
        config.set_initial_max_data(10_000_000);
        config.set_initial_max_stream_data_bidi_local(1_000_000);
        config.set_initial_max_stream_data_bidi_remote(1_000_000);
        config.set_initial_max_stream_data_uni(1_000_000);
        config.set_initial_max_streams_bidi(100);
        config.set_initial_max_streams_uni(8);
        config.set_handshake_timeout(self.config.connect_timeout);
        config.set_max_handshake_timeout(self.config.max_connect_timeout);

        Ok(config)
    }

    fn h3_config(&self) -> Result<h3::Config, ClientError> {
        let mut config = h3::Config::new().map_err(ClientError::H3)?;

        if let Some(v) = self.config.max_field_section_size {
            config.set_max_field_section_size(v);
        }

        config.set_qpack_max_table_capacity(self.config.qpack_max_table_capacity);
        config.set_qpack_blocked_streams(self.config.qpack_blocked_streams);

        if let Some((cap, fallback)) = self.config.qpack_max_literal_insertions {
            config.set_qpack_max_literal_insertions(cap, fallback);
        }

        Ok(config)
    }

    fn resolve_target(&self, origin: &str) -> String {
        if self.config.discovery == DiscoveryMode::AltSvc {
            if let Some(alt) = self.alt_endpoints.lock().get(origin) {
                return alt.clone();
            }
        }

        origin.to_string()
    }

    fn record_success(&self, request: &Request, response: &Response) {
        self.verified.lock().insert(request.authority.clone());

        let alt = response
            .headers
            .iter()
            .find(|h| h.name() == b"alt-svc")
            .and_then(|h| parse_alt_svc(&request.authority, h.value()));

        if let Some(alt) = alt {
            debug!("learned alternative endpoint {alt} for {}", request.authority);
            self.alt_endpoints
                .lock()
                .insert(request.authority.clone(), alt);
        }
    }
}

/// Extracts the first `h3` endpoint from an `alt-svc` header value, e.g.
/// `h3=":443"; ma=3600` or `h3="alt.example.org:443"`.
fn parse_alt_svc(origin: &str, value: &[u8]) -> Option<String> {
    let value = std::str::from_utf8(value).ok()?;

    let rest = value.split("h3=\"").nth(1)?;
    let endpoint = rest.split('"').next()?;

    if endpoint.is_empty() {
        return None;
    }

    if let Some(port) = endpoint.strip_prefix(':') {
        let host = origin.rsplit_once(':').map_or(origin, |(h, _)| h);
        return Some(format!("{host}:{port}"));
    }

    Some(endpoint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_methods() {
        assert!(Request::get("example.org:443", "/").is_idempotent());
        assert!(!Request::post("example.org:443", "/", vec![]).is_idempotent());
    }

    #[test]
    fn alt_svc_same_host() {
        assert_eq!(
            parse_alt_svc("example.org:443", b"h3=\":8443\"; ma=3600"),
            Some("example.org:8443".to_string())
        );
    }

    #[test]
    fn alt_svc_other_host() {
        assert_eq!(
            parse_alt_svc("example.org:443", b"h3=\"alt.example.org:443\""),
            Some("alt.example.org:443".to_string())
        );
    }

    #[test]
    fn alt_svc_absent() {
        assert_eq!(parse_alt_svc("example.org:443", b"h2=\":443\""), None);
    }
}
