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

//! Per-connection driver task.
//!
//! Each connection is owned by exactly one task running [`Driver::run`].
//! All interaction happens over a command channel, and each request is
//! completed exactly once through its oneshot slot.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use quill::h3;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::transport::Transport;
use crate::transport::MAX_DATAGRAM_SIZE;

/// A completed HTTP/3 exchange.
#[derive(Debug)]
pub struct Response {
    pub headers: Vec<h3::Header>,
    pub body: Vec<u8>,
}

impl Response {
    /// The `:status` pseudo-header, if present and numeric.
    pub fn status(&self) -> Option<u64> {
        use quill::h3::NameValue;

        self.headers
            .iter()
            .find(|h| h.name() == b":status")
            .and_then(|h| std::str::from_utf8(h.value()).ok())
            .and_then(|v| v.parse().ok())
    }
}

pub(crate) type Completer = oneshot::Sender<Result<Response, ClientError>>;

pub(crate) enum Command {
    Request {
        headers: Vec<h3::Header>,
        body: Option<Vec<u8>>,
        token: u64,
        completer: Completer,
    },

    Cancel {
        token: u64,
    },
}

enum Wake {
    Command(Option<Command>),
    Datagram(std::io::Result<usize>),
    Timer,
}

struct QueuedRequest {
    headers: Vec<h3::Header>,
    body: Option<Vec<u8>>,
    token: u64,
    completer: Completer,
}

struct Inflight {
    token: u64,
    completer: Completer,
    headers: Option<Vec<h3::Header>>,
    body: Vec<u8>,

    /// Request body bytes not yet accepted by flow control, and the
    /// offset of the next byte to send.
    outgoing: Option<(Vec<u8>, usize)>,
}

pub(crate) struct Driver<T: Transport> {
    transport: T,
    conn: quill::Connection,
    h3: h3::Connection,

    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,

    queued: VecDeque<QueuedRequest>,
    inflight: HashMap<u64, Inflight>,
    streams_by_token: HashMap<u64, u64>,

    /// Shared with the pool: set once no new request may start here.
    draining: Arc<AtomicBool>,

    /// Requests started on this connection, for the self-imposed cap.
    started: u64,
    max_requests: u64,
    goaway_sent: bool,

    ping_interval: Option<Duration>,
    next_ping: Option<Instant>,
}

/// Drives the QUIC handshake to completion over the given transport.
pub(crate) async fn handshake<T: Transport>(
    conn: &mut quill::Connection, transport: &mut T,
) -> Result<(), ClientError> {
    let mut out = vec![0; MAX_DATAGRAM_SIZE];
    let mut buf = vec![0; MAX_DATAGRAM_SIZE];

    while !conn.is_established() {
        loop {
            match conn.send(&mut out, Instant::now()) {
                Ok(n) => transport.send(&out[..n]).await?,

                Err(quill::Error::Done) => break,

                Err(e) => return Err(ClientError::Handshake(e)),
            }
        }

        if conn.is_closed() {
            if conn.is_timed_out() {
                return Err(ClientError::ConnectTimeout);
            }

            return Err(ClientError::Handshake(quill::Error::HandshakeFail));
        }

        tokio::select! {
            r = transport.recv(&mut buf) => {
                let n = r?;

                if let Err(e) = conn.recv(&buf[..n], Instant::now()) {
                    return Err(ClientError::Handshake(e));
                }
            },

            _ = wait_deadline(conn.timeout_instant()) => {
                conn.on_timeout(Instant::now());
            },
        }
    }

    Ok(())
}

impl<T: Transport> Driver<T> {
    pub(crate) fn new(
        transport: T, conn: quill::Connection, h3: h3::Connection,
        commands: mpsc::UnboundedReceiver<Command>, draining: Arc<AtomicBool>,
        max_requests: u64, keep_alive: Option<Duration>,
    ) -> Driver<T> {
        // A PING at half the transport idle period keeps the connection
        // alive when the application wants it around for longer.
        let ping_interval = match (conn.idle_timeout(), keep_alive) {
            (Some(idle), Some(app)) if app > idle => Some(idle / 2),

            _ => None,
        };

        let next_ping = ping_interval.map(|i| Instant::now() + i);

        Driver {
            transport,
            conn,
            h3,
            commands,
            commands_open: true,
            queued: VecDeque::new(),
            inflight: HashMap::new(),
            streams_by_token: HashMap::new(),
            draining,
            started: 0,
            max_requests,
            goaway_sent: false,
            ping_interval,
            next_ping,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];

        loop {
            if let Err(e) = self.pump() {
                debug!("connection failed: {e:?}");
                self.conn.close(true, e.to_wire(), b"").ok();
            }

            if self.flush().await.is_err() {
                self.fail_all(|| ClientError::ConnectionGone);
                return;
            }

            if self.conn.is_closed() {
                self.fail_all(|| ClientError::ConnectionGone);
                return;
            }

            let deadline = earliest(self.conn.timeout_instant(), self.next_ping);

            let wake = tokio::select! {
                cmd = self.commands.recv(), if self.commands_open =>
                    Wake::Command(cmd),

                r = self.transport.recv(&mut buf) => Wake::Datagram(r),

                _ = wait_deadline(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Command(Some(cmd)) => self.handle_command(cmd),

                Wake::Command(None) => {
                    // All handles are gone; wind the connection down
                    // cleanly.
                    self.commands_open = false;
                    self.conn
                        .close(true, h3::WireErrorCode::NoError as u64, b"")
                        .ok();
                },

                Wake::Datagram(Ok(n)) => {
                    if let Err(e) = self.conn.recv(&buf[..n], Instant::now())
                    {
                        trace!("recv failed: {e:?}");
                    }
                },

                Wake::Datagram(Err(e)) => {
                    trace!("transport gone: {e:?}");
                    self.fail_all(|| ClientError::ConnectionGone);
                    return;
                },

                Wake::Timer => {
                    let now = Instant::now();

                    if self.conn.timeout_instant().is_some_and(|t| t <= now) {
                        self.conn.on_timeout(now);
                    }

                    if self.next_ping.is_some_and(|t| t <= now) {
                        self.conn.send_ping();
                    }
                },
            }
        }
    }

    /// Makes all progress that does not require waiting: starts queued
    /// requests, writes request bodies, and surfaces peer events.
    fn pump(&mut self) -> h3::Result<()> {
        self.start_queued_requests();
        self.write_bodies();
        self.poll_events()
    }

    fn start_queued_requests(&mut self) {
        while let Some(req) = self.queued.pop_front() {
            if self.draining.load(Ordering::Relaxed) ||
                self.started >= self.max_requests
            {
                let _ = req.completer.send(Err(ClientError::NotProcessed));
                continue;
            }

            let fin = req.body.is_none();

            match self.h3.send_request(&mut self.conn, &req.headers, fin) {
                Ok(stream_id) => {
                    self.started += 1;

                    if self.started >= self.max_requests {
                        self.drain_self();
                    }

                    self.streams_by_token.insert(req.token, stream_id);
                    self.inflight.insert(stream_id, Inflight {
                        token: req.token,
                        completer: req.completer,
                        headers: None,
                        body: Vec::new(),
                        outgoing: req.body.map(|b| (b, 0)),
                    });
                },

                Err(h3::Error::StreamBlocked) => {
                    self.queued.push_front(req);
                    break;
                },

                Err(h3::Error::HeaderSizeExceeded) => {
                    let _ = req
                        .completer
                        .send(Err(ClientError::HeaderSizeExceeded));
                },

                Err(h3::Error::TooManyLiteralInsertions) => {
                    let _ = req
                        .completer
                        .send(Err(ClientError::TooManyLiteralInsertions));
                },

                Err(e) => {
                    let _ = req.completer.send(Err(ClientError::H3(e)));
                },
            }
        }
    }

    /// The request cap was reached: refuse new work and tell the peer no
    /// more pushes will be honored either.
    fn drain_self(&mut self) {
        self.draining.store(true, Ordering::Relaxed);

        if !self.goaway_sent {
            self.goaway_sent = true;
            self.h3.send_goaway(&mut self.conn, 0).ok();
        }
    }

    fn write_bodies(&mut self) {
        let stream_ids: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, inf)| inf.outgoing.is_some())
            .map(|(&id, _)| id)
            .collect();

        for stream_id in stream_ids {
            let Some(inf) = self.inflight.get_mut(&stream_id) else {
                continue;
            };

            let Some((body, mut off)) = inf.outgoing.take() else {
                continue;
            };

            loop {
                match self.h3.send_body(
                    &mut self.conn,
                    stream_id,
                    &body[off..],
                    true,
                ) {
                    Ok(n) => {
                        off += n;

                        if off == body.len() {
                            break;
                        }
                    },

                    Err(h3::Error::Done) => {
                        // Flow control pushed back; resume later without
                        // holding a thread.
                        inf.outgoing = Some((body, off));
                        break;
                    },

                    Err(e) => {
                        self.complete(stream_id, Err(ClientError::H3(e)));
                        break;
                    },
                }
            }
        }
    }

    fn poll_events(&mut self) -> h3::Result<()> {
        loop {
            match self.h3.poll(&mut self.conn) {
                Ok((stream_id, event)) => self.handle_event(stream_id, event),

                Err(h3::Error::Done) => return Ok(()),

                Err(e) => {
                    self.fail_all(|| ClientError::H3(e));
                    return Err(e);
                },
            }
        }
    }

    fn handle_event(&mut self, stream_id: u64, event: h3::Event) {
        match event {
            h3::Event::Headers { list, .. } => {
                if let Some(inf) = self.inflight.get_mut(&stream_id) {
                    inf.headers = Some(list);
                }
            },

            h3::Event::Data => {
                let mut buf = [0; 4096];

                loop {
                    match self.h3.recv_body(
                        &mut self.conn,
                        stream_id,
                        &mut buf,
                    ) {
                        Ok(n) => {
                            if let Some(inf) =
                                self.inflight.get_mut(&stream_id)
                            {
                                inf.body.extend_from_slice(&buf[..n]);
                            }
                        },

                        Err(h3::Error::Done) => break,

                        Err(e) => {
                            self.complete(
                                stream_id,
                                Err(ClientError::H3(e)),
                            );
                            break;
                        },
                    }
                }
            },

            h3::Event::Finished => {
                let result = match self
                    .inflight
                    .get_mut(&stream_id)
                    .and_then(|inf| inf.headers.take())
                {
                    Some(headers) => {
                        let body = self
                            .inflight
                            .get_mut(&stream_id)
                            .map(|inf| std::mem::take(&mut inf.body))
                            .unwrap_or_default();

                        Ok(Response { headers, body })
                    },

                    // The stream ended without a response.
                    None => Err(ClientError::ConnectionGone),
                };

                self.complete(stream_id, result);
            },

            h3::Event::Reset(code) => {
                let err = match code {
                    c if c == h3::WireErrorCode::RequestRejected as u64 =>
                        ClientError::NotProcessed,

                    c if c == h3::WireErrorCode::RequestCancelled as u64 =>
                        ClientError::Cancelled,

                    c => ClientError::StreamReset(c),
                };

                self.complete(stream_id, Err(err));
            },

            h3::Event::GoAway(id) => {
                debug!("peer goaway, last accepted stream {id}");

                self.draining.store(true, Ordering::Relaxed);

                // Streams above the accepted ID were never processed;
                // everything at or below it drains normally.
                let rejected: Vec<u64> = self
                    .inflight
                    .keys()
                    .copied()
                    .filter(|&sid| sid > id)
                    .collect();

                for sid in rejected {
                    self.complete(sid, Err(ClientError::NotProcessed));
                }

                for req in self.queued.drain(..) {
                    let _ =
                        req.completer.send(Err(ClientError::NotProcessed));
                }
            },

            h3::Event::PushPromise { push_id } => {
                // Nothing subscribes to pushes; refuse them.
                self.h3.cancel_push(&mut self.conn, push_id).ok();
            },

            h3::Event::PushCanceled { push_id } => {
                trace!("push {push_id} canceled by peer");
            },
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request {
                headers,
                body,
                token,
                completer,
            } => {
                self.queued.push_back(QueuedRequest {
                    headers,
                    body,
                    token,
                    completer,
                });
            },

            Command::Cancel { token } => {
                if let Some(pos) =
                    self.queued.iter().position(|q| q.token == token)
                {
                    if let Some(req) = self.queued.remove(pos) {
                        let _ =
                            req.completer.send(Err(ClientError::Cancelled));
                    }

                    return;
                }

                if let Some(stream_id) = self.streams_by_token.get(&token) {
                    let stream_id = *stream_id;

                    self.h3.cancel_request(&mut self.conn, stream_id).ok();
                    self.complete(stream_id, Err(ClientError::Cancelled));
                }
            },
        }
    }

    /// Resolves a request exactly once and forgets its stream.
    fn complete(
        &mut self, stream_id: u64, result: Result<Response, ClientError>,
    ) {
        if let Some(inf) = self.inflight.remove(&stream_id) {
            self.streams_by_token.remove(&inf.token);
            let _ = inf.completer.send(result);
        }
    }

    fn fail_all(&mut self, err: impl Fn() -> ClientError) {
        self.draining.store(true, Ordering::Relaxed);

        for (_, inf) in self.inflight.drain() {
            let _ = inf.completer.send(Err(err()));
        }

        for req in self.queued.drain(..) {
            let _ = req.completer.send(Err(err()));
        }

        self.streams_by_token.clear();
    }

    /// Sends every flight the connection has pending, restarting the
    /// keep-alive clock if anything went out.
    async fn flush(&mut self) -> Result<(), ClientError> {
        let mut out = vec![0; MAX_DATAGRAM_SIZE];
        let mut sent_any = false;

        loop {
            match self.conn.send(&mut out, Instant::now()) {
                Ok(n) => {
                    self.transport.send(&out[..n]).await?;
                    sent_any = true;
                },

                Err(quill::Error::Done) => break,

                Err(e) => {
                    trace!("send failed: {e:?}");
                    break;
                },
            }
        }

        if sent_any {
            if let Some(interval) = self.ping_interval {
                self.next_ping = Some(Instant::now() + interval);
            }
        }

        Ok(())
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) =>
            tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,

        None => futures::future::pending().await,
    }
}
