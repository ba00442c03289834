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

//! An in-process HTTP/3 server for exercising the client end to end.

use std::io;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio_quill::quill;
use tokio_quill::quill::h3;
use tokio_quill::transport::pipe;
use tokio_quill::transport::Pipe;
use tokio_quill::transport::Transport;
use tokio_quill::transport::MAX_DATAGRAM_SIZE;
use tokio_quill::Connect;

const H3_REQUEST_REJECTED: u64 = 0x10b;

/// Scripted server behavior, shared across every connection a test makes.
pub struct ServerBehavior {
    /// Requests to reset with `H3_REQUEST_REJECTED` before accepting any.
    pub reject_budget: AtomicU32,

    /// Accept the first request stream only; reject later ones and send
    /// GOAWAY naming the first.
    pub goaway_after_first: bool,

    /// Never respond.
    pub stall: bool,

    /// Transport idle timeout advertised by the server, in milliseconds.
    pub idle_ms: u64,

    /// The server's `SETTINGS_MAX_FIELD_SECTION_SIZE`.
    pub max_field_section_size: Option<u64>,

    /// Connections accepted.
    pub connections: AtomicUsize,

    /// Requests answered with 200.
    pub accepted: AtomicUsize,
}

impl Default for ServerBehavior {
    fn default() -> ServerBehavior {
        ServerBehavior {
            reject_budget: AtomicU32::new(0),
            goaway_after_first: false,
            stall: false,
            idle_ms: 10_000,
            max_field_section_size: None,
            connections: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
        }
    }
}

/// A connector that spawns a fresh in-process server per dial.
pub struct TestConnect {
    pub behavior: Arc<ServerBehavior>,
}

impl TestConnect {
    pub fn new(behavior: ServerBehavior) -> (TestConnect, Arc<ServerBehavior>) {
        let behavior = Arc::new(behavior);

        (
            TestConnect {
                behavior: Arc::clone(&behavior),
            },
            behavior,
        )
    }
}

impl Connect for TestConnect {
    type Transport = Pipe;

    async fn connect(&self, _authority: &str) -> io::Result<Pipe> {
        let (client_end, server_end) = pipe();

        self.behavior.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_server(server_end, Arc::clone(&self.behavior)));

        Ok(client_end)
    }
}

async fn flush(conn: &mut quill::Connection, transport: &mut Pipe) -> bool {
    let mut out = vec![0; MAX_DATAGRAM_SIZE];

    loop {
        match conn.send(&mut out, Instant::now()) {
            Ok(n) => {
                if transport.send(&out[..n]).await.is_err() {
                    return false;
                }
            },

            Err(quill::Error::Done) => return true,

            Err(_) => return false,
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) =>
            tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,

        None => std::future::pending().await,
    }
}

fn reject(conn: &mut quill::Connection, stream_id: u64) {
    conn.stream_shutdown(stream_id, quill::Shutdown::Write, H3_REQUEST_REJECTED)
        .ok();
    conn.stream_shutdown(stream_id, quill::Shutdown::Read, H3_REQUEST_REJECTED)
        .ok();
}

async fn run_server(mut transport: Pipe, behavior: Arc<ServerBehavior>) {
    let mut config = quill::Config::new().unwrap();
    config.set_max_idle_timeout(behavior.idle_ms);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_stream_data_uni(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(8);

    let mut conn = quill::accept(&mut config).unwrap();

    let mut buf = vec![0; MAX_DATAGRAM_SIZE];

    while !conn.is_established() {
        if !flush(&mut conn, &mut transport).await || conn.is_closed() {
            return;
        }

        tokio::select! {
            r = transport.recv(&mut buf) => match r {
                Ok(n) => {
                    let _ = conn.recv(&buf[..n], Instant::now());
                },
                Err(_) => return,
            },

            _ = wait_deadline(conn.timeout_instant()) => {
                conn.on_timeout(Instant::now());
            },
        }
    }

    let mut h3_config = h3::Config::new().unwrap();
    if let Some(v) = behavior.max_field_section_size {
        h3_config.set_max_field_section_size(v);
    }

    let mut h3_conn =
        h3::Connection::with_transport(&mut conn, &h3_config).unwrap();

    let mut goaway_sent = false;

    loop {
        loop {
            match h3_conn.poll(&mut conn) {
                Ok((stream_id, h3::Event::Headers { .. })) => {
                    if behavior.goaway_after_first && stream_id > 0 {
                        if !goaway_sent {
                            goaway_sent = true;
                            h3_conn.send_goaway(&mut conn, 0).ok();
                        }

                        reject(&mut conn, stream_id);
                        continue;
                    }

                    let rejected = behavior
                        .reject_budget
                        .fetch_update(
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                            |v| v.checked_sub(1),
                        )
                        .is_ok();

                    if rejected {
                        reject(&mut conn, stream_id);
                        continue;
                    }

                    if behavior.stall {
                        continue;
                    }

                    behavior.accepted.fetch_add(1, Ordering::SeqCst);

                    let resp = vec![
                        h3::Header::new(b":status", b"200"),
                        h3::Header::new(b"server", b"quill-test-server"),
                    ];

                    h3_conn
                        .send_response(&mut conn, stream_id, &resp, false)
                        .ok();
                    h3_conn.send_body(&mut conn, stream_id, b"ok", true).ok();
                },

                Ok((stream_id, h3::Event::Data)) => {
                    let mut body = [0; 4096];
                    while h3_conn
                        .recv_body(&mut conn, stream_id, &mut body)
                        .is_ok()
                    {}
                },

                Ok(_) => (),

                Err(h3::Error::Done) => break,

                Err(_) => break,
            }
        }

        if !flush(&mut conn, &mut transport).await || conn.is_closed() {
            return;
        }

        tokio::select! {
            r = transport.recv(&mut buf) => match r {
                Ok(n) => {
                    let _ = conn.recv(&buf[..n], Instant::now());
                },
                Err(_) => return,
            },

            _ = wait_deadline(conn.timeout_instant()) => {
                conn.on_timeout(Instant::now());
            },
        }
    }
}
