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

//! quill is a sans-I/O HTTP/3 client engine running above a provided
//! datagram transport.
//!
//! quill does not perform any I/O or keep any timers of its own: the
//! application (or the [tokio-quill] driver) shuttles datagram payloads
//! between the transport and a [`Connection`] via [`recv()`] and [`send()`],
//! and reports the passage of time via [`on_timeout()`]. TLS is an external
//! collaborator as well: the handshake flight carries the transport
//! parameters and the cipher suites negotiated on quill's behalf.
//!
//! ## Connection setup
//!
//! ```
//! let mut config = quill::Config::new()?;
//! config.set_initial_max_data(1_000_000);
//! config.set_initial_max_stream_data_bidi_local(100_000);
//! config.set_initial_max_stream_data_bidi_remote(100_000);
//! config.set_initial_max_stream_data_uni(100_000);
//! config.set_initial_max_streams_bidi(16);
//! config.set_initial_max_streams_uni(3);
//!
//! let conn = quill::connect(Some("example.org"), &mut config)?;
//! # Ok::<(), quill::Error>(())
//! ```
//!
//! The handshake is driven by calling [`send()`] to produce outgoing
//! flights and [`recv()`] with whatever the transport delivers, until
//! [`is_established()`] returns true.
//!
//! [tokio-quill]: https://docs.rs/tokio-quill
//! [`recv()`]: struct.Connection.html#method.recv
//! [`send()`]: struct.Connection.html#method.send
//! [`on_timeout()`]: struct.Connection.html#method.on_timeout
//! [`is_established()`]: struct.Connection.html#method.is_established

#[macro_use]
extern crate log;

use std::time::Duration;
use std::time::Instant;

pub use crate::error::ConnectionError;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::error::WireErrorCode;
pub use crate::stream::StreamIter;
pub use crate::stream::StreamState;
pub use crate::transport_params::TransportParams;
pub use crate::transport_params::CIPHER_AES128_GCM_SHA256;
pub use crate::transport_params::CIPHER_AES256_GCM_SHA384;
pub use crate::transport_params::CIPHER_CHACHA20_POLY1305_SHA256;

use crate::flowcontrol::FlowControl;
use crate::frame::Frame;
use crate::stream::Stream;

/// The default send buffer cap per stream, in bytes.
const DEFAULT_MAX_STREAM_BUFFER: usize = 65_536;

/// Estimated per-frame overhead when packing STREAM frames.
const STREAM_FRAME_OVERHEAD: usize = 24;

/// The side of the stream to be shut down.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop receiving data (sends STOP_SENDING to the peer).
    Read  = 0,
    /// Stop sending data (sends RESET_STREAM to the peer).
    Write = 1,
}

/// Stores configuration shared between multiple connections.
pub struct Config {
    local_params: TransportParams,
    cipher_suites: Vec<u64>,
    max_stream_buffer: usize,
    handshake_timeout: Duration,
    max_handshake_timeout: Duration,
}

impl Config {
    /// Creates a config object with default settings.
    pub fn new() -> Result<Config> {
        Ok(Config {
            local_params: TransportParams::default(),
            cipher_suites: vec![CIPHER_AES128_GCM_SHA256],
            max_stream_buffer: DEFAULT_MAX_STREAM_BUFFER,
            handshake_timeout: Duration::from_millis(200),
            max_handshake_timeout: Duration::from_secs(3),
        })
    }

    /// Sets the `max_idle_timeout` transport parameter, in milliseconds.
    ///
    /// The default is 0, meaning idle timeout is disabled.
    pub fn set_max_idle_timeout(&mut self, v: u64) {
        self.local_params.max_idle_timeout = v;
    }

    /// Sets the `initial_max_data` transport parameter.
    pub fn set_initial_max_data(&mut self, v: u64) {
        self.local_params.initial_max_data = v;
    }

    /// Sets the `initial_max_stream_data_bidi_local` transport parameter.
    pub fn set_initial_max_stream_data_bidi_local(&mut self, v: u64) {
        self.local_params.initial_max_stream_data_bidi_local = v;
    }

    /// Sets the `initial_max_stream_data_bidi_remote` transport parameter.
    pub fn set_initial_max_stream_data_bidi_remote(&mut self, v: u64) {
        self.local_params.initial_max_stream_data_bidi_remote = v;
    }

    /// Sets the `initial_max_stream_data_uni` transport parameter.
    pub fn set_initial_max_stream_data_uni(&mut self, v: u64) {
        self.local_params.initial_max_stream_data_uni = v;
    }

    /// Sets the `initial_max_streams_bidi` transport parameter.
    pub fn set_initial_max_streams_bidi(&mut self, v: u64) {
        self.local_params.initial_max_streams_bidi = v;
    }

    /// Sets the `initial_max_streams_uni` transport parameter.
    pub fn set_initial_max_streams_uni(&mut self, v: u64) {
        self.local_params.initial_max_streams_uni = v;
    }

    /// Sets the cipher suites offered (client) or accepted (server) during
    /// the handshake.
    pub fn set_cipher_suites(&mut self, suites: &[u64]) {
        self.cipher_suites = suites.to_vec();
    }

    /// Caps the amount of data buffered per stream before the writer is
    /// pushed back.
    pub fn set_max_stream_buffer(&mut self, v: usize) {
        self.max_stream_buffer = v;
    }

    /// Sets the initial handshake retransmission timeout.
    ///
    /// The timeout doubles on each expiry until it exceeds the value set by
    /// [`set_max_handshake_timeout()`], at which point the connection fails.
    ///
    /// [`set_max_handshake_timeout()`]: struct.Config.html#method.set_max_handshake_timeout
    pub fn set_handshake_timeout(&mut self, v: Duration) {
        self.handshake_timeout = v;
    }

    /// Bounds the handshake retransmission backoff.
    pub fn set_max_handshake_timeout(&mut self, v: Duration) {
        self.max_handshake_timeout = v;
    }
}

/// Creates a new client-side connection.
pub fn connect(
    server_name: Option<&str>, config: &mut Config,
) -> Result<Connection> {
    let conn = Connection::new(server_name, config, false)?;

    Ok(conn)
}

/// Creates a new server-side connection.
///
/// The server role exists to support in-process test servers; quill is
/// first and foremost a client engine.
pub fn accept(config: &mut Config) -> Result<Connection> {
    let conn = Connection::new(None, config, true)?;

    Ok(conn)
}

/// A QUIC-like connection to a single peer, multiplexing flow-controlled
/// streams over a provided datagram transport.
pub struct Connection {
    /// Whether this is a server-side connection.
    is_server: bool,

    /// The name of the server the client is connecting to.
    server_name: Option<String>,

    /// Local transport parameters, advertised in the handshake flight.
    local_params: TransportParams,

    /// Peer transport parameters, applied atomically when the handshake
    /// flight is received.
    peer_params: TransportParams,

    /// Cipher suites acceptable to the local endpoint.
    cipher_suites: Vec<u64>,

    /// Whether the handshake completed.
    handshake_completed: bool,

    /// Whether a handshake flight needs to be (re)sent.
    handshake_flight_pending: bool,

    /// Deadline for the next handshake retransmission.
    handshake_deadline: Option<Instant>,

    /// Current handshake retransmission timeout, doubling per expiry.
    handshake_timeout: Duration,

    /// Bound on the handshake retransmission backoff.
    max_handshake_timeout: Duration,

    /// Streams and stream-level limits.
    streams: stream::StreamMap,

    /// Per-stream send buffer cap.
    max_stream_buffer: usize,

    /// Connection-level receive flow controller.
    flow_control: FlowControl,

    /// Total flow-controlled bytes received.
    rx_data: u64,

    /// Connection-level send limit granted by the peer.
    max_tx_data: u64,

    /// Total flow-controlled bytes sent.
    tx_data: u64,

    /// The send limit we were blocked at, to report via DATA_BLOCKED.
    blocked_limit: Option<u64>,

    /// When the idle timeout fires next, if enabled.
    idle_timer: Option<Instant>,

    /// Whether a PING needs to be sent (keep-alive).
    ping_pending: bool,

    /// Whether a PONG needs to be sent in response to a peer PING.
    pong_pending: bool,

    /// Error to be sent to the peer in a close frame.
    local_error: Option<ConnectionError>,

    /// Error received from the peer in a close frame.
    peer_error: Option<ConnectionError>,

    /// Whether the close frame was emitted.
    close_sent: bool,

    /// Whether the connection timed out (handshake or idle).
    timed_out: bool,

    /// Whether the connection is fully terminated.
    closed: bool,
}

impl Connection {
    fn new(
        server_name: Option<&str>, config: &mut Config, is_server: bool,
    ) -> Result<Connection> {
        let local_params = TransportParams {
            cipher_suites: config.cipher_suites.clone(),
            ..config.local_params.clone()
        };

        let conn = Connection {
            is_server,
            server_name: server_name.map(|s| s.to_string()),
            streams: stream::StreamMap::new(
                local_params.initial_max_streams_bidi,
                local_params.initial_max_streams_uni,
            ),
            max_stream_buffer: config.max_stream_buffer,
            flow_control: FlowControl::new(
                local_params.initial_max_data,
                local_params.initial_max_data,
            ),
            local_params,
            peer_params: TransportParams {
                cipher_suites: Vec::new(),
                ..TransportParams::default()
            },
            cipher_suites: config.cipher_suites.clone(),
            handshake_completed: false,
            // Clients open with a handshake flight, servers respond.
            handshake_flight_pending: !is_server,
            handshake_deadline: None,
            handshake_timeout: config.handshake_timeout,
            max_handshake_timeout: config.max_handshake_timeout,
            rx_data: 0,
            max_tx_data: 0,
            tx_data: 0,
            blocked_limit: None,
            idle_timer: None,
            ping_pending: false,
            pong_pending: false,
            local_error: None,
            peer_error: None,
            close_sent: false,
            timed_out: false,
            closed: false,
        };

        Ok(conn)
    }

    /// Processes a datagram payload received from the transport.
    ///
    /// On success the number of bytes processed is returned.
    pub fn recv(&mut self, buf: &[u8], now: Instant) -> Result<usize> {
        if self.closed {
            return Err(Error::InvalidState);
        }

        let mut b = octets::Octets::with_slice(buf);

        while b.cap() > 0 {
            let frame = Frame::from_bytes(&mut b)?;

            trace!(
                "{} rx frm {frame:?}",
                if self.is_server { "server" } else { "client" }
            );

            if let Err(e) = self.process_frame(frame, now) {
                if self.local_error.is_none() {
                    self.close(false, e.to_wire(), b"").ok();
                }

                return Err(e);
            }
        }

        // Receiving any traffic restarts the idle period.
        self.restart_idle_timer(now);

        Ok(b.off())
    }

    fn process_frame(&mut self, frame: Frame, _now: Instant) -> Result<()> {
        match frame {
            Frame::Padding { .. } => (),

            Frame::Ping => {
                self.pong_pending = true;
            },

            Frame::Pong => (),

            Frame::Handshake { params } => self.process_handshake(params)?,

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                if !self.handshake_completed {
                    return Err(Error::InvalidState);
                }

                // Data on a locally-initiated unidirectional stream is a
                // protocol violation.
                if !stream::is_bidi(stream_id) &&
                    stream::is_local(stream_id, self.is_server)
                {
                    return Err(Error::InvalidStreamState(stream_id));
                }

                let max_rx_data = self.local_stream_rx_limit(stream_id);
                let max_tx_data = self.peer_stream_tx_limit(stream_id);
                let max_buffer = self.max_stream_buffer;
                let is_server = self.is_server;

                let stream = match self.streams.get_or_create(
                    stream_id,
                    max_rx_data,
                    max_tx_data,
                    max_buffer,
                    false,
                    is_server,
                ) {
                    Ok(s) => s,

                    // Data for a collected stream is a stale retransmit.
                    Err(Error::Done) => return Ok(()),

                    Err(e) => return Err(e),
                };

                let max_off_delta = stream.recv.write(offset, &data, fin)?;

                if self.rx_data + max_off_delta > self.flow_control.max_data() {
                    return Err(Error::FlowControl);
                }

                self.rx_data += max_off_delta;

                if self.streams.get(stream_id).is_some_and(Stream::is_readable)
                {
                    self.streams.mark_readable(stream_id, true);
                }
            },

            Frame::MaxData { max } => {
                self.max_tx_data = self.max_tx_data.max(max);
                self.blocked_limit = None;
            },

            Frame::MaxStreamData { stream_id, max } => {
                let (writable, flushable) =
                    match self.streams.get_mut(stream_id) {
                        Some(stream) => {
                            stream.send.update_max_data(max);
                            (stream.is_writable(), stream.is_flushable())
                        },

                        None => (false, false),
                    };

                if writable {
                    self.streams.mark_writable(stream_id, true);
                }

                if flushable {
                    self.streams.mark_flushable(stream_id, true);
                }
            },

            Frame::MaxStreamsBidi { max } => {
                self.streams.update_peer_max_streams_bidi(max);
            },

            Frame::MaxStreamsUni { max } => {
                self.streams.update_peer_max_streams_uni(max);
            },

            Frame::DataBlocked { limit } => {
                trace!("peer blocked at connection limit {limit}");
            },

            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!("peer blocked on stream {stream_id} at {limit}");
            },

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                let max_rx_data = self.local_stream_rx_limit(stream_id);
                let max_tx_data = self.peer_stream_tx_limit(stream_id);
                let max_buffer = self.max_stream_buffer;
                let is_server = self.is_server;

                let stream = match self.streams.get_or_create(
                    stream_id,
                    max_rx_data,
                    max_tx_data,
                    max_buffer,
                    false,
                    is_server,
                ) {
                    Ok(s) => s,
                    Err(Error::Done) => return Ok(()),
                    Err(e) => return Err(e),
                };

                let max_off_delta = stream.recv.reset(error_code, final_size)?;

                if self.rx_data + max_off_delta > self.flow_control.max_data() {
                    return Err(Error::FlowControl);
                }

                self.rx_data += max_off_delta;
                self.flow_control.add_consumed(max_off_delta);

                self.streams.mark_readable(stream_id, true);
            },

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                let stopped = self
                    .streams
                    .get_mut(stream_id)
                    .and_then(|s| s.send.stop(error_code).ok());

                if let Some(final_size) = stopped {
                    // Respond with RESET_STREAM carrying the same error
                    // code, per the STOP_SENDING contract.
                    self.streams
                        .mark_reset(stream_id, true, error_code, final_size);
                    self.streams.mark_writable(stream_id, false);
                    self.streams.mark_flushable(stream_id, false);
                }
            },

            Frame::ConnectionClose { error_code, reason } => {
                self.peer_error = Some(ConnectionError {
                    is_app: false,
                    error_code,
                    reason,
                });

                self.closed = true;
            },

            Frame::ApplicationClose { error_code, reason } => {
                self.peer_error = Some(ConnectionError {
                    is_app: true,
                    error_code,
                    reason,
                });

                self.closed = true;
            },
        }

        Ok(())
    }

    fn process_handshake(&mut self, params: TransportParams) -> Result<()> {
        if self.handshake_completed {
            // A duplicate client hello means our reply was lost.
            if self.is_server {
                self.handshake_flight_pending = true;
            }

            return Ok(());
        }

        let negotiated = if self.is_server {
            // Pick the first offered suite we also support, mirroring the
            // external TLS stack's verdict.
            params
                .cipher_suites
                .iter()
                .find(|c| self.cipher_suites.contains(c))
                .copied()
        } else {
            // The server echoes its selection; it must be one we offered.
            params
                .cipher_suites
                .first()
                .filter(|c| self.cipher_suites.contains(c))
                .copied()
        };

        let Some(cipher) = negotiated else {
            return Err(Error::HandshakeFail);
        };

        // Apply peer settings before any stream activity is permitted.
        self.streams
            .update_peer_max_streams_bidi(params.initial_max_streams_bidi);
        self.streams
            .update_peer_max_streams_uni(params.initial_max_streams_uni);
        self.max_tx_data = params.initial_max_data;

        self.peer_params = params;

        self.handshake_completed = true;
        self.handshake_deadline = None;

        if self.is_server {
            self.local_params.cipher_suites = vec![cipher];
            self.handshake_flight_pending = true;
        }

        debug!(
            "{} handshake completed cipher={cipher:#x} server_name={:?}",
            if self.is_server { "server" } else { "client" },
            self.server_name,
        );

        Ok(())
    }

    /// Writes a single flight of frames into the provided buffer.
    ///
    /// Returns `Error::Done` when there is nothing to send.
    pub fn send(&mut self, out: &mut [u8], now: Instant) -> Result<usize> {
        if out.is_empty() {
            return Err(Error::BufferTooShort);
        }

        let mut b = octets::OctetsMut::with_slice(out);

        // A pending close preempts everything else.
        if let Some(err) = self.local_error.clone() {
            if !self.close_sent {
                let frame = if err.is_app {
                    Frame::ApplicationClose {
                        error_code: err.error_code,
                        reason: err.reason,
                    }
                } else {
                    Frame::ConnectionClose {
                        error_code: err.error_code,
                        reason: err.reason,
                    }
                };

                trace!("tx frm {frame:?}");
                frame.to_bytes(&mut b)?;

                self.close_sent = true;
                self.closed = true;

                return Ok(b.off());
            }

            return Err(Error::Done);
        }

        if self.closed {
            return Err(Error::Done);
        }

        if self.handshake_flight_pending {
            let frame = Frame::Handshake {
                params: self.local_params.clone(),
            };

            trace!("tx frm {frame:?}");
            frame.to_bytes(&mut b)?;

            self.handshake_flight_pending = false;

            if !self.handshake_completed {
                self.handshake_deadline = Some(now + self.handshake_timeout);
            }
        }

        if !self.handshake_completed {
            return if b.off() > 0 { Ok(b.off()) } else { Err(Error::Done) };
        }

        if self.pong_pending {
            Frame::Pong.to_bytes(&mut b)?;
            self.pong_pending = false;
        }

        if self.ping_pending {
            Frame::Ping.to_bytes(&mut b)?;
            self.ping_pending = false;
        }

        // Connection-level flow control credit.
        if self.flow_control.should_update_max_data() {
            let max = self.flow_control.max_data_next();
            Frame::MaxData { max }.to_bytes(&mut b)?;
            self.flow_control.update_max_data();
        }

        // Stream-level flow control credit.
        for stream_id in self.streams.almost_full() {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                if stream.recv.should_update_max_data() {
                    let max = stream.recv.max_data_next();
                    Frame::MaxStreamData { stream_id, max }.to_bytes(&mut b)?;
                    stream.recv.update_max_data();
                }
            }

            self.streams.mark_almost_full(stream_id, false);
        }

        // Stream count credit.
        if let Some(max) = self.streams.max_streams_bidi_next() {
            Frame::MaxStreamsBidi { max }.to_bytes(&mut b)?;
        }

        // STOP_SENDING then RESET_STREAM, so a stream aborted in both
        // directions reads consistently on the peer.
        if self.streams.has_stopped() {
            let stopped: Vec<_> =
                self.streams.stopped().map(|(&k, &v)| (k, v)).collect();

            for (stream_id, error_code) in stopped {
                Frame::StopSending {
                    stream_id,
                    error_code,
                }
                .to_bytes(&mut b)?;

                self.streams.mark_stopped(stream_id, false, 0);
            }
        }

        if self.streams.has_reset() {
            let reset: Vec<_> =
                self.streams.reset().map(|(&k, &v)| (k, v)).collect();

            for (stream_id, (error_code, final_size)) in reset {
                Frame::ResetStream {
                    stream_id,
                    error_code,
                    final_size,
                }
                .to_bytes(&mut b)?;

                self.streams.mark_reset(stream_id, false, 0, 0);
                self.collect_if_complete(stream_id);
            }
        }

        if let Some(limit) = self.blocked_limit.take() {
            Frame::DataBlocked { limit }.to_bytes(&mut b)?;
        }

        if self.streams.has_blocked() {
            let blocked: Vec<_> =
                self.streams.blocked().map(|(&k, &v)| (k, v)).collect();

            for (stream_id, limit) in blocked {
                Frame::StreamDataBlocked { stream_id, limit }
                    .to_bytes(&mut b)?;
                self.streams.mark_blocked(stream_id, false, 0);
            }
        }

        // Finally, flush stream data while the connection window and the
        // output buffer allow.
        while b.cap() > STREAM_FRAME_OVERHEAD {
            let Some(stream_id) = self.streams.peek_flushable() else {
                break;
            };

            let conn_window = (self.max_tx_data - self.tx_data) as usize;

            if conn_window == 0 {
                self.blocked_limit = Some(self.max_tx_data);
                break;
            }

            let max_len = (b.cap() - STREAM_FRAME_OVERHEAD).min(conn_window);
            let mut data = vec![0; max_len];

            let stream = match self.streams.get_mut(stream_id) {
                Some(s) => s,
                None => {
                    self.streams.mark_flushable(stream_id, false);
                    continue;
                },
            };

            let (len, offset, fin) = stream.send.emit(&mut data)?;
            data.truncate(len);

            self.tx_data += len as u64;

            let blocked_at = stream.send.blocked_at();
            stream.send.update_blocked_at(None);

            if let Some(blocked_at) = blocked_at {
                self.streams.mark_blocked(stream_id, true, blocked_at);
            }

            if len > 0 || fin {
                let frame = Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin,
                };

                trace!("tx frm {frame:?}");
                frame.to_bytes(&mut b)?;
            }

            let (flushable, writable) = self
                .streams
                .get(stream_id)
                .map_or((false, false), |s| (s.is_flushable(), s.is_writable()));

            if !flushable {
                self.streams.mark_flushable(stream_id, false);
            }

            if writable {
                self.streams.mark_writable(stream_id, true);
            }

            self.collect_if_complete(stream_id);

            if len == 0 && !fin {
                break;
            }
        }

        if b.off() == 0 {
            return Err(Error::Done);
        }

        self.restart_idle_timer(now);

        Ok(b.off())
    }

    /// Writes data to a stream's send buffer.
    ///
    /// Locally-initiated streams are created on first use. Returns the
    /// number of bytes accepted, or `Error::Done` when the stream has no
    /// capacity (the caller should wait for [`writable()`]).
    ///
    /// [`writable()`]: struct.Connection.html#method.writable
    pub fn stream_send(
        &mut self, stream_id: u64, buf: &[u8], fin: bool,
    ) -> Result<usize> {
        if !self.handshake_completed || self.closed || self.local_error.is_some()
        {
            return Err(Error::InvalidState);
        }

        let max_rx_data = self.local_stream_rx_limit(stream_id);
        let max_tx_data = self.peer_stream_tx_limit(stream_id);
        let max_buffer = self.max_stream_buffer;
        let is_server = self.is_server;
        let local = stream::is_local(stream_id, is_server);

        let stream = self.streams.get_or_create(
            stream_id,
            max_rx_data,
            max_tx_data,
            max_buffer,
            local,
            is_server,
        )?;

        let written = stream.send.write(buf, fin)?;

        let flushable = stream.is_flushable();
        let writable = stream.is_writable();

        if flushable {
            self.streams.mark_flushable(stream_id, true);
        }

        self.streams.mark_writable(stream_id, writable);

        Ok(written)
    }

    /// Reads contiguous data from a stream into the provided buffer.
    ///
    /// Returns the number of bytes read and the fin flag, `Error::Done` when
    /// there is nothing to read, or `Error::StreamReset` (exactly once) when
    /// the peer reset the stream.
    pub fn stream_recv(
        &mut self, stream_id: u64, out: &mut [u8],
    ) -> Result<(usize, bool)> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        let res = stream.recv.emit(out);

        if let Ok((read, _)) = res {
            self.flow_control.add_consumed(read as u64);

            if stream.recv.should_update_max_data() {
                self.streams.mark_almost_full(stream_id, true);
            }
        }

        let readable =
            self.streams.get(stream_id).is_some_and(Stream::is_readable);
        self.streams.mark_readable(stream_id, readable);

        self.collect_if_complete(stream_id);

        res
    }

    /// Shuts down reading or writing on the stream.
    pub fn stream_shutdown(
        &mut self, stream_id: u64, direction: Shutdown, err: u64,
    ) -> Result<()> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        match direction {
            Shutdown::Read => {
                stream.recv.shutdown()?;

                // Asking the peer to stop is distinct from resetting our
                // send side; only the receive half is affected here.
                self.streams.mark_stopped(stream_id, true, err);
                self.streams.mark_readable(stream_id, false);
            },

            Shutdown::Write => {
                let final_size = stream.send.reset();

                self.streams.mark_reset(stream_id, true, err, final_size);
                self.streams.mark_writable(stream_id, false);
                self.streams.mark_flushable(stream_id, false);
            },
        }

        Ok(())
    }

    /// Send capacity currently available on the stream.
    pub fn stream_capacity(&self, stream_id: u64) -> Result<usize> {
        let stream = self
            .streams
            .get(stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        stream.send.cap()
    }

    /// Returns true if the stream's receive half was fully consumed.
    pub fn stream_finished(&self, stream_id: u64) -> bool {
        match self.streams.get(stream_id) {
            Some(s) => s.recv.is_drained(),
            None => true,
        }
    }

    /// Observable state of the stream, if it exists.
    pub fn stream_state(&self, stream_id: u64) -> Result<StreamState> {
        self.streams
            .get(stream_id)
            .map(Stream::state)
            .ok_or(Error::InvalidStreamState(stream_id))
    }

    /// An iterator over streams with data to read.
    pub fn readable(&self) -> StreamIter {
        self.streams.readable()
    }

    /// An iterator over streams with send capacity.
    pub fn writable(&self) -> StreamIter {
        self.streams.writable()
    }

    /// Number of bidirectional streams that can still be opened towards the
    /// peer.
    pub fn peer_streams_left_bidi(&self) -> u64 {
        self.streams.peer_streams_left_bidi()
    }

    /// Number of unidirectional streams that can still be opened towards
    /// the peer.
    pub fn peer_streams_left_uni(&self) -> u64 {
        self.streams.peer_streams_left_uni()
    }

    /// Schedules a keep-alive PING in the next flight.
    ///
    /// This is the mechanism the driver uses to hold a connection open when
    /// the negotiated transport idle timeout is shorter than the
    /// application's keep-alive period.
    pub fn send_ping(&mut self) {
        if self.handshake_completed && !self.closed {
            self.ping_pending = true;
        }
    }

    /// Closes the connection with the given error.
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        if self.closed || self.local_error.is_some() {
            return Err(Error::Done);
        }

        self.local_error = Some(ConnectionError {
            is_app: app,
            error_code: err,
            reason: reason.to_vec(),
        });

        Ok(())
    }

    /// The instant the next internal timer fires, if any.
    pub fn timeout_instant(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }

        if !self.handshake_completed {
            return self.handshake_deadline;
        }

        self.idle_timer
    }

    /// Processes timer expirations.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        if !self.handshake_completed {
            if let Some(deadline) = self.handshake_deadline {
                if now >= deadline {
                    let next = self.handshake_timeout * 2;

                    if next > self.max_handshake_timeout {
                        debug!("handshake timed out after backoff cap");

                        self.timed_out = true;
                        self.closed = true;
                        self.local_error = Some(ConnectionError {
                            is_app: false,
                            error_code: Error::HandshakeTimeout.to_wire(),
                            reason: b"handshake timeout".to_vec(),
                        });
                        return;
                    }

                    trace!("handshake retransmit, next timeout {next:?}");

                    self.handshake_timeout = next;
                    self.handshake_flight_pending = true;
                    self.handshake_deadline = None;
                }
            }

            return;
        }

        if let Some(idle) = self.idle_timer {
            if now >= idle {
                debug!("idle timeout expired");

                self.timed_out = true;
                self.closed = true;
            }
        }
    }

    /// The effective idle timeout, the minimum of the two endpoints'
    /// advertised values (zero meaning disabled).
    pub fn idle_timeout(&self) -> Option<Duration> {
        let timeout = match (
            self.local_params.max_idle_timeout,
            self.peer_params.max_idle_timeout,
        ) {
            (0, 0) => return None,
            (0, v) | (v, 0) => v,
            (lo, pe) => lo.min(pe),
        };

        Some(Duration::from_millis(timeout))
    }

    fn restart_idle_timer(&mut self, now: Instant) {
        if let Some(timeout) = self.idle_timeout() {
            self.idle_timer = Some(now + timeout);
        }
    }

    /// Returns true if the handshake completed.
    pub fn is_established(&self) -> bool {
        self.handshake_completed
    }

    /// Returns true if the connection is fully terminated.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true if the connection timed out (handshake or idle).
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// The error the peer closed the connection with, if any.
    pub fn peer_error(&self) -> Option<&ConnectionError> {
        self.peer_error.as_ref()
    }

    /// The error the local endpoint closed the connection with, if any.
    pub fn local_error(&self) -> Option<&ConnectionError> {
        self.local_error.as_ref()
    }

    /// Peer transport parameters, once the handshake completed.
    pub fn peer_transport_params(&self) -> Option<&TransportParams> {
        self.handshake_completed.then_some(&self.peer_params)
    }

    /// Whether this is a server-side connection.
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    fn collect_if_complete(&mut self, stream_id: u64) {
        let complete =
            self.streams.get(stream_id).is_some_and(Stream::is_complete);

        let pending_frames = self.streams.reset().any(|(&id, _)| id == stream_id) ||
            self.streams.stopped().any(|(&id, _)| id == stream_id);

        if complete && !pending_frames {
            self.streams.collect(stream_id);
        }
    }

    fn local_stream_rx_limit(&self, stream_id: u64) -> u64 {
        if !stream::is_bidi(stream_id) {
            return self.local_params.initial_max_stream_data_uni;
        }

        if stream::is_local(stream_id, self.is_server) {
            self.local_params.initial_max_stream_data_bidi_local
        } else {
            self.local_params.initial_max_stream_data_bidi_remote
        }
    }

    fn peer_stream_tx_limit(&self, stream_id: u64) -> u64 {
        if !stream::is_bidi(stream_id) {
            return self.peer_params.initial_max_stream_data_uni;
        }

        // What is "local" to us is "remote" from the peer's point of view.
        if stream::is_local(stream_id, self.is_server) {
            self.peer_params.initial_max_stream_data_bidi_remote
        } else {
            self.peer_params.initial_max_stream_data_bidi_local
        }
    }
}

pub mod h3;

mod error;
mod flowcontrol;
mod frame;
mod stream;
mod transport_params;

#[doc(hidden)]
pub mod test_utils;

#[cfg(test)]
mod tests;
