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

//! HTTP/3 request multiplexing on top of a [`Connection`].
//!
//! An [`h3::Connection`] drives the HTTP/3 control and QPACK streams and
//! turns transport-level stream activity into request-level [`Event`]s:
//!
//! ```no_run
//! # let mut config = quill::Config::new()?;
//! # let mut conn = quill::connect(Some("example.org"), &mut config)?;
//! let h3_config = quill::h3::Config::new()?;
//! let mut h3_conn = quill::h3::Connection::with_transport(&mut conn, &h3_config)?;
//!
//! let req = vec![
//!     quill::h3::Header::new(b":method", b"GET"),
//!     quill::h3::Header::new(b":scheme", b"https"),
//!     quill::h3::Header::new(b":authority", b"example.org"),
//!     quill::h3::Header::new(b":path", b"/"),
//! ];
//!
//! let stream_id = h3_conn.send_request(&mut conn, &req, true)?;
//! # let _ = stream_id;
//! # Ok::<(), quill::h3::Error>(())
//! ```
//!
//! [`Connection`]: ../struct.Connection.html
//! [`h3::Connection`]: struct.Connection.html
//! [`Event`]: enum.Event.html

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

/// The [`Result`] type returned by HTTP/3 operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// An HTTP/3 error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// There is no error or no work to do.
    Done,

    /// The provided buffer is too short.
    BufferTooShort,

    /// Internal error in the HTTP/3 stack.
    InternalError,

    /// The peer is exhibiting behavior causing excessive load.
    ExcessiveLoad,

    /// A required critical stream was closed.
    ClosedCriticalStream,

    /// The peer created a stream that is not allowed, or a duplicate of a
    /// stream that must be unique.
    StreamCreationError,

    /// A frame was received on a stream where it is not permitted.
    FrameUnexpected,

    /// A frame's payload is malformed.
    FrameError,

    /// No SETTINGS frame was received where one was mandatory.
    MissingSettings,

    /// The SETTINGS frame is invalid.
    SettingsError,

    /// A QPACK field section could not be decompressed.
    QpackDecompressionFailed,

    /// An error occurred in the underlying transport.
    TransportError(crate::Error),

    /// The operation cannot happen yet because the stream, or the
    /// connection as a whole, is blocked. Retry once the peer opens up.
    StreamBlocked,

    /// The peer rejected the request without processing it.
    RequestRejected,

    /// The request or response was cancelled.
    RequestCancelled,

    /// The header list is larger than the peer accepts, determined before
    /// any part of the request was sent.
    HeaderSizeExceeded,

    /// The QPACK encoder hit its insertion cap in strict mode.
    TooManyLiteralInsertions,
}

/// HTTP/3 wire error codes.
pub enum WireErrorCode {
    /// No error. This is used when the connection or stream needs to be
    /// closed, but there is no error to signal.
    NoError              = 0x100,
    /// Peer violated protocol requirements in a way that does not match a
    /// more specific error code.
    GeneralProtocolError = 0x101,
    /// An internal error has occurred in the HTTP stack.
    InternalError        = 0x102,
    /// The endpoint detected that its peer created a stream that it will not
    /// accept.
    StreamCreationError  = 0x103,
    /// A stream required by the HTTP/3 connection was closed or reset.
    ClosedCriticalStream = 0x104,
    /// A frame was received that was not permitted in the current state or on
    /// the current stream.
    FrameUnexpected      = 0x105,
    /// A frame that fails to satisfy layout requirements or with an invalid
    /// size was received.
    FrameError           = 0x106,
    /// The endpoint detected that its peer is exhibiting a behavior that
    /// might be generating excessive load.
    ExcessiveLoad        = 0x107,
    /// A stream ID or push ID was used incorrectly, such as exceeding a
    /// limit, reducing a limit, or being reused.
    IdError              = 0x108,
    /// An endpoint detected an error in the payload of a SETTINGS frame.
    SettingsError        = 0x109,
    /// No SETTINGS frame was received at the beginning of the control stream.
    MissingSettings      = 0x10a,
    /// A server rejected a request without performing any application
    /// processing.
    RequestRejected      = 0x10b,
    /// The request or its response is cancelled.
    RequestCancelled     = 0x10c,
    /// The decoder failed to interpret an encoded field section and is not
    /// able to continue decoding that field section.
    QpackDecompressionFailed = 0x200,
}

impl Error {
    pub fn to_wire(self) -> u64 {
        match self {
            Error::Done => WireErrorCode::NoError as u64,
            Error::InternalError => WireErrorCode::InternalError as u64,
            Error::ExcessiveLoad => WireErrorCode::ExcessiveLoad as u64,
            Error::ClosedCriticalStream =>
                WireErrorCode::ClosedCriticalStream as u64,
            Error::StreamCreationError =>
                WireErrorCode::StreamCreationError as u64,
            Error::FrameUnexpected => WireErrorCode::FrameUnexpected as u64,
            Error::FrameError => WireErrorCode::FrameError as u64,
            Error::MissingSettings => WireErrorCode::MissingSettings as u64,
            Error::SettingsError => WireErrorCode::SettingsError as u64,
            Error::QpackDecompressionFailed =>
                WireErrorCode::QpackDecompressionFailed as u64,
            Error::RequestRejected => WireErrorCode::RequestRejected as u64,
            Error::RequestCancelled => WireErrorCode::RequestCancelled as u64,

            _ => WireErrorCode::GeneralProtocolError as u64,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TransportError(e) => Some(e),

            _ => None,
        }
    }
}

impl From<crate::Error> for Error {
    fn from(err: crate::Error) -> Error {
        match err {
            crate::Error::Done => Error::Done,
            crate::Error::BufferTooShort => Error::BufferTooShort,

            _ => Error::TransportError(err),
        }
    }
}

impl From<qpack::Error> for Error {
    fn from(err: qpack::Error) -> Error {
        match err {
            qpack::Error::TooManyLiteralInsertions =>
                Error::TooManyLiteralInsertions,

            qpack::Error::FieldSectionTooLarge => Error::ExcessiveLoad,

            qpack::Error::BufferTooShort => Error::BufferTooShort,

            _ => Error::QpackDecompressionFailed,
        }
    }
}

impl From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

/// A trait for types that have an associated name and value.
pub trait NameValue {
    fn name(&self) -> &[u8];

    fn value(&self) -> &[u8];
}

impl NameValue for (&[u8], &[u8]) {
    fn name(&self) -> &[u8] {
        self.0
    }

    fn value(&self) -> &[u8] {
        self.1
    }
}

/// An owned name-value pair representing a raw HTTP header.
#[derive(Clone, PartialEq, Eq)]
pub struct Header(Vec<u8>, Vec<u8>);

impl Header {
    /// Creates a new header from its name and value.
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Self(name.to_vec(), value.to_vec())
    }
}

impl NameValue for Header {
    fn name(&self) -> &[u8] {
        &self.0
    }

    fn value(&self) -> &[u8] {
        &self.1
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "\"{}: {}\"",
            String::from_utf8_lossy(&self.0),
            String::from_utf8_lossy(&self.1)
        )
    }
}

/// An HTTP/3 connection event.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// A complete header field section was received.
    Headers {
        /// The header fields, in the order they were encoded.
        list: Vec<Header>,

        /// Whether body frames may follow on this stream.
        has_body: bool,
    },

    /// Body data is available to be read with [`recv_body()`].
    ///
    /// [`recv_body()`]: struct.Connection.html#method.recv_body
    Data,

    /// The stream was closed cleanly by the peer.
    Finished,

    /// The stream was abruptly reset by the peer, with the given wire error
    /// code.
    Reset(u64),

    /// The peer promised a pushed response. Clients that do not consume
    /// pushes should cancel the push ID.
    PushPromise {
        push_id: u64,
    },

    /// The peer abandoned a previously promised push.
    PushCanceled {
        push_id: u64,
    },

    /// The peer is shutting the connection down. Requests on streams with
    /// IDs above the given one were not processed.
    GoAway(u64),
}

/// HTTP/3 configuration.
pub struct Config {
    max_field_section_size: Option<u64>,
    qpack_max_table_capacity: u64,
    qpack_blocked_streams: u64,
    qpack_max_literal_insertions: Option<u64>,
    qpack_fallback_to_literal: bool,
}

impl Config {
    pub fn new() -> Result<Config> {
        Ok(Config {
            max_field_section_size: None,
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 16,
            qpack_max_literal_insertions: None,
            qpack_fallback_to_literal: true,
        })
    }

    /// Sets the `SETTINGS_MAX_FIELD_SECTION_SIZE` setting, bounding the
    /// header sections the peer may send us.
    pub fn set_max_field_section_size(&mut self, v: u64) {
        self.max_field_section_size = Some(v);
    }

    /// Sets the `SETTINGS_QPACK_MAX_TABLE_CAPACITY` setting. This is also
    /// the capacity requested from the peer for the encoding direction.
    pub fn set_qpack_max_table_capacity(&mut self, v: u64) {
        self.qpack_max_table_capacity = v;
    }

    /// Sets the `SETTINGS_QPACK_BLOCKED_STREAMS` setting.
    pub fn set_qpack_blocked_streams(&mut self, v: u64) {
        self.qpack_blocked_streams = v;
    }

    /// Caps the number of QPACK insertions the local encoder will perform.
    ///
    /// With `fallback` set, headers beyond the cap are encoded as literals;
    /// otherwise the request fails with
    /// [`Error::TooManyLiteralInsertions`].
    pub fn set_qpack_max_literal_insertions(&mut self, v: u64, fallback: bool) {
        self.qpack_max_literal_insertions = Some(v);
        self.qpack_fallback_to_literal = fallback;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ConnectionSettings {
    pub max_field_section_size: Option<u64>,
    pub qpack_max_table_capacity: Option<u64>,
    pub qpack_blocked_streams: Option<u64>,
}

/// An HTTP/3 connection.
pub struct Connection {
    is_server: bool,

    next_request_stream_id: u64,
    next_uni_stream_id: u64,

    streams: HashMap<u64, stream::Stream>,

    local_settings: ConnectionSettings,
    peer_settings: ConnectionSettings,
    peer_settings_received: bool,

    control_stream_id: Option<u64>,
    peer_control_stream_id: Option<u64>,

    qpack_encoder: qpack::Encoder,
    qpack_decoder: qpack::Decoder,

    local_qpack_encoder_stream_id: Option<u64>,
    local_qpack_decoder_stream_id: Option<u64>,
    peer_qpack_encoder_stream_id: Option<u64>,
    peer_qpack_decoder_stream_id: Option<u64>,

    /// Header blocks that reference QPACK insertions that have not arrived.
    blocked_header_blocks: HashMap<u64, Vec<u8>>,

    /// Desired capacity for the encoding-direction dynamic table.
    qpack_desired_capacity: u64,

    /// Events decoded ahead of the current poll call.
    pending_events: VecDeque<(u64, Event)>,

    /// Outgoing bytes accepted by us but not yet by the transport.
    pending_writes: HashMap<u64, VecDeque<u8>>,

    /// Streams for which a Finished or Reset event was delivered.
    finished_streams: HashSet<u64>,

    /// Largest request stream ID the peer may still open, once GOAWAY was
    /// sent.
    local_goaway_id: Option<u64>,

    /// GOAWAY received from the peer.
    peer_goaway_id: Option<u64>,

    /// Requests sent (client) or accepted (server) on this connection.
    request_count: u64,
}

impl Connection {
    /// Creates an HTTP/3 connection on an established transport, opening
    /// the control and QPACK streams and sending SETTINGS.
    pub fn with_transport(
        conn: &mut crate::Connection, config: &Config,
    ) -> Result<Connection> {
        if !conn.is_established() {
            return Err(Error::TransportError(crate::Error::InvalidState));
        }

        let is_server = conn.is_server();

        let mut h3 = Connection {
            is_server,
            next_request_stream_id: 0,
            next_uni_stream_id: if is_server { 3 } else { 2 },
            streams: HashMap::new(),
            local_settings: ConnectionSettings {
                max_field_section_size: config.max_field_section_size,
                qpack_max_table_capacity: Some(
                    config.qpack_max_table_capacity,
                ),
                qpack_blocked_streams: Some(config.qpack_blocked_streams),
            },
            peer_settings: ConnectionSettings::default(),
            peer_settings_received: false,
            control_stream_id: None,
            peer_control_stream_id: None,
            qpack_encoder: qpack::Encoder::new(),
            qpack_decoder: qpack::Decoder::new(
                config.qpack_max_table_capacity,
            ),
            local_qpack_encoder_stream_id: None,
            local_qpack_decoder_stream_id: None,
            peer_qpack_encoder_stream_id: None,
            peer_qpack_decoder_stream_id: None,
            blocked_header_blocks: HashMap::new(),
            qpack_desired_capacity: config.qpack_max_table_capacity,
            pending_events: VecDeque::new(),
            pending_writes: HashMap::new(),
            finished_streams: HashSet::new(),
            local_goaway_id: None,
            peer_goaway_id: None,
            request_count: 0,
        };

        if let Some(cap) = config.qpack_max_literal_insertions {
            h3.qpack_encoder
                .set_insertion_cap(cap, config.qpack_fallback_to_literal);
        }

        h3.open_critical_streams(conn)?;
        h3.send_settings(conn)?;

        Ok(h3)
    }

    /// Sends a request with the given headers, returning its stream ID.
    ///
    /// Fails with [`Error::StreamBlocked`] until the peer's SETTINGS have
    /// been received, or when the stream limit does not permit another
    /// request yet. Fails with [`Error::HeaderSizeExceeded`] before sending
    /// anything when the header list is larger than the peer accepts.
    pub fn send_request<T: NameValue>(
        &mut self, conn: &mut crate::Connection, headers: &[T], fin: bool,
    ) -> Result<u64> {
        // The peer's SETTINGS determine header limits and QPACK behavior,
        // so no request may start before they are in effect.
        if !self.peer_settings_received {
            return Err(Error::StreamBlocked);
        }

        if conn.peer_streams_left_bidi() == 0 {
            return Err(Error::StreamBlocked);
        }

        self.check_header_size(headers)?;

        let stream_id = self.next_request_stream_id;

        self.send_headers(conn, stream_id, headers, fin)?;

        // Only commit the stream ID once the request is on its way.
        self.next_request_stream_id += 4;
        self.request_count += 1;

        self.streams
            .entry(stream_id)
            .or_insert_with(|| stream::Stream::new_request(stream_id));

        Ok(stream_id)
    }

    /// Sends a response on the given stream.
    pub fn send_response<T: NameValue>(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
        headers: &[T], fin: bool,
    ) -> Result<()> {
        self.check_header_size(headers)?;

        self.send_headers(conn, stream_id, headers, fin)?;

        Ok(())
    }

    /// Sends body data, prefixed with a DATA frame header.
    ///
    /// Returns the number of payload bytes accepted, which may be less than
    /// the input when flow control pushes back, or `Error::Done` when
    /// nothing can be written.
    pub fn send_body(
        &mut self, conn: &mut crate::Connection, stream_id: u64, body: &[u8],
        fin: bool,
    ) -> Result<usize> {
        // An empty fin-only DATA frame is a waste; just close the stream.
        if body.is_empty() && fin {
            conn.stream_send(stream_id, b"", true)?;
            return Ok(0);
        }

        let cap = conn.stream_capacity(stream_id)?;

        let overhead = 1 + octets::varint_len(body.len() as u64);

        if cap <= overhead {
            return Err(Error::Done);
        }

        let len = body.len().min(cap - overhead);

        let frame = frame::Frame::Data {
            payload: body[..len].to_vec(),
        };

        let mut buf = vec![0; overhead + len];
        let mut b = octets::OctetsMut::with_slice(&mut buf);
        let written = frame.to_bytes(&mut b)?;

        conn.stream_send(stream_id, &buf[..written], fin && len == body.len())?;

        trace!("stream {stream_id} tx DATA len={len} fin={fin}");

        Ok(len)
    }

    /// Reads body data from a stream after a [`Event::Data`] event.
    ///
    /// [`Event::Data`]: enum.Event.html#variant.Data
    pub fn recv_body(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        let (read, fin) = {
            let stream = self
                .streams
                .get_mut(&stream_id)
                .ok_or(Error::Done)?;

            stream.try_consume_data(conn, out)?
        };

        // The FIN was handed to the application here, so the stream will
        // not come up as readable again.
        if fin && !self.finished_streams.contains(&stream_id) {
            self.finished_streams.insert(stream_id);
            self.pending_events.push_back((stream_id, Event::Finished));
        }

        Ok(read)
    }

    /// Processes HTTP/3 data received from the peer.
    ///
    /// Returns one event at a time, and `Error::Done` when all events have
    /// been reported.
    pub fn poll(&mut self, conn: &mut crate::Connection) -> Result<(u64, Event)> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }

        self.flush_writes(conn)?;

        for stream_id in conn.readable() {
            if let Err(e) = self.process_readable_stream(conn, stream_id) {
                if e != Error::Done {
                    conn.close(true, e.to_wire(), b"").ok();
                    return Err(e);
                }
            }

            if let Some(event) = self.pending_events.pop_front() {
                return Ok(event);
            }
        }

        self.flush_writes(conn)?;

        Err(Error::Done)
    }

    /// Tells the peer to stop creating new work: a client sends the largest
    /// push ID it will honor, a server the largest request stream ID it
    /// will process.
    pub fn send_goaway(
        &mut self, conn: &mut crate::Connection, id: u64,
    ) -> Result<()> {
        if let Some(sent) = self.local_goaway_id {
            if id > sent {
                return Err(Error::InternalError);
            }
        }

        self.send_control_frame(conn, &frame::Frame::GoAway { id })?;
        self.local_goaway_id = Some(id);

        Ok(())
    }

    /// Cancels a promised push.
    pub fn cancel_push(
        &mut self, conn: &mut crate::Connection, push_id: u64,
    ) -> Result<()> {
        self.send_control_frame(conn, &frame::Frame::CancelPush { push_id })
    }

    /// Abandons a request: both directions of its stream are shut down and
    /// the peer is told the exchange was cancelled.
    pub fn cancel_request(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
    ) -> Result<()> {
        let err = WireErrorCode::RequestCancelled as u64;

        conn.stream_shutdown(stream_id, crate::Shutdown::Write, err)
            .ok();
        conn.stream_shutdown(stream_id, crate::Shutdown::Read, err).ok();

        self.blocked_header_blocks.remove(&stream_id);
        self.qpack_decoder.cancel_stream(stream_id)?;
        self.finished_streams.insert(stream_id);

        Ok(())
    }

    /// Number of requests sent (client) or accepted (server) so far.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Whether the peer's SETTINGS have arrived and are in effect.
    pub fn peer_settings_received(&self) -> bool {
        self.peer_settings_received
    }

    /// The peer's GOAWAY ID, if the peer is shutting down.
    pub fn peer_goaway_id(&self) -> Option<u64> {
        self.peer_goaway_id
    }

    /// The peer's advertised `SETTINGS_MAX_FIELD_SECTION_SIZE`, if any.
    pub fn peer_max_field_section_size(&self) -> Option<u64> {
        self.peer_settings.max_field_section_size
    }

    fn open_critical_streams(
        &mut self, conn: &mut crate::Connection,
    ) -> Result<()> {
        let control = self.open_uni_stream(
            conn,
            stream::HTTP3_CONTROL_STREAM_TYPE_ID,
        )?;
        self.control_stream_id = Some(control);

        let enc = self
            .open_uni_stream(conn, stream::QPACK_ENCODER_STREAM_TYPE_ID)?;
        self.local_qpack_encoder_stream_id = Some(enc);

        let dec = self
            .open_uni_stream(conn, stream::QPACK_DECODER_STREAM_TYPE_ID)?;
        self.local_qpack_decoder_stream_id = Some(dec);

        Ok(())
    }

    fn open_uni_stream(
        &mut self, conn: &mut crate::Connection, ty: u64,
    ) -> Result<u64> {
        if conn.peer_streams_left_uni() == 0 {
            return Err(Error::StreamCreationError);
        }

        let stream_id = self.next_uni_stream_id;

        let mut buf = [0; 8];
        let mut b = octets::OctetsMut::with_slice(&mut buf);
        b.put_varint(ty)?;

        let off = b.off();
        conn.stream_send(stream_id, &buf[..off], false)?;

        self.next_uni_stream_id += 4;

        Ok(stream_id)
    }

    fn send_settings(&mut self, conn: &mut crate::Connection) -> Result<()> {
        let settings = frame::Frame::Settings {
            max_field_section_size: self.local_settings.max_field_section_size,
            qpack_max_table_capacity: self
                .local_settings
                .qpack_max_table_capacity,
            qpack_blocked_streams: self.local_settings.qpack_blocked_streams,
        };

        self.send_control_frame(conn, &settings)
    }

    fn send_control_frame(
        &mut self, conn: &mut crate::Connection, frame: &frame::Frame,
    ) -> Result<()> {
        let stream_id =
            self.control_stream_id.ok_or(Error::InternalError)?;

        let mut buf = [0; 128];
        let mut b = octets::OctetsMut::with_slice(&mut buf);
        let written = frame.to_bytes(&mut b)?;

        self.queue_write(conn, stream_id, &buf[..written])?;

        Ok(())
    }

    fn check_header_size<T: NameValue>(&self, headers: &[T]) -> Result<()> {
        let Some(limit) = self.peer_settings.max_field_section_size else {
            return Ok(());
        };

        let size: u64 = headers
            .iter()
            .map(|h| qpack::entry_size(h.name(), h.value()))
            .sum();

        if size > limit {
            return Err(Error::HeaderSizeExceeded);
        }

        Ok(())
    }

    fn send_headers<T: NameValue>(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
        headers: &[T], fin: bool,
    ) -> Result<()> {
        let mut block = vec![0; 16 * 1024];

        let block_len = self
            .qpack_encoder
            .encode(headers, stream_id, &mut block)
            .map_err(Error::from)?;

        // The insertions the block references travel on the encoder stream.
        self.flush_qpack(conn)?;

        let mut buf = vec![0; block_len + 16];
        let mut b = octets::OctetsMut::with_slice(&mut buf);

        let frame = frame::Frame::Headers {
            header_block: block[..block_len].to_vec(),
        };
        let written = frame.to_bytes(&mut b)?;

        // Creating the stream first lets the capacity check below work for
        // streams that do not exist yet.
        conn.stream_send(stream_id, b"", false)?;

        if conn.stream_capacity(stream_id)? < written {
            return Err(Error::StreamBlocked);
        }

        conn.stream_send(stream_id, &buf[..written], fin)?;

        trace!("stream {stream_id} tx HEADERS len={block_len} fin={fin}");

        Ok(())
    }

    fn process_readable_stream(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
    ) -> Result<()> {
        self.streams.entry(stream_id).or_insert_with(|| {
            if crate::stream::is_bidi(stream_id) {
                stream::Stream::new_request(stream_id)
            } else {
                stream::Stream::new_uni(stream_id)
            }
        });

        // While a header block waits for QPACK insertions nothing else may
        // be surfaced from this stream, or events would be reordered.
        if self.blocked_header_blocks.contains_key(&stream_id) {
            return Ok(());
        }

        loop {
            let progress = {
                let stream = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or(Error::InternalError)?;

                stream.poll(conn)
            };

            match progress {
                Ok(p) => self.handle_progress(conn, stream_id, p)?,

                Err(Error::Done) => break,

                Err(Error::TransportError(crate::Error::StreamReset(e))) => {
                    self.handle_stream_reset(stream_id, e)?;
                    break;
                },

                Err(e) => return Err(e),
            }

            if self.blocked_header_blocks.contains_key(&stream_id) {
                return Ok(());
            }
        }

        self.maybe_finish_stream(conn, stream_id);

        Ok(())
    }

    fn handle_progress(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
        progress: stream::Progress,
    ) -> Result<()> {
        match progress {
            stream::Progress::StreamType(ty) =>
                self.register_peer_stream(stream_id, ty),

            stream::Progress::PushId(push_id) => {
                // This client never consumes pushes: refuse the stream and
                // tell the server not to bother.
                conn.stream_shutdown(
                    stream_id,
                    crate::Shutdown::Read,
                    WireErrorCode::RequestCancelled as u64,
                )
                .ok();

                self.cancel_push(conn, push_id)?;

                Ok(())
            },

            stream::Progress::Frame(frame) =>
                self.handle_frame(conn, stream_id, frame),

            stream::Progress::Data => {
                self.pending_events.push_back((stream_id, Event::Data));
                Ok(())
            },

            stream::Progress::QpackBytes(bytes) =>
                self.handle_qpack_bytes(conn, stream_id, &bytes),
        }
    }

    fn register_peer_stream(
        &mut self, stream_id: u64, ty: stream::Type,
    ) -> Result<()> {
        let slot = match ty {
            stream::Type::Control => &mut self.peer_control_stream_id,
            stream::Type::QpackEncoder =>
                &mut self.peer_qpack_encoder_stream_id,
            stream::Type::QpackDecoder =>
                &mut self.peer_qpack_decoder_stream_id,

            // Push streams are handled at the push ID, unknown types drain.
            _ => return Ok(()),
        };

        // Critical streams must be unique.
        if slot.is_some() {
            return Err(Error::StreamCreationError);
        }

        *slot = Some(stream_id);

        Ok(())
    }

    fn handle_frame(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
        frame: frame::Frame,
    ) -> Result<()> {
        let ty = self
            .streams
            .get(&stream_id)
            .and_then(stream::Stream::ty)
            .ok_or(Error::InternalError)?;

        match ty {
            stream::Type::Control =>
                self.handle_control_frame(stream_id, frame),

            stream::Type::Request =>
                self.handle_request_frame(conn, stream_id, frame),

            // Push streams were refused at the push ID; any frame already
            // in flight is dropped.
            stream::Type::Push => Ok(()),

            _ => Err(Error::FrameUnexpected),
        }
    }

    fn handle_control_frame(
        &mut self, stream_id: u64, frame: frame::Frame,
    ) -> Result<()> {
        // The control stream must start with SETTINGS.
        if !self.peer_settings_received &&
            !matches!(frame, frame::Frame::Settings { .. })
        {
            return Err(Error::MissingSettings);
        }

        match frame {
            frame::Frame::Settings {
                max_field_section_size,
                qpack_max_table_capacity,
                qpack_blocked_streams,
            } => {
                if self.peer_settings_received {
                    return Err(Error::FrameUnexpected);
                }

                self.peer_settings = ConnectionSettings {
                    max_field_section_size,
                    qpack_max_table_capacity,
                    qpack_blocked_streams,
                };

                // All settings take effect atomically before any request
                // uses them.
                self.qpack_encoder.apply_settings(
                    qpack_max_table_capacity.unwrap_or(0),
                    qpack_blocked_streams.unwrap_or(0),
                    self.qpack_desired_capacity,
                )?;

                self.peer_settings_received = true;

                debug!(
                    "peer settings applied max_field_section={max_field_section_size:?} qpack_max_table={qpack_max_table_capacity:?} qpack_blocked={qpack_blocked_streams:?}",
                );

                Ok(())
            },

            frame::Frame::GoAway { id } => {
                // A client receives request stream IDs in GOAWAY.
                if !self.is_server && id % 4 != 0 {
                    return Err(Error::FrameUnexpected);
                }

                // GOAWAY may only tighten, never extend.
                if let Some(prev) = self.peer_goaway_id {
                    if id > prev {
                        return Err(Error::FrameUnexpected);
                    }
                }

                self.peer_goaway_id = Some(id);
                self.pending_events
                    .push_back((stream_id, Event::GoAway(id)));

                Ok(())
            },

            frame::Frame::CancelPush { push_id } => {
                if !self.is_server {
                    self.pending_events
                        .push_back((stream_id, Event::PushCanceled { push_id }));
                }

                Ok(())
            },

            frame::Frame::MaxPushId { .. } =>
                if self.is_server {
                    Ok(())
                } else {
                    Err(Error::FrameUnexpected)
                },

            frame::Frame::Unknown { .. } => Ok(()),

            _ => Err(Error::FrameUnexpected),
        }
    }

    fn handle_request_frame(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
        frame: frame::Frame,
    ) -> Result<()> {
        match frame {
            frame::Frame::Headers { header_block } => {
                if self.is_server {
                    self.request_count += 1;
                }

                self.decode_header_block(conn, stream_id, header_block)
            },

            frame::Frame::PushPromise { push_id, .. } => {
                if self.is_server {
                    return Err(Error::FrameUnexpected);
                }

                self.pending_events
                    .push_back((stream_id, Event::PushPromise { push_id }));

                Ok(())
            },

            frame::Frame::Unknown { .. } => Ok(()),

            _ => Err(Error::FrameUnexpected),
        }
    }

    fn decode_header_block(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
        header_block: Vec<u8>,
    ) -> Result<()> {
        let max_size = self
            .local_settings
            .max_field_section_size
            .unwrap_or(u64::MAX);

        match self.qpack_decoder.decode(&header_block, stream_id, max_size) {
            Ok(list) => {
                let has_body = !conn.stream_finished(stream_id);

                self.pending_events
                    .push_back((stream_id, Event::Headers { list, has_body }));

                Ok(())
            },

            Err(qpack::Error::Blocked) => {
                let budget = self
                    .local_settings
                    .qpack_blocked_streams
                    .unwrap_or(0);

                if self.blocked_header_blocks.len() as u64 >= budget {
                    return Err(Error::ExcessiveLoad);
                }

                trace!("stream {stream_id} blocked on qpack insertions");

                self.blocked_header_blocks.insert(stream_id, header_block);

                Ok(())
            },

            Err(e) => Err(e.into()),
        }
    }

    fn handle_qpack_bytes(
        &mut self, conn: &mut crate::Connection, stream_id: u64, bytes: &[u8],
    ) -> Result<()> {
        if Some(stream_id) == self.peer_qpack_encoder_stream_id {
            self.qpack_decoder.control(bytes).map_err(Error::from)?;

            self.retry_blocked_streams(conn)?;

            return Ok(());
        }

        if Some(stream_id) == self.peer_qpack_decoder_stream_id {
            self.qpack_encoder.control(bytes).map_err(Error::from)?;

            return Ok(());
        }

        Err(Error::InternalError)
    }

    /// Retries header blocks that were waiting for QPACK insertions.
    fn retry_blocked_streams(
        &mut self, conn: &mut crate::Connection,
    ) -> Result<()> {
        let blocked: Vec<u64> =
            self.blocked_header_blocks.keys().copied().collect();

        for stream_id in blocked {
            let block = self
                .blocked_header_blocks
                .remove(&stream_id)
                .ok_or(Error::InternalError)?;

            self.decode_header_block(conn, stream_id, block)?;

            // If it is still blocked it was re-inserted; otherwise the
            // stream can make progress again.
            if !self.blocked_header_blocks.contains_key(&stream_id) {
                self.process_readable_stream(conn, stream_id)?;
            }
        }

        Ok(())
    }

    fn handle_stream_reset(&mut self, stream_id: u64, e: u64) -> Result<()> {
        let ty = self.streams.get(&stream_id).and_then(stream::Stream::ty);

        match ty {
            Some(stream::Type::Request) => {
                if !self.finished_streams.contains(&stream_id) {
                    self.finished_streams.insert(stream_id);
                    self.blocked_header_blocks.remove(&stream_id);
                    self.qpack_decoder.cancel_stream(stream_id)?;

                    self.pending_events
                        .push_back((stream_id, Event::Reset(e)));
                }

                Ok(())
            },

            Some(stream::Type::Control) |
            Some(stream::Type::QpackEncoder) |
            Some(stream::Type::QpackDecoder) =>
                Err(Error::ClosedCriticalStream),

            _ => Ok(()),
        }
    }

    fn maybe_finish_stream(
        &mut self, conn: &mut crate::Connection, stream_id: u64,
    ) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };

        if stream.ty() != Some(stream::Type::Request) {
            return;
        }

        if conn.stream_finished(stream_id) &&
            stream.is_at_frame_boundary() &&
            !self.finished_streams.contains(&stream_id)
        {
            self.finished_streams.insert(stream_id);
            self.pending_events
                .push_back((stream_id, Event::Finished));
        }
    }

    /// Queues bytes for a local stream, sending as much as the transport
    /// accepts right away.
    fn queue_write(
        &mut self, conn: &mut crate::Connection, stream_id: u64, bytes: &[u8],
    ) -> Result<()> {
        let pending = self.pending_writes.entry(stream_id).or_default();
        pending.extend(bytes);

        Self::flush_stream_writes(conn, stream_id, pending)?;

        Ok(())
    }

    fn flush_writes(&mut self, conn: &mut crate::Connection) -> Result<()> {
        self.flush_qpack(conn)?;

        for (stream_id, pending) in self.pending_writes.iter_mut() {
            Self::flush_stream_writes(conn, *stream_id, pending)?;
        }

        self.pending_writes.retain(|_, pending| !pending.is_empty());

        Ok(())
    }

    fn flush_stream_writes(
        conn: &mut crate::Connection, stream_id: u64,
        pending: &mut VecDeque<u8>,
    ) -> Result<()> {
        while !pending.is_empty() {
            let (head, _) = pending.as_slices();

            let written = match conn.stream_send(stream_id, head, false) {
                Ok(v) => v,

                Err(crate::Error::Done) => break,

                Err(e) => return Err(e.into()),
            };

            if written == 0 {
                break;
            }

            pending.drain(..written);
        }

        Ok(())
    }

    /// Moves pending QPACK instructions onto their streams.
    fn flush_qpack(&mut self, conn: &mut crate::Connection) -> Result<()> {
        let mut buf = [0; 4096];

        if self.qpack_encoder.has_instructions() {
            let stream_id = self
                .local_qpack_encoder_stream_id
                .ok_or(Error::InternalError)?;

            let n = self.qpack_encoder.emit_instructions(&mut buf);

            self.queue_write(conn, stream_id, &buf[..n])?;
        }

        if self.qpack_decoder.has_instructions() {
            let stream_id = self
                .local_qpack_decoder_stream_id
                .ok_or(Error::InternalError)?;

            let n = self.qpack_decoder.emit_instructions(&mut buf);

            self.queue_write(conn, stream_id, &buf[..n])?;
        }

        Ok(())
    }
}

pub mod frame;
pub mod qpack;

mod stream;

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::Pipe;

    /// An end-to-end HTTP/3 session over an in-memory transport.
    pub struct Session {
        pub pipe: Pipe,
        pub client: Connection,
        pub server: Connection,
    }

    impl Session {
        pub fn new() -> Result<Session> {
            let config = Config::new()?;
            Session::with_configs(&config, &config)
        }

        pub fn with_configs(
            client_config: &Config, server_config: &Config,
        ) -> Result<Session> {
            let mut pipe = Pipe::new().map_err(Error::TransportError)?;
            pipe.handshake().map_err(Error::TransportError)?;

            let client =
                Connection::with_transport(&mut pipe.client, client_config)?;
            let server =
                Connection::with_transport(&mut pipe.server, server_config)?;

            Ok(Session {
                pipe,
                client,
                server,
            })
        }

        /// Delivers pending flights and lets both sides process control
        /// data (settings, QPACK instructions, acknowledgements).
        pub fn advance(&mut self) {
            for _ in 0..4 {
                self.pipe.advance().unwrap();

                while self.client.poll(&mut self.pipe.client).is_ok() {}
                while self.server.poll(&mut self.pipe.server).is_ok() {}
            }
        }

        /// Like `advance`, but collects the events each side produced.
        pub fn advance_collect(
            &mut self,
        ) -> (Vec<(u64, Event)>, Vec<(u64, Event)>) {
            let mut client_events = Vec::new();
            let mut server_events = Vec::new();

            for _ in 0..4 {
                self.pipe.advance().unwrap();

                while let Ok(ev) = self.client.poll(&mut self.pipe.client) {
                    client_events.push(ev);
                }

                while let Ok(ev) = self.server.poll(&mut self.pipe.server) {
                    server_events.push(ev);
                }
            }

            (client_events, server_events)
        }
    }

    fn request_headers() -> Vec<Header> {
        vec![
            Header::new(b":method", b"GET"),
            Header::new(b":scheme", b"https"),
            Header::new(b":authority", b"quill.test"),
            Header::new(b":path", b"/index.html"),
            Header::new(b"user-agent", b"quill-test"),
        ]
    }

    fn response_headers() -> Vec<Header> {
        vec![
            Header::new(b":status", b"200"),
            Header::new(b"server", b"quill-test"),
        ]
    }

    #[test]
    fn settings_exchange() {
        let mut s = Session::new().unwrap();
        s.advance();

        assert!(s.client.peer_settings_received());
        assert!(s.server.peer_settings_received());
    }

    #[test]
    fn request_before_settings() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();

        let config = Config::new().unwrap();
        let mut client =
            Connection::with_transport(&mut pipe.client, &config).unwrap();

        // The server's SETTINGS have not arrived yet.
        assert_eq!(
            client.send_request(&mut pipe.client, &request_headers(), true),
            Err(Error::StreamBlocked)
        );
    }

    #[test]
    fn request_response() {
        let mut s = Session::new().unwrap();
        s.advance();

        let stream_id = s
            .client
            .send_request(&mut s.pipe.client, &request_headers(), true)
            .unwrap();
        assert_eq!(stream_id, 0);
        assert_eq!(s.client.request_count(), 1);

        let (_, server_events) = s.advance_collect();

        assert_eq!(
            server_events,
            vec![
                (0, Event::Headers {
                    list: request_headers(),
                    has_body: false,
                }),
                (0, Event::Finished),
            ]
        );

        s.server
            .send_response(&mut s.pipe.server, 0, &response_headers(), false)
            .unwrap();
        s.server
            .send_body(&mut s.pipe.server, 0, b"hello world", true)
            .unwrap();

        let (client_events, _) = s.advance_collect();

        assert_eq!(client_events[0].0, 0);
        assert!(matches!(
            client_events[0].1,
            Event::Headers { has_body: true, .. }
        ));
        assert_eq!(client_events[1], (0, Event::Data));

        let mut body = [0; 64];
        let read = s
            .client
            .recv_body(&mut s.pipe.client, 0, &mut body)
            .unwrap();
        assert_eq!(&body[..read], b"hello world");

        let (client_events, _) = s.advance_collect();
        assert_eq!(client_events, vec![(0, Event::Finished)]);
    }

    #[test]
    fn header_size_fail_fast() {
        let mut server_config = Config::new().unwrap();
        server_config.set_max_field_section_size(300);

        let client_config = Config::new().unwrap();

        let mut s =
            Session::with_configs(&client_config, &server_config).unwrap();
        s.advance();

        let mut headers = request_headers();
        headers.push(Header::new(b"x-filler", &[b'a'; 200]));

        // The request fails locally, consuming no stream ID.
        assert_eq!(
            s.client
                .send_request(&mut s.pipe.client, &headers, true),
            Err(Error::HeaderSizeExceeded)
        );
        assert_eq!(s.client.request_count(), 0);

        // A conforming request still goes through afterwards.
        let stream_id = s
            .client
            .send_request(&mut s.pipe.client, &request_headers(), true)
            .unwrap();
        assert_eq!(stream_id, 0);
    }

    #[test]
    fn goaway_event() {
        let mut s = Session::new().unwrap();
        s.advance();

        s.client
            .send_request(&mut s.pipe.client, &request_headers(), true)
            .unwrap();
        s.advance();

        s.server.send_goaway(&mut s.pipe.server, 0).unwrap();

        let (client_events, _) = s.advance_collect();
        assert!(client_events.contains(&(3, Event::GoAway(0))));
        assert_eq!(s.client.peer_goaway_id(), Some(0));
    }

    #[test]
    fn goaway_must_not_extend() {
        let mut s = Session::new().unwrap();
        s.advance();

        s.server.send_goaway(&mut s.pipe.server, 4).unwrap();
        assert_eq!(
            s.server.send_goaway(&mut s.pipe.server, 8),
            Err(Error::InternalError)
        );
    }

    #[test]
    fn response_reset_event() {
        let mut s = Session::new().unwrap();
        s.advance();

        let stream_id = s
            .client
            .send_request(&mut s.pipe.client, &request_headers(), true)
            .unwrap();
        s.advance();

        // The server drops the request without processing it.
        s.pipe
            .server
            .stream_shutdown(
                stream_id,
                crate::Shutdown::Write,
                WireErrorCode::RequestRejected as u64,
            )
            .unwrap();

        let (client_events, _) = s.advance_collect();
        assert!(client_events.contains(&(
            stream_id,
            Event::Reset(WireErrorCode::RequestRejected as u64)
        )));
    }

    #[test]
    fn dynamic_headers_across_requests() {
        let mut s = Session::new().unwrap();
        s.advance();

        // The custom header is inserted into the dynamic table on first
        // use and referenced afterwards.
        let mut headers = request_headers();
        headers.push(Header::new(b"x-tenant", b"blue-42"));

        for i in 0..4 {
            let stream_id = s
                .client
                .send_request(&mut s.pipe.client, &headers, true)
                .unwrap();
            assert_eq!(stream_id, i * 4);

            let (_, server_events) = s.advance_collect();

            assert_eq!(
                server_events,
                vec![
                    (stream_id, Event::Headers {
                        list: headers.clone(),
                        has_body: false,
                    }),
                    (stream_id, Event::Finished),
                ]
            );
        }
    }

    #[test]
    fn strict_insertion_cap_fails_request() {
        let mut client_config = Config::new().unwrap();
        client_config.set_qpack_max_literal_insertions(1, false);

        let server_config = Config::new().unwrap();

        let mut s =
            Session::with_configs(&client_config, &server_config).unwrap();
        s.advance();

        let mut headers = request_headers();
        headers.push(Header::new(b"x-a", b"1"));
        headers.push(Header::new(b"x-b", b"2"));

        assert_eq!(
            s.client.send_request(&mut s.pipe.client, &headers, true),
            Err(Error::TooManyLiteralInsertions)
        );
    }

    #[test]
    fn body_round_trip_with_flow_control() {
        let mut s = Session::new().unwrap();
        s.advance();

        let stream_id = s
            .client
            .send_request(&mut s.pipe.client, &request_headers(), false)
            .unwrap();

        let body = vec![b'q'; 10_000];
        let mut sent = 0;

        while sent < body.len() {
            match s.client.send_body(
                &mut s.pipe.client,
                stream_id,
                &body[sent..],
                true,
            ) {
                Ok(n) => sent += n,

                Err(Error::Done) => s.advance(),

                Err(e) => panic!("send_body failed: {e:?}"),
            }
        }

        let (_, server_events) = s.advance_collect();
        assert!(server_events
            .iter()
            .any(|(_, ev)| matches!(ev, Event::Headers { .. })));
        assert!(server_events.contains(&(stream_id, Event::Data)));

        let mut received = Vec::new();
        let mut buf = [0; 4096];

        loop {
            match s.server.recv_body(&mut s.pipe.server, stream_id, &mut buf)
            {
                Ok(n) => received.extend_from_slice(&buf[..n]),

                Err(Error::Done) => {
                    if received.len() == body.len() {
                        break;
                    }
                    s.advance();
                },

                Err(e) => panic!("recv_body failed: {e:?}"),
            }
        }

        assert_eq!(received, body);
    }

    #[test]
    fn cancel_request_resets_stream() {
        let mut s = Session::new().unwrap();
        s.advance();

        let stream_id = s
            .client
            .send_request(&mut s.pipe.client, &request_headers(), false)
            .unwrap();
        s.advance();

        s.client
            .cancel_request(&mut s.pipe.client, stream_id)
            .unwrap();

        let (_, server_events) = s.advance_collect();
        assert!(server_events.contains(&(
            stream_id,
            Event::Reset(WireErrorCode::RequestCancelled as u64)
        )));
    }
}
