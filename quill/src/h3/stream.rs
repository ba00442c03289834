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

use super::frame;
use super::Error;
use super::Result;

pub const HTTP3_CONTROL_STREAM_TYPE_ID: u64 = 0x0;
pub const HTTP3_PUSH_STREAM_TYPE_ID: u64 = 0x1;
pub const QPACK_ENCODER_STREAM_TYPE_ID: u64 = 0x2;
pub const QPACK_DECODER_STREAM_TYPE_ID: u64 = 0x3;

/// Cap on a single buffered frame payload.
const MAX_STATE_BUF_SIZE: usize = 1 << 20;

/// The unidirectional stream type, as declared by its first varint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Control,
    Request,
    Push,
    QpackEncoder,
    QpackDecoder,
    Unknown,
}

impl Type {
    pub fn deserialize(v: u64) -> Type {
        match v {
            HTTP3_CONTROL_STREAM_TYPE_ID => Type::Control,
            HTTP3_PUSH_STREAM_TYPE_ID => Type::Push,
            QPACK_ENCODER_STREAM_TYPE_ID => Type::QpackEncoder,
            QPACK_DECODER_STREAM_TYPE_ID => Type::QpackDecoder,

            _ => Type::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Reading the unidirectional stream type.
    StreamType,

    /// Reading the push ID following a push stream's type.
    PushId,

    /// Reading a frame's type.
    FrameType,

    /// Reading a frame's payload length.
    FramePayloadLen,

    /// Buffering a frame's payload.
    FramePayload,

    /// Passing a DATA frame's payload through to the application.
    Data,

    /// Forwarding raw QPACK instruction bytes.
    QpackInstruction,

    /// Discarding everything on a stream of unknown type.
    Drain,
}

/// What a call to [`Stream::poll`] produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// The stream declared its type.
    StreamType(Type),

    /// A push stream declared its push ID.
    PushId(u64),

    /// A complete non-DATA frame.
    Frame(frame::Frame),

    /// DATA payload is ready to be consumed by the application.
    Data,

    /// Raw QPACK instruction bytes.
    QpackBytes(Vec<u8>),
}

/// Per-stream HTTP/3 parsing state.
pub struct Stream {
    id: u64,

    ty: Option<Type>,

    state: State,

    /// Bytes accumulated for the element currently being parsed.
    state_buf: Vec<u8>,

    /// Expected length of the current element.
    state_len: usize,

    /// Bytes of the current element received so far.
    state_off: usize,

    /// Type of the frame currently being parsed.
    frame_type: Option<u64>,

    /// Remaining payload of the DATA frame being consumed.
    data_left: u64,

    /// Whether a Data progress was already reported for the currently
    /// buffered payload.
    data_event_fired: bool,
}

impl Stream {
    /// A peer-initiated stream whose type comes from its first varint.
    pub fn new_uni(id: u64) -> Stream {
        Stream {
            id,
            ty: None,
            state: State::StreamType,
            state_buf: vec![0; 1],
            state_len: 1,
            state_off: 0,
            frame_type: None,
            data_left: 0,
            data_event_fired: false,
        }
    }

    /// A bidirectional request stream, which carries frames directly.
    pub fn new_request(id: u64) -> Stream {
        Stream {
            id,
            ty: Some(Type::Request),
            state: State::FrameType,
            state_buf: vec![0; 1],
            state_len: 1,
            state_off: 0,
            frame_type: None,
            data_left: 0,
            data_event_fired: false,
        }
    }

    pub fn ty(&self) -> Option<Type> {
        self.ty
    }

    /// Whether the parser sits between frames, where a FIN is legal.
    pub fn is_at_frame_boundary(&self) -> bool {
        matches!(self.state, State::FrameType) && self.state_off == 0
    }

    /// Advances the parser by reading from the transport.
    ///
    /// Returns `Error::Done` when no further progress can be made with the
    /// data currently buffered.
    pub fn poll(&mut self, conn: &mut crate::Connection) -> Result<Progress> {
        loop {
            match self.state {
                State::StreamType => {
                    let v = self.try_consume_varint(conn)?;
                    let ty = Type::deserialize(v);

                    self.ty = Some(ty);

                    match ty {
                        Type::Control =>
                            self.state_transition(State::FrameType, 1),

                        Type::Push => self.state_transition(State::PushId, 1),

                        Type::QpackEncoder | Type::QpackDecoder =>
                            self.state_transition(State::QpackInstruction, 0),

                        Type::Unknown =>
                            self.state_transition(State::Drain, 0),

                        Type::Request => unreachable!(),
                    }

                    return Ok(Progress::StreamType(ty));
                },

                State::PushId => {
                    let push_id = self.try_consume_varint(conn)?;

                    self.state_transition(State::FrameType, 1);

                    return Ok(Progress::PushId(push_id));
                },

                State::FrameType => {
                    let v = self.try_consume_varint(conn)?;

                    self.frame_type = Some(v);
                    self.state_transition(State::FramePayloadLen, 1);
                },

                State::FramePayloadLen => {
                    let len = self.try_consume_varint(conn)?;

                    let frame_type =
                        self.frame_type.ok_or(Error::InternalError)?;

                    if frame_type == frame::DATA_FRAME_TYPE_ID {
                        if !matches!(
                            self.ty,
                            Some(Type::Request) | Some(Type::Push)
                        ) {
                            return Err(Error::FrameUnexpected);
                        }

                        if len == 0 {
                            self.state_transition(State::FrameType, 1);
                            continue;
                        }

                        self.data_left = len;
                        self.data_event_fired = false;
                        self.state_transition(State::Data, 0);

                        continue;
                    }

                    if len as usize > MAX_STATE_BUF_SIZE {
                        return Err(Error::ExcessiveLoad);
                    }

                    self.state_transition(State::FramePayload, len as usize);
                },

                State::FramePayload => {
                    self.try_fill_buffer(conn)?;

                    let frame_type =
                        self.frame_type.ok_or(Error::InternalError)?;

                    let frame = frame::Frame::from_bytes(
                        frame_type,
                        self.state_len as u64,
                        &self.state_buf[..self.state_len],
                    )?;

                    self.state_transition(State::FrameType, 1);

                    trace!("stream {} rx frm {frame:?}", self.id);

                    return Ok(Progress::Frame(frame));
                },

                State::Data => {
                    if self.data_event_fired {
                        return Err(Error::Done);
                    }

                    self.data_event_fired = true;

                    return Ok(Progress::Data);
                },

                State::QpackInstruction => {
                    let mut buf = [0; 4096];

                    let (read, _) = conn
                        .stream_recv(self.id, &mut buf)
                        .map_err(map_transport_err)?;

                    return Ok(Progress::QpackBytes(buf[..read].to_vec()));
                },

                State::Drain => {
                    let mut buf = [0; 4096];

                    loop {
                        conn.stream_recv(self.id, &mut buf)
                            .map_err(map_transport_err)?;
                    }
                },
            }
        }
    }

    /// Reads DATA payload directly into the application's buffer.
    ///
    /// Returns the number of bytes read and whether this was the end of the
    /// stream.
    pub fn try_consume_data(
        &mut self, conn: &mut crate::Connection, out: &mut [u8],
    ) -> Result<(usize, bool)> {
        if self.state != State::Data {
            return Err(Error::Done);
        }

        let n = out.len().min(self.data_left as usize);

        let (read, fin) = conn
            .stream_recv(self.id, &mut out[..n])
            .map_err(map_transport_err)?;

        self.data_left -= read as u64;
        self.data_event_fired = false;

        // A FIN before the declared payload length is a malformed message.
        if fin && self.data_left > 0 {
            return Err(Error::FrameError);
        }

        if self.data_left == 0 {
            self.state_transition(State::FrameType, 1);
        }

        Ok((read, fin))
    }

    fn state_transition(&mut self, state: State, expected_len: usize) {
        self.state = state;
        self.state_off = 0;
        self.state_len = expected_len;

        if self.state_buf.len() < expected_len {
            self.state_buf.resize(expected_len, 0);
        }
    }

    fn try_fill_buffer(&mut self, conn: &mut crate::Connection) -> Result<()> {
        if self.state_off == self.state_len {
            return Ok(());
        }

        let buf = &mut self.state_buf[self.state_off..self.state_len];

        let (read, fin) =
            conn.stream_recv(self.id, buf).map_err(map_transport_err)?;

        self.state_off += read;

        if self.state_off < self.state_len {
            if fin {
                // A FIN between frames ends the stream cleanly; in the
                // middle of an element it is malformed.
                if self.state_off == 0 &&
                    matches!(self.state, State::FrameType | State::StreamType)
                {
                    return Err(Error::Done);
                }

                return Err(Error::FrameError);
            }

            return Err(Error::Done);
        }

        Ok(())
    }

    fn try_consume_varint(
        &mut self, conn: &mut crate::Connection,
    ) -> Result<u64> {
        self.try_fill_buffer(conn)?;

        let varint_len = octets::varint_parse_len(self.state_buf[0]);

        if varint_len > self.state_len {
            self.state_len = varint_len;

            if self.state_buf.len() < varint_len {
                self.state_buf.resize(varint_len, 0);
            }

            self.try_fill_buffer(conn)?;
        }

        let mut b = octets::Octets::with_slice(&self.state_buf[..self.state_len]);

        Ok(b.get_varint()?)
    }
}

fn map_transport_err(e: crate::Error) -> Error {
    match e {
        crate::Error::Done => Error::Done,

        other => Error::TransportError(other),
    }
}
