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

use crate::Error;
use crate::Result;

use crate::transport_params::TransportParams;

pub const PADDING_FRAME_TYPE_ID: u64 = 0x00;
pub const PING_FRAME_TYPE_ID: u64 = 0x01;
pub const PONG_FRAME_TYPE_ID: u64 = 0x02;
pub const RESET_STREAM_FRAME_TYPE_ID: u64 = 0x04;
pub const STOP_SENDING_FRAME_TYPE_ID: u64 = 0x05;
pub const HANDSHAKE_FRAME_TYPE_ID: u64 = 0x06;
pub const STREAM_FRAME_TYPE_ID: u64 = 0x08;
pub const STREAM_FRAME_TYPE_ID_FIN: u64 = 0x09;
pub const MAX_DATA_FRAME_TYPE_ID: u64 = 0x10;
pub const MAX_STREAM_DATA_FRAME_TYPE_ID: u64 = 0x11;
pub const MAX_STREAMS_BIDI_FRAME_TYPE_ID: u64 = 0x12;
pub const MAX_STREAMS_UNI_FRAME_TYPE_ID: u64 = 0x13;
pub const DATA_BLOCKED_FRAME_TYPE_ID: u64 = 0x14;
pub const STREAM_DATA_BLOCKED_FRAME_TYPE_ID: u64 = 0x15;
pub const CONNECTION_CLOSE_FRAME_TYPE_ID: u64 = 0x1c;
pub const APPLICATION_CLOSE_FRAME_TYPE_ID: u64 = 0x1d;

#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    Padding {
        len: usize,
    },

    Ping,

    Pong,

    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },

    StopSending {
        stream_id: u64,
        error_code: u64,
    },

    Handshake {
        params: TransportParams,
    },

    Stream {
        stream_id: u64,
        offset: u64,
        data: Vec<u8>,
        fin: bool,
    },

    MaxData {
        max: u64,
    },

    MaxStreamData {
        stream_id: u64,
        max: u64,
    },

    MaxStreamsBidi {
        max: u64,
    },

    MaxStreamsUni {
        max: u64,
    },

    DataBlocked {
        limit: u64,
    },

    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },

    ConnectionClose {
        error_code: u64,
        reason: Vec<u8>,
    },

    ApplicationClose {
        error_code: u64,
        reason: Vec<u8>,
    },
}

impl Frame {
    pub fn from_bytes(b: &mut octets::Octets) -> Result<Frame> {
        let frame_type = b.get_varint()?;

        let frame = match frame_type {
            PADDING_FRAME_TYPE_ID => {
                let mut len = 1;

                while b.cap() > 0 && b.peek_u8()? == 0x00 {
                    b.get_u8()?;
                    len += 1;
                }

                Frame::Padding { len }
            },

            PING_FRAME_TYPE_ID => Frame::Ping,

            PONG_FRAME_TYPE_ID => Frame::Pong,

            RESET_STREAM_FRAME_TYPE_ID => Frame::ResetStream {
                stream_id: b.get_varint()?,
                error_code: b.get_varint()?,
                final_size: b.get_varint()?,
            },

            STOP_SENDING_FRAME_TYPE_ID => Frame::StopSending {
                stream_id: b.get_varint()?,
                error_code: b.get_varint()?,
            },

            HANDSHAKE_FRAME_TYPE_ID => {
                let raw = b.get_bytes_with_varint_length()?;

                Frame::Handshake {
                    params: TransportParams::decode(raw.buf())
                        .map_err(|_| Error::InvalidTransportParam)?,
                }
            },

            STREAM_FRAME_TYPE_ID | STREAM_FRAME_TYPE_ID_FIN => Frame::Stream {
                stream_id: b.get_varint()?,
                offset: b.get_varint()?,
                data: b.get_bytes_with_varint_length()?.to_vec(),
                fin: frame_type == STREAM_FRAME_TYPE_ID_FIN,
            },

            MAX_DATA_FRAME_TYPE_ID => Frame::MaxData {
                max: b.get_varint()?,
            },

            MAX_STREAM_DATA_FRAME_TYPE_ID => Frame::MaxStreamData {
                stream_id: b.get_varint()?,
                max: b.get_varint()?,
            },

            MAX_STREAMS_BIDI_FRAME_TYPE_ID => Frame::MaxStreamsBidi {
                max: b.get_varint()?,
            },

            MAX_STREAMS_UNI_FRAME_TYPE_ID => Frame::MaxStreamsUni {
                max: b.get_varint()?,
            },

            DATA_BLOCKED_FRAME_TYPE_ID => Frame::DataBlocked {
                limit: b.get_varint()?,
            },

            STREAM_DATA_BLOCKED_FRAME_TYPE_ID => Frame::StreamDataBlocked {
                stream_id: b.get_varint()?,
                limit: b.get_varint()?,
            },

            CONNECTION_CLOSE_FRAME_TYPE_ID => Frame::ConnectionClose {
                error_code: b.get_varint()?,
                reason: b.get_bytes_with_varint_length()?.to_vec(),
            },

            APPLICATION_CLOSE_FRAME_TYPE_ID => Frame::ApplicationClose {
                error_code: b.get_varint()?,
                reason: b.get_bytes_with_varint_length()?.to_vec(),
            },

            _ => return Err(Error::InvalidFrame),
        };

        Ok(frame)
    }

    pub fn to_bytes(&self, b: &mut octets::OctetsMut) -> Result<usize> {
        let before = b.cap();

        match self {
            Frame::Padding { len } => {
                for _ in 0..*len {
                    b.put_varint(PADDING_FRAME_TYPE_ID)?;
                }
            },

            Frame::Ping => {
                b.put_varint(PING_FRAME_TYPE_ID)?;
            },

            Frame::Pong => {
                b.put_varint(PONG_FRAME_TYPE_ID)?;
            },

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                b.put_varint(RESET_STREAM_FRAME_TYPE_ID)?;
                b.put_varint(*stream_id)?;
                b.put_varint(*error_code)?;
                b.put_varint(*final_size)?;
            },

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                b.put_varint(STOP_SENDING_FRAME_TYPE_ID)?;
                b.put_varint(*stream_id)?;
                b.put_varint(*error_code)?;
            },

            Frame::Handshake { params } => {
                b.put_varint(HANDSHAKE_FRAME_TYPE_ID)?;

                let mut raw = [0; 256];
                let raw = TransportParams::encode(params, &mut raw)?;

                b.put_varint(raw.len() as u64)?;
                b.put_bytes(raw)?;
            },

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let ty = if *fin {
                    STREAM_FRAME_TYPE_ID_FIN
                } else {
                    STREAM_FRAME_TYPE_ID
                };

                b.put_varint(ty)?;
                b.put_varint(*stream_id)?;
                b.put_varint(*offset)?;
                b.put_varint(data.len() as u64)?;
                b.put_bytes(data)?;
            },

            Frame::MaxData { max } => {
                b.put_varint(MAX_DATA_FRAME_TYPE_ID)?;
                b.put_varint(*max)?;
            },

            Frame::MaxStreamData { stream_id, max } => {
                b.put_varint(MAX_STREAM_DATA_FRAME_TYPE_ID)?;
                b.put_varint(*stream_id)?;
                b.put_varint(*max)?;
            },

            Frame::MaxStreamsBidi { max } => {
                b.put_varint(MAX_STREAMS_BIDI_FRAME_TYPE_ID)?;
                b.put_varint(*max)?;
            },

            Frame::MaxStreamsUni { max } => {
                b.put_varint(MAX_STREAMS_UNI_FRAME_TYPE_ID)?;
                b.put_varint(*max)?;
            },

            Frame::DataBlocked { limit } => {
                b.put_varint(DATA_BLOCKED_FRAME_TYPE_ID)?;
                b.put_varint(*limit)?;
            },

            Frame::StreamDataBlocked { stream_id, limit } => {
                b.put_varint(STREAM_DATA_BLOCKED_FRAME_TYPE_ID)?;
                b.put_varint(*stream_id)?;
                b.put_varint(*limit)?;
            },

            Frame::ConnectionClose { error_code, reason } => {
                b.put_varint(CONNECTION_CLOSE_FRAME_TYPE_ID)?;
                b.put_varint(*error_code)?;
                b.put_varint(reason.len() as u64)?;
                b.put_bytes(reason)?;
            },

            Frame::ApplicationClose { error_code, reason } => {
                b.put_varint(APPLICATION_CLOSE_FRAME_TYPE_ID)?;
                b.put_varint(*error_code)?;
                b.put_varint(reason.len() as u64)?;
                b.put_bytes(reason)?;
            },
        }

        Ok(before - b.cap())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Frame::Padding { len } => {
                write!(f, "PADDING len={len}")?;
            },

            Frame::Ping => {
                write!(f, "PING")?;
            },

            Frame::Pong => {
                write!(f, "PONG")?;
            },

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                write!(
                    f,
                    "RESET_STREAM stream={stream_id} err={error_code:x} size={final_size}"
                )?;
            },

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                write!(f, "STOP_SENDING stream={stream_id} err={error_code:x}")?;
            },

            Frame::Handshake { params } => {
                write!(f, "HANDSHAKE params={params:?}")?;
            },

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                write!(
                    f,
                    "STREAM id={stream_id} off={offset} len={} fin={fin}",
                    data.len()
                )?;
            },

            Frame::MaxData { max } => {
                write!(f, "MAX_DATA max={max}")?;
            },

            Frame::MaxStreamData { stream_id, max } => {
                write!(f, "MAX_STREAM_DATA stream={stream_id} max={max}")?;
            },

            Frame::MaxStreamsBidi { max } => {
                write!(f, "MAX_STREAMS_BIDI max={max}")?;
            },

            Frame::MaxStreamsUni { max } => {
                write!(f, "MAX_STREAMS_UNI max={max}")?;
            },

            Frame::DataBlocked { limit } => {
                write!(f, "DATA_BLOCKED limit={limit}")?;
            },

            Frame::StreamDataBlocked { stream_id, limit } => {
                write!(f, "STREAM_DATA_BLOCKED stream={stream_id} limit={limit}")?;
            },

            Frame::ConnectionClose { error_code, reason } => {
                write!(
                    f,
                    "CONNECTION_CLOSE err={error_code:x} reason={reason:x?}"
                )?;
            },

            Frame::ApplicationClose { error_code, reason } => {
                write!(
                    f,
                    "APPLICATION_CLOSE err={error_code:x} reason={reason:x?}"
                )?;
            },
        }

        Ok(())
    }
}
