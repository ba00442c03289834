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

/// The [`Result`] type returned by quill's fallible operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A transport error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Nothing to report; call again when more data or time has passed.
    Done,

    /// The caller's buffer is too small for the operation.
    BufferTooShort,

    /// A received flight contained a frame that cannot be parsed.
    InvalidFrame,

    /// The connection is not in a state that allows the operation.
    InvalidState,

    /// The stream (given as associated data) is not in a state that allows
    /// the operation.
    InvalidStreamState(u64),

    /// The peer's transport parameters cannot be parsed.
    InvalidTransportParam,

    /// The handshake failed, for example because the peer accepts none of
    /// the offered cipher suites.
    HandshakeFail,

    /// The handshake did not complete before the configured deadline.
    HandshakeTimeout,

    /// The peer sent more data than the advertised flow control limits
    /// allow.
    FlowControl,

    /// The peer opened more streams than the advertised limits allow.
    StreamLimit,

    /// The peer asked us to stop sending on a stream, carrying the
    /// `STOP_SENDING` application error code.
    StreamStopped(u64),

    /// The peer abandoned a stream, carrying the `RESET_STREAM`
    /// application error code.
    StreamReset(u64),

    /// Received stream data contradicts the stream's known final size.
    FinalSize,
}

/// Transport error codes sent on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WireErrorCode {
    /// Clean closure with no error to report.
    NoError              = 0x0,
    /// The sender hit an internal error it cannot recover from.
    InternalError        = 0x1,
    /// Data arrived beyond the advertised flow control limits.
    FlowControlError     = 0x3,
    /// A stream was opened beyond the advertised stream limits.
    StreamLimitError     = 0x4,
    /// A frame arrived for a stream in a state that does not allow it.
    StreamStateError     = 0x5,
    /// Stream data contradicted an already established final size.
    FinalSizeError       = 0x6,
    /// A frame could not be decoded.
    FrameEncodingError   = 0x7,
    /// Transport parameters were malformed or unacceptable.
    TransportParameterError = 0x8,
    /// A protocol violation with no more specific code.
    ProtocolViolation    = 0xa,
    /// The application layer closed the connection.
    ApplicationError     = 0xc,
    /// The handshake failed, for example due to an unacceptable cipher suite.
    CryptoError          = 0x100,
}

impl Error {
    pub(crate) fn to_wire(self) -> u64 {
        match self {
            Error::Done => WireErrorCode::NoError as u64,
            Error::InvalidFrame => WireErrorCode::FrameEncodingError as u64,
            Error::InvalidStreamState(..) =>
                WireErrorCode::StreamStateError as u64,
            Error::InvalidTransportParam =>
                WireErrorCode::TransportParameterError as u64,
            Error::HandshakeFail | Error::HandshakeTimeout =>
                WireErrorCode::CryptoError as u64,
            Error::FlowControl => WireErrorCode::FlowControlError as u64,
            Error::StreamLimit => WireErrorCode::StreamLimitError as u64,
            Error::FinalSize => WireErrorCode::FinalSizeError as u64,
            _ => WireErrorCode::ProtocolViolation as u64,
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
        None
    }
}

impl From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

/// The contents of a `CONNECTION_CLOSE` frame, local or received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionError {
    /// Whether the application layer, rather than the transport, closed
    /// the connection.
    pub is_app: bool,

    /// The error code sent or received in the frame.
    pub error_code: u64,

    /// The accompanying human-readable reason.
    pub reason: Vec<u8>,
}
