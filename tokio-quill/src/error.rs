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

/// Errors surfaced to users of a [`Client`].
///
/// [`Client`]: crate::Client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The QUIC handshake with the server failed.
    #[error("handshake with the server failed")]
    Handshake(#[source] quill::Error),

    /// The connection attempt timed out after exhausting its backoff.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The peer refused the request before doing any application
    /// processing, so it is always safe to replay.
    #[error("request not processed by peer")]
    NotProcessed,

    /// The request was cancelled locally.
    #[error("request was cancelled")]
    Cancelled,

    /// The header list exceeds the peer's advertised
    /// `SETTINGS_MAX_FIELD_SECTION_SIZE`. Detected before anything is
    /// sent; retrying cannot help.
    #[error("header list exceeds the peer's advertised limit")]
    HeaderSizeExceeded,

    /// The QPACK encoder hit its insertion cap with fallback disabled.
    #[error("qpack insertion cap exceeded")]
    TooManyLiteralInsertions,

    /// The peer reset the request stream with the given wire error code,
    /// possibly after partial processing.
    #[error("stream reset by peer with error code {0:#x}")]
    StreamReset(u64),

    /// The connection carrying the request went away.
    #[error("connection closed while the request was in flight")]
    ConnectionGone,

    /// Every retry attempt failed; carries the last attempt's error.
    #[error("retries exhausted: {0}")]
    RetriesExhausted(#[source] Box<ClientError>),

    /// An HTTP/3 protocol error on the connection.
    #[error("http/3 protocol error")]
    H3(#[source] quill::h3::Error),

    /// A transport I/O error.
    #[error("transport i/o error")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the peer is guaranteed not to have processed the request,
    /// making a replay safe regardless of idempotency.
    pub fn is_unprocessed(&self) -> bool {
        matches!(
            self,
            ClientError::NotProcessed | ClientError::ConnectTimeout
        )
    }

    /// Whether a replay is allowed for idempotent requests. The request
    /// may have been partially processed.
    pub fn is_retriable_for_idempotent(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionGone | ClientError::StreamReset(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::error::Error;

    #[test]
    fn retries_exhausted_keeps_cause() {
        let err =
            ClientError::RetriesExhausted(Box::new(ClientError::ConnectTimeout));

        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "retries exhausted: connection attempt timed out"
        );

        let err =
            ClientError::RetriesExhausted(Box::new(ClientError::NotProcessed));

        assert_eq!(
            err.to_string(),
            "retries exhausted: request not processed by peer"
        );
    }
}
