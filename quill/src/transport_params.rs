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

const PARAM_MAX_IDLE_TIMEOUT: u64 = 0x01;
const PARAM_INITIAL_MAX_DATA: u64 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const PARAM_CIPHER_SUITES: u64 = 0xff01;

/// TLS 1.3 AES-128-GCM-SHA256.
pub const CIPHER_AES128_GCM_SHA256: u64 = 0x1301;
/// TLS 1.3 AES-256-GCM-SHA384.
pub const CIPHER_AES256_GCM_SHA384: u64 = 0x1302;
/// TLS 1.3 ChaCha20-Poly1305-SHA256.
pub const CIPHER_CHACHA20_POLY1305_SHA256: u64 = 0x1303;

/// Transport parameters carried in the handshake flight.
///
/// The cipher suite list stands in for the TLS negotiation performed by the
/// external security layer: the client offers its suites, the server echoes
/// the one it selected (or closes the connection with a crypto error).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParams {
    /// Idle timeout advertised to the peer, in milliseconds. Zero disables
    /// idle timeout enforcement.
    pub max_idle_timeout: u64,

    /// Connection-level flow control limit granted to the peer.
    pub initial_max_data: u64,

    /// Per-stream limit for locally-initiated bidirectional streams.
    pub initial_max_stream_data_bidi_local: u64,

    /// Per-stream limit for peer-initiated bidirectional streams.
    pub initial_max_stream_data_bidi_remote: u64,

    /// Per-stream limit for unidirectional streams.
    pub initial_max_stream_data_uni: u64,

    /// Concurrent bidirectional streams the peer may open.
    pub initial_max_streams_bidi: u64,

    /// Concurrent unidirectional streams the peer may open.
    pub initial_max_streams_uni: u64,

    /// Offered (client) or selected (server) cipher suites.
    pub cipher_suites: Vec<u64>,
}

impl Default for TransportParams {
    fn default() -> TransportParams {
        TransportParams {
            max_idle_timeout: 0,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            cipher_suites: vec![CIPHER_AES128_GCM_SHA256],
        }
    }
}

impl TransportParams {
    pub fn decode(buf: &[u8]) -> Result<TransportParams> {
        let mut params = octets::Octets::with_slice(buf);
        let mut tp = TransportParams {
            cipher_suites: Vec::new(),
            ..TransportParams::default()
        };

        while params.cap() > 0 {
            let id = params.get_varint()?;
            let mut val = params.get_bytes_with_varint_length()?;

            match id {
                PARAM_MAX_IDLE_TIMEOUT => {
                    tp.max_idle_timeout = val.get_varint()?;
                },

                PARAM_INITIAL_MAX_DATA => {
                    tp.initial_max_data = val.get_varint()?;
                },

                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    tp.initial_max_stream_data_bidi_local = val.get_varint()?;
                },

                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    tp.initial_max_stream_data_bidi_remote = val.get_varint()?;
                },

                PARAM_INITIAL_MAX_STREAM_DATA_UNI => {
                    tp.initial_max_stream_data_uni = val.get_varint()?;
                },

                PARAM_INITIAL_MAX_STREAMS_BIDI => {
                    let max = val.get_varint()?;
                    if max > 2u64.pow(60) {
                        return Err(Error::InvalidTransportParam);
                    }
                    tp.initial_max_streams_bidi = max;
                },

                PARAM_INITIAL_MAX_STREAMS_UNI => {
                    let max = val.get_varint()?;
                    if max > 2u64.pow(60) {
                        return Err(Error::InvalidTransportParam);
                    }
                    tp.initial_max_streams_uni = max;
                },

                PARAM_CIPHER_SUITES => {
                    while val.cap() > 0 {
                        tp.cipher_suites.push(val.get_varint()?);
                    }
                },

                // Ignore unknown parameters.
                _ => (),
            }
        }

        Ok(tp)
    }

    pub fn encode<'a>(
        tp: &TransportParams, out: &'a mut [u8],
    ) -> Result<&'a mut [u8]> {
        let mut b = octets::OctetsMut::with_slice(out);

        if tp.max_idle_timeout != 0 {
            encode_param(&mut b, PARAM_MAX_IDLE_TIMEOUT, tp.max_idle_timeout)?;
        }

        encode_param(&mut b, PARAM_INITIAL_MAX_DATA, tp.initial_max_data)?;

        encode_param(
            &mut b,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            tp.initial_max_stream_data_bidi_local,
        )?;

        encode_param(
            &mut b,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            tp.initial_max_stream_data_bidi_remote,
        )?;

        encode_param(
            &mut b,
            PARAM_INITIAL_MAX_STREAM_DATA_UNI,
            tp.initial_max_stream_data_uni,
        )?;

        encode_param(
            &mut b,
            PARAM_INITIAL_MAX_STREAMS_BIDI,
            tp.initial_max_streams_bidi,
        )?;

        encode_param(
            &mut b,
            PARAM_INITIAL_MAX_STREAMS_UNI,
            tp.initial_max_streams_uni,
        )?;

        if !tp.cipher_suites.is_empty() {
            b.put_varint(PARAM_CIPHER_SUITES)?;

            let len = tp
                .cipher_suites
                .iter()
                .map(|c| octets::varint_len(*c))
                .sum::<usize>();
            b.put_varint(len as u64)?;

            for c in &tp.cipher_suites {
                b.put_varint(*c)?;
            }
        }

        let out_len = b.off();

        Ok(&mut out[..out_len])
    }
}

fn encode_param(
    b: &mut octets::OctetsMut, ty: u64, value: u64,
) -> Result<()> {
    b.put_varint(ty)?;
    b.put_varint(octets::varint_len(value) as u64)?;
    b.put_varint(value)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let tp = TransportParams {
            max_idle_timeout: 30_000,
            initial_max_data: 424_645_563,
            initial_max_stream_data_bidi_local: 154_323_123,
            initial_max_stream_data_bidi_remote: 6_587_456,
            initial_max_stream_data_uni: 2_461_234,
            initial_max_streams_bidi: 12_231,
            initial_max_streams_uni: 18_473,
            cipher_suites: vec![
                CIPHER_AES128_GCM_SHA256,
                CIPHER_CHACHA20_POLY1305_SHA256,
            ],
        };

        let mut raw_params = [42; 256];
        let raw_params =
            TransportParams::encode(&tp, &mut raw_params).unwrap();

        let new_tp = TransportParams::decode(raw_params).unwrap();

        assert_eq!(new_tp, tp);
    }

    #[test]
    fn zero_idle_timeout_omitted() {
        let tp = TransportParams {
            max_idle_timeout: 0,
            ..TransportParams::default()
        };

        let mut raw_params = [42; 256];
        let raw_params =
            TransportParams::encode(&tp, &mut raw_params).unwrap();

        let new_tp = TransportParams::decode(raw_params).unwrap();
        assert_eq!(new_tp.max_idle_timeout, 0);
    }
}
