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

use std::time::Duration;
use std::time::Instant;

use rstest::rstest;

use crate::frame::Frame;
use crate::test_utils::default_config;
use crate::test_utils::Pipe;
use crate::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn handshake() {
    init_logging();

    let mut pipe = Pipe::new().unwrap();

    assert_eq!(pipe.handshake(), Ok(()));

    assert!(pipe.client.is_established());
    assert!(pipe.server.is_established());

    // The server echoed a single selected suite.
    let peer_params = pipe.client.peer_transport_params().unwrap();
    assert_eq!(peer_params.cipher_suites, vec![CIPHER_AES128_GCM_SHA256]);
}

#[test]
fn handshake_cipher_mismatch() {
    let mut client_config = default_config();
    client_config.set_cipher_suites(&[CIPHER_CHACHA20_POLY1305_SHA256]);

    let mut server_config = default_config();
    server_config.set_cipher_suites(&[CIPHER_AES256_GCM_SHA384]);

    let mut pipe =
        Pipe::with_configs(&mut client_config, &mut server_config).unwrap();

    assert_eq!(pipe.handshake(), Err(Error::HandshakeFail));

    // The server reports the failure to the client in a close frame.
    pipe.advance().unwrap();

    let err = pipe.client.peer_error().unwrap();
    assert_eq!(err.error_code, WireErrorCode::CryptoError as u64);
    assert!(pipe.client.is_closed());
}

#[rstest]
#[case::servers_pick_from_the_offer(
    &[CIPHER_AES128_GCM_SHA256, CIPHER_AES256_GCM_SHA384],
    &[CIPHER_AES256_GCM_SHA384],
    CIPHER_AES256_GCM_SHA384
)]
#[case::offer_order_wins(
    &[CIPHER_CHACHA20_POLY1305_SHA256, CIPHER_AES128_GCM_SHA256],
    &[CIPHER_AES128_GCM_SHA256, CIPHER_CHACHA20_POLY1305_SHA256],
    CIPHER_CHACHA20_POLY1305_SHA256
)]
fn cipher_negotiation(
    #[case] offered: &[u64], #[case] supported: &[u64], #[case] selected: u64,
) {
    init_logging();

    let mut client_config = default_config();
    client_config.set_cipher_suites(offered);

    let mut server_config = default_config();
    server_config.set_cipher_suites(supported);

    let mut pipe =
        Pipe::with_configs(&mut client_config, &mut server_config).unwrap();
    assert_eq!(pipe.handshake(), Ok(()));

    let peer_params = pipe.client.peer_transport_params().unwrap();
    assert_eq!(peer_params.cipher_suites, vec![selected]);
}

#[test]
fn handshake_retransmit_backoff() {
    let mut config = default_config();
    config.set_handshake_timeout(Duration::from_millis(200));
    config.set_max_handshake_timeout(Duration::from_millis(500));

    let mut client = connect(Some("quill.test"), &mut config).unwrap();

    let now = Instant::now();
    let mut buf = [0; 65535];

    // Initial flight goes out, arming the retransmission timer.
    client.send(&mut buf, now).unwrap();
    let deadline = client.timeout_instant().unwrap();
    assert_eq!(deadline, now + Duration::from_millis(200));

    // First expiry doubles the timeout and schedules a retransmit.
    client.on_timeout(deadline);
    assert!(!client.is_closed());

    let len = client.send(&mut buf, deadline).unwrap();
    assert!(len > 0);

    let deadline = client.timeout_instant().unwrap();

    // Second expiry would need an 800ms timeout, above the cap.
    client.on_timeout(deadline);
    assert!(client.is_timed_out());
    assert!(client.is_closed());

    // The failure is recorded as a transport-level handshake timeout.
    let err = client.local_error().unwrap();
    assert!(!err.is_app);
    assert_eq!(err.error_code, Error::HandshakeTimeout.to_wire());
}

#[test]
fn stream_round_trip() {
    let mut pipe = Pipe::new().unwrap();
    pipe.handshake().unwrap();

    assert_eq!(pipe.client.stream_send(0, b"hello", true), Ok(5));
    pipe.advance().unwrap();

    let readable: Vec<u64> = pipe.server.readable().collect();
    assert_eq!(readable, vec![0]);

    let mut buf = [0; 65535];
    let (len, fin) = pipe.server.stream_recv(0, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert!(fin);

    assert_eq!(pipe.server.stream_send(0, b"world", true), Ok(5));
    pipe.advance().unwrap();

    let (len, fin) = pipe.client.stream_recv(0, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"world");
    assert!(fin);

    assert!(pipe.client.stream_finished(0));
    assert!(pipe.server.stream_finished(0));
}

#[test]
fn stream_flow_control_grant() {
    let mut client_config = default_config();
    client_config.set_max_stream_buffer(10);

    let mut server_config = default_config();
    server_config.set_initial_max_stream_data_bidi_remote(10);

    let mut pipe =
        Pipe::with_configs(&mut client_config, &mut server_config).unwrap();
    pipe.handshake().unwrap();

    // Writes are bounded by the send buffer cap, not the peer's window;
    // once the buffer is full the writer sees backpressure.
    assert_eq!(pipe.client.stream_send(0, b"aaaaabbbbbccccc", false), Ok(10));
    assert_eq!(pipe.client.stream_send(0, b"ccccc", false), Err(Error::Done));
    assert_eq!(pipe.client.stream_capacity(0), Ok(0));

    // Draining the buffer frees capacity, but the whole window went out
    // with it: the remainder buffers and waits for credit.
    pipe.advance().unwrap();
    assert_eq!(pipe.client.stream_capacity(0), Ok(10));
    assert_eq!(pipe.client.stream_send(0, b"ccccc", true), Ok(5));
    pipe.advance().unwrap();

    let mut buf = [0; 65535];
    let (len, fin) = pipe.server.stream_recv(0, &mut buf).unwrap();
    assert_eq!(len, 10);
    assert!(!fin);

    // Reading on the server side triggers a MAX_STREAM_DATA grant, which
    // lets the buffered tail through.
    pipe.advance().unwrap();

    let (len, fin) = pipe.server.stream_recv(0, &mut buf).unwrap();
    assert_eq!(len, 5);
    assert!(fin);
}

#[test]
fn stream_shutdown_write_resets_peer() {
    let mut pipe = Pipe::new().unwrap();
    pipe.handshake().unwrap();

    pipe.client.stream_send(0, b"hello", false).unwrap();
    pipe.advance().unwrap();

    pipe.client.stream_shutdown(0, Shutdown::Write, 42).unwrap();
    pipe.advance().unwrap();

    let mut buf = [0; 65535];
    assert_eq!(
        pipe.server.stream_recv(0, &mut buf),
        Err(Error::StreamReset(42))
    );

    // The reset is delivered exactly once.
    assert_eq!(pipe.server.stream_recv(0, &mut buf), Err(Error::Done));
}

#[test]
fn stream_shutdown_read_stops_peer() {
    let mut pipe = Pipe::new().unwrap();
    pipe.handshake().unwrap();

    pipe.client.stream_send(0, b"hello", false).unwrap();
    pipe.advance().unwrap();

    pipe.server.stream_shutdown(0, Shutdown::Read, 7).unwrap();
    pipe.advance().unwrap();

    // STOP_SENDING reached the client, which reset its send half.
    assert_eq!(
        pipe.client.stream_send(0, b"more", false),
        Err(Error::StreamStopped(7))
    );
}

#[test]
fn stream_limits_grow() {
    let mut client_config = default_config();

    let mut server_config = default_config();
    server_config.set_initial_max_streams_bidi(2);

    let mut pipe =
        Pipe::with_configs(&mut client_config, &mut server_config).unwrap();
    pipe.handshake().unwrap();

    assert_eq!(pipe.client.peer_streams_left_bidi(), 2);

    pipe.client.stream_send(0, b"a", true).unwrap();
    pipe.client.stream_send(4, b"b", true).unwrap();
    assert_eq!(pipe.client.stream_send(8, b"c", true), Err(Error::StreamLimit));

    // Once the server sees both streams it extends the limit.
    pipe.advance().unwrap();

    assert_eq!(pipe.client.stream_send(8, b"c", true), Ok(1));
}

#[test]
fn idle_timeout() {
    let mut config = default_config();
    config.set_max_idle_timeout(1_000);

    let mut pipe = Pipe::with_config(&mut config).unwrap();
    pipe.handshake().unwrap();

    assert_eq!(pipe.client.idle_timeout(), Some(Duration::from_secs(1)));

    let idle = pipe.client.timeout_instant().unwrap();

    // Before the deadline nothing happens.
    pipe.client.on_timeout(idle - Duration::from_millis(1));
    assert!(!pipe.client.is_closed());

    pipe.client.on_timeout(idle);
    assert!(pipe.client.is_timed_out());
    assert!(pipe.client.is_closed());
}

#[test]
fn idle_timeout_uses_minimum() {
    let mut client_config = default_config();
    client_config.set_max_idle_timeout(5_000);

    let mut server_config = default_config();
    server_config.set_max_idle_timeout(2_000);

    let mut pipe =
        Pipe::with_configs(&mut client_config, &mut server_config).unwrap();
    pipe.handshake().unwrap();

    assert_eq!(pipe.client.idle_timeout(), Some(Duration::from_secs(2)));
    assert_eq!(pipe.server.idle_timeout(), Some(Duration::from_secs(2)));
}

#[test]
fn ping_pong() {
    let mut pipe = Pipe::new().unwrap();
    pipe.handshake().unwrap();

    pipe.client.send_ping();

    let now = Instant::now();
    let mut buf = [0; 65535];

    let len = pipe.client.send(&mut buf, now).unwrap();

    let mut b = octets::Octets::with_slice(&buf[..len]);
    assert_eq!(Frame::from_bytes(&mut b), Ok(Frame::Ping));

    pipe.server.recv(&buf[..len], now).unwrap();

    // The peer answers so the sender's idle timer is refreshed too.
    let len = pipe.server.send(&mut buf, now).unwrap();

    let mut b = octets::Octets::with_slice(&buf[..len]);
    assert_eq!(Frame::from_bytes(&mut b), Ok(Frame::Pong));

    pipe.client.recv(&buf[..len], now).unwrap();

    assert!(!pipe.client.is_closed());
    assert!(!pipe.server.is_closed());
}

#[test]
fn connection_close() {
    let mut pipe = Pipe::new().unwrap();
    pipe.handshake().unwrap();

    pipe.client.close(true, 0x100, b"kthxbye").unwrap();
    assert_eq!(pipe.client.close(true, 0x100, b"kthxbye"), Err(Error::Done));

    pipe.advance().unwrap();

    let err = pipe.server.peer_error().unwrap();
    assert!(err.is_app);
    assert_eq!(err.error_code, 0x100);
    assert_eq!(err.reason, b"kthxbye".to_vec());

    assert!(pipe.client.is_closed());
    assert!(pipe.server.is_closed());

    assert_eq!(
        pipe.client.stream_send(0, b"x", false),
        Err(Error::InvalidState)
    );
}

#[test]
fn data_before_handshake() {
    let mut config = default_config();
    let mut server = accept(&mut config).unwrap();

    let frame = Frame::Stream {
        stream_id: 0,
        offset: 0,
        data: b"hello".to_vec(),
        fin: false,
    };

    let mut buf = [0; 65535];
    let mut b = octets::OctetsMut::with_slice(&mut buf);
    let len = frame.to_bytes(&mut b).unwrap();

    assert_eq!(
        server.recv(&buf[..len], Instant::now()),
        Err(Error::InvalidState)
    );
}
