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

//! Pluggable datagram transports.
//!
//! The driver is written against the [`Transport`] trait so that tests can
//! run entirely in memory over a [`pipe`] while production traffic goes
//! through [`UdpTransport`].

use std::future::Future;
use std::io;

use tokio::sync::mpsc;

/// Largest datagram payload the engine sends or accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// An unreliable, message-oriented byte transport.
pub trait Transport: Send + 'static {
    /// Sends one datagram.
    fn send(&mut self, buf: &[u8])
        -> impl Future<Output = io::Result<()>> + Send;

    /// Receives one datagram into `buf`, returning its length.
    fn recv(&mut self, buf: &mut [u8])
        -> impl Future<Output = io::Result<usize>> + Send;
}

/// A transport over a connected UDP socket.
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
}

impl UdpTransport {
    /// Binds an ephemeral local socket and connects it to `addr`.
    pub async fn connect(addr: &str) -> io::Result<UdpTransport> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        Ok(UdpTransport { socket })
    }
}

impl Transport for UdpTransport {
    async fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.socket.send(buf).await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

/// One end of an in-memory datagram pipe.
pub struct Pipe {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Creates a connected pair of in-memory transports.
pub fn pipe() -> (Pipe, Pipe) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);

    (Pipe { tx: a_tx, rx: b_rx }, Pipe { tx: b_tx, rx: a_rx })
}

impl Transport for Pipe {
    async fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))?;

        if datagram.len() > buf.len() {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }

        buf[..datagram.len()].copy_from_slice(&datagram);

        Ok(datagram.len())
    }
}
