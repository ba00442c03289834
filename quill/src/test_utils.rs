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

//! Testing utilities: an in-memory client/server connection pair.

use std::time::Instant;

use crate::Config;
use crate::Connection;
use crate::Error;
use crate::Result;

/// A reasonable config for in-memory tests.
pub fn default_config() -> Config {
    let mut config = Config::new().unwrap();

    config.set_initial_max_data(150_000);
    config.set_initial_max_stream_data_bidi_local(50_000);
    config.set_initial_max_stream_data_bidi_remote(50_000);
    config.set_initial_max_stream_data_uni(50_000);
    config.set_initial_max_streams_bidi(16);
    config.set_initial_max_streams_uni(8);

    config
}

/// A client/server connection pair exchanging flights in memory.
pub struct Pipe {
    pub client: Connection,
    pub server: Connection,
}

impl Pipe {
    pub fn new() -> Result<Pipe> {
        let mut config = default_config();
        Pipe::with_config(&mut config)
    }

    pub fn with_config(config: &mut Config) -> Result<Pipe> {
        Ok(Pipe {
            client: crate::connect(Some("quill.test"), config)?,
            server: crate::accept(config)?,
        })
    }

    pub fn with_configs(
        client_config: &mut Config, server_config: &mut Config,
    ) -> Result<Pipe> {
        Ok(Pipe {
            client: crate::connect(Some("quill.test"), client_config)?,
            server: crate::accept(server_config)?,
        })
    }

    /// Runs the handshake to completion.
    pub fn handshake(&mut self) -> Result<()> {
        while !self.client.is_established() || !self.server.is_established() {
            self.advance()?;

            if self.client.is_closed() || self.server.is_closed() {
                return Err(Error::HandshakeFail);
            }
        }

        Ok(())
    }

    /// Delivers flights in both directions until neither side has anything
    /// left to send.
    pub fn advance(&mut self) -> Result<()> {
        let mut progress = true;

        while progress {
            progress = false;

            progress |= Self::flush(&mut self.client, &mut self.server)?;
            progress |= Self::flush(&mut self.server, &mut self.client)?;
        }

        Ok(())
    }

    fn flush(from: &mut Connection, to: &mut Connection) -> Result<bool> {
        let mut buf = [0; 65535];
        let mut delivered = false;

        loop {
            let len = match from.send(&mut buf, Instant::now()) {
                Ok(v) => v,

                Err(Error::Done) => break,

                Err(e) => return Err(e),
            };

            to.recv(&buf[..len], Instant::now())?;

            delivered = true;
        }

        Ok(delivered)
    }
}
