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

//! Asynchronous HTTP/3 client on top of the [quill] protocol core.
//!
//! Each connection is owned by a single driver task; requests are
//! dispatched to it over channels and complete through single-resolution
//! handles. Connections are pooled per origin, drained on GOAWAY or when
//! their request cap is reached, and kept alive with PINGs when the
//! application outlives the transport idle timeout.
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), tokio_quill::ClientError> {
//! let client = tokio_quill::Client::new(tokio_quill::ClientConfig::new());
//!
//! let response = client
//!     .send(tokio_quill::Request::get("example.org:443", "/"))
//!     .await?;
//!
//! assert_eq!(response.status(), Some(200));
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub use crate::client::Client;
pub use crate::client::ClientConfig;
pub use crate::client::Connect;
pub use crate::client::DiscoveryMode;
pub use crate::client::InflightHandle;
pub use crate::client::Request;
pub use crate::client::UdpConnect;
pub use crate::driver::Response;
pub use crate::error::ClientError;

pub use quill;
pub use quill::h3::Header;

pub mod transport;

mod client;
mod driver;
mod error;
mod pool;
