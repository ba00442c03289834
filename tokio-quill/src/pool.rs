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

//! Per-origin connection reuse.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::driver::Command;

/// A cheap handle onto a live driver task.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub draining: Arc<AtomicBool>,
    pub checked_out: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(
        commands: mpsc::UnboundedSender<Command>, draining: Arc<AtomicBool>,
    ) -> ConnectionHandle {
        ConnectionHandle {
            commands,
            draining,
            checked_out: Arc::new(AtomicU64::new(0)),
        }
    }

    fn is_usable(&self, max_requests: u64) -> bool {
        !self.commands.is_closed() &&
            !self.draining.load(Ordering::Relaxed) &&
            self.checked_out.load(Ordering::Relaxed) < max_requests
    }
}

#[derive(Default)]
pub(crate) struct Pool {
    conns: Mutex<HashMap<String, Vec<ConnectionHandle>>>,
}

impl Pool {
    /// Hands out a usable connection for the origin, evicting dead or
    /// draining ones on the way.
    pub fn checkout(
        &self, origin: &str, max_requests: u64,
    ) -> Option<ConnectionHandle> {
        let mut conns = self.conns.lock();

        let handles = conns.get_mut(origin)?;
        handles.retain(|h| h.is_usable(max_requests));

        let handle = handles.first()?.clone();
        handle.checked_out.fetch_add(1, Ordering::Relaxed);

        Some(handle)
    }

    pub fn insert(&self, origin: &str, handle: ConnectionHandle) {
        handle.checked_out.fetch_add(1, Ordering::Relaxed);

        self.conns
            .lock()
            .entry(origin.to_string())
            .or_default()
            .push(handle);
    }
}
