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

use std::collections::hash_map;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::flowcontrol::FlowControl;
use crate::Error;
use crate::Result;

/// Highest allowed stream count limit.
const MAX_STREAMS_PER_TYPE: u64 = 1 << 60;

/// Returns true if the stream was created locally.
pub fn is_local(stream_id: u64, is_server: bool) -> bool {
    (stream_id & 0x1) == (is_server as u64)
}

/// Returns true if the stream is bidirectional.
pub fn is_bidi(stream_id: u64) -> bool {
    (stream_id & 0x2) == 0
}

/// The observable state of a stream, derived from its two halves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Reset,
    Closed,
}

/// Keeps track of streams and enforces stream limits.
#[derive(Default)]
pub struct StreamMap {
    /// Map of streams indexed by stream ID.
    streams: HashMap<u64, Stream>,

    /// Streams that have buffered data ready to be read by the application.
    readable: HashSet<u64>,

    /// Streams that have enough send capacity to accept application data.
    writable: HashSet<u64>,

    /// Streams with outstanding data to send to the peer, ordered by ID so
    /// earlier requests make progress first.
    flushable: BTreeSet<u64>,

    /// Streams whose receive window is running low and need to grant the
    /// peer a higher MAX_STREAM_DATA limit.
    almost_full: HashSet<u64>,

    /// Streams blocked on the peer's flow control limit, with the offset at
    /// which the block happened.
    blocked: HashMap<u64, u64>,

    /// Streams on which a RESET_STREAM frame still needs to be sent, with
    /// error code and final size.
    reset: HashMap<u64, (u64, u64)>,

    /// Streams on which a STOP_SENDING frame still needs to be sent.
    stopped: HashMap<u64, u64>,

    /// Streams that have been completed and garbage collected.
    collected: HashSet<u64>,

    /// Number of bidirectional streams the peer may still open.
    peer_max_streams_bidi: u64,

    /// Number of unidirectional streams the peer may still open.
    peer_max_streams_uni: u64,

    /// Highest bidirectional stream count opened by the local endpoint.
    local_opened_streams_bidi: u64,

    /// Highest unidirectional stream count opened by the local endpoint.
    local_opened_streams_uni: u64,

    /// Number of streams the local endpoint allows the peer to open.
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,

    /// Increment applied when extending the peer's stream credit.
    streams_window_bidi: u64,

    /// Highest stream count opened by the peer.
    peer_opened_streams_bidi: u64,
    peer_opened_streams_uni: u64,
}

impl StreamMap {
    pub fn new(max_streams_bidi: u64, max_streams_uni: u64) -> StreamMap {
        StreamMap {
            local_max_streams_bidi: max_streams_bidi,
            local_max_streams_uni: max_streams_uni,
            streams_window_bidi: max_streams_bidi,
            ..StreamMap::default()
        }
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Returns the mutable stream with the given ID if it exists, or creates
    /// a new one otherwise.
    ///
    /// Stream counts against the relevant limit are charged on creation, and
    /// `Error::StreamLimit` is returned when a limit would be exceeded.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create(
        &mut self, id: u64, max_rx_data: u64, max_tx_data: u64,
        max_buffer: usize, local: bool, is_server: bool,
    ) -> Result<&mut Stream> {
        let (stream, is_new) = match self.streams.entry(id) {
            hash_map::Entry::Vacant(v) => {
                if self.collected.contains(&id) {
                    return Err(Error::Done);
                }

                // Enforce stream count limits: locally-created streams are
                // checked against the peer's advertised limit, peer-created
                // ones against the local limit.
                if local != is_local(id, is_server) {
                    return Err(Error::InvalidStreamState(id));
                }

                let seq = (id >> 2) + 1;

                if local {
                    let max = if is_bidi(id) {
                        self.peer_max_streams_bidi
                    } else {
                        self.peer_max_streams_uni
                    };

                    if seq > max {
                        return Err(Error::StreamLimit);
                    }

                    if is_bidi(id) {
                        self.local_opened_streams_bidi =
                            self.local_opened_streams_bidi.max(seq);
                    } else {
                        self.local_opened_streams_uni =
                            self.local_opened_streams_uni.max(seq);
                    }
                } else {
                    let max = if is_bidi(id) {
                        self.local_max_streams_bidi
                    } else {
                        self.local_max_streams_uni
                    };

                    if seq > max {
                        return Err(Error::StreamLimit);
                    }

                    if is_bidi(id) {
                        self.peer_opened_streams_bidi =
                            self.peer_opened_streams_bidi.max(seq);
                    } else {
                        self.peer_opened_streams_uni =
                            self.peer_opened_streams_uni.max(seq);
                    }
                }

                let s =
                    Stream::new(id, max_rx_data, max_tx_data, max_buffer, local);
                (v.insert(s), true)
            },

            hash_map::Entry::Occupied(v) => (v.into_mut(), false),
        };

        if is_new {
            trace!("stream {id} created local={local}");
        }

        Ok(stream)
    }

    pub fn mark_readable(&mut self, stream_id: u64, readable: bool) {
        if readable {
            self.readable.insert(stream_id);
        } else {
            self.readable.remove(&stream_id);
        }
    }

    pub fn mark_writable(&mut self, stream_id: u64, writable: bool) {
        if writable {
            self.writable.insert(stream_id);
        } else {
            self.writable.remove(&stream_id);
        }
    }

    pub fn mark_flushable(&mut self, stream_id: u64, flushable: bool) {
        if flushable {
            self.flushable.insert(stream_id);
        } else {
            self.flushable.remove(&stream_id);
        }
    }

    pub fn mark_almost_full(&mut self, stream_id: u64, almost_full: bool) {
        if almost_full {
            self.almost_full.insert(stream_id);
        } else {
            self.almost_full.remove(&stream_id);
        }
    }

    pub fn mark_blocked(&mut self, stream_id: u64, blocked: bool, off: u64) {
        if blocked {
            self.blocked.insert(stream_id, off);
        } else {
            self.blocked.remove(&stream_id);
        }
    }

    pub fn mark_reset(
        &mut self, stream_id: u64, reset: bool, error_code: u64, final_size: u64,
    ) {
        if reset {
            self.reset.insert(stream_id, (error_code, final_size));
        } else {
            self.reset.remove(&stream_id);
        }
    }

    pub fn mark_stopped(
        &mut self, stream_id: u64, stopped: bool, error_code: u64,
    ) {
        if stopped {
            self.stopped.insert(stream_id, error_code);
        } else {
            self.stopped.remove(&stream_id);
        }
    }

    pub fn update_peer_max_streams_bidi(&mut self, v: u64) {
        self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(v);
    }

    pub fn update_peer_max_streams_uni(&mut self, v: u64) {
        self.peer_max_streams_uni = self.peer_max_streams_uni.max(v);
    }

    /// Number of bidirectional streams the local endpoint may still open.
    pub fn peer_streams_left_bidi(&self) -> u64 {
        self.peer_max_streams_bidi - self.local_opened_streams_bidi
    }

    /// Number of unidirectional streams the local endpoint may still open.
    pub fn peer_streams_left_uni(&self) -> u64 {
        self.peer_max_streams_uni - self.local_opened_streams_uni
    }

    /// Grows the local stream count limit and returns the new value to
    /// advertise, once the peer has consumed more than half of its credit.
    pub fn max_streams_bidi_next(&mut self) -> Option<u64> {
        let left = self.local_max_streams_bidi - self.peer_opened_streams_bidi;

        if left < self.streams_window_bidi / 2 {
            let next = (self.peer_opened_streams_bidi + self.streams_window_bidi)
                .min(MAX_STREAMS_PER_TYPE);

            if next > self.local_max_streams_bidi {
                self.local_max_streams_bidi = next;
                return Some(next);
            }
        }

        None
    }

    /// Removes and collects a stream that is fully terminated.
    pub fn collect(&mut self, stream_id: u64) {
        self.streams.remove(&stream_id);

        self.mark_readable(stream_id, false);
        self.mark_writable(stream_id, false);
        self.mark_flushable(stream_id, false);
        self.mark_almost_full(stream_id, false);
        self.mark_blocked(stream_id, false, 0);

        self.collected.insert(stream_id);

        trace!("stream {stream_id} collected");
    }

    pub fn is_collected(&self, stream_id: u64) -> bool {
        self.collected.contains(&stream_id)
    }

    pub fn readable(&self) -> StreamIter {
        StreamIter::from(&self.readable)
    }

    pub fn writable(&self) -> StreamIter {
        StreamIter::from(&self.writable)
    }

    pub fn almost_full(&self) -> StreamIter {
        StreamIter::from(&self.almost_full)
    }

    pub fn peek_flushable(&self) -> Option<u64> {
        self.flushable.iter().next().copied()
    }

    pub fn has_flushable(&self) -> bool {
        !self.flushable.is_empty()
    }

    pub fn has_readable(&self) -> bool {
        !self.readable.is_empty()
    }

    pub fn blocked(&self) -> hash_map::Iter<u64, u64> {
        self.blocked.iter()
    }

    pub fn reset(&self) -> hash_map::Iter<u64, (u64, u64)> {
        self.reset.iter()
    }

    pub fn stopped(&self) -> hash_map::Iter<u64, u64> {
        self.stopped.iter()
    }

    pub fn has_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn has_reset(&self) -> bool {
        !self.reset.is_empty()
    }

    pub fn has_stopped(&self) -> bool {
        !self.stopped.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// A QUIC stream.
pub struct Stream {
    /// The stream ID.
    pub id: u64,

    /// Receive-side stream buffer.
    pub recv: RecvBuf,

    /// Send-side stream buffer.
    pub send: SendBuf,

    /// Whether the stream was created locally.
    pub local: bool,

    /// Whether the stream is bidirectional.
    pub bidi: bool,
}

impl Stream {
    pub fn new(
        id: u64, max_rx_data: u64, max_tx_data: u64, max_buffer: usize,
        local: bool,
    ) -> Stream {
        Stream {
            id,
            recv: RecvBuf::new(max_rx_data),
            send: SendBuf::new(max_tx_data, max_buffer),
            local,
            bidi: is_bidi(id),
        }
    }

    /// Returns true if the stream has data to read.
    pub fn is_readable(&self) -> bool {
        self.recv.ready() ||
            (self.recv.is_fin() && !self.recv.drained) ||
            (self.recv.error.is_some() && !self.recv.drained)
    }

    /// Returns true if the stream's send buffer can accept more data from
    /// the application.
    pub fn is_writable(&self) -> bool {
        !self.send.is_shutdown() &&
            !self.send.is_fin() &&
            self.send.cap().map_or(false, |cap| cap > 0)
    }

    /// Returns true if the stream has data queued that the peer's window
    /// allows sending.
    pub fn is_flushable(&self) -> bool {
        self.send.ready()
    }

    /// Returns true if both halves of the stream are done and the stream can
    /// be collected.
    pub fn is_complete(&self) -> bool {
        let send_done = self.send.is_complete() || self.send.is_shutdown();

        // A pending reset keeps the stream alive until `StreamReset` has
        // been emitted to the application, even if all prior data was read.
        let recv_done = if self.recv.error.is_some() {
            self.recv.drained
        } else {
            self.recv.is_drained()
        };

        if !self.bidi {
            // One half never exists for unidirectional streams.
            return if self.local { send_done } else { recv_done };
        }

        send_done && recv_done
    }

    /// Observable state of this stream.
    pub fn state(&self) -> StreamState {
        if self.recv.error.is_some() {
            return StreamState::Reset;
        }

        if self.is_complete() {
            return StreamState::Closed;
        }

        let send_closed = self.send.is_fin() || self.send.is_shutdown();
        let recv_closed = self.recv.fin_off.is_some();

        match (send_closed, recv_closed) {
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            _ => StreamState::Open,
        }
    }
}

/// Receive-side stream buffer.
///
/// Data received from the peer is buffered in chunks ordered by offset.
/// Contiguous data can then be read into a slice.
#[derive(Default)]
pub struct RecvBuf {
    /// Chunks of data received from the peer that have not yet been read by
    /// the application, ordered by offset.
    data: BTreeMap<u64, Vec<u8>>,

    /// The lowest data offset that has yet to be read by the application.
    off: u64,

    /// The total length of data received on this stream.
    len: u64,

    /// Receiver flow controller.
    flow_control: FlowControl,

    /// The final stream offset received from the peer, if any.
    fin_off: Option<u64>,

    /// The error code received via RESET_STREAM.
    pub error: Option<u64>,

    /// Whether the receive half was shut down locally (STOP_SENDING sent),
    /// in which case incoming data is discarded.
    pub drained: bool,
}

impl RecvBuf {
    fn new(max_data: u64) -> RecvBuf {
        RecvBuf {
            flow_control: FlowControl::new(max_data, max_data),
            ..RecvBuf::default()
        }
    }

    /// Inserts the given chunk of data in the buffer.
    ///
    /// Enforces the stream-level flow control limit and final size
    /// invariants. Returns the number of new bytes accounted (for the
    /// connection-level flow controller).
    pub fn write(
        &mut self, off: u64, mut data: &[u8], fin: bool,
    ) -> Result<u64> {
        let end = off + data.len() as u64;

        if end > self.flow_control.max_data() {
            return Err(Error::FlowControl);
        }

        if let Some(fin_off) = self.fin_off {
            // New data can't exceed the stream's final size, and the final
            // size can't change.
            if end > fin_off || (fin && fin_off != end) {
                return Err(Error::FinalSize);
            }
        }

        if fin {
            if end < self.len {
                return Err(Error::FinalSize);
            }

            self.fin_off = Some(end);
        }

        let max_off_delta = end.saturating_sub(self.len);
        self.len = self.len.max(end);

        if self.drained {
            // Receive half was shut down, account for the data but drop it.
            self.off = self.off.max(end);
            return Ok(max_off_delta);
        }

        // Drop bytes that were already read.
        let mut off = off;
        if off < self.off {
            let dup = (self.off - off).min(data.len() as u64) as usize;
            data = &data[dup..];
            off = self.off;
        }

        if !data.is_empty() {
            // Keep the longest chunk seen for a given offset; overlaps are
            // trimmed when data is emitted.
            match self.data.get(&off) {
                Some(existing) if existing.len() >= data.len() => (),
                _ => {
                    self.data.insert(off, data.to_vec());
                },
            }
        }

        Ok(max_off_delta)
    }

    /// Reads contiguous data from the receive buffer into `out`.
    ///
    /// Returns the amount of data read and the fin flag. Returns
    /// `Error::Done` when no contiguous data is buffered at the read offset.
    pub fn emit(&mut self, out: &mut [u8]) -> Result<(usize, bool)> {
        if let Some(error_code) = self.error {
            if !self.drained {
                self.drained = true;
                return Err(Error::StreamReset(error_code));
            }

            return Err(Error::Done);
        }

        if self.drained {
            return Err(Error::Done);
        }

        if !self.ready() && !self.is_fin() {
            return Err(Error::Done);
        }

        let mut read = 0;

        while read < out.len() {
            let (&chunk_off, chunk) = match self.data.first_key_value() {
                Some(e) => e,
                None => break,
            };

            if chunk_off > self.off {
                // Gap in the data, stop at the contiguous boundary.
                break;
            }

            // Part of the chunk may already have been read from an
            // overlapping chunk.
            let skip = (self.off - chunk_off) as usize;

            if skip >= chunk.len() {
                self.data.pop_first();
                continue;
            }

            let avail = &chunk[skip..];
            let n = avail.len().min(out.len() - read);

            out[read..read + n].copy_from_slice(&avail[..n]);
            read += n;
            self.off += n as u64;

            if skip + n == chunk.len() {
                self.data.pop_first();
            }
        }

        if read == 0 && !self.is_fin() {
            return Err(Error::Done);
        }

        self.flow_control.add_consumed(read as u64);

        let fin = self.is_fin();

        // The end of the stream is delivered once; afterwards reads return
        // `Done` and the stream stops being readable.
        if fin {
            self.drained = true;
        }

        Ok((read, fin))
    }

    /// Handles an incoming RESET_STREAM.
    ///
    /// Buffered data is discarded. Returns the number of flow-controlled
    /// bytes newly accounted by the advertised final size.
    pub fn reset(&mut self, error_code: u64, final_size: u64) -> Result<u64> {
        if final_size > self.flow_control.max_data() {
            return Err(Error::FlowControl);
        }

        if let Some(fin_off) = self.fin_off {
            if fin_off != final_size {
                return Err(Error::FinalSize);
            }
        }

        if final_size < self.len {
            return Err(Error::FinalSize);
        }

        let max_off_delta = final_size - self.len;

        self.error = Some(error_code);
        self.fin_off = Some(final_size);
        self.len = final_size;
        self.data.clear();

        Ok(max_off_delta)
    }

    /// Shuts down the receive half: buffered and future data is discarded.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.drained {
            return Err(Error::Done);
        }

        self.drained = true;
        self.data.clear();
        self.off = self.len;

        Ok(())
    }

    /// Returns true if contiguous data is buffered at the read offset.
    pub fn ready(&self) -> bool {
        match self.data.first_key_value() {
            Some((&off, _)) => off <= self.off,
            None => false,
        }
    }

    pub fn is_fin(&self) -> bool {
        self.fin_off == Some(self.off)
    }

    pub fn is_drained(&self) -> bool {
        self.drained || self.is_fin()
    }

    pub fn max_data(&self) -> u64 {
        self.flow_control.max_data()
    }

    pub fn should_update_max_data(&self) -> bool {
        self.fin_off.is_none() &&
            self.error.is_none() &&
            self.flow_control.should_update_max_data()
    }

    pub fn max_data_next(&self) -> u64 {
        self.flow_control.max_data_next()
    }

    pub fn update_max_data(&mut self) {
        self.flow_control.update_max_data();
    }
}

/// Send-side stream buffer.
///
/// Pending data is buffered until the peer's flow control window allows it
/// to be emitted. The amount of buffered-but-unsent data is capped so a
/// peer that stops reading exerts backpressure instead of unbounded memory
/// growth.
#[derive(Default)]
pub struct SendBuf {
    /// Data queued by the application that has not been emitted yet.
    data: VecDeque<u8>,

    /// The offset of the front of `data`, i.e. the next offset to emit.
    off: u64,

    /// The maximum offset the peer allows sending to.
    max_data: u64,

    /// Upper bound on buffered unsent bytes.
    max_buffer: usize,

    /// Whether the final offset has been queued.
    fin: bool,

    /// Whether the final offset has been emitted.
    fin_sent: bool,

    /// The error code received via STOP_SENDING.
    stopped: Option<u64>,

    /// Whether the send half was shut down locally (RESET_STREAM sent).
    shutdown: bool,

    /// The offset the stream was blocked at, if any.
    blocked_at: Option<u64>,
}

impl SendBuf {
    fn new(max_data: u64, max_buffer: usize) -> SendBuf {
        SendBuf {
            max_data,
            max_buffer,
            ..SendBuf::default()
        }
    }

    /// Queues data for sending, up to the stream's buffer capacity.
    ///
    /// Returns the number of bytes accepted, which may be less than the
    /// input length when the send buffer cap is reached. Returns
    /// `Error::Done` when nothing can be accepted.
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<usize> {
        let cap = self.cap()?;

        if self.fin {
            return Err(Error::FinalSize);
        }

        if cap == 0 && !data.is_empty() {
            return Err(Error::Done);
        }

        let n = data.len().min(cap);

        self.data.extend(&data[..n]);

        // Only latch fin if the whole input was accepted.
        if fin && n == data.len() {
            self.fin = true;
        }

        Ok(n)
    }

    /// Emits queued data into `out`, limited by the peer's window.
    ///
    /// Returns the number of bytes written, the offset they start at, and
    /// whether this emission carries the final offset.
    pub fn emit(&mut self, out: &mut [u8]) -> Result<(usize, u64, bool)> {
        let window = (self.max_data - self.off) as usize;
        let n = out.len().min(self.data.len()).min(window);

        let off = self.off;

        for (i, b) in self.data.drain(..n).enumerate() {
            out[i] = b;
        }

        self.off += n as u64;

        let fin = self.fin && self.data.is_empty();
        if fin {
            self.fin_sent = true;
        }

        if !self.data.is_empty() && self.off == self.max_data {
            self.blocked_at = Some(self.max_data);
        }

        Ok((n, off, fin))
    }

    /// Send capacity currently available to the application, bounded by
    /// the buffer cap. The peer's window is applied at emission time, not
    /// here: the application may buffer ahead of the window, up to
    /// `max_buffer` bytes.
    pub fn cap(&self) -> Result<usize> {
        if let Some(error_code) = self.stopped {
            return Err(Error::StreamStopped(error_code));
        }

        if self.shutdown {
            return Err(Error::InvalidStreamState(0));
        }

        Ok(self.max_buffer.saturating_sub(self.data.len()))
    }

    pub fn update_max_data(&mut self, max_data: u64) {
        if max_data > self.max_data {
            self.max_data = max_data;
            self.blocked_at = None;
        }
    }

    pub fn blocked_at(&self) -> Option<u64> {
        self.blocked_at
    }

    pub fn update_blocked_at(&mut self, blocked_at: Option<u64>) {
        self.blocked_at = blocked_at;
    }

    /// Aborts the send half, dropping buffered data.
    ///
    /// Returns the final size to advertise in RESET_STREAM.
    pub fn reset(&mut self) -> u64 {
        self.data.clear();
        self.shutdown = true;
        self.blocked_at = None;

        self.off
    }

    /// Handles an incoming STOP_SENDING. Pending writes fail with
    /// `StreamStopped` and a RESET_STREAM must be sent in response.
    pub fn stop(&mut self, error_code: u64) -> Result<u64> {
        if self.stopped.is_some() || self.shutdown {
            return Err(Error::Done);
        }

        self.stopped = Some(error_code);

        Ok(self.reset())
    }

    /// Returns true if data is queued that the window allows emitting, or a
    /// fin still needs to go out.
    pub fn ready(&self) -> bool {
        if self.shutdown {
            return false;
        }

        if !self.data.is_empty() {
            return self.off < self.max_data;
        }

        self.fin && !self.fin_sent
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn is_complete(&self) -> bool {
        self.fin_sent && self.data.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }
}

/// An iterator over QUIC streams.
#[derive(Default)]
pub struct StreamIter {
    streams: SmallVec<[u64; 8]>,
    index: usize,
}

impl StreamIter {
    fn from(streams: &HashSet<u64>) -> Self {
        StreamIter {
            streams: streams.iter().copied().collect(),
            index: 0,
        }
    }
}

impl Iterator for StreamIter {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        let v = self.streams.get(self.index)?;
        self.index += 1;
        Some(*v)
    }
}

impl ExactSizeIterator for StreamIter {
    fn len(&self) -> usize {
        self.streams.len() - self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_in_order() {
        let mut recv = RecvBuf::new(100);

        recv.write(0, b"hello", false).unwrap();
        recv.write(5, b" world", true).unwrap();

        let mut out = [0; 32];
        let (len, fin) = recv.emit(&mut out).unwrap();

        assert_eq!(&out[..len], b"hello world");
        assert!(fin);
        assert!(recv.is_drained());
    }

    #[test]
    fn recv_out_of_order() {
        let mut recv = RecvBuf::new(100);

        recv.write(5, b" world", true).unwrap();

        let mut out = [0; 32];
        assert_eq!(recv.emit(&mut out), Err(Error::Done));

        recv.write(0, b"hello", false).unwrap();

        let (len, fin) = recv.emit(&mut out).unwrap();
        assert_eq!(&out[..len], b"hello world");
        assert!(fin);
    }

    #[test]
    fn recv_duplicate() {
        let mut recv = RecvBuf::new(100);

        recv.write(0, b"hello", false).unwrap();
        recv.write(0, b"hello", false).unwrap();

        let mut out = [0; 32];
        let (len, fin) = recv.emit(&mut out).unwrap();
        assert_eq!(&out[..len], b"hello");
        assert!(!fin);

        // Retransmit of already-read data is dropped.
        recv.write(0, b"hello", false).unwrap();
        assert_eq!(recv.emit(&mut out), Err(Error::Done));
    }

    #[test]
    fn recv_flow_control() {
        let mut recv = RecvBuf::new(10);

        assert_eq!(recv.write(0, b"hello world", false), Err(Error::FlowControl));
        assert_eq!(recv.write(0, b"hello", false), Ok(5));
    }

    #[test]
    fn recv_final_size_shrinks() {
        let mut recv = RecvBuf::new(100);

        recv.write(0, b"hello world", false).unwrap();
        assert_eq!(recv.write(0, b"hello", true), Err(Error::FinalSize));
    }

    #[test]
    fn recv_past_final_size() {
        let mut recv = RecvBuf::new(100);

        recv.write(0, b"hello", true).unwrap();
        assert_eq!(recv.write(5, b"world", false), Err(Error::FinalSize));
    }

    #[test]
    fn recv_reset_discards() {
        let mut recv = RecvBuf::new(100);

        recv.write(0, b"hello", false).unwrap();
        recv.reset(42, 10).unwrap();

        let mut out = [0; 32];
        assert_eq!(recv.emit(&mut out), Err(Error::StreamReset(42)));

        // The reset is delivered exactly once.
        assert_eq!(recv.emit(&mut out), Err(Error::Done));
    }

    #[test]
    fn reset_after_read_is_still_delivered() {
        let mut stream = Stream::new(0, 100, 100, 100, true);

        // Send half finishes cleanly.
        stream.send.write(b"request", true).unwrap();
        let mut out = [0; 32];
        stream.send.emit(&mut out).unwrap();

        // The application reads everything buffered, then a reset arrives
        // at the final size it already consumed.
        stream.recv.write(0, b"partial", false).unwrap();
        stream.recv.emit(&mut out).unwrap();
        stream.recv.reset(42, 7).unwrap();

        // The stream must stay readable, and alive, until the reset has
        // been emitted to the application.
        assert!(!stream.is_complete());
        assert!(stream.is_readable());

        assert_eq!(stream.recv.emit(&mut out), Err(Error::StreamReset(42)));
        assert!(stream.is_complete());
    }

    #[test]
    fn send_respects_window() {
        let mut send = SendBuf::new(5, 100);

        assert_eq!(send.write(b"hello world", false), Ok(11));

        let mut out = [0; 32];
        let (n, off, fin) = send.emit(&mut out).unwrap();
        assert_eq!((n, off, fin), (5, 0, false));
        assert_eq!(&out[..n], b"hello");

        // Window exhausted.
        let (n, ..) = send.emit(&mut out).unwrap();
        assert_eq!(n, 0);
        assert_eq!(send.blocked_at(), Some(5));

        send.update_max_data(100);
        let (n, off, fin) = send.emit(&mut out).unwrap();
        assert_eq!((n, off, fin), (6, 5, false));
        assert_eq!(&out[..n], b" world");
    }

    #[test]
    fn send_buffer_cap() {
        let mut send = SendBuf::new(1000, 10);

        assert_eq!(send.write(b"hello world!", false), Ok(10));
        assert_eq!(send.write(b"more", false), Err(Error::Done));

        // Draining the buffer frees capacity again.
        let mut out = [0; 32];
        send.emit(&mut out).unwrap();
        assert_eq!(send.write(b"more", true), Ok(4));
    }

    #[test]
    fn send_stop() {
        let mut send = SendBuf::new(100, 100);

        send.write(b"hello", false).unwrap();
        let final_size = send.stop(42).unwrap();
        assert_eq!(final_size, 0);

        assert_eq!(send.cap(), Err(Error::StreamStopped(42)));
        assert_eq!(send.write(b"x", false), Err(Error::StreamStopped(42)));
    }

    #[test]
    fn stream_limits() {
        let mut map = StreamMap::new(2, 1);
        map.update_peer_max_streams_bidi(1);

        // Local bidi stream 0 is fine, stream 4 exceeds the peer's limit.
        assert!(map.get_or_create(0, 100, 100, 100, true, false).is_ok());
        assert_eq!(
            map.get_or_create(4, 100, 100, 100, true, false).err(),
            Some(Error::StreamLimit)
        );

        // Peer-created bidi streams 1 and 5 are within the local limit of 2,
        // stream 9 is not.
        assert!(map.get_or_create(1, 100, 100, 100, false, false).is_ok());
        assert!(map.get_or_create(5, 100, 100, 100, false, false).is_ok());
        assert_eq!(
            map.get_or_create(9, 100, 100, 100, false, false).err(),
            Some(Error::StreamLimit)
        );
    }

    #[test]
    fn stream_states() {
        let mut stream = Stream::new(0, 100, 100, 100, true);
        assert_eq!(stream.state(), StreamState::Open);

        stream.send.write(b"request", true).unwrap();
        let mut out = [0; 32];
        stream.send.emit(&mut out).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);

        stream.recv.write(0, b"response", true).unwrap();
        stream.recv.emit(&mut out).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_complete());
    }
}
