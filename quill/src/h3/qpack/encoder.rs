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

use std::collections::HashSet;
use std::collections::VecDeque;

use crate::h3::NameValue;

use super::decode_int;
use super::encode_int;
use super::encode_str;
use super::entry_size;
use super::static_table;
use super::DynamicTable;
use super::Error;
use super::Result;

/// How a single field line will be represented on the wire.
enum Repr {
    StaticIndexed(u64),
    DynamicIndexed(u64),
    StaticNameLiteral(u64, Vec<u8>),
    Literal(Vec<u8>, Vec<u8>),
}

/// A QPACK encoder with a dynamic table.
///
/// Insertions are queued as encoder stream instructions and must be flushed
/// via [`emit_instructions()`] before the field sections that reference
/// them reach the peer; the transport's ordered delivery of the encoder
/// stream takes care of the rest.
///
/// [`emit_instructions()`]: struct.Encoder.html#method.emit_instructions
pub struct Encoder {
    table: DynamicTable,

    /// Pending encoder stream instructions.
    inst_buf: VecDeque<u8>,

    /// Highest insertion known to have been received by the decoder.
    known_received_count: u64,

    /// Sections sent but not yet acknowledged: stream ID, required insert
    /// count and lowest referenced index.
    unacked_sections: VecDeque<(u64, u64, u64)>,

    /// How many streams the decoder is willing to have blocked.
    max_blocked_streams: u64,

    /// Insert instructions emitted so far.
    insertions: u64,

    /// Cap on insert instructions.
    max_insertions: u64,

    /// Whether hitting the insertion cap degrades to literal encoding
    /// instead of failing.
    fallback_to_literal: bool,
}

impl Default for Encoder {
    fn default() -> Encoder {
        Encoder {
            table: DynamicTable::new(0),
            inst_buf: VecDeque::new(),
            known_received_count: 0,
            unacked_sections: VecDeque::new(),
            max_blocked_streams: 0,
            insertions: 0,
            max_insertions: u64::MAX,
            fallback_to_literal: true,
        }
    }
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder::default()
    }

    /// Applies the decoder's SETTINGS, sizing the dynamic table and queueing
    /// the Set Dynamic Table Capacity instruction.
    pub fn apply_settings(
        &mut self, max_table_capacity: u64, blocked_streams: u64,
        desired_capacity: u64,
    ) -> Result<()> {
        self.max_blocked_streams = blocked_streams;

        let capacity = desired_capacity.min(max_table_capacity);

        self.table = DynamicTable::new(max_table_capacity);
        self.table.set_capacity(capacity)?;

        if capacity > 0 {
            let mut buf = [0; 16];
            let mut b = octets::OctetsMut::with_slice(&mut buf);

            // Set Dynamic Table Capacity: '001' + 5-bit prefix.
            encode_int(capacity, 0x20, 5, &mut b)?;

            let off = b.off();
            self.inst_buf.extend(&buf[..off]);
        }

        Ok(())
    }

    /// Caps the number of insert instructions this encoder will emit.
    ///
    /// With `fallback` set, headers past the cap are encoded as literals;
    /// otherwise encoding fails with [`Error::TooManyLiteralInsertions`].
    pub fn set_insertion_cap(&mut self, cap: u64, fallback: bool) {
        self.max_insertions = cap;
        self.fallback_to_literal = fallback;
    }

    /// Encodes a field section for the given stream.
    pub fn encode<T: NameValue>(
        &mut self, headers: &[T], stream_id: u64, out: &mut [u8],
    ) -> Result<usize> {
        let mut reprs = Vec::with_capacity(headers.len());

        // Dynamic references chosen for this section.
        let mut max_ref: Option<u64> = None;
        let mut min_ref: Option<u64> = None;

        for h in headers {
            let repr = self.pick_repr(
                h.name(),
                h.value(),
                stream_id,
                &mut max_ref,
                &mut min_ref,
            )?;

            reprs.push(repr);
        }

        let required_insert_count = max_ref.map_or(0, |abs| abs + 1);
        let base = required_insert_count;

        let mut b = octets::OctetsMut::with_slice(out);

        // Field section prefix: required insert count on an 8-bit prefix,
        // then sign and delta base (always zero, Base == RIC).
        encode_int(required_insert_count, 0, 8, &mut b)?;
        encode_int(0, 0, 7, &mut b)?;

        for repr in &reprs {
            match repr {
                // Indexed field line, static table: '1' T=1 + 6-bit index.
                Repr::StaticIndexed(index) => {
                    encode_int(*index, 0xc0, 6, &mut b)?;
                },

                // Indexed field line, dynamic table: '1' T=0 + 6-bit
                // base-relative index.
                Repr::DynamicIndexed(abs) => {
                    encode_int(base - 1 - abs, 0x80, 6, &mut b)?;
                },

                // Literal with static name reference: '01' N=0 T=1 + 4-bit
                // index.
                Repr::StaticNameLiteral(index, value) => {
                    encode_int(*index, 0x50, 4, &mut b)?;
                    encode_str(value, 0, 7, &mut b)?;
                },

                // Literal with literal name: '001' N=0 H=0 + 3-bit name
                // length.
                Repr::Literal(name, value) => {
                    encode_str(name, 0x20, 3, &mut b)?;
                    encode_str(value, 0, 7, &mut b)?;
                },
            }
        }

        if required_insert_count > 0 {
            self.unacked_sections.push_back((
                stream_id,
                required_insert_count,
                min_ref.unwrap_or(0),
            ));
        }

        Ok(b.off())
    }

    fn pick_repr(
        &mut self, name: &[u8], value: &[u8], stream_id: u64,
        max_ref: &mut Option<u64>, min_ref: &mut Option<u64>,
    ) -> Result<Repr> {
        let static_match = static_table::find_entry(name, value);

        if let Some((index, true)) = static_match {
            return Ok(Repr::StaticIndexed(index));
        }

        // A dynamic reference to an unacknowledged entry blocks the stream
        // at the decoder; only so many streams may be blocked at once.
        let may_block = self.can_block(stream_id) ||
            max_ref.is_some_and(|abs| abs + 1 > self.known_received_count);

        if let Some((abs, true)) = self.table.find_entry(name, value) {
            if abs < self.known_received_count || may_block {
                track_ref(abs, max_ref, min_ref);
                return Ok(Repr::DynamicIndexed(abs));
            }
        }

        if self.should_insert(name, value, min_ref) && may_block {
            if self.insertions < self.max_insertions {
                let abs = self.insert(name, value, static_match)?;

                track_ref(abs, max_ref, min_ref);
                return Ok(Repr::DynamicIndexed(abs));
            }

            if !self.fallback_to_literal {
                return Err(Error::TooManyLiteralInsertions);
            }
        }

        match static_match {
            Some((index, _)) =>
                Ok(Repr::StaticNameLiteral(index, value.to_vec())),

            None => Ok(Repr::Literal(name.to_vec(), value.to_vec())),
        }
    }

    /// Whether inserting this entry is possible without evicting entries
    /// that in-flight sections may still reference.
    fn should_insert(
        &self, name: &[u8], value: &[u8], section_min_ref: &Option<u64>,
    ) -> bool {
        let size = entry_size(name, value);

        if !self.table.can_insert(size) {
            return false;
        }

        let mut boundary = self.known_received_count;

        for (_, _, min_ref) in &self.unacked_sections {
            boundary = boundary.min(*min_ref);
        }

        if let Some(min_ref) = section_min_ref {
            boundary = boundary.min(*min_ref);
        }

        let evictions = self.table.evictions_for(size);

        self.table.oldest_index() + evictions <= boundary
    }

    fn insert(
        &mut self, name: &[u8], value: &[u8],
        static_match: Option<(u64, bool)>,
    ) -> Result<u64> {
        let mut buf = vec![0; name.len() + value.len() + 16];
        let mut b = octets::OctetsMut::with_slice(&mut buf);

        match static_match {
            // Insert with name reference: '1' T=1 + 6-bit index.
            Some((index, _)) => {
                encode_int(index, 0xc0, 6, &mut b)?;
                encode_str(value, 0, 7, &mut b)?;
            },

            // Insert with literal name: '01' H=0 + 5-bit name length.
            None => {
                encode_str(name, 0x40, 5, &mut b)?;
                encode_str(value, 0, 7, &mut b)?;
            },
        }

        let off = b.off();
        self.inst_buf.extend(&buf[..off]);

        self.insertions += 1;

        self.table.insert(name.to_vec(), value.to_vec())
    }

    /// Whether referencing unacknowledged entries from this stream stays
    /// within the decoder's blocked streams budget.
    fn can_block(&self, stream_id: u64) -> bool {
        let mut blocked = HashSet::new();

        for (sid, ric, _) in &self.unacked_sections {
            if *ric > self.known_received_count {
                blocked.insert(*sid);
            }
        }

        if blocked.contains(&stream_id) {
            return true;
        }

        (blocked.len() as u64) < self.max_blocked_streams
    }

    /// Processes decoder stream instructions.
    pub fn control(&mut self, buf: &[u8]) -> Result<()> {
        let mut b = octets::Octets::with_slice(buf);

        while b.cap() > 0 {
            let first = b.peek_u8()?;

            // Section Acknowledgment: '1' + 7-bit stream ID.
            if first & 0x80 != 0 {
                let stream_id = decode_int(&mut b, 7)?;

                let pos = self
                    .unacked_sections
                    .iter()
                    .position(|(sid, ..)| *sid == stream_id)
                    .ok_or(Error::InvalidInstruction)?;

                if let Some((_, ric, _)) = self.unacked_sections.remove(pos) {
                    self.known_received_count =
                        self.known_received_count.max(ric);
                }

                continue;
            }

            // Stream Cancellation: '01' + 6-bit stream ID.
            if first & 0x40 != 0 {
                let stream_id = decode_int(&mut b, 6)?;

                self.unacked_sections.retain(|(sid, ..)| *sid != stream_id);

                continue;
            }

            // Insert Count Increment: '00' + 6-bit increment.
            let increment = decode_int(&mut b, 6)?;

            let krc = self
                .known_received_count
                .checked_add(increment)
                .filter(|v| *v <= self.table.insert_count())
                .ok_or(Error::InvalidInstruction)?;

            self.known_received_count = krc;
        }

        Ok(())
    }

    /// Drains pending encoder stream instructions into `out`.
    ///
    /// Returns the number of bytes written; zero when nothing is pending.
    pub fn emit_instructions(&mut self, out: &mut [u8]) -> usize {
        let n = self.inst_buf.len().min(out.len());

        for (i, byte) in self.inst_buf.drain(..n).enumerate() {
            out[i] = byte;
        }

        n
    }

    pub fn has_instructions(&self) -> bool {
        !self.inst_buf.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn known_received_count(&self) -> u64 {
        self.known_received_count
    }

    #[cfg(test)]
    pub(crate) fn insertions(&self) -> u64 {
        self.insertions
    }
}

fn track_ref(abs: u64, max_ref: &mut Option<u64>, min_ref: &mut Option<u64>) {
    *max_ref = Some(max_ref.map_or(abs, |v| v.max(abs)));
    *min_ref = Some(min_ref.map_or(abs, |v| v.min(abs)));
}
