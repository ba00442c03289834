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

use std::collections::VecDeque;

use crate::h3::Header;

use super::decode_int;
use super::decode_str;
use super::encode_int;
use super::entry_size;
use super::static_table;
use super::DynamicTable;
use super::Error;
use super::Result;

/// A QPACK decoder with a dynamic table.
///
/// Encoder stream bytes are fed through [`control()`], field sections
/// through [`decode()`]. Acknowledgements accumulate internally and are
/// drained with [`emit_instructions()`].
///
/// [`control()`]: struct.Decoder.html#method.control
/// [`decode()`]: struct.Decoder.html#method.decode
/// [`emit_instructions()`]: struct.Decoder.html#method.emit_instructions
pub struct Decoder {
    table: DynamicTable,

    /// Pending decoder stream instructions.
    inst_buf: VecDeque<u8>,
}

impl Decoder {
    /// Creates a decoder whose table capacity is bounded by the
    /// `QPACK_MAX_TABLE_CAPACITY` value advertised in our SETTINGS.
    pub fn new(max_table_capacity: u64) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_table_capacity),
            inst_buf: VecDeque::new(),
        }
    }

    /// Total insertions processed so far.
    pub fn insert_count(&self) -> u64 {
        self.table.insert_count()
    }

    /// Processes encoder stream instructions.
    pub fn control(&mut self, buf: &[u8]) -> Result<()> {
        let mut b = octets::Octets::with_slice(buf);

        let before = self.table.insert_count();

        while b.cap() > 0 {
            let first = b.peek_u8()?;

            // Insert with name reference: '1' T + 6-bit index.
            if first & 0x80 != 0 {
                let is_static = first & 0x40 != 0;
                let index = decode_int(&mut b, 6)?;
                let value = decode_str(&mut b, 7)?;

                let name = if is_static {
                    static_table::get_entry(index)
                        .ok_or(Error::InvalidStaticTableIndex)?
                        .0
                        .to_vec()
                } else {
                    let abs = self.rel_to_abs(index)?;
                    self.table.get(abs)?.0.to_vec()
                };

                self.table.insert(name, value)?;

                continue;
            }

            // Insert with literal name: '01' H + 5-bit name length.
            if first & 0x40 != 0 {
                let name = decode_str(&mut b, 5)?;
                let value = decode_str(&mut b, 7)?;

                self.table.insert(name, value)?;

                continue;
            }

            // Set dynamic table capacity: '001' + 5-bit prefix.
            if first & 0x20 != 0 {
                let capacity = decode_int(&mut b, 5)?;

                self.table.set_capacity(capacity)?;

                continue;
            }

            // Duplicate: '000' + 5-bit relative index.
            let index = decode_int(&mut b, 5)?;

            let abs = self.rel_to_abs(index)?;
            let (name, value) = {
                let (n, v) = self.table.get(abs)?;
                (n.to_vec(), v.to_vec())
            };

            self.table.insert(name, value)?;
        }

        let inserted = self.table.insert_count() - before;

        if inserted > 0 {
            self.queue_insert_count_increment(inserted)?;
        }

        Ok(())
    }

    /// Decodes a field section received on the given stream.
    ///
    /// Fails with [`Error::Blocked`] when the section references insertions
    /// that have not arrived yet; the caller buffers the section and retries
    /// after feeding more encoder stream bytes through [`control()`].
    ///
    /// [`control()`]: struct.Decoder.html#method.control
    pub fn decode(
        &mut self, buf: &[u8], stream_id: u64, max_size: u64,
    ) -> Result<Vec<Header>> {
        let mut b = octets::Octets::with_slice(buf);

        let required_insert_count = decode_int(&mut b, 8)?;

        if required_insert_count > self.table.insert_count() {
            return Err(Error::Blocked);
        }

        let sign = b.peek_u8()? & 0x80 != 0;
        let delta_base = decode_int(&mut b, 7)?;

        let base = if sign {
            required_insert_count
                .checked_sub(delta_base + 1)
                .ok_or(Error::InvalidInstruction)?
        } else {
            required_insert_count + delta_base
        };

        let mut headers = Vec::new();
        let mut section_size = 0;

        while b.cap() > 0 {
            let first = b.peek_u8()?;

            let (name, value) = if first & 0x80 != 0 {
                // Indexed field line: '1' T + 6-bit index.
                let is_static = first & 0x40 != 0;
                let index = decode_int(&mut b, 6)?;

                if is_static {
                    let (n, v) = static_table::get_entry(index)
                        .ok_or(Error::InvalidStaticTableIndex)?;

                    (n.to_vec(), v.to_vec())
                } else {
                    let abs = base_rel_to_abs(base, index)?;
                    let (n, v) = self.table.get(abs)?;

                    (n.to_vec(), v.to_vec())
                }
            } else if first & 0x40 != 0 {
                // Literal with name reference: '01' N T + 4-bit index.
                let is_static = first & 0x10 != 0;
                let index = decode_int(&mut b, 4)?;
                let value = decode_str(&mut b, 7)?;

                let name = if is_static {
                    static_table::get_entry(index)
                        .ok_or(Error::InvalidStaticTableIndex)?
                        .0
                        .to_vec()
                } else {
                    let abs = base_rel_to_abs(base, index)?;
                    self.table.get(abs)?.0.to_vec()
                };

                (name, value)
            } else if first & 0x20 != 0 {
                // Literal with literal name: '001' N H + 3-bit name length.
                let name = decode_str(&mut b, 3)?;
                let value = decode_str(&mut b, 7)?;

                (name, value)
            } else {
                // Post-base representations are never produced by this
                // codec since Base always equals the required insert count.
                return Err(Error::InvalidInstruction);
            };

            section_size += entry_size(&name, &value);

            if section_size > max_size {
                return Err(Error::FieldSectionTooLarge);
            }

            headers.push(Header::new(&name, &value));
        }

        if required_insert_count > 0 {
            self.queue_section_ack(stream_id)?;
        }

        Ok(headers)
    }

    /// Queues a Stream Cancellation instruction for a stream whose field
    /// sections will never be decoded.
    pub fn cancel_stream(&mut self, stream_id: u64) -> Result<()> {
        let mut buf = [0; 16];
        let mut b = octets::OctetsMut::with_slice(&mut buf);

        // Stream Cancellation: '01' + 6-bit stream ID.
        encode_int(stream_id, 0x40, 6, &mut b)?;

        let off = b.off();
        self.inst_buf.extend(&buf[..off]);

        Ok(())
    }

    /// Drains pending decoder stream instructions into `out`.
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

    fn queue_section_ack(&mut self, stream_id: u64) -> Result<()> {
        let mut buf = [0; 16];
        let mut b = octets::OctetsMut::with_slice(&mut buf);

        // Section Acknowledgment: '1' + 7-bit stream ID.
        encode_int(stream_id, 0x80, 7, &mut b)?;

        let off = b.off();
        self.inst_buf.extend(&buf[..off]);

        Ok(())
    }

    fn queue_insert_count_increment(&mut self, increment: u64) -> Result<()> {
        let mut buf = [0; 16];
        let mut b = octets::OctetsMut::with_slice(&mut buf);

        // Insert Count Increment: '00' + 6-bit increment.
        encode_int(increment, 0, 6, &mut b)?;

        let off = b.off();
        self.inst_buf.extend(&buf[..off]);

        Ok(())
    }

    /// Converts an encoder-stream relative index (relative to the current
    /// insert count) to an absolute one.
    fn rel_to_abs(&self, rel: u64) -> Result<u64> {
        self.table
            .insert_count()
            .checked_sub(rel + 1)
            .ok_or(Error::InvalidDynamicTableIndex)
    }
}

/// Converts a field-line relative index (relative to the section's base) to
/// an absolute one.
fn base_rel_to_abs(base: u64, rel: u64) -> Result<u64> {
    base.checked_sub(rel + 1)
        .ok_or(Error::InvalidDynamicTableIndex)
}
