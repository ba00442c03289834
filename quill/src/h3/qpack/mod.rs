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

//! QPACK header compression with a dynamic table on both sides.
//!
//! The encoder and decoder each keep a dynamic table. Insertions travel on
//! the encoder stream, acknowledgements on the decoder stream, and field
//! sections on the request streams that carry them. A field section
//! referencing entries the decoder has not received yet fails with
//! [`Error::Blocked`] and must be retried once the missing insertions
//! arrive.

use std::collections::VecDeque;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// Overhead added to name and value lengths when computing an entry's size.
const ENTRY_OVERHEAD: u64 = 32;

/// The [`Result`] type returned by QPACK operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A QPACK error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The provided buffer is too short.
    BufferTooShort,

    /// A field line references a static table entry that doesn't exist.
    InvalidStaticTableIndex,

    /// A field line references a dynamic table entry that was evicted or
    /// never existed.
    InvalidDynamicTableIndex,

    /// The string literal is Huffman-coded, which this codec does not
    /// produce or accept.
    InvalidHuffmanEncoding,

    /// An instruction or field line could not be parsed.
    InvalidInstruction,

    /// The dynamic table capacity exceeds the advertised bound.
    TableCapacityExceeded,

    /// The field section requires insertions the decoder has not received
    /// yet, and must be retried later.
    Blocked,

    /// The field section exceeds the advertised size limit.
    FieldSectionTooLarge,

    /// The encoder reached its cap on literal insertions and fallback is
    /// disabled.
    TooManyLiteralInsertions,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

/// Size of a dynamic table entry, per RFC 9204 Section 3.2.1.
pub(crate) fn entry_size(name: &[u8], value: &[u8]) -> u64 {
    name.len() as u64 + value.len() as u64 + ENTRY_OVERHEAD
}

/// A dynamic table shared in shape by the encoder and decoder sides.
///
/// Entries are kept newest-last. Absolute indices grow monotonically with
/// each insertion and never get reused, so both endpoints agree on them
/// regardless of evictions.
#[derive(Default)]
pub(crate) struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,

    /// Current table capacity in bytes.
    capacity: u64,

    /// Upper bound on the capacity, from the decoder's SETTINGS.
    max_capacity: u64,

    /// Current size in bytes.
    size: u64,

    /// Total number of insertions so far.
    insert_count: u64,
}

impl DynamicTable {
    pub fn new(max_capacity: u64) -> DynamicTable {
        DynamicTable {
            max_capacity,
            ..DynamicTable::default()
        }
    }

    pub fn set_capacity(&mut self, capacity: u64) -> Result<()> {
        if capacity > self.max_capacity {
            return Err(Error::TableCapacityExceeded);
        }

        self.capacity = capacity;
        self.evict_to(capacity);

        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn insert_count(&self) -> u64 {
        self.insert_count
    }

    /// Absolute index of the oldest entry still in the table.
    pub fn oldest_index(&self) -> u64 {
        self.insert_count - self.entries.len() as u64
    }

    /// Returns true if an entry of the given size fits after evictions.
    pub fn can_insert(&self, size: u64) -> bool {
        size <= self.capacity
    }

    /// Inserts an entry, evicting from the oldest end as needed.
    ///
    /// Returns the new entry's absolute index.
    pub fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) -> Result<u64> {
        let size = entry_size(&name, &value);

        if !self.can_insert(size) {
            return Err(Error::TableCapacityExceeded);
        }

        self.evict_to(self.capacity - size);

        self.size += size;
        self.entries.push_back((name, value));

        let index = self.insert_count;
        self.insert_count += 1;

        Ok(index)
    }

    /// Looks up an entry by absolute index.
    pub fn get(&self, index: u64) -> Result<(&[u8], &[u8])> {
        let oldest = self.oldest_index();

        if index < oldest || index >= self.insert_count {
            return Err(Error::InvalidDynamicTableIndex);
        }

        let (name, value) = &self.entries[(index - oldest) as usize];

        Ok((name, value))
    }

    /// Finds an entry by content, newest match first.
    ///
    /// Returns the absolute index of the best match and whether the value
    /// matched too.
    pub fn find_entry(&self, name: &[u8], value: &[u8]) -> Option<(u64, bool)> {
        let oldest = self.oldest_index();
        let mut name_match = None;

        for (i, (n, v)) in self.entries.iter().enumerate().rev() {
            if n != name {
                continue;
            }

            if v == value {
                return Some((oldest + i as u64, true));
            }

            if name_match.is_none() {
                name_match = Some((oldest + i as u64, false));
            }
        }

        name_match
    }

    /// The number of entries that would be evicted by an insertion of the
    /// given size, without performing it.
    pub fn evictions_for(&self, size: u64) -> u64 {
        let mut freed = self.capacity.saturating_sub(self.size);
        let mut count = 0;

        for (name, value) in &self.entries {
            if freed >= size {
                break;
            }

            freed += entry_size(name, value);
            count += 1;
        }

        count
    }

    fn evict_to(&mut self, target: u64) {
        while self.size > target {
            let Some((name, value)) = self.entries.pop_front() else {
                self.size = 0;
                break;
            };

            self.size -= entry_size(&name, &value);
        }
    }
}

/// Encodes an integer with the given prefix length, ORing the remaining
/// bits of the first byte with `first`.
fn encode_int(
    mut v: u64, first: u8, prefix: usize, b: &mut octets::OctetsMut,
) -> Result<()> {
    let mask = (1u64 << prefix) - 1;

    if v < mask {
        b.put_u8(first | v as u8)?;
        return Ok(());
    }

    b.put_u8(first | mask as u8)?;
    v -= mask;

    while v >= 128 {
        b.put_u8((v % 128 + 128) as u8)?;
        v >>= 7;
    }

    b.put_u8(v as u8)?;

    Ok(())
}

/// Decodes an integer with the given prefix length.
fn decode_int(b: &mut octets::Octets, prefix: usize) -> Result<u64> {
    let mask = (1u64 << prefix) - 1;

    let mut val = u64::from(b.get_u8()?) & mask;

    if val < mask {
        return Ok(val);
    }

    let mut shift = 0;

    loop {
        let byte = b.get_u8()?;

        let inc = u64::from(byte & 0x7f)
            .checked_shl(shift)
            .ok_or(Error::InvalidInstruction)?;

        val = val.checked_add(inc).ok_or(Error::InvalidInstruction)?;

        if byte & 0x80 == 0 {
            return Ok(val);
        }

        shift += 7;
    }
}

/// Encodes a string literal. Huffman coding is never used, so the H bit
/// (the bit above the length prefix) is left unset.
fn encode_str(
    s: &[u8], first: u8, prefix: usize, b: &mut octets::OctetsMut,
) -> Result<()> {
    encode_int(s.len() as u64, first, prefix, b)?;
    b.put_bytes(s)?;

    Ok(())
}

/// Decodes a string literal with the H bit above the given length prefix.
fn decode_str(b: &mut octets::Octets, prefix: usize) -> Result<Vec<u8>> {
    let first = b.peek_u8()?;

    if first & (1 << prefix) != 0 {
        return Err(Error::InvalidHuffmanEncoding);
    }

    let len = decode_int(b, prefix)?;
    let data = b.get_bytes(len as usize)?;

    Ok(data.to_vec())
}

pub mod static_table;

mod decoder;
mod encoder;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        let mut buf = [0; 16];

        for v in [0u64, 10, 30, 31, 127, 1337, 1 << 30] {
            let mut b = octets::OctetsMut::with_slice(&mut buf);
            encode_int(v, 0, 5, &mut b).unwrap();

            let mut b = octets::Octets::with_slice(&buf);
            assert_eq!(decode_int(&mut b, 5).unwrap(), v);
        }
    }

    #[test]
    fn str_round_trip() {
        let mut buf = [0; 64];

        let mut b = octets::OctetsMut::with_slice(&mut buf);
        encode_str(b"hello world", 0, 6, &mut b).unwrap();

        let mut b = octets::Octets::with_slice(&buf);
        assert_eq!(decode_str(&mut b, 6).unwrap(), b"hello world");
    }

    #[test]
    fn huffman_rejected() {
        // H bit set above a 7-bit prefix.
        let buf = [0x85, 0xae, 0xc3, 0x77, 0x1a, 0x4b];

        let mut b = octets::Octets::with_slice(&buf);
        assert_eq!(decode_str(&mut b, 7), Err(Error::InvalidHuffmanEncoding));
    }

    #[test]
    fn table_insert_and_evict() {
        let mut table = DynamicTable::new(100);
        table.set_capacity(100).unwrap();

        // Each entry is 10 + 32 = 42 bytes, so only two fit.
        let e0 = table.insert(b"name-0".to_vec(), b"val0".to_vec()).unwrap();
        let e1 = table.insert(b"name-1".to_vec(), b"val1".to_vec()).unwrap();
        let e2 = table.insert(b"name-2".to_vec(), b"val2".to_vec()).unwrap();

        assert_eq!((e0, e1, e2), (0, 1, 2));
        assert_eq!(table.insert_count(), 3);
        assert_eq!(table.oldest_index(), 1);

        assert_eq!(table.get(0), Err(Error::InvalidDynamicTableIndex));
        assert_eq!(table.get(2).unwrap().0, b"name-2");
    }

    #[test]
    fn table_find_prefers_newest() {
        let mut table = DynamicTable::new(1000);
        table.set_capacity(1000).unwrap();

        table.insert(b"x-a".to_vec(), b"1".to_vec()).unwrap();
        table.insert(b"x-a".to_vec(), b"2".to_vec()).unwrap();

        assert_eq!(table.find_entry(b"x-a", b"1"), Some((0, true)));
        assert_eq!(table.find_entry(b"x-a", b"3"), Some((1, false)));
    }

    #[test]
    fn capacity_bound() {
        let mut table = DynamicTable::new(64);
        assert_eq!(table.set_capacity(65), Err(Error::TableCapacityExceeded));
        assert_eq!(table.set_capacity(64), Ok(()));
    }

    use crate::h3::Header;

    fn transfer(enc: &mut Encoder, dec: &mut Decoder) {
        let mut buf = [0; 4096];

        let n = enc.emit_instructions(&mut buf);
        dec.control(&buf[..n]).unwrap();

        let n = dec.emit_instructions(&mut buf);
        enc.control(&buf[..n]).unwrap();
    }

    #[test]
    fn static_only_round_trip() {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(0);

        let headers = vec![
            Header::new(b":method", b"GET"),
            Header::new(b":path", b"/"),
            Header::new(b"x-custom", b"foo"),
        ];

        let mut buf = [0; 4096];
        let len = enc.encode(&headers, 0, &mut buf).unwrap();

        assert!(!enc.has_instructions());

        let out = dec.decode(&buf[..len], 0, 16384).unwrap();
        assert_eq!(out, headers);

        // Nothing referenced the dynamic table, so nothing to acknowledge.
        assert!(!dec.has_instructions());
    }

    #[test]
    fn dynamic_round_trip_with_ack() {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(4096);

        enc.apply_settings(4096, 16, 4096).unwrap();

        let headers = vec![
            Header::new(b"x-token", b"abcd"),
            Header::new(b":method", b"GET"),
        ];

        let mut buf = [0; 4096];
        let len = enc.encode(&headers, 0, &mut buf).unwrap();

        assert_eq!(enc.insertions(), 1);
        assert!(enc.has_instructions());

        // The decoder needs the insertions before the section.
        let mut inst = [0; 4096];
        let n = enc.emit_instructions(&mut inst);
        dec.control(&inst[..n]).unwrap();

        let out = dec.decode(&buf[..len], 0, 16384).unwrap();
        assert_eq!(out, headers);

        // Acknowledgements flow back and advance the received count.
        let n = dec.emit_instructions(&mut inst);
        enc.control(&inst[..n]).unwrap();
        assert_eq!(enc.known_received_count(), 1);

        // A repeat of the same header hits the table without a new insert.
        let len = enc.encode(&headers[..1], 4, &mut buf).unwrap();
        assert_eq!(enc.insertions(), 1);
        assert!(!enc.has_instructions());

        let out = dec.decode(&buf[..len], 4, 16384).unwrap();
        assert_eq!(out, headers[..1]);
    }

    #[test]
    fn blocked_until_insertions_arrive() {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(4096);

        enc.apply_settings(4096, 16, 4096).unwrap();

        let headers = vec![Header::new(b"x-token", b"abcd")];

        let mut buf = [0; 4096];
        let len = enc.encode(&headers, 0, &mut buf).unwrap();

        // Section before instructions: the decoder cannot proceed yet.
        assert_eq!(dec.decode(&buf[..len], 0, 16384), Err(Error::Blocked));

        let mut inst = [0; 4096];
        let n = enc.emit_instructions(&mut inst);
        dec.control(&inst[..n]).unwrap();

        let out = dec.decode(&buf[..len], 0, 16384).unwrap();
        assert_eq!(out, headers);
    }

    #[test]
    fn insertion_cap_strict() {
        let mut enc = Encoder::new();

        enc.apply_settings(4096, 16, 4096).unwrap();
        enc.set_insertion_cap(1, false);

        let headers = vec![
            Header::new(b"x-a", b"1"),
            Header::new(b"x-b", b"2"),
        ];

        let mut buf = [0; 4096];
        assert_eq!(
            enc.encode(&headers, 0, &mut buf),
            Err(Error::TooManyLiteralInsertions)
        );
    }

    #[test]
    fn insertion_cap_fallback() {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(4096);

        enc.apply_settings(4096, 16, 4096).unwrap();
        enc.set_insertion_cap(1, true);

        let headers = vec![
            Header::new(b"x-a", b"1"),
            Header::new(b"x-b", b"2"),
        ];

        let mut buf = [0; 4096];
        let len = enc.encode(&headers, 0, &mut buf).unwrap();

        // Only the first header got indexed, the rest degraded to literals.
        assert_eq!(enc.insertions(), 1);

        let mut inst = [0; 4096];
        let n = enc.emit_instructions(&mut inst);
        dec.control(&inst[..n]).unwrap();

        let out = dec.decode(&buf[..len], 0, 16384).unwrap();
        assert_eq!(out, headers);
    }

    #[test]
    fn blocked_streams_budget() {
        let mut enc = Encoder::new();

        // The decoder accepts no blocked streams at all, so the encoder
        // cannot reference entries before they are acknowledged.
        enc.apply_settings(4096, 0, 4096).unwrap();

        let headers = vec![Header::new(b"x-a", b"1")];

        let mut buf = [0; 4096];
        let len = enc.encode(&headers, 0, &mut buf).unwrap();

        assert_eq!(enc.insertions(), 0);

        // Proof that the section is self-contained: a decoder that never
        // saw any instructions can decode it.
        let mut dec = Decoder::new(4096);
        let out = dec.decode(&buf[..len], 0, 16384).unwrap();
        assert_eq!(out, headers);
    }

    #[test]
    fn second_stream_does_not_block() {
        let mut enc = Encoder::new();

        enc.apply_settings(4096, 1, 4096).unwrap();

        let headers = vec![Header::new(b"x-a", b"1")];

        let mut buf = [0; 4096];
        enc.encode(&headers, 0, &mut buf).unwrap();
        assert_eq!(enc.insertions(), 1);

        // Stream 0 is still unacknowledged and occupies the whole blocked
        // streams budget, so stream 4 must avoid dynamic references.
        let len = enc.encode(&headers, 4, &mut buf).unwrap();
        assert_eq!(enc.insertions(), 1);

        let mut dec = Decoder::new(4096);
        let out = dec.decode(&buf[..len], 4, 16384).unwrap();
        assert_eq!(out, headers);
    }

    #[test]
    fn field_section_size_limit() {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(0);

        let headers = vec![Header::new(b"x-large", b"aaaaaaaaaaaaaaaa")];

        let mut buf = [0; 4096];
        let len = enc.encode(&headers, 0, &mut buf).unwrap();

        assert_eq!(
            dec.decode(&buf[..len], 0, 10),
            Err(Error::FieldSectionTooLarge)
        );
    }
}
