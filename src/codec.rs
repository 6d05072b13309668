//! The event stream codec.
//!
//! Each buffer stands alone: it starts with an eight-byte redundant index,
//! followed by a sequence of compressed events, followed by `0xFF` padding.
//! The padding doubles as the stream terminator, which is what allows a
//! half-filled buffer to be programmed to flash and decoded again later: any
//! position where a header would start but the byte is still `0xFF` ends the
//! stream.  To make that sound, every legal header first byte must carry at
//! least one zero bit in its low five bits, which in turn constrains event
//! codes (see [`code_is_encodable`]).
//!
//! ## Header shapes
//!
//! The two low bits of the first header byte select the shape:
//!
//! - bit 0 clear: the event reuses the previous event's code and size, and
//!   the remaining bits of the same varint hold the time delta
//! - bit 0 set: a varint of `(code << 2) | flags` is followed by a size
//!   varint and a time delta varint
//! - bit 1 clear: the delta is full precision
//! - bit 1 set: the delta was truncated by dropping its low 13 bits
//!
//! The truncated shape is only used for events whose producer requested a
//! low-resolution timestamp, and only when the delta's low 13 bits are in
//! fact zero (the truncation of the timestamp itself is skipped when it
//! would step backwards past the previous event).

use std::fmt;

/// Number of leading bytes holding the redundant buffer index.
pub const BLOCK_INDEX_LEN: usize = 8;

/// Upper bound on an encoded event header.
///
/// A 14-bit code with flags is three varint bytes, a size bounded by the
/// buffer is two, and a 32-bit delta is five; fifteen leaves slack.
pub const MAX_HEADER_LEN: usize = 15;

/// Bits dropped from a timestamp when the low-resolution encoding applies.
pub const LOW_RES_SHIFT: u32 = 13;

/// Mask of the timestamp bits dropped by the low-resolution encoding.
pub const LOW_RES_MASK: u32 = (1 << LOW_RES_SHIFT) - 1;

/// Whether an event code can be legally encoded.
///
/// The code must fit in 14 bits and must not be all-ones in its low three
/// bits, so that the first header byte always contains a zero bit in its low
/// five bits and `0xFF` remains an unambiguous stream terminator.
pub fn code_is_encodable(code: u16) -> bool {
    code < (1 << 14) && code & 0x7 != 0x7
}

/// Encodes `v` as an unsigned varint at `buf[start..]`, returning the new
/// write position.
///
/// Seven payload bits per byte, least-significant group first, with the high
/// bit of each byte flagging continuation.
pub fn encode_uvarint(buf: &mut [u8], mut start: usize, mut v: u64) -> usize {
    loop {
        if v < 0x80 {
            buf[start] = v as u8;
            return start + 1;
        }
        buf[start] = (v & 0x7f) as u8 | 0x80;
        start += 1;
        v >>= 7;
    }
}

/// Encodes `v` as a signed varint at `buf[start..]`, returning the new write
/// position.
///
/// Same continuation scheme as [`encode_uvarint`]; the encoding stops once
/// the remaining value sign-extends from seven bits, i.e. lies in
/// `-64..=63`.
pub fn encode_ivarint(buf: &mut [u8], mut start: usize, mut v: i32) -> usize {
    loop {
        if (-0x40..=0x3f).contains(&v) {
            buf[start] = (v & 0x7f) as u8;
            return start + 1;
        }
        buf[start] = (v & 0x7f) as u8 | 0x80;
        start += 1;
        v >>= 7;
    }
}

/// Decodes an unsigned varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input ends mid-varint or the varint does not fit in 64 bits.
pub fn decode_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((v, i + 1));
        }
        shift += 7;
    }
    None
}

/// Decodes a signed varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` on a
/// truncated or over-long input.
pub fn decode_ivarint(buf: &[u8]) -> Option<(i32, usize)> {
    let mut v: i64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        v |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if byte & 0x40 != 0 && shift < 64 {
                // Sign-extend from the top payload bit of the final byte.
                v |= -1i64 << shift;
            }
            return Some((v as i32, i + 1));
        }
    }
    None
}

/// Writes the redundant `(index, !index)` pair into the first eight bytes.
pub fn encode_block_index(buf: &mut [u8], index: u32) {
    buf[0..4].copy_from_slice(&index.to_le_bytes());
    buf[4..8].copy_from_slice(&(!index).to_le_bytes());
}

/// Reads a block index back out of the leading eight bytes.
///
/// Returns `None` unless the two words are exact bitwise complements, which
/// is what rejects erased, interrupted, or corrupted sectors.
pub fn decode_block_index(buf: &[u8]) -> Option<u32> {
    if buf.len() < BLOCK_INDEX_LEN {
        return None;
    }
    let index = u32::from_le_bytes(buf[0..4].try_into().expect("length checked"));
    let check = u32::from_le_bytes(buf[4..8].try_into().expect("length checked"));
    (index == !check).then_some(index)
}

/// Encodes an event header into `buf`, returning its length.
///
/// `repeat` selects the carried-over code/size shape, `truncated` the
/// 13-bit-dropped delta.  Callers must only pass `truncated` when
/// `delta & LOW_RES_MASK == 0`.
pub(crate) fn encode_event_header(
    buf: &mut [u8; MAX_HEADER_LEN],
    repeat: bool,
    truncated: bool,
    code: u16,
    size: u32,
    delta: u32,
) -> usize {
    debug_assert!(!truncated || delta & LOW_RES_MASK == 0);
    let mut len = 0;
    if repeat {
        let v = if truncated {
            u64::from(delta >> (LOW_RES_SHIFT - 2)) | 0b10
        } else {
            u64::from(delta) << 2
        };
        len = encode_uvarint(buf, len, v);
    } else {
        let flags = if truncated { 0b11 } else { 0b01 };
        len = encode_uvarint(buf, len, u64::from(code) << 2 | flags);
        len = encode_uvarint(buf, len, u64::from(size));
        let v = if truncated {
            u64::from(delta >> LOW_RES_SHIFT)
        } else {
            u64::from(delta)
        };
        len = encode_uvarint(buf, len, v);
    }
    len
}

/// A single event recovered from a buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    /// The event class.
    pub code: u16,
    /// Reconstructed absolute timestamp, possibly rounded down if the event
    /// was written with a low-resolution time.
    pub time: u32,
    /// The opaque payload bytes.
    pub payload: Vec<u8>,
}

impl fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("code", &self.code)
            .field("time", &self.time)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Iterator over the events of a single buffer's event stream.
///
/// Takes the stream region only, i.e. the buffer contents after the
/// eight-byte index.  Decoding stops at the first `0xFF` header byte, at the
/// end of the input, or at any malformed tail (truncated varint or payload);
/// a malformed tail is indistinguishable from an interrupted program cycle
/// and is treated the same way.
pub struct EventStreamDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    last_code: u16,
    last_size: u32,
    last_time: u32,
}

impl<'a> EventStreamDecoder<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self {
            data: stream,
            pos: 0,
            last_code: 0,
            last_size: 0,
            last_time: 0,
        }
    }

    /// Byte offset of the first position not consumed by a valid event.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take_uvarint(&mut self) -> Option<u64> {
        let (v, n) = decode_uvarint(&self.data[self.pos..])?;
        self.pos += n;
        Some(v)
    }
}

impl Iterator for EventStreamDecoder<'_> {
    type Item = DecodedEvent;

    fn next(&mut self) -> Option<DecodedEvent> {
        let first = *self.data.get(self.pos)?;
        if first == 0xff {
            return None;
        }
        let rewind = self.pos;
        let new_code = first & 0b01 != 0;
        let truncated = first & 0b10 != 0;

        let result = (|| {
            let (code, size, raw_delta) = if new_code {
                let code = u16::try_from(self.take_uvarint()? >> 2).ok()?;
                let size = u32::try_from(self.take_uvarint()?).ok()?;
                (code, size, self.take_uvarint()?)
            } else {
                let v = self.take_uvarint()?;
                (self.last_code, self.last_size, v >> 2)
            };
            let delta = if truncated {
                // Time arithmetic is modular, so an absurd stored delta
                // wraps instead of overflowing.
                u32::try_from(raw_delta).ok()?.wrapping_shl(LOW_RES_SHIFT)
            } else {
                u32::try_from(raw_delta).ok()?
            };
            let payload = self
                .data
                .get(self.pos..self.pos + size as usize)?
                .to_vec();
            self.pos += size as usize;

            let time = self.last_time.wrapping_add(delta);
            self.last_code = code;
            self.last_size = size;
            self.last_time = time;
            Some(DecodedEvent {
                code,
                time,
                payload,
            })
        })();

        if result.is_none() {
            self.pos = rewind;
        }
        result
    }
}

/// Decodes a whole buffer: the leading redundant index plus its event
/// stream.
///
/// Returns `None` if the index words are not bitwise complements.
pub fn decode_block(block: &[u8]) -> Option<(u32, Vec<DecodedEvent>)> {
    let index = decode_block_index(block)?;
    let events = EventStreamDecoder::new(&block[BLOCK_INDEX_LEN..]).collect();
    Some((index, events))
}
