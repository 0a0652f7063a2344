// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::marker::PhantomData;

use crate::error::{Error, Result};

/// How the pump pulls the next byte out of the underlying range.
///
/// The pump itself always hands out bits in MSB-first order; the policy only
/// decides which bytes exist in the stream.
pub trait FetchPolicy {
    /// Returns the byte at `*pos` and advances `*pos`, or `None` once the
    /// stream has ended.
    fn fetch(data: &[u8], pos: &mut usize) -> Option<u8>;
}

/// Plain big-endian byte feed. Used by the VC-5 decompressor.
pub enum MsbFetch {}

impl FetchPolicy for MsbFetch {
    #[inline]
    fn fetch(data: &[u8], pos: &mut usize) -> Option<u8> {
        let b = *data.get(*pos)?;
        *pos += 1;
        Some(b)
    }
}

/// JPEG entropy-coded segment feed.
///
/// A 0xFF byte must be followed by a stuffed 0x00, which is stripped. Any
/// other byte after 0xFF is a marker and permanently terminates the stream.
pub enum JpegFetch {}

impl FetchPolicy for JpegFetch {
    #[inline]
    fn fetch(data: &[u8], pos: &mut usize) -> Option<u8> {
        let b = *data.get(*pos)?;
        if b != 0xff {
            *pos += 1;
            return Some(b);
        }
        match data.get(*pos + 1) {
            Some(0x00) => {
                *pos += 2;
                Some(0xff)
            }
            // A marker, or a lone trailing 0xFF. Leave `pos` in place so
            // every later fetch sees the same terminator.
            _ => None,
        }
    }
}

/// Cursor over a byte range producing arbitrary-width bit fields, MSB first.
///
/// After the underlying stream ends the pump serves up to 64 bits of zero
/// padding, which tolerates the overreads the tail of an entropy-coded
/// stream needs; consuming beyond that window fails with
/// [`Error::UnexpectedEof`].
/// ```
/// # use rawcore::bit_pump::BitPumpMsb;
/// let mut pump = BitPumpMsb::new(&[0b1011_0001, 0xf0]);
/// assert_eq!(pump.get_bits(4)?, 0b1011);
/// assert_eq!(pump.peek(4)?, 0b0001);
/// pump.consume(4);
/// assert_eq!(pump.get_bits(8)?, 0xf0);
/// # Ok::<(), rawcore::error::Error>(())
/// ```
pub struct BitPump<'a, F: FetchPolicy> {
    data: &'a [u8],
    pos: usize,
    cache: u64,
    bits_in_cache: u32,
    zero_bits_served: u32,
    _policy: PhantomData<F>,
}

pub type BitPumpMsb<'a> = BitPump<'a, MsbFetch>;
pub type BitPumpJpeg<'a> = BitPump<'a, JpegFetch>;

/// Zero bits a pump may serve past the end of its input.
const MAX_PADDING_BITS: u32 = 64;

impl<'a, F: FetchPolicy> BitPump<'a, F> {
    pub fn new(data: &'a [u8]) -> BitPump<'a, F> {
        BitPump {
            data,
            pos: 0,
            cache: 0,
            bits_in_cache: 0,
            zero_bits_served: 0,
            _policy: PhantomData,
        }
    }

    /// Tops up the cache. A no-op when 56 or more bits are already buffered.
    #[inline]
    pub fn fill(&mut self) {
        while self.bits_in_cache <= 56 {
            let Some(b) = F::fetch(self.data, &mut self.pos) else {
                return;
            };
            self.cache = (self.cache << 8) | u64::from(b);
            self.bits_in_cache += 8;
        }
    }

    /// Reads `num` bits without consuming them. `num` must be at most 32.
    #[inline]
    pub fn peek(&mut self, num: u32) -> Result<u32> {
        debug_assert!(num > 0 && num <= 32);
        if self.bits_in_cache < num {
            self.fill();
        }
        self.peek_no_fill(num)
    }

    /// Like [`BitPump::peek`], but relies on a previous `fill()` call.
    #[inline]
    pub fn peek_no_fill(&mut self, num: u32) -> Result<u32> {
        debug_assert!(num > 0 && num <= 32);
        if self.bits_in_cache >= num {
            return Ok((self.cache >> (self.bits_in_cache - num)) as u32 & mask(num));
        }
        // Serve the cached bits followed by zero padding.
        let missing = num - self.bits_in_cache;
        if self.zero_bits_served + missing > MAX_PADDING_BITS {
            return Err(Error::UnexpectedEof);
        }
        Ok(((self.cache << missing) as u32) & mask(num))
    }

    /// Advances by `num` bits, which must have been peeked beforehand.
    #[inline]
    pub fn consume(&mut self, num: u32) {
        if self.bits_in_cache >= num {
            self.bits_in_cache -= num;
            self.cache = if self.bits_in_cache == 0 {
                0
            } else {
                self.cache & (u64::MAX >> (64 - self.bits_in_cache))
            };
        } else {
            self.zero_bits_served += num - self.bits_in_cache;
            self.bits_in_cache = 0;
            self.cache = 0;
        }
    }

    /// Reads and consumes `num` bits. `num` must be at most 32.
    #[inline]
    pub fn get_bits(&mut self, num: u32) -> Result<u32> {
        if num == 0 {
            return Ok(0);
        }
        let ret = self.peek(num)?;
        self.consume(num);
        Ok(ret)
    }

    /// Like [`BitPump::get_bits`], but relies on a previous `fill()` call.
    #[inline]
    pub fn get_bits_no_fill(&mut self, num: u32) -> Result<u32> {
        let ret = self.peek_no_fill(num)?;
        self.consume(num);
        Ok(ret)
    }

    /// Drops bits up to the next byte boundary of the source stream.
    pub fn byte_align(&mut self) {
        self.consume(self.bits_in_cache % 8);
    }

    /// Bytes that have been neither consumed nor buffered, plus whole
    /// buffered bytes.
    pub fn remaining_bytes(&self) -> usize {
        self.data.len() - self.pos + self.bits_in_cache as usize / 8
    }
}

#[inline]
fn mask(num: u32) -> u32 {
    if num >= 32 {
        u32::MAX
    } else {
        (1u32 << num) - 1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn msb_bit_order() -> Result<()> {
        let mut pump = BitPumpMsb::new(&[0b1100_1010, 0b0101_0011]);
        assert_eq!(pump.get_bits(1)?, 1);
        assert_eq!(pump.get_bits(2)?, 0b10);
        assert_eq!(pump.get_bits(5)?, 0b01010);
        assert_eq!(pump.get_bits(8)?, 0b0101_0011);
        Ok(())
    }

    #[test]
    fn zero_padding_then_eof() -> Result<()> {
        let mut pump = BitPumpMsb::new(&[0xab]);
        assert_eq!(pump.get_bits(8)?, 0xab);
        // Up to 64 bits of padding decode as zeros.
        assert_eq!(pump.get_bits(32)?, 0);
        assert_eq!(pump.get_bits(32)?, 0);
        assert!(pump.get_bits(1).is_err());
        Ok(())
    }

    #[test]
    fn jpeg_stuffing_is_stripped() -> Result<()> {
        let mut pump = BitPumpJpeg::new(&[0xff, 0x00, 0x12]);
        assert_eq!(pump.get_bits(8)?, 0xff);
        assert_eq!(pump.get_bits(8)?, 0x12);
        Ok(())
    }

    #[test]
    fn jpeg_marker_terminates() -> Result<()> {
        // 0xFFD9 (EOI) must end the stream after the first byte.
        let mut pump = BitPumpJpeg::new(&[0x5a, 0xff, 0xd9, 0x77]);
        assert_eq!(pump.get_bits(8)?, 0x5a);
        assert_eq!(pump.get_bits(8)?, 0); // padding
        assert!(pump.get_bits(64).is_err());
        Ok(())
    }

    #[test]
    fn byte_align() -> Result<()> {
        let mut pump = BitPumpMsb::new(&[0xff, 0x81]);
        assert_eq!(pump.get_bits(3)?, 0b111);
        pump.byte_align();
        assert_eq!(pump.get_bits(8)?, 0x81);
        Ok(())
    }

    #[test]
    fn peek_does_not_consume() -> Result<()> {
        let mut pump = BitPumpMsb::new(&[0x42]);
        assert_eq!(pump.peek(8)?, 0x42);
        assert_eq!(pump.peek(8)?, 0x42);
        assert_eq!(pump.get_bits(8)?, 0x42);
        Ok(())
    }

    #[test]
    fn arbitrary_reads_match_reference() {
        arbtest::arbtest(|u| {
            let data: Vec<u8> = u.arbitrary()?;
            let mut pump = BitPumpMsb::new(&data);
            // Reading bit-by-bit must agree with direct indexing.
            for (i, byte) in data.iter().enumerate() {
                for bit in 0..8 {
                    let expected = (byte >> (7 - bit)) & 1;
                    assert_eq!(pump.get_bits(1).unwrap(), u32::from(expected), "bit {i}:{bit}");
                }
            }
            Ok(())
        });
    }
}
