// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::bit_pump::{BitPump, FetchPolicy};
use crate::error::{Error, Result};

/// Longest code a canonical JPEG Huffman table may contain.
pub const MAX_CODE_LENGTH: u32 = 16;

/// Canonical Huffman code table in the lossless JPEG flavor.
///
/// Built from the classic `(counts[16], values[])` DHT layout: `counts[i]`
/// is the number of codes of length `i + 1`, `values` lists the decoded
/// symbols in code order. For a *full decode* table every symbol is a bit
/// category `ssss`, and [`HuffmanTable::decode_difference`] reads the code
/// followed by `ssss` magnitude bits and sign-extends by the JPEG rule.
#[derive(Clone, Debug)]
pub struct HuffmanTable {
    /// Flat decode table indexed by the next `max_code_length` bits of the
    /// stream. `len == 0` marks a hole (no code has that prefix).
    lut: Vec<LutEntry>,
    max_code_length: u32,
    full_decode: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct LutEntry {
    len: u8,
    value: u8,
}

impl HuffmanTable {
    pub fn new(counts: &[u8; 16], values: &[u8], full_decode: bool) -> Result<HuffmanTable> {
        let total: usize = counts.iter().map(|&c| c as usize).sum();
        if total == 0 || total != values.len() {
            return Err(Error::InvalidHuffman);
        }
        if full_decode && values.iter().any(|&v| u32::from(v) > MAX_CODE_LENGTH) {
            // A full-decode symbol is a magnitude-bit count.
            return Err(Error::InvalidHuffman);
        }

        let max_code_length = 16
            - counts
                .iter()
                .rev()
                .take_while(|&&c| c == 0)
                .count() as u32;

        let mut lut = vec![LutEntry::default(); 1 << max_code_length];
        let mut code: u32 = 0;
        let mut next_value = 0usize;
        for bit_length in 1..=max_code_length {
            for _ in 0..counts[bit_length as usize - 1] {
                // Canonicity: the code must fit in its own bit length.
                if code >= (1 << bit_length) {
                    return Err(Error::InvalidHuffman);
                }
                let value = values[next_value];
                next_value += 1;
                let fill = max_code_length - bit_length;
                let base = (code << fill) as usize;
                for slot in &mut lut[base..base + (1 << fill)] {
                    slot.len = bit_length as u8;
                    slot.value = value;
                }
                code += 1;
            }
            code <<= 1;
        }

        Ok(HuffmanTable {
            lut,
            max_code_length,
            full_decode,
        })
    }

    pub fn is_full_decode(&self) -> bool {
        self.full_decode
    }

    /// Decodes the next code word, returning its symbol.
    #[inline]
    pub fn decode_code<F: FetchPolicy>(&self, pump: &mut BitPump<F>) -> Result<u8> {
        let peeked = pump.peek(self.max_code_length)?;
        let entry = self.lut[peeked as usize];
        if entry.len == 0 {
            return Err(Error::CodeNotFound);
        }
        pump.consume(u32::from(entry.len));
        Ok(entry.value)
    }

    /// Decodes one signed lossless-JPEG difference.
    #[inline]
    pub fn decode_difference<F: FetchPolicy>(&self, pump: &mut BitPump<F>) -> Result<i32> {
        debug_assert!(self.full_decode);
        let ssss = u32::from(self.decode_code(pump)?);
        if ssss == 0 {
            return Ok(0);
        }
        if ssss == 16 {
            return Ok(-32768);
        }
        let bits = pump.get_bits(ssss)? as i32;
        // value < 2^(ssss-1) means the difference is negative.
        if bits < (1 << (ssss - 1)) {
            Ok(bits - (1 << ssss) + 1)
        } else {
            Ok(bits)
        }
    }
}
