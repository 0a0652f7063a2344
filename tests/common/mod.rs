// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Bit-level writers the fixtures use to author synthetic streams.
#![allow(dead_code)]

/// MSB-first bit accumulator.
#[derive(Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_pos: u32,
}

impl BitWriter {
    pub fn push_bits(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            if self.bit_pos % 8 == 0 {
                self.bytes.push(0);
            }
            let byte = self.bytes.last_mut().unwrap();
            *byte |= (bit as u8) << (7 - self.bit_pos % 8);
            self.bit_pos += 1;
        }
    }

    /// The raw bytes, zero-padded to a byte boundary.
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    /// The bytes as a JPEG entropy-coded segment: every 0xFF is followed by
    /// a stuffed 0x00.
    pub fn finish_jpeg(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len());
        for b in self.bytes {
            out.push(b);
            if b == 0xff {
                out.push(0x00);
            }
        }
        out
    }
}

/// Encodes one lossless-JPEG difference against the canonical "ssss ladder"
/// table (`counts[i] = 1` for lengths 1..=n, values 0..n): category k is
/// coded as k ones and a zero, followed by k magnitude bits.
pub fn push_diff(w: &mut BitWriter, diff: i32) {
    let magnitude = diff.unsigned_abs();
    let ssss = 32 - magnitude.leading_zeros();
    // k ones, then a zero.
    w.push_bits((1 << (ssss + 1)) - 2, ssss + 1);
    if ssss > 0 {
        let bits = if diff < 0 {
            (diff + (1 << ssss) - 1) as u32
        } else {
            diff as u32
        };
        w.push_bits(bits, ssss);
    }
}
