// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Run-length-value entropy code for the highpass bands.
//!
//! The codebook is the codec's fixed alphabet: short codes for single zeros
//! and small magnitudes, power-of-two zero runs, a dedicated band-end
//! marker and a raw 16-bit escape for outliers. Nonzero values carry a
//! trailing sign bit. Codes are matched MSB-first by scanning the table in
//! ascending code-length order, so the table must stay sorted by `bits`.

use crate::bit_pump::BitPumpMsb;
use crate::error::{Error, Result};

/// `value` of the entry that terminates a band (with `count` 0).
pub const MARKER_BAND_END: i16 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    /// `count` zeros.
    Run,
    /// One coefficient of magnitude `value`, sign bit follows.
    Value,
    /// End of the current band; no sign bit.
    BandEnd,
    /// Magnitude in the next 16 bits, sign bit follows when nonzero.
    Escape,
}

#[derive(Clone, Copy, Debug)]
struct RlvEntry {
    bits: u32,
    code: u32,
    count: u32,
    value: i16,
    kind: Kind,
}

const fn run(bits: u32, code: u32, count: u32) -> RlvEntry {
    RlvEntry {
        bits,
        code,
        count,
        value: 0,
        kind: Kind::Run,
    }
}

const fn val(bits: u32, code: u32, value: i16) -> RlvEntry {
    RlvEntry {
        bits,
        code,
        count: 1,
        value,
        kind: Kind::Value,
    }
}

/// Complete prefix code (Kraft sum is exactly one): `0`, then pairs
/// `1…10b`, then the two 17-bit stragglers.
const TABLE: [RlvEntry; 33] = [
    run(1, 0b0, 1),
    val(3, 0b100, 1),
    run(3, 0b101, 2),
    val(4, 0b1100, 2),
    run(4, 0b1101, 4),
    val(5, 0b11100, 3),
    run(5, 0b11101, 8),
    val(6, 0b111100, 4),
    run(6, 0b111101, 16),
    val(7, 0b1111100, 5),
    run(7, 0b1111101, 32),
    val(8, 0b11111100, 6),
    run(8, 0b11111101, 64),
    val(9, 0b111111100, 7),
    run(9, 0b111111101, 128),
    val(10, 0b1111111100, 8),
    val(10, 0b1111111101, 9),
    val(11, 0b11111111100, 10),
    val(11, 0b11111111101, 11),
    val(12, 0b111111111100, 12),
    val(12, 0b111111111101, 13),
    val(13, 0b1111111111100, 14),
    val(13, 0b1111111111101, 15),
    val(14, 0b11111111111100, 16),
    val(14, 0b11111111111101, 18),
    val(15, 0b111111111111100, 20),
    val(15, 0b111111111111101, 24),
    val(16, 0b1111111111111100, 28),
    val(16, 0b1111111111111101, 32),
    RlvEntry {
        bits: 17,
        code: 0b11111111111111100,
        count: 0,
        value: MARKER_BAND_END,
        kind: Kind::BandEnd,
    },
    RlvEntry {
        bits: 17,
        code: 0b11111111111111101,
        count: 1,
        value: 0,
        kind: Kind::Escape,
    },
    val(17, 0b11111111111111110, 48),
    // All-ones is a valid code, which keeps a run of set bits from ever
    // stalling the prefix scan.
    val(17, 0b11111111111111111, 64),
];

/// Reads one `(value, count)` pair. The band-end marker comes back as
/// `(MARKER_BAND_END, 0)`.
pub fn get_rlv(pump: &mut BitPumpMsb<'_>) -> Result<(i16, u32)> {
    pump.fill();
    for entry in &TABLE {
        if pump.peek_no_fill(entry.bits)? != entry.code {
            continue;
        }
        pump.consume(entry.bits);
        let (mut value, count): (i32, u32) = match entry.kind {
            Kind::Run => (0, entry.count),
            Kind::Value => (i32::from(entry.value), 1),
            Kind::BandEnd => return Ok((MARKER_BAND_END, 0)),
            Kind::Escape => (pump.get_bits(16)? as i32, 1),
        };
        if value != 0 && pump.get_bits(1)? == 1 {
            value = -value;
        }
        return Ok((value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16, count));
    }
    Err(Error::RlvCodeNotFound)
}
