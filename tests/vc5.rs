// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Fixture-driven tests of the VC-5 decompressor: hand-authored tag/value
//! streams with raw lowpass payloads and RLV-coded highpass bands.

mod common;

use common::BitWriter;
use rawcore::decompressors::vc5::Vc5Decompressor;
use rawcore::error::{Error, Result};
use rawcore::image::{DataTypeTag, RawImage};

// Tag numbers of the segment dictionary, as the encoder writes them.
const CHANNEL_COUNT: i16 = 0x000c;
const IMAGE_WIDTH: i16 = 0x0014;
const IMAGE_HEIGHT: i16 = 0x0015;
const LOWPASS_PRECISION: i16 = 0x0023;
const SUBBAND_NUMBER: i16 = 0x0030;
const QUANTIZATION: i16 = 0x0035;
const CHANNEL_NUMBER: i16 = 0x003e;
const IMAGE_FORMAT: i16 = 0x0054;
const PATTERN_WIDTH: i16 = 0x006a;
const PATTERN_HEIGHT: i16 = 0x006b;
const COMPONENTS_PER_SAMPLE: i16 = 0x006c;

#[derive(Default)]
struct StreamWriter {
    data: Vec<u8>,
}

impl StreamWriter {
    fn tag(&mut self, tag: i16, val: u16) -> &mut Self {
        self.data.extend_from_slice(&tag.to_be_bytes());
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    /// Emits a large-codeblock segment: `0x60nn` tag carrying the payload
    /// size in 32-bit words, then the payload padded to a word boundary.
    fn codeblock(&mut self, payload: &[u8]) -> &mut Self {
        let words = payload.len().div_ceil(4);
        let tag = 0x6000u16 | (words >> 16) as u16;
        self.tag(tag as i16, words as u16);
        self.data.extend_from_slice(payload);
        self.data.resize(self.data.len() + (4 * words - payload.len()), 0);
        self
    }

    fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Raw lowpass band payload: `values` at `precision` bits each.
fn lowpass_payload(values: &[u16], precision: u32) -> Vec<u8> {
    let mut w = BitWriter::default();
    for &v in values {
        w.push_bits(u32::from(v), precision);
    }
    w.finish()
}

/// Zero run codes of the RLV codebook, largest first.
const ZERO_RUNS: [(u32, u32, u32); 8] = [
    (128, 0b111111101, 9),
    (64, 0b11111101, 8),
    (32, 0b1111101, 7),
    (16, 0b111101, 6),
    (8, 0b11101, 5),
    (4, 0b1101, 4),
    (2, 0b101, 3),
    (1, 0b0, 1),
];

fn push_zero_run(w: &mut BitWriter, mut count: u32) {
    for &(run, code, bits) in &ZERO_RUNS {
        while count >= run {
            w.push_bits(code, bits);
            count -= run;
        }
    }
}

fn push_band_end(w: &mut BitWriter) {
    w.push_bits(0b11111111111111100, 17);
}

/// A highpass band payload that is entirely zeros.
fn zero_band_payload(coefficients: u32) -> Vec<u8> {
    let mut w = BitWriter::default();
    push_zero_run(&mut w, coefficients);
    push_band_end(&mut w);
    w.finish()
}

/// A complete single-channel pyramid for an 8x8 channel: subband 0 carries
/// `dc` raw, all nine highpass bands are zero.
fn single_channel_8x8(s: &mut StreamWriter, channel: u16, dc: u16) {
    s.tag(CHANNEL_NUMBER, channel);
    s.tag(LOWPASS_PRECISION, 16);
    s.tag(SUBBAND_NUMBER, 0);
    s.codeblock(&lowpass_payload(&[dc], 16));
    for subband in 1..10u16 {
        // Wavelet sizes per level: 1x1, 2x2, 4x4.
        let coefficients = match subband {
            1..=3 => 1,
            4..=6 => 4,
            _ => 16,
        };
        s.tag(QUANTIZATION, 1);
        s.tag(SUBBAND_NUMBER, subband);
        s.codeblock(&zero_band_payload(coefficients));
    }
}

fn gray_image(dim: (usize, usize)) -> RawImage {
    let raw = RawImage::create(dim, DataTypeTag::U16, 1).unwrap();
    raw.write().white_point = 4095;
    raw
}

/// The decoder's output curve, restated for expectations.
fn log_curve(i: u16) -> u16 {
    let v = (4096.0 * (113f64.powf(f64::from(i) / 4095.0) - 1.0) / 112.0).round() as u32;
    v.min(4095) as u16
}

#[test]
fn single_channel_all_zero_reconstructs_to_black() -> Result<()> {
    let raw = gray_image((8, 8));
    let mut s = StreamWriter::default();
    s.tag(CHANNEL_COUNT, 1)
        .tag(IMAGE_WIDTH, 8)
        .tag(IMAGE_HEIGHT, 8)
        .tag(IMAGE_FORMAT, 4)
        .tag(PATTERN_WIDTH, 1)
        .tag(PATTERN_HEIGHT, 1)
        .tag(COMPONENTS_PER_SAMPLE, 1);
    single_channel_8x8(&mut s, 0, 0);
    let data = s.finish();
    Vc5Decompressor::new(&data, raw.clone())?.decompress()?;
    let img = raw.read();
    let view = img.u16_uncropped()?;
    for y in 0..8 {
        assert!(view.row(y).iter().all(|&v| v == 0), "row {y}");
    }
    Ok(())
}

#[test]
fn dc_only_pyramid_reconstructs_uniform_image() -> Result<()> {
    // A lowpass of 4096 halves once per synthesis pass: three levels of
    // two passes each leave 64, which the log curve then maps.
    let raw = gray_image((8, 8));
    let mut s = StreamWriter::default();
    s.tag(CHANNEL_COUNT, 1)
        .tag(IMAGE_WIDTH, 8)
        .tag(IMAGE_HEIGHT, 8)
        .tag(IMAGE_FORMAT, 4)
        .tag(PATTERN_WIDTH, 1)
        .tag(PATTERN_HEIGHT, 1);
    single_channel_8x8(&mut s, 0, 4096);
    let data = s.finish();
    Vc5Decompressor::new(&data, raw.clone())?.decompress()?;
    let expected = log_curve(64);
    assert!(expected > 0);
    let img = raw.read();
    let view = img.u16_uncropped()?;
    for y in 0..8 {
        assert!(
            view.row(y).iter().all(|&v| v == expected),
            "row {y}: {:?}",
            view.row(y)
        );
    }
    Ok(())
}

#[test]
fn four_channels_interleave_into_the_mosaic() -> Result<()> {
    // Only channel 1 (the top-right mosaic position) carries energy.
    let raw = gray_image((16, 16));
    let mut s = StreamWriter::default();
    s.tag(CHANNEL_COUNT, 4)
        .tag(IMAGE_WIDTH, 16)
        .tag(IMAGE_HEIGHT, 16)
        .tag(IMAGE_FORMAT, 4)
        .tag(PATTERN_WIDTH, 2)
        .tag(PATTERN_HEIGHT, 2);
    for channel in 0..4 {
        let dc = if channel == 1 { 4096 } else { 0 };
        single_channel_8x8(&mut s, channel, dc);
    }
    let data = s.finish();
    Vc5Decompressor::new(&data, raw.clone())?.decompress()?;
    let bright = log_curve(64);
    let img = raw.read();
    let view = img.u16_uncropped()?;
    for y in 0..16 {
        for x in 0..16 {
            let expected = if y % 2 == 0 && x % 2 == 1 { bright } else { 0 };
            assert_eq!(view.at(y, x), expected, "pixel ({x}, {y})");
        }
    }
    Ok(())
}

#[test]
fn highpass_values_survive_quantization() -> Result<()> {
    // One +3 coefficient quantized by 16 in the finest HL band must leave
    // a visible, bounded dent; everything else stays black.
    let raw = gray_image((8, 8));
    let mut s = StreamWriter::default();
    s.tag(CHANNEL_COUNT, 1)
        .tag(IMAGE_WIDTH, 8)
        .tag(IMAGE_HEIGHT, 8)
        .tag(IMAGE_FORMAT, 4)
        .tag(PATTERN_WIDTH, 1)
        .tag(PATTERN_HEIGHT, 1);
    s.tag(CHANNEL_NUMBER, 0);
    s.tag(LOWPASS_PRECISION, 16);
    s.tag(SUBBAND_NUMBER, 0);
    s.codeblock(&lowpass_payload(&[2048], 16));
    for subband in 1..10u16 {
        let coefficients = match subband {
            1..=3 => 1,
            4..=6 => 4,
            _ => 16,
        };
        s.tag(QUANTIZATION, 16);
        s.tag(SUBBAND_NUMBER, subband);
        if subband == 8 {
            // 7 zeros, +3, then the rest zeros.
            let mut w = BitWriter::default();
            push_zero_run(&mut w, 7);
            w.push_bits(0b11100, 5); // magnitude 3
            w.push_bits(0, 1); // positive
            push_zero_run(&mut w, coefficients - 8);
            push_band_end(&mut w);
            s.codeblock(&w.finish());
        } else {
            s.codeblock(&zero_band_payload(coefficients));
        }
    }
    let data = s.finish();
    Vc5Decompressor::new(&data, raw.clone())?.decompress()?;
    let img = raw.read();
    let view = img.u16_uncropped()?;
    let flat = log_curve(2048 / 64);
    let mut perturbed = 0;
    for y in 0..8 {
        for x in 0..8 {
            if view.at(y, x) != flat {
                perturbed += 1;
            }
        }
    }
    // An HL coefficient in band column 3 feeds only output columns 6 and
    // 7 of the horizontal pass, however far the vertical taps smear it.
    assert!(perturbed > 0, "quantized coefficient had no effect");
    assert!(perturbed <= 16, "perturbation spread too far: {perturbed}");
    for y in 0..8 {
        for x in 0..6 {
            assert_eq!(view.at(y, x), flat, "pixel ({x}, {y}) outside the dent");
        }
    }
    Ok(())
}

#[test]
fn short_highpass_band_is_malformed() {
    let raw = gray_image((8, 8));
    let mut s = StreamWriter::default();
    s.tag(CHANNEL_COUNT, 1)
        .tag(IMAGE_WIDTH, 8)
        .tag(IMAGE_HEIGHT, 8)
        .tag(IMAGE_FORMAT, 4)
        .tag(PATTERN_WIDTH, 1)
        .tag(PATTERN_HEIGHT, 1);
    s.tag(CHANNEL_NUMBER, 0);
    s.tag(SUBBAND_NUMBER, 7);
    // 15 of 16 coefficients, then the band-end marker.
    let mut w = BitWriter::default();
    push_zero_run(&mut w, 15);
    push_band_end(&mut w);
    s.codeblock(&w.finish());
    let data = s.finish();
    let mut d = Vc5Decompressor::new(&data, raw).unwrap();
    assert!(matches!(d.decompress(), Err(Error::ShortBand)));
}

#[test]
fn truncated_codeblock_is_an_eof_error() {
    let raw = gray_image((8, 8));
    let mut s = StreamWriter::default();
    s.tag(IMAGE_WIDTH, 8)
        .tag(IMAGE_HEIGHT, 8)
        .tag(PATTERN_WIDTH, 1)
        .tag(PATTERN_HEIGHT, 1)
        .tag(CHANNEL_COUNT, 1)
        .tag(SUBBAND_NUMBER, 1);
    // Codeblock claims 8 words but the stream ends after 4 bytes.
    s.tag(0x6000u16 as i16, 8);
    let mut data = s.finish();
    data.extend_from_slice(&[0, 0, 0, 0]);
    let mut d = Vc5Decompressor::new(&data, raw).unwrap();
    assert!(matches!(d.decompress(), Err(Error::UnexpectedEof)));
}

#[test]
fn duplicate_subband_is_rejected() {
    let raw = gray_image((8, 8));
    let mut s = StreamWriter::default();
    s.tag(CHANNEL_COUNT, 1)
        .tag(IMAGE_WIDTH, 8)
        .tag(IMAGE_HEIGHT, 8)
        .tag(IMAGE_FORMAT, 4)
        .tag(PATTERN_WIDTH, 1)
        .tag(PATTERN_HEIGHT, 1);
    s.tag(CHANNEL_NUMBER, 0);
    s.tag(SUBBAND_NUMBER, 1);
    s.codeblock(&zero_band_payload(1));
    s.tag(SUBBAND_NUMBER, 1);
    s.codeblock(&zero_band_payload(1));
    let data = s.finish();
    let mut d = Vc5Decompressor::new(&data, raw).unwrap();
    assert!(matches!(d.decompress(), Err(Error::DuplicateSubband(1))));
}
