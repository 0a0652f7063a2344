// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! VC-5 wavelet decompressor, as used by GoPro raw files.
//!
//! The stream is a sequence of 16-bit big-endian `(tag, value)` pairs. Tags
//! either update a small decoder state record (dimensions, current channel
//! and subband, quantization, prescale shifts) or introduce a compressed
//! codeblock payload. Each of the four Bayer channels carries a three-level
//! wavelet pyramid of ten subbands: the coarsest lowpass, stored raw, plus
//! three entropy-coded detail bands per level. Once every subband has
//! arrived the pyramid is collapsed bottom-up by inverse 2-6 synthesis and
//! the channels are interleaved back into the mosaic through a log-space
//! output curve.

mod rlv;
mod wavelet;

use crate::bit_pump::BitPumpMsb;
use crate::byte_stream::{ByteStream, Endianness};
use crate::error::{Error, Result};
use crate::image::{DataTypeTag, RawImage};
use crate::util::tracing_wrappers::*;
use wavelet::Wavelet;

/// Tag dictionary of the codec's segment syntax.
mod tag {
    pub const CHANNEL_COUNT: i16 = 0x000c;
    pub const IMAGE_WIDTH: i16 = 0x0014;
    pub const IMAGE_HEIGHT: i16 = 0x0015;
    pub const LOWPASS_PRECISION: i16 = 0x0023;
    pub const SUBBAND_NUMBER: i16 = 0x0030;
    pub const QUANTIZATION: i16 = 0x0035;
    pub const CHANNEL_NUMBER: i16 = 0x003e;
    pub const IMAGE_SEQUENCE_IDENTIFIER: i16 = 0x0044;
    pub const IMAGE_SEQUENCE_NUMBER: i16 = 0x0045;
    pub const IMAGE_FORMAT: i16 = 0x0054;
    pub const MAX_BITS_PER_COMPONENT: i16 = 0x0066;
    pub const PATTERN_WIDTH: i16 = 0x006a;
    pub const PATTERN_HEIGHT: i16 = 0x006b;
    pub const COMPONENTS_PER_SAMPLE: i16 = 0x006c;
    pub const PRESCALE_SHIFT: i16 = 0x006d;
    /// Tags `0x60nn` open a codeblock payload of `(nn << 16 | value)`
    /// 32-bit words.
    pub const LARGE_CODEBLOCK_FAMILY: u16 = 0x6000;
}

const NUM_CHANNELS: usize = 4;
const NUM_WAVELETS: usize = 3;
const NUM_SUBBANDS: usize = 10;
/// The RAW coding format; the only one a Bayer decoder accepts.
const IMAGE_FORMAT_RAW: u16 = 4;
const LOG_TABLE_BITS: u32 = 12;

/// Which pyramid level and band each subband lands in. Level 2 is the
/// coarsest; subband 0 is its lowpass band.
const WAVELET_OF_SUBBAND: [usize; NUM_SUBBANDS] = [2, 2, 2, 2, 1, 1, 1, 0, 0, 0];
const BAND_OF_SUBBAND: [usize; NUM_SUBBANDS] = [0, 1, 2, 3, 1, 2, 3, 1, 2, 3];

#[derive(Debug)]
struct Vc5State {
    channel: usize,
    subband: Option<usize>,
    img_width: usize,
    img_height: usize,
    img_format: u16,
    pattern_width: usize,
    pattern_height: usize,
    components_per_sample: usize,
    bits_per_component: u16,
    lowpass_precision: Option<u32>,
    quantization: i16,
    channel_count: usize,
    image_sequence_identifier: [u8; 16],
    image_sequence_number: u32,
}

impl Default for Vc5State {
    fn default() -> Self {
        Vc5State {
            channel: 0,
            subband: None,
            img_width: 0,
            img_height: 0,
            img_format: 0,
            pattern_width: 2,
            pattern_height: 2,
            components_per_sample: 1,
            bits_per_component: 12,
            lowpass_precision: None,
            quantization: 1,
            channel_count: NUM_CHANNELS,
            image_sequence_identifier: [0; 16],
            image_sequence_number: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Transform {
    wavelets: [Wavelet; NUM_WAVELETS],
    prescale: [u32; NUM_WAVELETS],
}

impl Transform {
    /// Collapses the pyramid bottom-up into the full-resolution channel
    /// plane, clamped to the codec's output range.
    fn reconstruct_channel(&mut self) -> Vec<i16> {
        for level in (1..NUM_WAVELETS).rev() {
            debug_assert!(self.wavelets[level].all_bands_valid());
            let lowband = self.wavelets[level].reconstruct_lowband(self.prescale[level], false);
            self.wavelets[level - 1]
                .set_lowband(lowband)
                .expect("pyramid levels are sized 2:1");
        }
        debug_assert!(self.wavelets[0].all_bands_valid());
        self.wavelets[0].reconstruct_lowband(self.prescale[0], true)
    }
}

/// Decompresses a VC-5 stream into a Bayer CFA image.
pub struct Vc5Decompressor<'a> {
    input: &'a [u8],
    raw: RawImage,
    state: Vc5State,
    transforms: Vec<Transform>,
    /// 12-bit-input log-space curve mapping reconstructed values into the
    /// camera's raw domain.
    log_table: Vec<u16>,
}

impl<'a> Vc5Decompressor<'a> {
    pub fn new(input: &'a [u8], raw: RawImage) -> Result<Vc5Decompressor<'a>> {
        let white_point;
        {
            let img = raw.read();
            if img.data_type() != DataTypeTag::U16 {
                return Err(Error::UnexpectedDataType(img.data_type()));
            }
            if img.cpp() != 1 {
                return Err(Error::UnexpectedCpp(img.cpp()));
            }
            let (w, h) = img.dim;
            if w == 0 || h == 0 {
                return Err(Error::UnexpectedDimensions(w, h));
            }
            white_point = img.white_point;
        }
        let mut transforms = Vec::new();
        transforms.resize_with(NUM_CHANNELS, Transform::default);
        Ok(Vc5Decompressor {
            input,
            raw,
            state: Vc5State::default(),
            transforms,
            log_table: build_log_table(white_point),
        })
    }

    pub fn decompress(&mut self) -> Result<()> {
        self.parse_stream()?;

        let (w, h) = self.raw.read().dim;
        if (self.state.img_width, self.state.img_height) != (w, h) {
            return Err(Error::InconsistentDimensions(
                self.state.img_width,
                self.state.img_height,
                w,
                h,
            ));
        }
        if self.state.img_format != IMAGE_FORMAT_RAW {
            return Err(Error::InvalidTagValue(
                tag::IMAGE_FORMAT as u16,
                self.state.img_format,
            ));
        }

        let channels = self.state.channel_count;
        for (c, transform) in self.transforms.iter().take(channels).enumerate() {
            for (level, wavelet) in transform.wavelets.iter().enumerate() {
                let complete = wavelet.is_initialized()
                    && if level + 1 == NUM_WAVELETS {
                        wavelet.all_bands_valid()
                    } else {
                        wavelet.all_high_bands_valid()
                    };
                if !complete {
                    return Err(Error::MissingBands(c));
                }
            }
        }

        let planes: Vec<Vec<i16>> = {
            let transforms = &mut self.transforms[..channels];
            #[cfg(feature = "parallel")]
            {
                use rayon::prelude::*;
                transforms
                    .par_iter_mut()
                    .map(Transform::reconstruct_channel)
                    .collect()
            }
            #[cfg(not(feature = "parallel"))]
            {
                transforms
                    .iter_mut()
                    .map(Transform::reconstruct_channel)
                    .collect()
            }
        };

        self.assemble(&planes)
    }

    /// Interleaves the reconstructed channel planes into the mosaic and
    /// maps every sample through the log curve.
    fn assemble(&self, planes: &[Vec<i16>]) -> Result<()> {
        let mut img = self.raw.write();
        let (w, h) = img.dim;
        let mut out = img.u16_uncropped_mut()?;
        let lut = |v: i16| -> u16 {
            debug_assert!((0..=4095).contains(&v));
            self.log_table[v as usize]
        };
        match planes.len() {
            1 => {
                let plane = &planes[0];
                for y in 0..h {
                    for x in 0..w {
                        out.set(y, x, lut(plane[y * w + x]));
                    }
                }
            }
            _ => {
                // R, G1, G2, B onto the 2x2 mosaic positions.
                let cw = w / 2;
                for y in 0..h / 2 {
                    for x in 0..cw {
                        let i = y * cw + x;
                        out.set(2 * y, 2 * x, lut(planes[0][i]));
                        out.set(2 * y, 2 * x + 1, lut(planes[1][i]));
                        out.set(2 * y + 1, 2 * x, lut(planes[2][i]));
                        out.set(2 * y + 1, 2 * x + 1, lut(planes[3][i]));
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_stream(&mut self) -> Result<()> {
        let mut bs = ByteStream::new(self.input, Endianness::Big);
        while bs.remaining() >= 4 {
            let tag = bs.get_i16()?;
            let val = bs.get_u16()?;
            self.handle_tag(tag, val, &mut bs)?;
        }
        if bs.remaining() != 0 {
            self.raw
                .read()
                .set_error("trailing bytes after the last VC-5 segment");
        }
        Ok(())
    }

    fn handle_tag(&mut self, tag: i16, val: u16, bs: &mut ByteStream<'a>) -> Result<()> {
        if (tag as u16) & 0xff00 == tag::LARGE_CODEBLOCK_FAMILY {
            let words = usize::from(tag as u16 & 0xff) << 16 | usize::from(val);
            let payload = bs.sub_stream(4 * words)?;
            return self.decode_large_codeblock(payload);
        }
        // A negated tag marks the segment as optional.
        let optional = tag < 0;
        let tag = if optional { tag.wrapping_neg() } else { tag };
        match tag {
            tag::CHANNEL_COUNT => {
                if !(val == 1 || val as usize == NUM_CHANNELS) {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.channel_count = val as usize;
            }
            tag::IMAGE_WIDTH => self.state.img_width = val as usize,
            tag::IMAGE_HEIGHT => self.state.img_height = val as usize,
            tag::IMAGE_FORMAT => {
                if val != IMAGE_FORMAT_RAW {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.img_format = val;
            }
            tag::PATTERN_WIDTH => {
                if !(val == 1 || val == 2) {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.pattern_width = val as usize;
            }
            tag::PATTERN_HEIGHT => {
                if !(val == 1 || val == 2) {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.pattern_height = val as usize;
            }
            tag::COMPONENTS_PER_SAMPLE => {
                if val != 1 {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.components_per_sample = val as usize;
            }
            tag::MAX_BITS_PER_COMPONENT => {
                if !(8..=16).contains(&val) {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.bits_per_component = val;
            }
            tag::LOWPASS_PRECISION => {
                if !(8..=16).contains(&val) {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.lowpass_precision = Some(u32::from(val));
            }
            tag::CHANNEL_NUMBER => {
                if val as usize >= NUM_CHANNELS {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.channel = val as usize;
            }
            tag::SUBBAND_NUMBER => {
                if val as usize >= NUM_SUBBANDS {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.subband = Some(val as usize);
            }
            tag::QUANTIZATION => self.state.quantization = val as i16,
            tag::PRESCALE_SHIFT => {
                // Three 2-bit shifts packed from the top of the value.
                let transform = &mut self.transforms[self.state.channel];
                for i in 0..NUM_WAVELETS {
                    transform.prescale[i] = u32::from(val >> (14 - 2 * i)) & 3;
                }
            }
            tag::IMAGE_SEQUENCE_IDENTIFIER => {
                let payload = bs.sub_stream(4 * usize::from(val))?;
                let bytes = payload.peek_remaining();
                if bytes.len() != 16 {
                    return Err(Error::InvalidTagValue(tag as u16, val));
                }
                self.state.image_sequence_identifier.copy_from_slice(bytes);
            }
            tag::IMAGE_SEQUENCE_NUMBER => {
                let mut payload = bs.sub_stream(4 * usize::from(val))?;
                self.state.image_sequence_number = payload.get_u32()?;
            }
            _ => {
                if !optional {
                    return Err(Error::UnknownRequiredTag(tag as u16));
                }
                debug!("skipping unknown optional tag 0x{:04x}", tag as u16);
                self.raw
                    .read()
                    .set_error(format!("unknown optional VC-5 tag 0x{:04x}", tag as u16));
            }
        }
        Ok(())
    }

    /// `(width, height)` of one channel, derived from the declared image
    /// and pattern geometry.
    fn channel_dimensions(&self) -> Result<(usize, usize)> {
        let (iw, ih) = (self.state.img_width, self.state.img_height);
        if iw == 0 || ih == 0 {
            return Err(Error::InvalidImageSize(iw, ih));
        }
        let (pw, ph) = (self.state.pattern_width, self.state.pattern_height);
        if self.state.channel_count == 1 && (pw, ph) != (1, 1) {
            return Err(Error::InvalidTagValue(tag::PATTERN_WIDTH as u16, pw as u16));
        }
        if self.state.channel_count == NUM_CHANNELS && (pw, ph) != (2, 2) {
            return Err(Error::InvalidTagValue(tag::PATTERN_WIDTH as u16, pw as u16));
        }
        if iw % pw != 0 || ih % ph != 0 {
            return Err(Error::InconsistentDimensions(iw, ih, pw, ph));
        }
        let (cw, ch) = (iw / pw, ih / ph);
        // The three 2:1 pyramid levels must tile the channel exactly.
        if cw % 8 != 0 || ch % 8 != 0 {
            return Err(Error::UnsupportedChannelDimensions(cw, ch));
        }
        Ok((cw, ch))
    }

    fn decode_large_codeblock(&mut self, bs: ByteStream<'a>) -> Result<()> {
        let subband = self.state.subband.ok_or(Error::SubbandNotSet)?;
        if self.state.channel >= self.state.channel_count {
            return Err(Error::InvalidTagValue(
                tag::CHANNEL_NUMBER as u16,
                self.state.channel as u16,
            ));
        }
        let (cw, ch) = self.channel_dimensions()?;
        let transform = &mut self.transforms[self.state.channel];
        if !transform.wavelets[0].is_initialized() {
            for (i, wavelet) in transform.wavelets.iter_mut().enumerate() {
                wavelet.initialize(cw >> (i + 1), ch >> (i + 1))?;
            }
        }
        let level = WAVELET_OF_SUBBAND[subband];
        let band = BAND_OF_SUBBAND[subband];
        let wavelet = &mut transform.wavelets[level];
        if wavelet.is_band_valid(band) {
            return Err(Error::DuplicateSubband(subband as u16));
        }
        trace!(
            "channel {} subband {subband}: wavelet {level} band {band}",
            self.state.channel
        );
        if subband == 0 {
            let precision = self
                .state
                .lowpass_precision
                .ok_or(Error::LowpassPrecisionNotSet)?;
            decode_lowpass(wavelet.band_mut(0), bs.peek_remaining(), precision)?;
            wavelet.quant[0] = 1;
        } else {
            decode_highpass(
                wavelet.band_mut(band),
                bs.peek_remaining(),
            )?;
            wavelet.dequantize_band(band, self.state.quantization);
        }
        wavelet.set_band_valid(band);
        Ok(())
    }
}

/// Subband 0: raw big-endian coefficients of `precision` bits each.
fn decode_lowpass(data: &mut [i16], payload: &[u8], precision: u32) -> Result<()> {
    let mut pump = BitPumpMsb::new(payload);
    for v in data.iter_mut() {
        *v = pump.get_bits(precision)? as i16;
    }
    Ok(())
}

/// Subbands 1-9: RLV-coded runs terminated by the band-end marker.
fn decode_highpass(data: &mut [i16], payload: &[u8]) -> Result<()> {
    let mut pump = BitPumpMsb::new(payload);
    let total = data.len();
    let mut filled = 0usize;
    loop {
        let (value, count) = rlv::get_rlv(&mut pump)?;
        if count == 0 && value == rlv::MARKER_BAND_END {
            break;
        }
        if filled + count as usize > total {
            return Err(Error::BandOverflow);
        }
        data[filled..filled + count as usize].fill(value);
        filled += count as usize;
    }
    if filled != total {
        return Err(Error::ShortBand);
    }
    Ok(())
}

/// `(2^outputBits) * (113^(i/4095) - 1) / 112`, saturated at the white
/// point. The encoder's log curve compressed the sensor values into 12
/// bits; this undoes it.
fn build_log_table(white_point: u32) -> Vec<u16> {
    let output_bits = 32 - white_point.max(1).leading_zeros();
    let size = 1usize << LOG_TABLE_BITS;
    let ceiling = u64::from(white_point.min(65535));
    (0..size)
        .map(|i| {
            let x = i as f64 / (size - 1) as f64;
            let v = ((1u64 << output_bits) as f64 * (113f64.powf(x) - 1.0) / 112.0).round();
            (v as u64).min(ceiling) as u16
        })
        .collect()
}
