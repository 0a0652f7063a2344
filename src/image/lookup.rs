// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::error::{Error, Result};
use crate::image::RawImage;
use crate::util::tracing_wrappers::*;

const TABLE_SIZE: usize = 65536;

/// 16-bit to 16-bit lookup table, optionally with dithering.
///
/// In dither mode each entry holds a `(base, delta)` pair derived from the
/// curve's slope around the entry; applying the table adds a pseudo-random
/// fraction of `delta` to `base`, which hides the banding a steep curve
/// would otherwise produce on upscaled values.
#[derive(Clone, Debug)]
pub struct TableLookUp {
    entries: Entries,
}

#[derive(Clone, Debug)]
enum Entries {
    Plain(Vec<u16>),
    /// `(delta / 2) << 16 | base` per entry.
    Dithered(Vec<u32>),
}

impl TableLookUp {
    pub fn new(values: &[u16], dither: bool) -> Result<TableLookUp> {
        if values.is_empty() || values.len() > TABLE_SIZE {
            return Err(Error::InvalidTableSize(values.len()));
        }
        let last = values.len() - 1;
        let entries = if dither {
            let mut t = Vec::new();
            t.try_reserve_exact(TABLE_SIZE)?;
            for i in 0..TABLE_SIZE {
                let center = i32::from(values[i.min(last)]);
                let lower = i32::from(values[i.saturating_sub(1).min(last)]);
                let upper = i32::from(values[(i + 1).min(last)]);
                let delta = (upper - lower).max(0);
                let base = (center - delta / 4).clamp(0, 65535) as u32;
                t.push(((delta as u32 / 2) << 16) | base);
            }
            Entries::Dithered(t)
        } else {
            let mut t = Vec::new();
            t.try_reserve_exact(TABLE_SIZE)?;
            t.extend((0..TABLE_SIZE).map(|i| values[i.min(last)]));
            Entries::Plain(t)
        };
        Ok(TableLookUp { entries })
    }

    pub fn dither(&self) -> bool {
        matches!(self.entries, Entries::Dithered(_))
    }

    /// Maps one sample through the table.
    ///
    /// `random` is the caller's dither state; it is advanced on every
    /// dithered lookup and ignored otherwise. The result is deterministic
    /// for a given `(value, random)` pair.
    #[inline]
    pub fn apply(&self, value: u16, random: &mut u32) -> u16 {
        match &self.entries {
            Entries::Plain(t) => t[value as usize],
            Entries::Dithered(t) => {
                let lookup = t[value as usize];
                let base = lookup & 0xffff;
                let delta = lookup >> 16;
                let r = *random;
                let pix = base + ((delta * (r & 2047) + 1024) >> 12);
                *random = advance_dither_state(r);
                pix.min(65535) as u16
            }
        }
    }
}

/// One step of the multiply-with-carry dither generator.
#[inline]
pub fn advance_dither_state(r: u32) -> u32 {
    15700u32.wrapping_mul(r & 65535).wrapping_add(r >> 16)
}

/// Installs `curve` as the image's lookup table for the duration of a
/// decode, then leaves it installed undithered (when raw values are wanted
/// uncorrected) or removes it.
pub struct RawImageCurveGuard<'a> {
    raw: &'a RawImage,
    curve: Vec<u16>,
    uncorrected_raw_values: bool,
}

impl<'a> RawImageCurveGuard<'a> {
    pub fn new(
        raw: &'a RawImage,
        curve: Vec<u16>,
        uncorrected_raw_values: bool,
    ) -> RawImageCurveGuard<'a> {
        if !uncorrected_raw_values {
            if let Err(e) = raw.write().set_table(&curve, true) {
                warn!("failed to install curve: {e}");
                raw.write().set_error(format!("failed to install curve: {e}"));
            }
        }
        RawImageCurveGuard {
            raw,
            curve,
            uncorrected_raw_values,
        }
    }
}

impl Drop for RawImageCurveGuard<'_> {
    fn drop(&mut self) {
        let mut img = self.raw.write();
        if self.uncorrected_raw_values {
            // Keep the curve around for later application.
            if let Err(e) = img.set_table(&self.curve, false) {
                img.set_error(format!("failed to install curve: {e}"));
            }
        } else {
            img.clear_table();
        }
    }
}
