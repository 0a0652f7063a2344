// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::cfa::ColorFilterArray;
use crate::error::{Error, Result};
use crate::image::{Array2D, DataTypeTag, PixelBuffer, RawImageData};
use crate::util::tracing_wrappers::*;

/// Row-scoped post-processing steps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawImageWorkerTask {
    ScaleValues,
    FixBadPixels,
    ApplyLookup,
}

impl RawImageWorkerTask {
    /// Tasks with this flag always operate on the uncropped buffer.
    pub fn full_image(self) -> bool {
        matches!(self, RawImageWorkerTask::ApplyLookup)
    }
}

/// A value scheduled to replace a bad pixel, in uncropped coordinates.
struct PixelFix<T> {
    x: usize,
    y: usize,
    component: usize,
    value: T,
}

fn thread_count(rows: usize) -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, rows.max(1))
}

/// Splits `region` (of `rows` rows, `stride` elements each) into per-thread
/// row ranges and runs `f(first_row, chunk)` on each, joining before
/// returning.
fn for_each_row_chunk<T: Send, F>(region: &mut [T], stride: usize, rows: usize, f: F)
where
    F: Fn(usize, &mut [T]) + Sync,
{
    if rows == 0 {
        return;
    }
    let rows_per_task = rows.div_ceil(thread_count(rows));
    let chunk_len = rows_per_task * stride;
    #[cfg(feature = "parallel")]
    rayon::scope(|s| {
        for (i, chunk) in region.chunks_mut(chunk_len).enumerate() {
            let f = &f;
            s.spawn(move |_| f(i * rows_per_task, chunk));
        }
    });
    #[cfg(not(feature = "parallel"))]
    for (i, chunk) in region.chunks_mut(chunk_len).enumerate() {
        f(i * rows_per_task, chunk);
    }
}

impl RawImageData {
    /// Partitions the image's rows into roughly equal ranges and runs `task`
    /// over them, one range per thread. Returns after all ranges finish.
    ///
    /// `cropped` selects the cropped region for tasks that honor the crop;
    /// full-image tasks ignore it.
    pub fn start_worker(&mut self, task: RawImageWorkerTask, cropped: bool) -> Result<()> {
        let use_crop = cropped && !task.full_image();
        match task {
            RawImageWorkerTask::ScaleValues => self.scale_values_task(use_crop),
            RawImageWorkerTask::FixBadPixels => self.fix_bad_pixels_task(use_crop),
            RawImageWorkerTask::ApplyLookup => self.apply_lookup_task(),
        }
    }

    /// Derives any missing black/white calibration and scales all pixels to
    /// the full 16-bit (U16) or unit (F32) range.
    pub fn scale_black_white(&mut self) -> Result<()> {
        if self.black_level.is_none() || self.white_point >= 65536 {
            self.estimate_black_white()?;
        }
        if !self.black_areas.is_empty() {
            self.calculate_black_areas()?;
        }
        if self.black_level_separate.is_none() {
            let b = self.black_level.unwrap_or(0);
            self.black_level_separate = Some([b; 4]);
        }
        self.start_worker(RawImageWorkerTask::ScaleValues, true)
    }

    /// Min/max estimate over the interior of the image, skipping a border
    /// where optically shielded or garbage pixels usually live.
    fn estimate_black_white(&mut self) -> Result<()> {
        let (w, h) = self.dim;
        let skip_x = (w / 4).min(250);
        let skip_y = (h / 4).min(250);
        let cpp = self.cpp;
        let (mut lo, mut hi) = (u16::MAX, u16::MIN);
        match self.data_type {
            DataTypeTag::U16 => {
                let view = self.u16_cropped()?;
                for y in (skip_y..h - skip_y).step_by(2) {
                    let row = view.row(y);
                    for &v in &row[skip_x * cpp..(w - skip_x) * cpp] {
                        lo = lo.min(v);
                        hi = hi.max(v);
                    }
                }
            }
            DataTypeTag::F32 => {
                let view = self.f32_uncropped()?;
                let origin = (self.crop_offset().0 * cpp, self.crop_offset().1);
                let view = view.sub_view(origin, (w * cpp, h));
                for y in (skip_y..h - skip_y).step_by(2) {
                    let row = view.row(y);
                    for &v in &row[skip_x * cpp..(w - skip_x) * cpp] {
                        lo = lo.min(v as u16);
                        hi = hi.max(v.min(65535.0) as u16);
                    }
                }
            }
        }
        if lo > hi {
            self.set_error("could not estimate black/white levels");
            return Ok(());
        }
        if self.black_level.is_none() {
            self.black_level = Some(i32::from(lo));
        }
        if self.white_point >= 65536 {
            self.white_point = u32::from(hi);
        }
        info!(
            "estimated black level {:?}, white point {}",
            self.black_level, self.white_point
        );
        Ok(())
    }

    /// Averages the declared masked areas into one black level per 2x2
    /// mosaic position.
    pub fn calculate_black_areas(&mut self) -> Result<()> {
        let (w, h) = self.dim;
        let cpp = self.cpp;
        let mut sums = [0u64; 4];
        let mut counts = [0u64; 4];
        let mut accumulate = |at: &dyn Fn(usize, usize) -> u32, xs: std::ops::Range<usize>, ys: std::ops::Range<usize>| {
            for y in ys {
                for x in xs.clone() {
                    let i = ((y & 1) << 1) | (x & 1);
                    sums[i] += u64::from(at(y, x));
                    counts[i] += 1;
                }
            }
        };
        for area in self.black_areas.clone() {
            let (xs, ys) = if area.is_vertical {
                if area.offset + area.size > w {
                    self.set_error("vertical black area outside image, skipping");
                    continue;
                }
                (area.offset..area.offset + area.size, 0..h)
            } else {
                if area.offset + area.size > h {
                    self.set_error("horizontal black area outside image, skipping");
                    continue;
                }
                (0..w, area.offset..area.offset + area.size)
            };
            match self.data_type {
                DataTypeTag::U16 => {
                    let view = self.u16_cropped()?;
                    accumulate(&|y, x| u32::from(view.at(y, x * cpp)), xs, ys);
                }
                DataTypeTag::F32 => {
                    let full = self.f32_uncropped()?;
                    let origin = (self.crop_offset().0 * cpp, self.crop_offset().1);
                    let view = full.sub_view(origin, (w * cpp, h));
                    accumulate(&|y, x| view.at(y, x * cpp).max(0.0) as u32, xs, ys);
                }
            }
        }
        if counts.iter().any(|&c| c == 0) {
            let b = self.black_level.unwrap_or(0);
            self.black_level_separate = Some([b; 4]);
            return Ok(());
        }
        let mut separate = [0i32; 4];
        for i in 0..4 {
            separate[i] = (sums[i] / counts[i]) as i32;
        }
        self.black_level_separate = Some(separate);
        Ok(())
    }

    fn scale_values_task(&mut self, use_crop: bool) -> Result<()> {
        let black = self
            .black_level_separate
            .unwrap_or([self.black_level.unwrap_or(0); 4]);
        let white = self.white_point as i64;
        if black.iter().any(|&b| white <= i64::from(b)) {
            self.set_error(format!(
                "white point {white} not above black level {black:?}, not scaling"
            ));
            return Ok(());
        }
        // 16.14 fixed-point multipliers, one per mosaic position.
        let mut mul = [0u64; 4];
        for i in 0..4 {
            mul[i] = ((65535u64) << 14) / (white - i64::from(black[i])) as u64;
        }
        let is_cfa = self.is_cfa;
        let cpp = self.cpp;
        let stride = self.component_stride();
        let (x0, y0, w, h) = if use_crop {
            let off = self.crop_offset();
            (off.0 * cpp, off.1, self.dim.0 * cpp, self.dim.1)
        } else {
            (0, 0, self.uncropped_dim().0 * cpp, self.uncropped_dim().1)
        };
        match &mut self.data {
            Some(PixelBuffer::U16(buf)) => {
                let region = &mut buf[y0 * stride..(y0 + h) * stride];
                for_each_row_chunk(region, stride, h, |first_row, chunk| {
                    for (r, row) in chunk.chunks_mut(stride).enumerate() {
                        let y = first_row + r;
                        for (x, v) in row[x0..x0 + w].iter_mut().enumerate() {
                            let i = if is_cfa { ((y & 1) << 1) | (x & 1) } else { 0 };
                            let diff = (i64::from(*v) - i64::from(black[i])).max(0) as u64;
                            *v = ((diff * mul[i] + (1 << 13)) >> 14).min(65535) as u16;
                        }
                    }
                });
            }
            Some(PixelBuffer::F32(buf)) => {
                let mut scale = [0f32; 4];
                for i in 0..4 {
                    scale[i] = 1.0 / (white - i64::from(black[i])) as f32;
                }
                let region = &mut buf[y0 * stride..(y0 + h) * stride];
                for_each_row_chunk(region, stride, h, |first_row, chunk| {
                    for (r, row) in chunk.chunks_mut(stride).enumerate() {
                        let y = first_row + r;
                        for (x, v) in row[x0..x0 + w].iter_mut().enumerate() {
                            let i = if is_cfa { ((y & 1) << 1) | (x & 1) } else { 0 };
                            *v = (*v - black[i] as f32) * scale[i];
                        }
                    }
                });
            }
            None => return Err(Error::NotAllocated),
        }
        Ok(())
    }

    /// Interpolates every flagged pixel and clears its map entry.
    pub fn fix_bad_pixels(&mut self) -> Result<()> {
        self.transfer_bad_pixels_to_map()?;
        if !self.has_bad_pixel_map() {
            return Ok(());
        }
        self.start_worker(RawImageWorkerTask::FixBadPixels, true)
    }

    fn fix_bad_pixels_task(&mut self, use_crop: bool) -> Result<()> {
        let (w, h) = if use_crop { self.dim } else { self.uncropped_dim() };
        let off = if use_crop { self.crop_offset() } else { (0, 0) };
        let cpp = self.cpp;
        // The stored pattern is anchored at the crop origin; re-anchor it
        // when the task runs over the uncropped buffer.
        let cfa = if use_crop {
            self.cfa.clone()
        } else {
            let (pw, ph) = self.cfa.size();
            let (ox, oy) = self.crop_offset();
            self.cfa.shifted((pw - ox % pw) % pw, (ph - oy % ph) % ph)
        };
        let is_cfa = self.is_cfa;

        // Phase 1: find replacement values against the pristine map. Fixed
        // pixels never feed other fixes, so the result is independent of
        // the row partitioning.
        match self.data_type {
            DataTypeTag::U16 => {
                let view = self.u16_uncropped()?;
                let fixes = collect_fixes(
                    self, &view, &cfa, is_cfa, off, (w, h), cpp,
                    |view, y, x| view.at(y, x),
                    |vals: &mut [u16]| {
                        vals.sort_unstable();
                        let n = vals.len();
                        if n % 2 == 1 {
                            vals[n / 2]
                        } else {
                            ((u32::from(vals[n / 2 - 1]) + u32::from(vals[n / 2])) / 2) as u16
                        }
                    },
                );
                drop(view);
                let mut out = self.u16_uncropped_mut()?;
                for fix in &fixes {
                    out.set(fix.y, fix.x * cpp + fix.component, fix.value);
                }
                self.clear_fixed_map_bits(&fixes);
            }
            DataTypeTag::F32 => {
                let view = self.f32_uncropped()?;
                let fixes = collect_fixes(
                    self, &view, &cfa, is_cfa, off, (w, h), cpp,
                    |view, y, x| view.at(y, x),
                    |vals: &mut [f32]| {
                        vals.sort_by(|a, b| a.total_cmp(b));
                        let n = vals.len();
                        if n % 2 == 1 {
                            vals[n / 2]
                        } else {
                            (vals[n / 2 - 1] + vals[n / 2]) / 2.0
                        }
                    },
                );
                drop(view);
                let mut out = self.f32_uncropped_mut()?;
                for fix in &fixes {
                    out.set(fix.y, fix.x * cpp + fix.component, fix.value);
                }
                self.clear_fixed_map_bits(&fixes);
            }
        }
        Ok(())
    }

    fn clear_fixed_map_bits<T>(&mut self, fixes: &[PixelFix<T>]) {
        let Some(map) = self.bad_pixel_map.as_mut() else {
            return;
        };
        for fix in fixes {
            map.bits[fix.y * map.pitch + (fix.x >> 3)] &= !(1 << (fix.x & 7));
        }
    }

    /// Runs every pixel of the uncropped buffer through the lookup table.
    pub fn apply_lookup(&mut self) -> Result<()> {
        self.start_worker(RawImageWorkerTask::ApplyLookup, false)
    }

    /// Convenience for installing and immediately applying a full 16-bit
    /// correction table.
    pub fn sixteen_bit_lookup(&mut self, values: &[u16], dither: bool) -> Result<()> {
        self.set_table(values, dither)?;
        self.apply_lookup()
    }

    fn apply_lookup_task(&mut self) -> Result<()> {
        if self.data_type != DataTypeTag::U16 {
            return Err(Error::FloatLookup);
        }
        let Some(table) = &self.table else {
            return Ok(());
        };
        let w = self.uncropped_dim.0 * self.cpp;
        let h = self.uncropped_dim.1;
        let stride = self.pitch / self.bpp;
        let Some(PixelBuffer::U16(buf)) = &mut self.data else {
            return Err(Error::NotAllocated);
        };
        let region = &mut buf[..h * stride];
        for_each_row_chunk(region, stride, h, |first_row, chunk| {
            // Reseed per range so the result does not depend on the number
            // of threads.
            let mut random = 0x2a4e_5d17u32 ^ first_row as u32;
            for row in chunk.chunks_mut(stride) {
                for v in &mut row[..w] {
                    *v = table.apply(*v, &mut random);
                }
            }
        });
        Ok(())
    }
}

/// Splits the rows of the region among threads and joins the per-range fix
/// lists.
#[allow(clippy::too_many_arguments)]
fn collect_fixes<'a, P, V, M>(
    img: &RawImageData,
    view: &Array2D<'a, P>,
    cfa: &ColorFilterArray,
    is_cfa: bool,
    off: (usize, usize),
    dim: (usize, usize),
    cpp: usize,
    value_at: V,
    median: M,
) -> Vec<PixelFix<P>>
where
    P: Copy + Send + Sync,
    V: Fn(&Array2D<'a, P>, usize, usize) -> P + Sync,
    M: Fn(&mut [P]) -> P + Sync,
{
    let h = dim.1;
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        let rows_per_task = h.div_ceil(thread_count(h)).max(1);
        let starts: Vec<usize> = (0..h).step_by(rows_per_task).collect();
        starts
            .into_par_iter()
            .flat_map_iter(|start| {
                let end = (start + rows_per_task).min(h);
                collect_fixes_rows(
                    img, view, cfa, is_cfa, off, dim, cpp, &value_at, &median,
                    start..end,
                )
            })
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        collect_fixes_rows(
            img, view, cfa, is_cfa, off, dim, cpp, &value_at, &median, 0..h,
        )
    }
}

/// Offsets of the 3x3 neighborhood, in units of the same-color spacing.
const NEIGHBORHOOD: [(isize, isize); 8] = [
    (-1, 0),
    (1, 0),
    (0, -1),
    (0, 1),
    (-1, -1),
    (1, -1),
    (-1, 1),
    (1, 1),
];

/// Replaces each flagged pixel with the median of the valid members of its
/// same-color 3x3 neighborhood (spacing taken from the mosaic); pixels
/// whose whole neighborhood is flagged or out of bounds are left alone.
#[allow(clippy::too_many_arguments)]
fn collect_fixes_rows<'a, P, V, M>(
    img: &RawImageData,
    view: &Array2D<'a, P>,
    cfa: &ColorFilterArray,
    is_cfa: bool,
    off: (usize, usize),
    dim: (usize, usize),
    cpp: usize,
    value_at: &V,
    median: &M,
    rows: std::ops::Range<usize>,
) -> Vec<PixelFix<P>>
where
    P: Copy,
    V: Fn(&Array2D<'a, P>, usize, usize) -> P,
    M: Fn(&mut [P]) -> P,
{
    let (w, h) = dim;
    let mut fixes = Vec::new();
    for y in rows {
        let uy = y + off.1;
        for x in 0..w {
            let ux = x + off.0;
            if !img.is_bad_pixel(ux, uy) {
                continue;
            }
            let (sx, sy) = if is_cfa {
                cfa.same_color_spacing(x, y)
            } else {
                (1, 1)
            };
            for c in 0..cpp {
                let mut vals = Vec::with_capacity(NEIGHBORHOOD.len());
                for (dx, dy) in NEIGHBORHOOD {
                    let nx = x as isize + dx * sx as isize;
                    let ny = y as isize + dy * sy as isize;
                    if nx < 0 || ny < 0 || nx as usize >= w || ny as usize >= h {
                        continue;
                    }
                    let (nx, ny) = (nx as usize, ny as usize);
                    if img.is_bad_pixel(nx + off.0, ny + off.1) {
                        continue;
                    }
                    vals.push(value_at(view, ny + off.1, (nx + off.0) * cpp + c));
                }
                if !vals.is_empty() {
                    fixes.push(PixelFix {
                        x: ux,
                        y: uy,
                        component: c,
                        value: median(&mut vals),
                    });
                }
            }
        }
    }
    fixes
}
