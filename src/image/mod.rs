// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

mod lookup;
mod view;
mod worker;

pub use lookup::{advance_dither_state, RawImageCurveGuard, TableLookUp};
pub use view::{Array2D, Array2DMut};
pub use worker::RawImageWorkerTask;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cfa::ColorFilterArray;
use crate::error::{Error, Result};
use crate::util::tracing_wrappers::*;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DataTypeTag {
    U16,
    F32,
}

impl DataTypeTag {
    /// Bytes per pixel component.
    pub fn bytes_per_component(self) -> usize {
        match self {
            DataTypeTag::U16 => 2,
            DataTypeTag::F32 => 4,
        }
    }
}

#[derive(Clone, Debug)]
enum PixelBuffer {
    U16(Vec<u16>),
    F32(Vec<f32>),
}

/// An axis-aligned rectangle in pixel coordinates: `pos` is `(x, y)`,
/// `dim` is `(width, height)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rect {
    pub pos: (usize, usize),
    pub dim: (usize, usize),
}

impl Rect {
    pub fn new(pos: (usize, usize), dim: (usize, usize)) -> Rect {
        Rect { pos, dim }
    }
}

/// A strip of masked sensels used for black-level calibration.
#[derive(Copy, Clone, Debug)]
pub struct BlackArea {
    /// First row (horizontal area) or column (vertical area) of the strip.
    pub offset: usize,
    /// Rows or columns covered.
    pub size: usize,
    pub is_vertical: bool,
}

/// Camera facts the core carries for its collaborators but never interprets.
#[derive(Clone, Debug)]
pub struct ImageMetadata {
    /// <1 means the image needs vertical stretching, >1 horizontal.
    pub pixel_aspect_ratio: f64,
    pub wb_coeffs: [f32; 4],
    pub subsampling: (usize, usize),
    /// 0 when unknown.
    pub iso_speed: u32,
    pub fuji_rotation_pos: usize,
    pub make: String,
    pub model: String,
    pub mode: String,
    pub canonical_make: String,
    pub canonical_model: String,
    pub canonical_alias: String,
    pub canonical_id: String,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        ImageMetadata {
            pixel_aspect_ratio: 1.0,
            wb_coeffs: [f32::NAN; 4],
            subsampling: (1, 1),
            iso_speed: 0,
            fuji_rotation_pos: 0,
            make: String::new(),
            model: String::new(),
            mode: String::new(),
            canonical_make: String::new(),
            canonical_model: String::new(),
            canonical_alias: String::new(),
            canonical_id: String::new(),
        }
    }
}

/// Append-only collection of non-fatal decode warnings.
#[derive(Debug, Default)]
pub struct ErrorLog {
    errors: Mutex<Vec<String>>,
}

impl ErrorLog {
    pub fn set_error(&self, error: impl Into<String>) {
        lock(&self.errors).push(error.into());
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

#[derive(Clone, Debug)]
struct BadPixelMap {
    bits: Vec<u8>,
    pitch: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The pixel buffer, its geometry and everything the post-processing steps
/// need to know about it.
///
/// Normally reached through a [`RawImage`] handle. Decompressors are the
/// sole writer while they run; the post-processing workers partition the
/// rows among themselves afterwards.
#[derive(Debug)]
pub struct RawImageData {
    data_type: DataTypeTag,
    /// Cropped dimensions in pixels.
    pub dim: (usize, usize),
    uncropped_dim: (usize, usize),
    offset: (usize, usize),
    /// Byte stride between consecutive rows of the uncropped buffer.
    pitch: usize,
    cpp: usize,
    bpp: usize,
    data: Option<PixelBuffer>,
    pub is_cfa: bool,
    /// Mosaic layout anchored at the crop origin; [`RawImageData::sub_frame`]
    /// keeps it in step with the crop.
    pub cfa: ColorFilterArray,
    pub black_level: Option<i32>,
    pub black_level_separate: Option<[i32; 4]>,
    pub white_point: u32,
    pub black_areas: Vec<BlackArea>,
    pub metadata: ImageMetadata,
    /// Dither table-based upscaling to hide banding.
    pub dither_scale: bool,
    /// Positions of pixels that must be interpolated, packed as
    /// `x | (y << 16)` in uncropped coordinates (so at most 65535 per axis).
    bad_pixel_positions: Mutex<Vec<u32>>,
    bad_pixel_map: Option<BadPixelMap>,
    table: Option<TableLookUp>,
    error_log: ErrorLog,
}

impl RawImageData {
    fn new(data_type: DataTypeTag) -> RawImageData {
        RawImageData {
            data_type,
            dim: (0, 0),
            uncropped_dim: (0, 0),
            offset: (0, 0),
            pitch: 0,
            cpp: 1,
            bpp: data_type.bytes_per_component(),
            data: None,
            is_cfa: true,
            cfa: ColorFilterArray::default(),
            black_level: None,
            black_level_separate: None,
            white_point: 65536,
            black_areas: Vec::new(),
            metadata: ImageMetadata::default(),
            dither_scale: true,
            bad_pixel_positions: Mutex::new(Vec::new()),
            bad_pixel_map: None,
            table: None,
            error_log: ErrorLog::default(),
        }
    }

    pub fn data_type(&self) -> DataTypeTag {
        self.data_type
    }

    pub fn cpp(&self) -> usize {
        self.cpp
    }

    /// Bytes per pixel component.
    pub fn bpp(&self) -> usize {
        self.bpp
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn uncropped_dim(&self) -> (usize, usize) {
        self.uncropped_dim
    }

    pub fn crop_offset(&self) -> (usize, usize) {
        self.offset
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    /// Components per pixel may only change before allocation.
    pub fn set_cpp(&mut self, cpp: usize) -> Result<()> {
        if self.is_allocated() {
            return Err(Error::AlreadyAllocated);
        }
        if cpp == 0 || cpp > 4 {
            return Err(Error::UnexpectedCpp(cpp));
        }
        self.cpp = cpp;
        Ok(())
    }

    /// Allocates the pixel buffer for the current `dim`.
    ///
    /// The row padding introduced by pitch alignment is left undefined:
    /// nothing may ever read it.
    pub fn create_data(&mut self) -> Result<()> {
        if self.is_allocated() {
            return Err(Error::AlreadyAllocated);
        }
        let (w, h) = self.dim;
        if w == 0 || h == 0 {
            return Err(Error::InvalidImageSize(w, h));
        }
        // These limits let us not worry about overflows below.
        if w as u64 >= i64::MAX as u64 / 4 || h as u64 >= i64::MAX as u64 / 4 {
            return Err(Error::ImageSizeTooLarge(w, h));
        }
        let row_bytes = w
            .checked_mul(self.cpp)
            .and_then(|v| v.checked_mul(self.bpp))
            .ok_or(Error::ImageSizeTooLarge(w, h))?;
        let pitch = row_bytes.div_ceil(16) * 16;
        let components = (pitch / self.bpp)
            .checked_mul(h)
            .ok_or(Error::ImageSizeTooLarge(w, h))?;
        self.data = Some(match self.data_type {
            DataTypeTag::U16 => {
                let mut v: Vec<u16> = Vec::new();
                v.try_reserve_exact(components)?;
                v.resize(components, 0);
                PixelBuffer::U16(v)
            }
            DataTypeTag::F32 => {
                let mut v: Vec<f32> = Vec::new();
                v.try_reserve_exact(components)?;
                v.resize(components, 0.0);
                PixelBuffer::F32(v)
            }
        });
        self.uncropped_dim = self.dim;
        self.offset = (0, 0);
        self.pitch = pitch;
        Ok(())
    }

    pub fn destroy_data(&mut self) {
        self.data = None;
        self.bad_pixel_map = None;
    }

    /// Stride between rows, in components.
    fn component_stride(&self) -> usize {
        self.pitch / self.bpp
    }

    pub fn u16_uncropped(&self) -> Result<Array2D<'_, u16>> {
        match &self.data {
            Some(PixelBuffer::U16(v)) => Ok(Array2D::new(
                v,
                self.uncropped_dim.0 * self.cpp,
                self.uncropped_dim.1,
                self.component_stride(),
            )),
            Some(PixelBuffer::F32(_)) => Err(Error::UnexpectedDataType(self.data_type)),
            None => Err(Error::NotAllocated),
        }
    }

    pub fn u16_uncropped_mut(&mut self) -> Result<Array2DMut<'_, u16>> {
        let width = self.uncropped_dim.0 * self.cpp;
        let height = self.uncropped_dim.1;
        let stride = self.component_stride();
        match &mut self.data {
            Some(PixelBuffer::U16(v)) => Ok(Array2DMut::new(v, width, height, stride)),
            Some(PixelBuffer::F32(_)) => Err(Error::UnexpectedDataType(self.data_type)),
            None => Err(Error::NotAllocated),
        }
    }

    pub fn u16_cropped(&self) -> Result<Array2D<'_, u16>> {
        let origin = (self.offset.0 * self.cpp, self.offset.1);
        let size = (self.dim.0 * self.cpp, self.dim.1);
        Ok(self.u16_uncropped()?.sub_view(origin, size))
    }

    pub fn f32_uncropped(&self) -> Result<Array2D<'_, f32>> {
        match &self.data {
            Some(PixelBuffer::F32(v)) => Ok(Array2D::new(
                v,
                self.uncropped_dim.0 * self.cpp,
                self.uncropped_dim.1,
                self.component_stride(),
            )),
            Some(PixelBuffer::U16(_)) => Err(Error::UnexpectedDataType(self.data_type)),
            None => Err(Error::NotAllocated),
        }
    }

    pub fn f32_uncropped_mut(&mut self) -> Result<Array2DMut<'_, f32>> {
        let width = self.uncropped_dim.0 * self.cpp;
        let height = self.uncropped_dim.1;
        let stride = self.component_stride();
        match &mut self.data {
            Some(PixelBuffer::F32(v)) => Ok(Array2DMut::new(v, width, height, stride)),
            Some(PixelBuffer::U16(_)) => Err(Error::UnexpectedDataType(self.data_type)),
            None => Err(Error::NotAllocated),
        }
    }

    /// Restricts the image to `cropped`, in coordinates relative to the
    /// current crop. Never reallocates. An oversized rectangle is clamped
    /// and logged rather than rejected.
    pub fn sub_frame(&mut self, cropped: Rect) {
        let mut crop = cropped;
        if crop.pos.0 >= self.dim.0 || crop.pos.1 >= self.dim.1 {
            self.set_error(format!(
                "sub frame position ({}, {}) outside image, ignoring crop",
                crop.pos.0, crop.pos.1
            ));
            return;
        }
        if crop.pos.0 + crop.dim.0 > self.dim.0 || crop.pos.1 + crop.dim.1 > self.dim.1 {
            warn!("crop {crop:?} larger than image {:?}, clamping", self.dim);
            self.set_error("sub frame larger than image, clamping".to_string());
            crop.dim = (
                crop.dim.0.min(self.dim.0 - crop.pos.0),
                crop.dim.1.min(self.dim.1 - crop.pos.1),
            );
        }
        self.offset = (self.offset.0 + crop.pos.0, self.offset.1 + crop.pos.1);
        self.dim = crop.dim;
        // Keep the mosaic description aligned with the new origin.
        self.cfa = self.cfa.shifted(crop.pos.0, crop.pos.1);
    }

    /// Fills `area` of the cropped image with a repeated byte value.
    pub fn clear_area(&mut self, area: Rect, value: u8) -> Result<()> {
        let (w, h) = self.dim;
        if area.pos.0 + area.dim.0 > w || area.pos.1 + area.dim.1 > h {
            return Err(Error::RectOutOfBounds(
                area.dim.0, area.dim.1, area.pos.0, area.pos.1, w, h,
            ));
        }
        let cpp = self.cpp;
        let origin = ((self.offset.0 + area.pos.0) * cpp, self.offset.1 + area.pos.1);
        let size = (area.dim.0 * cpp, area.dim.1);
        match self.data_type {
            DataTypeTag::U16 => {
                let fill = u16::from_ne_bytes([value, value]);
                let mut view = self.u16_uncropped_mut()?.into_sub_view(origin, size);
                for y in 0..size.1 {
                    view.row(y).fill(fill);
                }
            }
            DataTypeTag::F32 => {
                let fill = f32::from_ne_bytes([value, value, value, value]);
                let mut view = self.f32_uncropped_mut()?.into_sub_view(origin, size);
                for y in 0..size.1 {
                    view.row(y).fill(fill);
                }
            }
        }
        Ok(())
    }

    /// Row-wise copy of a `size` region from `src` at `src_pos` to this
    /// image at `dst_pos`, all in cropped coordinates.
    pub fn blit_from(
        &mut self,
        src: &RawImageData,
        src_pos: (usize, usize),
        size: (usize, usize),
        dst_pos: (usize, usize),
    ) -> Result<()> {
        if self.data_type != src.data_type || self.cpp != src.cpp {
            return Err(Error::BlitMismatch);
        }
        if src_pos.0 + size.0 > src.dim.0 || src_pos.1 + size.1 > src.dim.1 {
            return Err(Error::RectOutOfBounds(
                size.0, size.1, src_pos.0, src_pos.1, src.dim.0, src.dim.1,
            ));
        }
        if dst_pos.0 + size.0 > self.dim.0 || dst_pos.1 + size.1 > self.dim.1 {
            return Err(Error::RectOutOfBounds(
                size.0, size.1, dst_pos.0, dst_pos.1, self.dim.0, self.dim.1,
            ));
        }
        let cpp = self.cpp;
        let dst_origin = ((self.offset.0 + dst_pos.0) * cpp, self.offset.1 + dst_pos.1);
        let comp_size = (size.0 * cpp, size.1);
        match self.data_type {
            DataTypeTag::U16 => {
                let src_view = src
                    .u16_cropped()?
                    .sub_view((src_pos.0 * cpp, src_pos.1), comp_size);
                let mut dst = self.u16_uncropped_mut()?.into_sub_view(dst_origin, comp_size);
                for y in 0..comp_size.1 {
                    dst.row(y).copy_from_slice(src_view.row(y));
                }
            }
            DataTypeTag::F32 => {
                let src_view = src.f32_uncropped()?.sub_view(
                    ((src.offset.0 + src_pos.0) * cpp, src.offset.1 + src_pos.1),
                    comp_size,
                );
                let mut dst = self.f32_uncropped_mut()?.into_sub_view(dst_origin, comp_size);
                for y in 0..comp_size.1 {
                    dst.row(y).copy_from_slice(src_view.row(y));
                }
            }
        }
        Ok(())
    }

    /// Replicates the outermost rows and columns of `valid` into the border
    /// of the cropped image, hiding sensels a decoder could not produce.
    pub fn expand_border(&mut self, valid: Rect) -> Result<()> {
        let (w, h) = self.dim;
        if valid.pos.0 + valid.dim.0 > w || valid.pos.1 + valid.dim.1 > h {
            return Err(Error::RectOutOfBounds(
                valid.dim.0, valid.dim.1, valid.pos.0, valid.pos.1, w, h,
            ));
        }
        if valid.dim.0 == 0 || valid.dim.1 == 0 {
            return Err(Error::InvalidImageSize(valid.dim.0, valid.dim.1));
        }
        let cpp = self.cpp;
        let origin = (self.offset.0 * cpp, self.offset.1);
        let size = (w * cpp, h);
        let left = valid.pos.0;
        let right = valid.pos.0 + valid.dim.0;
        let top = valid.pos.1;
        let bottom = valid.pos.1 + valid.dim.1;
        match self.data_type {
            DataTypeTag::U16 => {
                let mut view = self.u16_uncropped_mut()?.into_sub_view(origin, size);
                expand_border_impl(&mut view, cpp, left, right, top, bottom, w);
            }
            DataTypeTag::F32 => {
                let mut view = self.f32_uncropped_mut()?.into_sub_view(origin, size);
                expand_border_impl(&mut view, cpp, left, right, top, bottom, w);
            }
        }
        Ok(())
    }

    pub fn set_table(&mut self, values: &[u16], dither: bool) -> Result<()> {
        self.table = Some(TableLookUp::new(values, dither)?);
        Ok(())
    }

    pub fn clear_table(&mut self) {
        self.table = None;
    }

    pub fn table(&self) -> Option<&TableLookUp> {
        self.table.as_ref()
    }

    /// Writes one 16-bit sample through the current lookup table.
    ///
    /// `random` carries the dither state between calls. This is the hot
    /// path of every decoder that corrects values on the fly.
    #[inline]
    pub fn set_with_lookup(&self, value: u16, dst: &mut u16, random: &mut u32) {
        match &self.table {
            None => *dst = value,
            Some(t) => *dst = t.apply(value, random),
        }
    }

    /// Flags a pixel (uncropped coordinates) for later interpolation.
    pub fn mark_bad_pixel(&self, x: usize, y: usize) {
        debug_assert!(x <= 0xffff && y <= 0xffff);
        lock(&self.bad_pixel_positions).push((x | (y << 16)) as u32);
    }

    pub fn bad_pixel_positions(&self) -> Vec<u32> {
        lock(&self.bad_pixel_positions).clone()
    }

    pub fn has_bad_pixel_map(&self) -> bool {
        self.bad_pixel_map.is_some()
    }

    /// True when the map flags `(x, y)` (uncropped coordinates) as bad.
    pub fn is_bad_pixel(&self, x: usize, y: usize) -> bool {
        match &self.bad_pixel_map {
            Some(map) => map.bits[y * map.pitch + (x >> 3)] & (1 << (x & 7)) != 0,
            None => false,
        }
    }

    /// Allocates the one-bit-per-uncropped-pixel map. Idempotent.
    pub fn create_bad_pixel_map(&mut self) -> Result<()> {
        if self.bad_pixel_map.is_some() {
            return Ok(());
        }
        if self.uncropped_dim.0 == 0 || self.uncropped_dim.1 == 0 {
            return Err(Error::NotAllocated);
        }
        let pitch = self.uncropped_dim.0.div_ceil(8).div_ceil(16) * 16;
        let len = pitch
            .checked_mul(self.uncropped_dim.1)
            .ok_or(Error::ImageSizeTooLarge(pitch, self.uncropped_dim.1))?;
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)?;
        bits.resize(len, 0);
        self.bad_pixel_map = Some(BadPixelMap { bits, pitch });
        Ok(())
    }

    /// Moves the positions list into the bitmap. Positions outside the
    /// uncropped buffer are dropped with a logged warning. Idempotent once
    /// the list has drained.
    pub fn transfer_bad_pixels_to_map(&mut self) -> Result<()> {
        let positions = std::mem::take(&mut *lock(&self.bad_pixel_positions));
        if positions.is_empty() {
            return Ok(());
        }
        self.create_bad_pixel_map()?;
        let (w, h) = self.uncropped_dim;
        let map = self.bad_pixel_map.as_mut().expect("map was just created");
        let mut dropped = 0usize;
        for pos in positions {
            let (x, y) = ((pos & 0xffff) as usize, (pos >> 16) as usize);
            if x >= w || y >= h {
                dropped += 1;
                continue;
            }
            map.bits[y * map.pitch + (x >> 3)] |= 1 << (x & 7);
        }
        if dropped != 0 {
            self.set_error(format!("{dropped} bad pixel positions outside the image"));
        }
        Ok(())
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.error_log.set_error(error);
    }

    pub fn errors(&self) -> Vec<String> {
        self.error_log.errors()
    }
}

fn expand_border_impl<T: Copy>(
    view: &mut Array2DMut<'_, T>,
    cpp: usize,
    left: usize,
    right: usize,
    top: usize,
    bottom: usize,
    width: usize,
) {
    // Fill the left and right borders of every valid row, then replicate
    // whole rows up and down.
    for y in top..bottom {
        let row = view.row(y);
        for x in 0..left {
            for c in 0..cpp {
                row[x * cpp + c] = row[left * cpp + c];
            }
        }
        for x in right..width {
            for c in 0..cpp {
                row[x * cpp + c] = row[(right - 1) * cpp + c];
            }
        }
    }
    for y in 0..top {
        let (dst, src) = (y, top);
        let from: Vec<T> = view.row(src).to_vec();
        view.row(dst).copy_from_slice(&from);
    }
    for y in bottom..view.height() {
        let from: Vec<T> = view.row(bottom - 1).to_vec();
        view.row(y).copy_from_slice(&from);
    }
}

/// Shared-ownership handle to a [`RawImageData`].
///
/// Cheap to clone; the pointee is released when the last handle drops.
/// Equality is identity.
#[derive(Clone, Debug)]
pub struct RawImage(Arc<RwLock<RawImageData>>);

impl RawImage {
    /// An empty image of the given sample type; allocate with
    /// [`RawImageData::create_data`] after setting `dim`.
    pub fn new(data_type: DataTypeTag) -> RawImage {
        RawImage(Arc::new(RwLock::new(RawImageData::new(data_type))))
    }

    /// A fully allocated image.
    pub fn create(dim: (usize, usize), data_type: DataTypeTag, cpp: usize) -> Result<RawImage> {
        let mut data = RawImageData::new(data_type);
        data.set_cpp(cpp)?;
        data.dim = dim;
        data.create_data()?;
        Ok(RawImage(Arc::new(RwLock::new(data))))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RawImageData> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RawImageData> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for RawImage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RawImage {}
