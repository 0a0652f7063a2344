// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Canon CR2 lossless JPEG decompressor.
//!
//! Canon stores the raster as vertical slices of equal width (plus a
//! possibly different final width), while the predictor state resets at the
//! width of the *unsliced* frame the encoder saw. The decode loop therefore
//! walks frame rows and maps every group of samples back into the sliced
//! output geometry. For the slice handling and sampling factor behavior see
//! <https://github.com/lclevy/libcraw2/blob/master/docs/cr2_lossless.pdf>.

use crate::bit_pump::BitPumpJpeg;
use crate::error::{Error, Result};
use crate::huffman::HuffmanTable;
use crate::image::{Array2DMut, DataTypeTag, RawImage};

/// The vertical strips a CR2 frame is stored as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cr2Slicing {
    num_slices: usize,
    slice_width: usize,
    last_slice_width: usize,
}

impl Cr2Slicing {
    pub fn new(num_slices: usize, slice_width: usize, last_slice_width: usize) -> Cr2Slicing {
        Cr2Slicing {
            num_slices,
            slice_width,
            last_slice_width,
        }
    }

    /// An unsliced frame: one slice covering `width`.
    pub fn single(width: usize) -> Cr2Slicing {
        Cr2Slicing::new(1, width, width)
    }

    pub fn num_slices(&self) -> usize {
        self.num_slices
    }

    pub fn width_of_slice(&self, id: usize) -> usize {
        if id + 1 == self.num_slices {
            self.last_slice_width
        } else {
            self.slice_width
        }
    }

    pub fn total_width(&self) -> usize {
        match self.num_slices {
            0 => 0,
            n => (n - 1) * self.slice_width + self.last_slice_width,
        }
    }
}

/// Everything one component needs: its Huffman table and the predictor
/// starting value (typically `1 << (precision - 1)`).
#[derive(Clone, Debug)]
pub struct PerComponentRecipe {
    pub ht: HuffmanTable,
    pub init_pred: u16,
}

/// Lossless JPEG decompressor for the CR2 variants: 2 or 4 fully sampled
/// components, or 3 components with 2x1 / 2x2 chroma subsampling.
pub struct Cr2Decompressor<'a> {
    raw: RawImage,
    format: (usize, usize, usize),
    /// Pre-slicing frame geometry the encoder used.
    frame: (usize, usize),
    slicing: Cr2Slicing,
    rec: Vec<PerComponentRecipe>,
    input: &'a [u8],
}

impl<'a> Cr2Decompressor<'a> {
    /// `format` is `(N_COMP, X_S_F, Y_S_F)`; `input` is the byte range
    /// following the SOS marker.
    pub fn new(
        raw: RawImage,
        format: (usize, usize, usize),
        frame: (usize, usize),
        slicing: Cr2Slicing,
        rec: Vec<PerComponentRecipe>,
        input: &'a [u8],
    ) -> Result<Cr2Decompressor<'a>> {
        {
            let img = raw.read();
            if img.data_type() != DataTypeTag::U16 {
                return Err(Error::UnexpectedDataType(img.data_type()));
            }
            if img.cpp() != 1 || img.bpp() != 2 {
                return Err(Error::UnexpectedCpp(img.cpp()));
            }
            let (w, h) = img.dim;
            if w == 0 || h == 0 || w > 19440 || h > 5920 {
                return Err(Error::UnexpectedDimensions(w, h));
            }
            if slicing.num_slices == 0 {
                return Err(Error::BadSliceWidth(0));
            }
            for slice_id in 0..slicing.num_slices {
                if slicing.width_of_slice(slice_id) == 0 {
                    return Err(Error::BadSliceWidth(0));
                }
            }
            let is_subsampled = format.1 != 1 || format.2 != 1;
            if is_subsampled == img.is_cfa {
                return Err(Error::SubsamplingMismatch);
            }
            if !matches!(format, (3, 2, 2) | (3, 2, 1) | (2, 1, 1) | (4, 1, 1)) {
                return Err(Error::UnknownCr2Format(format.0, format.1, format.2));
            }
            if rec.len() != format.0 {
                return Err(Error::RecipeCountMismatch(rec.len(), format.0));
            }
            for recipe in &rec {
                if !recipe.ht.is_full_decode() {
                    return Err(Error::NotFullDecode);
                }
            }
        }
        Ok(Cr2Decompressor {
            raw,
            format,
            frame,
            slicing,
            rec,
            input,
        })
    }

    pub fn decompress(&self) -> Result<()> {
        let mut img = self.raw.write();
        let dim = img.dim;
        let mut out = img.u16_uncropped_mut()?;
        match self.format {
            (3, 2, 2) => self.decompress_n_x_y::<3, 2, 2>(&mut out, dim), // sRaw1/mRaw
            (3, 2, 1) => self.decompress_n_x_y::<3, 2, 1>(&mut out, dim), // sRaw2/sRaw
            (2, 1, 1) => self.decompress_n_x_y::<2, 1, 1>(&mut out, dim),
            (4, 1, 1) => self.decompress_n_x_y::<4, 1, 1>(&mut out, dim),
            (n, x, y) => Err(Error::UnknownCr2Format(n, x, y)),
        }
    }

    // N_COMP = number of components (2, 3 or 4)
    // X_S_F  = horizontal sampling factor (1 or 2)
    // Y_S_F  = vertical sampling factor (1 or 2)
    fn decompress_n_x_y<const N_COMP: usize, const X_S_F: usize, const Y_S_F: usize>(
        &self,
        out: &mut Array2DMut<'_, u16>,
        dim: (usize, usize),
    ) -> Result<()> {
        let sub_sampled = X_S_F != 1 || Y_S_F != 1;

        // One group per inner iteration: N_COMP samples for the fully
        // sampled formats, X_S_F*Y_S_F luma samples plus one Cb and one Cr
        // for the subsampled ones. A group advances the frame column by
        // X_S_F and the slice column by N_COMP*X_S_F.
        let slice_col_step = N_COMP * X_S_F;
        let frame_row_step = Y_S_F;
        let pixels_per_group = X_S_F * Y_S_F;
        let group_size = if sub_sampled { 2 + pixels_per_group } else { N_COMP };
        let cpp = if sub_sampled { 3 } else { 1 };
        let cols_per_group = if sub_sampled { group_size } else { cpp };

        let mut real_dim = dim;
        if sub_sampled {
            if real_dim.0 % group_size != 0 {
                return Err(Error::BadGroupAlignment(real_dim.0, group_size));
            }
            real_dim.0 /= group_size;
        }
        real_dim.0 *= X_S_F;
        real_dim.1 *= Y_S_F;

        for width in [self.slicing.slice_width, self.slicing.last_slice_width] {
            if width > real_dim.0 {
                return Err(Error::SliceTooWide);
            }
            if width % slice_col_step != 0 {
                return Err(Error::SliceWidthNotMultiple(width, slice_col_step));
            }
            if width % cpp != 0 {
                return Err(Error::SliceWidthNotMultiple(width, cpp));
            }
        }

        let sliced_area = self.frame.1 as u128 * self.slicing.total_width() as u128;
        if sliced_area < (cpp * real_dim.0 * real_dim.1) as u128 {
            return Err(Error::InsufficientSliceArea);
        }
        if self.frame.1 % frame_row_step != 0 {
            return Err(Error::BadFrameHeight(self.frame.1, frame_row_step));
        }
        if self.frame.0 % X_S_F != 0 {
            return Err(Error::BadGroupAlignment(self.frame.0, X_S_F));
        }

        let mut pred: [u16; N_COMP] = std::array::from_fn(|c| self.rec[c].init_pred);
        // Output position the predictors were last re-anchored at. On a
        // predictor reset the values come from this row, no matter where
        // the decoder is right now.
        let mut pred_next: (usize, usize) = (0, 0);

        let mut bs = BitPumpJpeg::new(self.input);

        let mut global_frame_col = 0usize;
        let mut global_frame_row = 0usize;
        for slice_id in 0..self.slicing.num_slices {
            let slice_width = self.slicing.width_of_slice(slice_id);

            let mut slice_frame_row = 0;
            while slice_frame_row < self.frame.1 {
                let row = global_frame_row % real_dim.1;
                let col = global_frame_row / real_dim.1 * self.slicing.width_of_slice(0) / cpp;
                if col >= real_dim.0 {
                    // The last frame row of an undersized final slice.
                    break;
                }

                debug_assert!(slice_width % cpp == 0);
                let pixels_per_slice_row = slice_width / cpp;
                if col + pixels_per_slice_row > real_dim.0 {
                    return Err(Error::BadSliceGeometry);
                }
                if slice_id + 1 == self.slicing.num_slices
                    && col + pixels_per_slice_row != real_dim.0
                {
                    return Err(Error::InsufficientSlices);
                }

                let row = row / Y_S_F;
                debug_assert!(col % X_S_F == 0);
                let mut col = col / X_S_F * cols_per_group;

                let mut slice_col = 0;
                while slice_col < slice_width {
                    // At every frame-row boundary the encoder reloaded its
                    // predictors from the previous anchor row, wherever the
                    // raster position happens to be in the sliced output.
                    if global_frame_col == self.frame.0 {
                        for (c, p) in pred.iter_mut().enumerate() {
                            let idx = if c == 0 { c } else { group_size - (N_COMP - c) };
                            *p = out.at(pred_next.0, pred_next.1 + idx);
                        }
                        pred_next = (row, col);
                        global_frame_col = 0;
                    }

                    // Samples we may decode before hitting the end of
                    // either the frame row (predictor change time) or the
                    // current slice row.
                    let remaining_in_frame_row =
                        slice_col_step * ((self.frame.0 - global_frame_col) / X_S_F);
                    let remaining_in_slice_row = slice_width - slice_col;
                    let cols_remaining = remaining_in_slice_row.min(remaining_in_frame_row);
                    debug_assert!(
                        cols_remaining >= slice_col_step && cols_remaining % slice_col_step == 0
                    );

                    let slice_col_end = slice_col + cols_remaining;
                    while slice_col < slice_col_end {
                        for p in 0..group_size {
                            let c = if p < pixels_per_group {
                                0
                            } else {
                                p - pixels_per_group + 1
                            };
                            let diff = self.rec[c].ht.decode_difference(&mut bs)?;
                            pred[c] = pred[c].wrapping_add(diff as u16);
                            out.set(row, col + p, pred[c]);
                        }
                        slice_col += slice_col_step;
                        global_frame_col += X_S_F;
                        col += group_size;
                    }
                }

                slice_frame_row += frame_row_step;
                global_frame_row += frame_row_step;
            }
        }
        Ok(())
    }
}
