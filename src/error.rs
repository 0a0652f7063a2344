// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::collections::TryReserveError;

use thiserror::Error;

use crate::image::DataTypeTag;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Read out of bounds")]
    OutOfBounds,
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),
    #[error("Image size too large: {0}x{1}")]
    ImageSizeTooLarge(usize, usize),
    #[error("Invalid image size: {0}x{1}")]
    InvalidImageSize(usize, usize),
    #[error("Unexpected image dimensions found: ({0}; {1})")]
    UnexpectedDimensions(usize, usize),
    #[error("Rect out of bounds: {0}x{1}+{2}+{3} rect in {4}x{5} view")]
    RectOutOfBounds(usize, usize, usize, usize, usize, usize),
    #[error("Image data already allocated")]
    AlreadyAllocated,
    #[error("Image data not yet allocated")]
    NotAllocated,
    #[error("Unexpected data type {0:?}")]
    UnexpectedDataType(DataTypeTag),
    #[error("Unexpected components per pixel: {0}")]
    UnexpectedCpp(usize),
    #[error("Blit source and destination are incompatible")]
    BlitMismatch,
    #[error("Lookup table has invalid size: {0}")]
    InvalidTableSize(usize),
    #[error("Lookup tables are not supported on floating-point images")]
    FloatLookup,
    // Huffman / lossless JPEG
    #[error("Invalid Huffman code lengths")]
    InvalidHuffman,
    #[error("Huffman code not found in table")]
    CodeNotFound,
    #[error("Huffman table is not of a full decoding variety")]
    NotFullDecode,
    // CR2
    #[error("Unknown CR2 format <{0},{1},{2}>")]
    UnknownCr2Format(usize, usize, usize),
    #[error("Cannot decode subsampled image to CFA data or vice versa")]
    SubsamplingMismatch,
    #[error("Huffman table / initial predictor count {0} does not match component count {1}")]
    RecipeCountMismatch(usize, usize),
    #[error("Bad slice width: {0}")]
    BadSliceWidth(usize),
    #[error("Slice width ({0}) should be multiple of {1}")]
    SliceWidthNotMultiple(usize, usize),
    #[error("Slice is wider than the image")]
    SliceTooWide,
    #[error("Incorrect slice height / slice widths, less than image size")]
    InsufficientSliceArea,
    #[error("Bad slice width / frame size / image size combination")]
    BadSliceGeometry,
    #[error("Insufficient slices - do not fill the entire image")]
    InsufficientSlices,
    #[error("Frame height {0} is not a multiple of the vertical sampling factor {1}")]
    BadFrameHeight(usize, usize),
    #[error("Image width {0} is not a multiple of the pixel group size {1}")]
    BadGroupAlignment(usize, usize),
    // VC-5
    #[error("Unknown (required) VC-5 tag 0x{0:04x}")]
    UnknownRequiredTag(u16),
    #[error("Invalid value 0x{1:04x} for VC-5 tag 0x{0:04x}")]
    InvalidTagValue(u16, u16),
    #[error("VC-5 codeblock seen before subband number was declared")]
    SubbandNotSet,
    #[error("VC-5 lowpass codeblock seen before lowpass precision was declared")]
    LowpassPrecisionNotSet,
    #[error("Inconsistent VC-5 stream dimensions {0}x{1}, image is {2}x{3}")]
    InconsistentDimensions(usize, usize, usize, usize),
    #[error("VC-5 channel dimensions {0}x{1} are not a multiple of 8")]
    UnsupportedChannelDimensions(usize, usize),
    #[error("Subband {0} was decoded twice")]
    DuplicateSubband(u16),
    #[error("Not all VC-5 subbands were decoded for channel {0}")]
    MissingBands(usize),
    #[error("Too many coefficients in highpass band")]
    BandOverflow,
    #[error("End-of-band marker reached before highpass band was filled")]
    ShortBand,
    #[error("Code not found in RLV codebook")]
    RlvCodeNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;
