// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Bounded random-access reader over a byte range.
///
/// All reads are bounds-checked and fail with [`Error::UnexpectedEof`] past
/// the end of the range. Multi-byte reads honor the stream's endianness.
/// ```
/// # use rawcore::byte_stream::{ByteStream, Endianness};
/// let mut bs = ByteStream::new(&[0x12, 0x34, 0x56, 0x78], Endianness::Big);
/// assert_eq!(bs.get_u16()?, 0x1234);
/// assert_eq!(bs.position(), 2);
/// assert_eq!(bs.get_u16()?, 0x5678);
/// assert!(bs.get_u8().is_err());
/// # Ok::<(), rawcore::error::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct ByteStream<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endianness,
}

impl<'a> ByteStream<'a> {
    pub fn new(data: &'a [u8], endian: Endianness) -> ByteStream<'a> {
        ByteStream {
            data,
            pos: 0,
            endian,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Checks that at least `n` more bytes can be read.
    pub fn check(&self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::UnexpectedEof);
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.check(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let bytes = self.get_bytes(2)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u16(bytes),
            Endianness::Big => BigEndian::read_u16(bytes),
        })
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.get_bytes(4)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u32(bytes),
            Endianness::Big => BigEndian::read_u32(bytes),
        })
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.check(n)?;
        let ret = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(ret)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check(n)?;
        self.pos += n;
        Ok(())
    }

    /// Splits off a bounded sub-stream covering the next `n` bytes and
    /// advances this stream past them.
    pub fn sub_stream(&mut self, n: usize) -> Result<ByteStream<'a>> {
        Ok(ByteStream::new(self.get_bytes(n)?, self.endian))
    }

    /// The bytes that have not been consumed yet.
    pub fn peek_remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
