// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::fmt;

/// One sensel color of the color filter array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaColor {
    Red,
    Green,
    Blue,
    /// The second green of an RGGB-style pattern, where a camera
    /// distinguishes the two.
    Green2,
}

/// The Bayer-like mosaic layout of a sensor.
///
/// The pattern repeats every `size` pixels in both directions, anchored at
/// the top-left of the uncropped image.
#[derive(Clone, PartialEq, Eq)]
pub struct ColorFilterArray {
    size: (usize, usize),
    pattern: Vec<CfaColor>,
}

impl fmt::Debug for ColorFilterArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CFA {}x{} {:?}", self.size.0, self.size.1, self.pattern)
    }
}

impl ColorFilterArray {
    pub fn new(size: (usize, usize), pattern: Vec<CfaColor>) -> ColorFilterArray {
        assert_eq!(size.0 * size.1, pattern.len());
        ColorFilterArray { size, pattern }
    }

    pub fn rggb() -> ColorFilterArray {
        use CfaColor::*;
        ColorFilterArray::new((2, 2), vec![Red, Green, Green2, Blue])
    }

    pub fn bggr() -> ColorFilterArray {
        use CfaColor::*;
        ColorFilterArray::new((2, 2), vec![Blue, Green, Green2, Red])
    }

    pub fn grbg() -> ColorFilterArray {
        use CfaColor::*;
        ColorFilterArray::new((2, 2), vec![Green, Red, Blue, Green2])
    }

    pub fn gbrg() -> ColorFilterArray {
        use CfaColor::*;
        ColorFilterArray::new((2, 2), vec![Green, Blue, Red, Green2])
    }

    pub fn size(&self) -> (usize, usize) {
        self.size
    }

    pub fn color_at(&self, x: usize, y: usize) -> CfaColor {
        self.pattern[(y % self.size.1) * self.size.0 + x % self.size.0]
    }

    /// The same mosaic as seen from an origin shifted by `(dx, dy)`,
    /// e.g. after cropping.
    pub fn shifted(&self, dx: usize, dy: usize) -> ColorFilterArray {
        let (w, h) = self.size;
        let pattern = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| self.color_at(x + dx, y + dy))
            .collect();
        ColorFilterArray::new(self.size, pattern)
    }

    /// Distance to the nearest sensel of the same color as `(x, y)`, per
    /// axis. On a 2x2 Bayer pattern this is 2 in both directions.
    pub fn same_color_spacing(&self, x: usize, y: usize) -> (usize, usize) {
        let color = self.color_at(x, y);
        let sx = (1..=self.size.0)
            .find(|&d| self.color_at(x + d, y) == color)
            .unwrap_or(self.size.0);
        let sy = (1..=self.size.1)
            .find(|&d| self.color_at(x, y + d) == color)
            .unwrap_or(self.size.1);
        (sx, sy)
    }
}

impl Default for ColorFilterArray {
    fn default() -> Self {
        ColorFilterArray::rggb()
    }
}
