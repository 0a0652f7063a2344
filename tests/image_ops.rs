// Copyright (c) the Rawcore Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! End-to-end checks of the raw image buffer operations: lookup tables,
//! region copies and the bad-pixel worker.

use rawcore::error::Result;
use rawcore::image::{
    DataTypeTag, RawImage, RawImageCurveGuard, RawImageWorkerTask, Rect, TableLookUp,
};

#[test]
fn set_with_lookup_variants() -> Result<()> {
    let raw = RawImage::create((4, 4), DataTypeTag::U16, 1)?;
    let mut random = 0u32;
    let mut dst = 0u16;

    // No table: the value passes through.
    raw.read().set_with_lookup(12345, &mut dst, &mut random);
    assert_eq!(dst, 12345);

    // Plain table: direct mapping.
    let doubled: Vec<u16> = (0..32768).map(|v| (v * 2) as u16).collect();
    raw.write().set_table(&doubled, false)?;
    raw.read().set_with_lookup(12345, &mut dst, &mut random);
    assert_eq!(dst, 24690);
    assert_eq!(random, 0, "plain lookup must not touch the dither state");

    // Dithered flat table: delta is zero, so the result ignores the
    // random state entirely.
    let flat = vec![4242u16; 65536];
    let table = TableLookUp::new(&flat, true)?;
    for seed in [0u32, 7, 0xffff_ffff] {
        let mut r = seed;
        assert_eq!(table.apply(12345, &mut r), 4242);
    }
    Ok(())
}

#[test]
fn set_with_lookup_is_deterministic() -> Result<()> {
    let curve: Vec<u16> = (0..65536).map(|v| ((v * 3) / 2) as u16 / 2).collect();
    let table = TableLookUp::new(&curve, true)?;
    let mut r1 = 99;
    let mut r2 = 99;
    for v in [0u16, 1, 1000, 30000, 65535] {
        assert_eq!(table.apply(v, &mut r1), table.apply(v, &mut r2));
        assert_eq!(r1, r2);
    }
    Ok(())
}

#[test]
fn blit_copies_only_the_target_region() -> Result<()> {
    let src = RawImage::create((8, 8), DataTypeTag::U16, 1)?;
    let dst = RawImage::create((8, 8), DataTypeTag::U16, 1)?;
    {
        let mut s = src.write();
        let mut view = s.u16_uncropped_mut()?;
        for y in 0..8 {
            for x in 0..8 {
                view.set(y, x, (100 + y * 8 + x) as u16);
            }
        }
    }
    {
        let mut d = dst.write();
        let src_guard = src.read();
        d.blit_from(&src_guard, (0, 0), (4, 4), (2, 2))?;
    }
    let d = dst.read();
    let view = d.u16_uncropped()?;
    for y in 0..8 {
        for x in 0..8 {
            let inside = (2..6).contains(&x) && (2..6).contains(&y);
            let expected = if inside {
                (100 + (y - 2) * 8 + (x - 2)) as u16
            } else {
                0
            };
            assert_eq!(view.at(y, x), expected, "pixel ({x}, {y})");
        }
    }
    Ok(())
}

#[test]
fn blit_rejects_out_of_bounds() -> Result<()> {
    let src = RawImage::create((4, 4), DataTypeTag::U16, 1)?;
    let dst = RawImage::create((4, 4), DataTypeTag::U16, 1)?;
    let mut d = dst.write();
    assert!(d.blit_from(&src.read(), (2, 2), (4, 4), (0, 0)).is_err());
    assert!(d.blit_from(&src.read(), (0, 0), (4, 4), (1, 0)).is_err());
    Ok(())
}

#[test]
fn fix_bad_pixels_worker_end_to_end() -> Result<()> {
    let raw = RawImage::create((12, 12), DataTypeTag::U16, 1)?;
    let mut img = raw.write();
    {
        let mut view = img.u16_uncropped_mut()?;
        for y in 0..12 {
            for x in 0..12 {
                view.set(y, x, 2000);
            }
        }
        // Garbage at three sensels.
        view.set(3, 3, 0);
        view.set(7, 8, 65535);
        view.set(10, 2, 1);
        // A hot but unflagged sensel two columns from the first bad pixel:
        // it sits in that pixel's same-color neighborhood and must not
        // drag the replacement value off the median (a mean would land
        // near 9250 here).
        view.set(3, 5, 60000);
    }
    img.mark_bad_pixel(3, 3);
    img.mark_bad_pixel(8, 7);
    img.mark_bad_pixel(2, 10);
    img.transfer_bad_pixels_to_map()?;
    img.start_worker(RawImageWorkerTask::FixBadPixels, true)?;

    let view = img.u16_uncropped()?;
    // Each fix lands on the median of its valid same-color neighborhood,
    // and the map entries are gone.
    for (x, y) in [(3usize, 3usize), (8, 7), (2, 10)] {
        assert_eq!(view.at(y, x), 2000, "pixel ({x}, {y})");
        assert!(!img.is_bad_pixel(x, y));
    }
    // The outlier itself was never flagged and stays put.
    assert_eq!(view.at(3, 5), 60000);
    Ok(())
}

#[test]
fn fix_bad_pixel_median_at_image_corner() -> Result<()> {
    // A corner pixel only has three valid same-color neighbors; the fix
    // must be their median, not their mean.
    let raw = RawImage::create((8, 8), DataTypeTag::U16, 1)?;
    let mut img = raw.write();
    {
        let mut view = img.u16_uncropped_mut()?;
        for y in 0..8 {
            for x in 0..8 {
                view.set(y, x, 300);
            }
        }
        view.set(0, 0, 44444);
        view.set(0, 2, 100);
        view.set(2, 0, 200);
        view.set(2, 2, 10000);
    }
    img.mark_bad_pixel(0, 0);
    img.fix_bad_pixels()?;
    let view = img.u16_uncropped()?;
    // Neighborhood values are {100, 200, 10000}: median 200, mean 3433.
    assert_eq!(view.at(0, 0), 200);
    Ok(())
}

#[test]
fn blit_round_trip_with_random_content() -> Result<()> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x00c0ffee);

    let src = RawImage::create((16, 16), DataTypeTag::U16, 1)?;
    let dst = RawImage::create((16, 16), DataTypeTag::U16, 1)?;
    let mut reference = [[0u16; 16]; 16];
    {
        let mut s = src.write();
        let mut view = s.u16_uncropped_mut()?;
        for (y, row) in reference.iter_mut().enumerate() {
            for (x, v) in row.iter_mut().enumerate() {
                *v = rng.gen();
                view.set(y, x, *v);
            }
        }
    }
    let size = (rng.gen_range(1..=8), rng.gen_range(1..=8));
    let src_pos = (rng.gen_range(0..8), rng.gen_range(0..8));
    let dst_pos = (rng.gen_range(0..8), rng.gen_range(0..8));
    dst.write().blit_from(&src.read(), src_pos, size, dst_pos)?;

    let d = dst.read();
    let view = d.u16_uncropped()?;
    for y in 0..16 {
        for x in 0..16 {
            let inside = (dst_pos.0..dst_pos.0 + size.0).contains(&x)
                && (dst_pos.1..dst_pos.1 + size.1).contains(&y);
            let expected = if inside {
                reference[y - dst_pos.1 + src_pos.1][x - dst_pos.0 + src_pos.0]
            } else {
                0
            };
            assert_eq!(view.at(y, x), expected, "pixel ({x}, {y})");
        }
    }
    Ok(())
}

#[test]
fn scale_values_worker_honors_crop() -> Result<()> {
    let raw = RawImage::create((8, 8), DataTypeTag::U16, 1)?;
    let mut img = raw.write();
    {
        let mut view = img.u16_uncropped_mut()?;
        for y in 0..8 {
            for x in 0..8 {
                view.set(y, x, 1000);
            }
        }
    }
    img.sub_frame(Rect::new((2, 2), (4, 4)));
    img.black_level = Some(0);
    img.white_point = 1000;
    img.scale_black_white()?;
    let view = img.u16_uncropped()?;
    // Inside the crop everything scaled to white; the border is untouched.
    assert_eq!(view.at(2, 2), 65535);
    assert_eq!(view.at(5, 5), 65535);
    assert_eq!(view.at(0, 0), 1000);
    assert_eq!(view.at(7, 7), 1000);
    Ok(())
}

#[test]
fn curve_guard_installs_and_removes_table() -> Result<()> {
    let raw = RawImage::create((4, 4), DataTypeTag::U16, 1)?;
    let curve: Vec<u16> = (0..1024).collect();
    {
        let _guard = RawImageCurveGuard::new(&raw, curve.clone(), false);
        assert!(raw.read().table().is_some());
        assert!(raw.read().table().unwrap().dither());
    }
    assert!(raw.read().table().is_none());

    {
        let _guard = RawImageCurveGuard::new(&raw, curve, true);
        assert!(raw.read().table().is_none());
    }
    // Uncorrected values keep the curve for later, undithered.
    assert!(raw.read().table().is_some());
    assert!(!raw.read().table().unwrap().dither());
    Ok(())
}
