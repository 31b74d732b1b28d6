use crate::image::PixelView;
use crate::octree::Palette;

/// Floyd–Steinberg dithering into an indexed frame buffer.
///
/// One instance lives on the encoder thread; the error rows are scratch that
/// is cleared on every call.
pub struct Ditherer {
    /// Two rows of per-channel residuals in 1/16 units, one pixel of padding
    /// on each side
    errors: Vec<i32>,
}

impl Ditherer {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Quantize `src` through `palette` and write the palette indices to
    /// `dst`, which addresses the destination rect's top-left pixel and is
    /// `dst_stride` bytes per row.
    pub fn dither_into(&mut self, dst: &mut [u8], dst_stride: usize, src: PixelView<'_>, palette: &Palette) {
        let width = src.width();
        let row = 3 * (width + 2);
        self.errors.clear();
        self.errors.resize(2 * row, 0);
        let (mut cur, mut next) = self.errors.split_at_mut(row);

        for y in 0..src.height() {
            for x in 0..width {
                let px = src.rgb(x, y);
                let want = [
                    clamp(i32::from(px.r) + cur[3 * (x + 1)] / 16),
                    clamp(i32::from(px.g) + cur[3 * (x + 1) + 1] / 16),
                    clamp(i32::from(px.b) + cur[3 * (x + 1) + 2] / 16),
                ];
                let (id, got) = palette.lookup(rgb::RGB8::new(want[0] as u8, want[1] as u8, want[2] as u8));
                dst[y * dst_stride + x] = id;

                let got = [i32::from(got.r), i32::from(got.g), i32::from(got.b)];
                for c in 0..3 {
                    let err = want[c] - got[c];
                    cur[3 * (x + 2) + c] += err * 7;
                    next[3 * x + c] += err * 3;
                    next[3 * (x + 1) + c] += err * 5;
                    next[3 * (x + 2) + c] += err;
                }
            }
            std::mem::swap(&mut cur, &mut next);
            next.fill(0);
        }
    }
}

#[inline]
fn clamp(v: i32) -> i32 {
    v.clamp(0, 255)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ByteOrder, PixelFormat};
    use rgb::RGB8;

    const RGB24: PixelFormat = PixelFormat { bpp: 3, byte_order: ByteOrder::BigEndian };

    fn palette_of(colors: &[RGB8]) -> Palette {
        let mut data = Vec::new();
        for c in colors {
            data.extend_from_slice(&[c.r, c.g, c.b]);
        }
        let view = PixelView::new(&data, colors.len(), 1, colors.len() * 3, RGB24);
        Palette::quantize(view, 256, false).unwrap()
    }

    #[test]
    fn solid_color_stays_solid() {
        let pal = palette_of(&[RGB8::new(10, 20, 30), RGB8::new(200, 200, 200)]);
        let src_data = vec![10, 20, 30].repeat(16);
        let src = PixelView::new(&src_data, 4, 4, 12, RGB24);
        let mut dst = vec![0xFFu8; 16];
        Ditherer::new().dither_into(&mut dst, 4, src, &pal);
        let expect = pal.lookup(RGB8::new(10, 20, 30)).0;
        assert!(dst.iter().all(|&i| i == expect));
    }

    #[test]
    fn gray_on_black_and_white_mixes() {
        let pal = palette_of(&[RGB8::new(0, 0, 0), RGB8::new(255, 255, 255)]);
        let src_data = vec![128u8; 8 * 8 * 3];
        let src = PixelView::new(&src_data, 8, 8, 24, RGB24);
        let mut dst = vec![0u8; 64];
        Ditherer::new().dither_into(&mut dst, 8, src, &pal);
        let white = pal.lookup(RGB8::new(255, 255, 255)).0;
        let lit = dst.iter().filter(|&&i| i == white).count();
        // error diffusion should turn flat gray into a roughly even mix
        assert!((16..=48).contains(&lit), "got {lit} of 64 white pixels");
    }

    #[test]
    fn respects_destination_stride() {
        let pal = palette_of(&[RGB8::new(0, 0, 0), RGB8::new(255, 255, 255)]);
        let src_data = vec![255u8; 2 * 2 * 3];
        let src = PixelView::new(&src_data, 2, 2, 6, RGB24);
        // dither a 2x2 window into the middle of a 4-wide buffer
        let mut dst = vec![9u8; 16];
        let white = pal.lookup(RGB8::new(255, 255, 255)).0;
        Ditherer::new().dither_into(&mut dst[5..], 4, src, &pal);
        for y in 0..4 {
            for x in 0..4 {
                let expect = if (1..3).contains(&x) && (1..3).contains(&y) { white } else { 9 };
                assert_eq!(dst[y * 4 + x], expect, "at {x},{y}");
            }
        }
    }
}
