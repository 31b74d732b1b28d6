use crate::rect::Rect;
use rgb::RGB8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Layout of one captured pixel as delivered by the capture source.
///
/// `bpp` is 3 or 4 bytes per pixel; with 4 the alpha/pad lane sits at byte
/// `[0]` for big-endian and `[3]` for little-endian buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bpp: u8,
    pub byte_order: ByteOrder,
}

impl PixelFormat {
    #[inline]
    pub fn bytes_per_pixel(&self) -> usize {
        self.bpp as usize
    }
}

/// An owned raster captured from the screen.
///
/// `rect` places the image on the screen; pixel storage is row-major with
/// `stride` bytes per row and no sub-byte packing.
pub struct Image {
    rect: Rect,
    format: PixelFormat,
    stride: usize,
    pixels: Vec<u8>,
}

impl Image {
    pub fn new(rect: Rect, format: PixelFormat) -> Self {
        let stride = rect.width as usize * format.bytes_per_pixel();
        Self {
            rect,
            format,
            stride,
            pixels: vec![0; stride * rect.height as usize],
        }
    }

    #[inline]
    pub fn rect(&self) -> Rect {
        self.rect
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Total buffer size; this is what the frame cache accounts.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// Mutable bytes of the rows covered by `local` (image-local coordinates),
    /// starting at its top-left pixel, for the capture source to blit into.
    pub fn rows_mut(&mut self, local: Rect) -> &mut [u8] {
        debug_assert!(Rect::new(0, 0, self.rect.width, self.rect.height).contains(&local));
        let bpp = self.format.bytes_per_pixel();
        let start = local.y as usize * self.stride + local.x as usize * bpp;
        let end = (local.bottom() as usize - 1) * self.stride + local.right() as usize * bpp;
        &mut self.pixels[start..end]
    }

    /// Raw bytes of each row of `local`, `width * bpp` bytes per row.
    pub fn rect_rows(&self, local: Rect) -> impl Iterator<Item = &[u8]> + '_ {
        debug_assert!(Rect::new(0, 0, self.rect.width, self.rect.height).contains(&local));
        let bpp = self.format.bytes_per_pixel();
        let len = local.width as usize * bpp;
        (local.y..local.bottom()).map(move |y| {
            let start = y as usize * self.stride + local.x as usize * bpp;
            &self.pixels[start..start + len]
        })
    }

    /// Read-only view of a sub-rect in image-local coordinates.
    pub fn view(&self, local: Rect) -> PixelView<'_> {
        debug_assert!(Rect::new(0, 0, self.rect.width, self.rect.height).contains(&local));
        let bpp = self.format.bytes_per_pixel();
        let start = local.y as usize * self.stride + local.x as usize * bpp;
        let end = (local.bottom() as usize - 1) * self.stride + local.right() as usize * bpp;
        PixelView {
            data: &self.pixels[start..end],
            width: local.width as usize,
            height: local.height as usize,
            stride: self.stride,
            format: self.format,
        }
    }

    pub fn full_view(&self) -> PixelView<'_> {
        self.view(Rect::new(0, 0, self.rect.width, self.rect.height))
    }
}

/// Borrowed window into raw captured bytes, decoding 24-bit RGB on read.
#[derive(Clone, Copy)]
pub struct PixelView<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    stride: usize,
    format: PixelFormat,
}

impl<'a> PixelView<'a> {
    /// `data` starts at the first pixel of the window; the final row may be
    /// shorter than `stride`.
    pub fn new(data: &'a [u8], width: usize, height: usize, stride: usize, format: PixelFormat) -> Self {
        debug_assert!(data.len() >= (height - 1) * stride + width * format.bytes_per_pixel());
        Self { data, width, height, stride, format }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn rgb(&self, x: usize, y: usize) -> RGB8 {
        debug_assert!(x < self.width && y < self.height);
        let p = &self.data[y * self.stride + x * self.format.bytes_per_pixel()..];
        match self.format.byte_order {
            // B, G, R, (pad)
            ByteOrder::LittleEndian => RGB8::new(p[2], p[1], p[0]),
            // (pad,) R, G, B
            ByteOrder::BigEndian => {
                let skip = if self.format.bpp == 4 { 1 } else { 0 };
                RGB8::new(p[skip], p[skip + 1], p[skip + 2])
            },
        }
    }

    /// All pixels, row-major.
    pub fn pixels(&self) -> impl Iterator<Item = RGB8> + '_ {
        (0..self.height).flat_map(move |y| (0..self.width).map(move |x| self.rgb(x, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LE4: PixelFormat = PixelFormat { bpp: 4, byte_order: ByteOrder::LittleEndian };
    const BE4: PixelFormat = PixelFormat { bpp: 4, byte_order: ByteOrder::BigEndian };
    const BE3: PixelFormat = PixelFormat { bpp: 3, byte_order: ByteOrder::BigEndian };

    #[test]
    fn pad_lane_is_skipped() {
        // one pixel (r,g,b) = (1,2,3) in each layout
        let le = [3u8, 2, 1, 0xAA];
        let be = [0xAA, 1, 2, 3];
        let packed = [1u8, 2, 3];
        assert_eq!(PixelView::new(&le, 1, 1, 4, LE4).rgb(0, 0), RGB8::new(1, 2, 3));
        assert_eq!(PixelView::new(&be, 1, 1, 4, BE4).rgb(0, 0), RGB8::new(1, 2, 3));
        assert_eq!(PixelView::new(&packed, 1, 1, 3, BE3).rgb(0, 0), RGB8::new(1, 2, 3));
    }

    #[test]
    fn subview_respects_stride() {
        let mut img = Image::new(Rect::new(0, 0, 4, 4), BE3);
        // paint pixel (2,1) red through the blit window
        img.rows_mut(Rect::new(2, 1, 2, 2))[0] = 0xFF;
        let view = img.view(Rect::new(2, 1, 2, 2));
        assert_eq!(view.rgb(0, 0), RGB8::new(0xFF, 0, 0));
        assert_eq!(view.rgb(1, 1), RGB8::new(0, 0, 0));
        assert_eq!(img.full_view().rgb(2, 1), RGB8::new(0xFF, 0, 0));
        assert_eq!(view.pixels().count(), 4);
    }
}
