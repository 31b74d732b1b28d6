use crate::error::{CatResult, Error};
use crate::lzw::{LzwPacker, MAX_WIDTH};
use crate::octree::Palette;
use crate::rect::Rect;
use imgref::ImgRef;
use rgb::RGB8;
use std::collections::HashMap;
use std::io::Write;

/// Streaming GIF89a writer.
///
/// The header goes out at construction; each frame carries its own graphic
/// control extension and local color table, so the logical screen has no
/// global one. Frames use disposal "none" and rely on the transparent index
/// to leave undamaged pixels showing through.
pub struct GifWriter<W: Write> {
    out: W,
    width: u16,
    height: u16,
    pal: Option<PaletteData>,
    looping_written: bool,
    images_written: u64,
    closed: bool,
}

struct PaletteData {
    colors: Vec<RGB8>,
    transparent: Option<u8>,
}

impl<W: Write> GifWriter<W> {
    /// Write the GIF89a header and logical screen descriptor to `out`.
    pub fn new(mut out: W, width: u16, height: u16) -> CatResult<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("screen size"));
        }
        out.write_all(b"GIF89a")?;
        out.write_all(&width.to_le_bytes())?;
        out.write_all(&height.to_le_bytes())?;
        // no global color table, background index 0, square pixels
        out.write_all(&[0, 0, 0])?;
        Ok(Self {
            out,
            width,
            height,
            pal: None,
            looping_written: false,
            images_written: 0,
            closed: false,
        })
    }

    /// The palette every following frame is indexed against. Must be called
    /// before the first `add_image`; the color table itself is written with
    /// each frame.
    pub fn set_palette(&mut self, palette: &Palette) {
        self.pal = Some(PaletteData {
            colors: palette.colors().to_vec(),
            transparent: palette.transparent_index(),
        });
    }

    /// Emit the Netscape 2.0 looping extension. Valid once, before the first
    /// frame.
    pub fn set_looping(&mut self) -> CatResult<()> {
        if self.looping_written || self.images_written > 0 {
            return Err(Error::InvalidState("set_looping"));
        }
        self.out.write_all(&[0x21, 0xFF, 0x0B])?;
        self.out.write_all(b"NETSCAPE2.0")?;
        // sub-block: loop forever
        self.out.write_all(&[0x03, 0x01, 0x00, 0x00, 0x00])?;
        self.looping_written = true;
        Ok(())
    }

    /// Write one frame at `rect` holding palette indices, shown for
    /// `delay_ms` (stored in 10 ms units).
    pub fn add_image(&mut self, rect: Rect, delay_ms: u32, image: ImgRef<'_, u8>) -> CatResult<()> {
        let pal = self.pal.as_ref().ok_or(Error::InvalidState("add_image"))?;
        let screen = Rect::new(0, 0, i32::from(self.width), i32::from(self.height));
        if !screen.contains(&rect) {
            return Err(Error::InvalidArgument("frame rect"));
        }
        if image.width() != rect.width as usize || image.height() != rect.height as usize {
            return Err(Error::InvalidArgument("frame size"));
        }

        let used = pal.colors.len() + usize::from(pal.transparent.is_some());
        let table_len = used.max(2).next_power_of_two();
        let size_exp = table_len.trailing_zeros() as u8;

        // graphic control extension
        let flags = u8::from(pal.transparent.is_some());
        let delay = (delay_ms / 10).min(u32::from(u16::MAX)) as u16;
        self.out.write_all(&[0x21, 0xF9, 0x04, flags])?;
        self.out.write_all(&delay.to_le_bytes())?;
        self.out.write_all(&[pal.transparent.unwrap_or(0), 0x00])?;

        // image descriptor with a local color table
        self.out.write_all(&[0x2C])?;
        self.out.write_all(&(rect.x as u16).to_le_bytes())?;
        self.out.write_all(&(rect.y as u16).to_le_bytes())?;
        self.out.write_all(&(rect.width as u16).to_le_bytes())?;
        self.out.write_all(&(rect.height as u16).to_le_bytes())?;
        self.out.write_all(&[0x80 | (size_exp - 1)])?;
        for c in &pal.colors {
            self.out.write_all(&[c.r, c.g, c.b])?;
        }
        for _ in pal.colors.len()..table_len {
            self.out.write_all(&[0, 0, 0])?;
        }

        Self::write_image_data(&mut self.out, size_exp.max(2), image)?;
        self.images_written += 1;
        Ok(())
    }

    /// LZW-compress `image` row by row; the dictionary lives here, the bit
    /// and sub-block packing in `LzwPacker`.
    fn write_image_data(out: &mut W, min_code_size: u8, image: ImgRef<'_, u8>) -> CatResult<()> {
        let mut packer = LzwPacker::new(out, min_code_size)?;
        let mut table: HashMap<(u16, u8), u16> = HashMap::new();
        let mut next = packer.first_free_code();
        let mut prefix: Option<u16> = None;
        for row in image.rows() {
            for &px in row {
                debug_assert!(u16::from(px) < packer.clear_code());
                let Some(p) = prefix else {
                    prefix = Some(u16::from(px));
                    continue;
                };
                if let Some(&code) = table.get(&(p, px)) {
                    prefix = Some(code);
                } else {
                    if packer.write_code(p)? {
                        // the packer cleared; start a fresh dictionary
                        table.clear();
                        next = packer.first_free_code();
                    } else if next < 1 << MAX_WIDTH {
                        table.insert((p, px), next);
                        next += 1;
                    }
                    prefix = Some(u16::from(px));
                }
            }
        }
        if let Some(p) = prefix {
            packer.write_code(p)?;
        }
        packer.finish()?;
        Ok(())
    }

    /// Write the trailer and flush. Safe to call more than once.
    pub fn close(&mut self) -> CatResult<()> {
        if !self.closed {
            self.out.write_all(&[0x3B])?;
            self.out.flush()?;
            self.closed = true;
        }
        Ok(())
    }
}
