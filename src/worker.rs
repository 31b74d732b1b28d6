//! The encoder thread.
//!
//! Frames arrive over the job queue in capture order. The first one builds
//! the palette; every later one is dithered into the shared frame buffer
//! and written out when the *next* frame fixes its display time. In spill
//! mode incoming frames are parked on disk instead and drained whenever the
//! queue is quiet, so the output order always matches the capture order.

use crate::cache::{FrameCache, SpillStore, StoredFrame};
use crate::dither::Ditherer;
use crate::error::{CatResult, Error};
use crate::gifenc::GifWriter;
use crate::image::{Image, PixelFormat, PixelView};
use crate::octree::Palette;
use crate::rect::Rect;
use crate::region::Region;
use crossbeam_channel::{Receiver, TryRecvError};
use imgref::Img;
use log::debug;
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bias added to every frame delay on top of the measured frame distance.
const DELAY_BIAS: Duration = Duration::from_millis(5);
/// One GIF timing tick; delays below this are bumped up to it.
const MIN_DELAY: Duration = Duration::from_millis(10);

pub(crate) struct Frame {
    pub ts: Instant,
    /// Dirty region in image-local coordinates
    pub region: Region,
    pub image: Image,
}

pub(crate) enum Job {
    Quantize(Frame),
    Encode(Frame),
    UseSpill,
    Quit(Instant),
}

/// The frame currently sitting in the dither buffer, waiting for the next
/// timestamp to fix its delay.
#[derive(Clone, Copy)]
struct PendingFrame {
    rect: Rect,
    ts: Instant,
}

pub(crate) struct EncoderWorker<W: Write> {
    jobs: Receiver<Job>,
    cache: Arc<FrameCache>,
    gif: GifWriter<W>,
    area: Rect,
    max_colors: u16,
    looping: bool,
    palette: Option<Palette>,
    transparent: u8,
    /// Palette indices for the whole capture area
    buf: Vec<u8>,
    pending: Option<PendingFrame>,
    ditherer: Ditherer,
}

impl<W: Write> EncoderWorker<W> {
    pub fn new(
        jobs: Receiver<Job>,
        cache: Arc<FrameCache>,
        gif: GifWriter<W>,
        area: Rect,
        max_colors: u16,
        looping: bool,
    ) -> Self {
        Self {
            jobs,
            cache,
            gif,
            area,
            max_colors,
            looping,
            palette: None,
            transparent: 0,
            buf: Vec::new(),
            pending: None,
            ditherer: Ditherer::new(),
        }
    }

    pub fn run(mut self) -> CatResult<()> {
        // the spill store holds open files, so it lives and dies here
        let mut spill: Option<SpillStore> = None;
        let result = self.run_loop(&mut spill);
        if let Some(ref mut spill) = spill {
            spill.cleanup();
        }
        result
    }

    fn run_loop(&mut self, spill: &mut Option<SpillStore>) -> CatResult<()> {
        let quit_ts = loop {
            let job = match spill {
                Some(ref mut s) if !s.is_empty() => match self.jobs.try_recv() {
                    Ok(job) => job,
                    Err(TryRecvError::Empty) => {
                        // drain the disk while the queue is quiet
                        if let Some(stored) = s.pop() {
                            self.encode_stored(s, stored)?;
                        }
                        continue;
                    },
                    Err(TryRecvError::Disconnected) => return Err(Error::ThreadSend),
                },
                _ => self.jobs.recv().map_err(|_| Error::ThreadSend)?,
            };
            match job {
                Job::Quantize(frame) => self.quantize(frame)?,
                Job::Encode(frame) => match spill {
                    Some(ref mut s) => self.spill_or_encode(s, frame)?,
                    None => self.encode_live(frame)?,
                },
                Job::UseSpill => {
                    if spill.is_none() {
                        debug!("switching to the spill tier");
                        *spill = Some(SpillStore::new(Arc::clone(&self.cache)));
                    }
                },
                Job::Quit(ts) => break ts,
            }
        };

        if let Some(ref mut s) = spill {
            while let Some(stored) = s.pop() {
                self.encode_stored(s, stored)?;
            }
        }
        self.emit_pending(quit_ts)?;
        self.gif.close()?;
        Ok(())
    }

    /// Build the palette from the initial full-frame snapshot and paint it
    /// into the frame buffer as the first pending frame.
    fn quantize(&mut self, frame: Frame) -> CatResult<()> {
        if self.palette.is_some() {
            return Err(Error::InvalidState("quantize"));
        }
        let palette = Palette::quantize(frame.image.full_view(), self.max_colors, true)?;
        self.gif.set_palette(&palette);
        if self.looping {
            self.gif.set_looping()?;
        }
        self.transparent = palette.transparent_index().unwrap_or(0);
        self.buf = vec![self.transparent; self.area.area()];
        self.palette = Some(palette);

        let stride = self.area.width as usize;
        let palette = self.palette.as_ref().ok_or(Error::ThreadSend)?;
        let clip = dither_region(
            &mut self.ditherer,
            &mut self.buf,
            stride,
            palette,
            self.transparent,
            &frame.region,
            &mut LivePixels(&frame.image),
        )?;
        self.pending = Some(PendingFrame { rect: clip, ts: frame.ts });
        self.cache.release(frame.image);
        Ok(())
    }

    /// Emit the previous frame, then dither this one into the buffer.
    fn encode_live(&mut self, frame: Frame) -> CatResult<()> {
        self.emit_pending(frame.ts)?;
        let stride = self.area.width as usize;
        let transparent = self.transparent;
        let palette = self.palette.as_ref().ok_or(Error::InvalidState("encode"))?;
        let clip = dither_region(
            &mut self.ditherer,
            &mut self.buf,
            stride,
            palette,
            transparent,
            &frame.region,
            &mut LivePixels(&frame.image),
        )?;
        self.pending = Some(PendingFrame { rect: clip, ts: frame.ts });
        self.cache.release(frame.image);
        Ok(())
    }

    /// Same as `encode_live`, with the pixels read back from a spill file.
    fn encode_stored(&mut self, spill: &mut SpillStore, stored: StoredFrame) -> CatResult<()> {
        self.emit_pending(stored.ts)?;
        stored.file.borrow_mut().seek(SeekFrom::Start(stored.offset))?;
        let stride = self.area.width as usize;
        let transparent = self.transparent;
        let palette = self.palette.as_ref().ok_or(Error::InvalidState("encode"))?;
        let mut src = SpilledPixels {
            file: &stored.file,
            buf: &mut spill.read_buf,
            format: stored.format,
        };
        let clip = dither_region(
            &mut self.ditherer,
            &mut self.buf,
            stride,
            palette,
            transparent,
            &stored.region,
            &mut src,
        )?;
        self.pending = Some(PendingFrame { rect: clip, ts: stored.ts });
        spill.retire(stored)?;
        Ok(())
    }

    /// Park the frame on disk, draining old frames to make room. Without
    /// room and with the disk queue empty, frame order still holds, so the
    /// frame is encoded directly.
    fn spill_or_encode(&mut self, spill: &mut SpillStore, frame: Frame) -> CatResult<()> {
        loop {
            if spill.store(frame.ts, &frame.region, &frame.image)? {
                break;
            }
            match spill.pop() {
                Some(stored) => self.encode_stored(spill, stored)?,
                None => return self.encode_live(frame),
            }
        }
        self.cache.release(frame.image);
        Ok(())
    }

    /// Write the buffered frame; `ts` is when the following frame replaces
    /// it on screen, which fixes its delay.
    fn emit_pending(&mut self, ts: Instant) -> CatResult<()> {
        let Some(pending) = self.pending else {
            return Ok(());
        };
        let delay = (ts.saturating_duration_since(pending.ts) + DELAY_BIAS).max(MIN_DELAY);
        self.pending = Some(PendingFrame { rect: pending.rect, ts });

        let rect = pending.rect;
        let stride = self.area.width as usize;
        let start = rect.y as usize * stride + rect.x as usize;
        let end = (rect.bottom() as usize - 1) * stride + rect.right() as usize;
        let image = Img::new_stride(&self.buf[start..end], rect.width as usize, rect.height as usize, stride);
        self.gif.add_image(rect, delay.as_millis() as u32, image)
    }
}

/// Source of raw pixels for one dirty rect at a time.
trait RectPixels {
    fn pixels(&mut self, rect: Rect) -> CatResult<PixelView<'_>>;
}

struct LivePixels<'a>(&'a Image);

impl RectPixels for LivePixels<'_> {
    fn pixels(&mut self, rect: Rect) -> CatResult<PixelView<'_>> {
        Ok(self.0.view(rect))
    }
}

/// Reads rects sequentially from a spill file; rects must be requested in
/// the same region order they were written in.
struct SpilledPixels<'a> {
    file: &'a RefCell<File>,
    buf: &'a mut Vec<u8>,
    format: PixelFormat,
}

impl RectPixels for SpilledPixels<'_> {
    fn pixels(&mut self, rect: Rect) -> CatResult<PixelView<'_>> {
        let bpp = self.format.bytes_per_pixel();
        let len = rect.area() * bpp;
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
        self.file.borrow_mut().read_exact(&mut self.buf[..len])?;
        Ok(PixelView::new(
            &self.buf[..len],
            rect.width as usize,
            rect.height as usize,
            rect.width as usize * bpp,
            self.format,
        ))
    }
}

/// Dither every rect of `region` into the frame buffer, then blank the rest
/// of the region's clipbox to the transparent index. Returns the clipbox.
fn dither_region(
    ditherer: &mut Ditherer,
    buf: &mut [u8],
    stride: usize,
    palette: &Palette,
    transparent: u8,
    region: &Region,
    src: &mut dyn RectPixels,
) -> CatResult<Rect> {
    let clip = region.clipbox().ok_or(Error::InvalidArgument("empty region"))?;
    for rect in region.rects() {
        let view = src.pixels(rect)?;
        let offset = rect.y as usize * stride + rect.x as usize;
        ditherer.dither_into(&mut buf[offset..], stride, view, palette);
    }
    let mut rest = Region::from_rect(clip);
    rest.subtract(region);
    for rect in rest.rects() {
        for y in rect.y..rect.bottom() {
            let start = y as usize * stride + rect.x as usize;
            buf[start..start + rect.width as usize].fill(transparent);
        }
    }
    Ok(clip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ByteOrder;
    use crossbeam_channel::unbounded;
    use rgb::RGB8;

    const FMT: PixelFormat = PixelFormat { bpp: 4, byte_order: ByteOrder::LittleEndian };

    fn solid_image(area: Rect, rgb: RGB8) -> Image {
        let mut image = Image::new(area, FMT);
        let local = Rect::new(0, 0, area.width, area.height);
        for chunk in image.rows_mut(local).chunks_exact_mut(4) {
            chunk.copy_from_slice(&[rgb.b, rgb.g, rgb.r, 0]);
        }
        image
    }

    fn full_frame(area: Rect, rgb: RGB8, ts: Instant) -> Frame {
        Frame {
            ts,
            region: Region::from_rect(Rect::new(0, 0, area.width, area.height)),
            image: solid_image(area, rgb),
        }
    }

    fn decode(data: &[u8]) -> Vec<(gif::Frame<'static>, Vec<u8>)> {
        let mut opts = gif::DecodeOptions::new();
        opts.set_color_output(gif::ColorOutput::Indexed);
        let mut decoder = opts.read_info(data).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.read_next_frame().unwrap() {
            frames.push((frame.clone(), frame.buffer.to_vec()));
        }
        frames
    }

    fn run_worker(area: Rect, looping: bool, jobs: Vec<Job>) -> Vec<u8> {
        let (tx, rx) = unbounded();
        let cache = Arc::new(FrameCache::new(1 << 24, 1 << 24));
        let mut out = Vec::new();
        let gif = GifWriter::new(&mut out, area.width as u16, area.height as u16).unwrap();
        let worker = EncoderWorker::new(rx, cache, gif, area, 255, looping);
        for job in jobs {
            tx.send(job).unwrap();
        }
        drop(tx);
        worker.run().unwrap();
        out
    }

    #[test]
    fn quantize_alone_still_produces_one_frame() {
        let area = Rect::new(0, 0, 10, 10);
        let t0 = Instant::now();
        let white = RGB8::new(255, 255, 255);
        let out = run_worker(area, false, vec![
            Job::Quantize(full_frame(area, white, t0)),
            Job::Quit(t0 + Duration::from_millis(50)),
        ]);
        let frames = decode(&out);
        assert_eq!(frames.len(), 1);
        let (frame, pixels) = &frames[0];
        assert_eq!((frame.width, frame.height), (10, 10));
        // 55 ms rounds down to 5 ticks
        assert_eq!(frame.delay, 5);
        // a white screen quantizes to a single color at index 0
        assert!(pixels.iter().all(|&i| i == 0));
    }

    #[test]
    fn damage_becomes_a_sub_rect_frame() {
        let area = Rect::new(0, 0, 10, 10);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(100);
        let t2 = t1 + Duration::from_millis(40);

        let mut second = Frame {
            ts: t1,
            region: Region::from_rect(Rect::new(2, 3, 4, 2)),
            image: solid_image(area, RGB8::new(0, 0, 0)),
        };
        second.region.union_rect(Rect::new(2, 5, 1, 1));

        let out = run_worker(area, true, vec![
            Job::Quantize(full_frame(area, RGB8::new(255, 255, 255), t0)),
            Job::Encode(second),
            Job::Quit(t2),
        ]);
        let frames = decode(&out);
        assert_eq!(frames.len(), 2);

        // initial frame shown for 105 ms
        assert_eq!(frames[0].0.delay, 10);
        assert_eq!((frames[0].0.left, frames[0].0.top), (0, 0));

        // second frame covers the damage clipbox and is shown for 45 ms
        let (frame, pixels) = &frames[1];
        assert_eq!((frame.left, frame.top, frame.width, frame.height), (2, 3, 4, 3));
        assert_eq!(frame.delay, 4);
        let transparent = frame.transparent.unwrap();
        // damaged pixels are black, the rest of the clipbox is transparent
        let idx = |x: usize, y: usize| pixels[y * 4 + x];
        assert_ne!(idx(0, 0), transparent);
        assert_ne!(idx(3, 1), transparent);
        assert_ne!(idx(0, 2), transparent);
        assert_eq!(idx(1, 2), transparent);
        assert_eq!(idx(3, 2), transparent);

        assert!(out.windows(11).any(|w| w == b"NETSCAPE2.0"));
    }

    #[test]
    fn min_delay_is_one_tick() {
        let area = Rect::new(0, 0, 4, 4);
        let t0 = Instant::now();
        let out = run_worker(area, false, vec![
            Job::Quantize(full_frame(area, RGB8::new(1, 2, 3), t0)),
            Job::Encode(full_frame(area, RGB8::new(200, 100, 50), t0 + Duration::from_millis(1))),
            Job::Quit(t0 + Duration::from_millis(2)),
        ]);
        let frames = decode(&out);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.delay, 1);
        assert_eq!(frames[1].0.delay, 1);
    }

    #[test]
    fn spill_mode_keeps_every_frame_in_order() {
        let area = Rect::new(0, 0, 8, 8);
        let (tx, rx) = unbounded();
        let cache = Arc::new(FrameCache::new(1 << 24, 1 << 24));
        let mut out = Vec::new();
        let gif = GifWriter::new(&mut out, 8, 8).unwrap();
        let worker = EncoderWorker::new(rx, Arc::clone(&cache), gif, area, 255, false);

        let t0 = Instant::now();
        tx.send(Job::Quantize(full_frame(area, RGB8::new(255, 255, 255), t0))).unwrap();
        tx.send(Job::UseSpill).unwrap();
        for i in 1..=20u64 {
            let shade = RGB8::new(i as u8 * 12, 0, 0);
            tx.send(Job::Encode(full_frame(area, shade, t0 + Duration::from_millis(40 * i)))).unwrap();
        }
        tx.send(Job::Quit(t0 + Duration::from_millis(40 * 21))).unwrap();
        drop(tx);
        worker.run().unwrap();

        let frames = decode(&out);
        assert_eq!(frames.len(), 21);
        for (frame, _) in &frames {
            assert_eq!(frame.delay, 4);
        }
        // everything parked on disk was drained and unaccounted again
        assert_eq!(cache.spill_bytes(), 0);
    }

    #[test]
    fn zero_spill_budget_encodes_directly() {
        let area = Rect::new(0, 0, 4, 4);
        let (tx, rx) = unbounded();
        let cache = Arc::new(FrameCache::new(1 << 20, 0));
        let mut out = Vec::new();
        let gif = GifWriter::new(&mut out, 4, 4).unwrap();
        let worker = EncoderWorker::new(rx, cache, gif, area, 255, false);
        let t0 = Instant::now();
        tx.send(Job::Quantize(full_frame(area, RGB8::new(9, 9, 9), t0))).unwrap();
        tx.send(Job::UseSpill).unwrap();
        tx.send(Job::Encode(full_frame(area, RGB8::new(90, 90, 90), t0 + Duration::from_millis(40)))).unwrap();
        tx.send(Job::Quit(t0 + Duration::from_millis(80))).unwrap();
        drop(tx);
        worker.run().unwrap();
        assert_eq!(decode(&out).len(), 2);
    }
}
