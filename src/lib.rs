/*
 gifcast damage-driven GIF screen recorder

 This program is free software: you can redistribute it and/or modify
 it under the terms of the GNU Affero General Public License as
 published by the Free Software Foundation, either version 3 of the
 License, or (at your option) any later version.

 This program is distributed in the hope that it will be useful,
 but WITHOUT ANY WARRANTY; without even the implied warranty of
 MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 GNU Affero General Public License for more details.

 You should have received a copy of the GNU Affero General Public License
 along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Records a rectangular screen region into an animated GIF, driven by
//! damage events instead of a fixed frame clock.
//!
//! A [`CaptureSource`] reports which parts of the screen changed; the
//! recorder coalesces that damage, snapshots the affected pixels on the
//! event thread, and hands frames to a dedicated encoder thread that
//! quantizes the first frame into a palette, dithers every frame against
//! it, and streams GIF89a output. When capture outpaces encoding, frames
//! overflow from a bounded RAM cache into temporary spill files.
//!
//! The event-thread surface is deliberately clock-explicit: the embedder
//! forwards damage with [`Recorder::damage`] (or lets [`Recorder::tick`]
//! poll the source), sleeps until [`Recorder::next_deadline`], and passes
//! `Instant`s in, which keeps recordings reproducible under test.

#[macro_use]
extern crate quick_error;

mod error;
pub use crate::error::*;
mod rect;
pub use crate::rect::Rect;
mod region;
pub use crate::region::Region;
mod image;
pub use crate::image::{ByteOrder, Image, PixelFormat, PixelView};
mod config;
pub use crate::config::Config;
pub mod source;
pub use crate::source::CaptureSource;
mod octree;
pub use crate::octree::{Octree, Palette};
mod dither;
mod gifenc;
pub use crate::gifenc::GifWriter;
mod cache;
mod lzw;
mod pump;
mod worker;

use crate::cache::FrameCache;
use crate::pump::CapturePump;
use crate::worker::{EncoderWorker, Job};
use crossbeam_channel::Sender;
use log::{debug, error};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Created,
    Prepared,
    Recording,
    Stopped,
    Error,
}

/// A recording session.
///
/// The state machine runs `Created → Prepared → Recording → Stopped`;
/// `Stopped` and `Error` are terminal. Operations called out of order fail
/// with [`Error::InvalidState`] and leave the state unchanged.
pub struct Recorder {
    state: RecorderState,
    config: Config,
    area: Rect,
    source: Box<dyn CaptureSource>,
    cache: Arc<FrameCache>,
    pump: CapturePump,
    jobs: Sender<Job>,
    encoder: Option<EncoderWorker<Box<dyn Write + Send>>>,
    encoder_thread: Option<JoinHandle<CatResult<()>>>,
    failed: Arc<AtomicBool>,
}

impl Recorder {
    /// Set up a recording of `config.area` (clipped to the screen) that will
    /// write GIF data to `sink`. Validates the configuration and the
    /// source's pixel depth, and writes the GIF header.
    pub fn new(source: Box<dyn CaptureSource>, sink: impl Write + Send + 'static, config: Config) -> CatResult<Self> {
        config.validate()?;
        let format = source.format();
        if format.bpp != 3 && format.bpp != 4 {
            return Err(Error::CaptureUnavailable);
        }
        let screen = source.screen_rect();
        let area = match config.area {
            Some(want) => want.intersection(&screen).ok_or(Error::InvalidArgument("area"))?,
            None => screen,
        };
        if area.width > i32::from(u16::MAX) || area.height > i32::from(u16::MAX) {
            return Err(Error::InvalidArgument("area"));
        }

        let sink: Box<dyn Write + Send> = Box::new(sink);
        let gif = GifWriter::new(sink, area.width as u16, area.height as u16)?;
        let cache = Arc::new(FrameCache::new(config.max_cache_bytes, config.max_spill_bytes));
        let (jobs, job_rx) = crossbeam_channel::unbounded();
        let pump = CapturePump::new(
            area,
            format,
            Duration::from_millis(u64::from(config.frame_duration_ms)),
            Instant::now(),
        );
        let encoder = EncoderWorker::new(job_rx, Arc::clone(&cache), gif, area, config.max_colors, config.looping);

        Ok(Self {
            state: RecorderState::Created,
            config,
            area,
            source,
            cache,
            pump,
            jobs,
            encoder: Some(encoder),
            encoder_thread: None,
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the encoder thread and push the initial full-frame snapshot,
    /// which seeds the palette and becomes the first frame.
    pub fn prepare(&mut self, now: Instant) -> CatResult<()> {
        if self.state != RecorderState::Created {
            return Err(Error::InvalidState("prepare"));
        }
        let encoder = self.encoder.take().ok_or(Error::InvalidState("prepare"))?;
        let failed = Arc::clone(&self.failed);
        let spawned = thread::Builder::new().name("encode".into()).spawn(move || {
            let result = encoder.run();
            if let Err(ref e) = result {
                failed.store(true, Relaxed);
                error!("encoder thread failed: {}", e);
            }
            result
        });
        match spawned {
            Ok(handle) => self.encoder_thread = Some(handle),
            Err(e) => {
                self.state = RecorderState::Error;
                return Err(e.into());
            },
        }
        match self.pump.prime(now, self.source.as_mut(), &self.cache, &self.jobs) {
            Ok(()) => {
                // no timer until damage starts flowing
                self.pump.cancel_timer();
                self.state = RecorderState::Prepared;
                Ok(())
            },
            Err(e) => {
                self.state = RecorderState::Error;
                Err(e)
            },
        }
    }

    /// Subscribe to damage events and start capturing.
    pub fn start(&mut self, _now: Instant) -> CatResult<()> {
        if self.state != RecorderState::Prepared {
            return Err(Error::InvalidState("start"));
        }
        match self.source.subscribe(self.area, self.config.record_cursor) {
            Ok(()) => {
                self.state = RecorderState::Recording;
                Ok(())
            },
            Err(e) => {
                self.state = RecorderState::Error;
                Err(e)
            },
        }
    }

    /// Forward one damage event. Ignored unless recording.
    pub fn damage(&mut self, dirty: Rect, now: Instant) {
        if self.state == RecorderState::Recording {
            self.pump.damage(dirty, now);
        }
    }

    /// When [`Recorder::tick`] next wants to run. `None` while idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state == RecorderState::Recording {
            self.pump.deadline()
        } else {
            None
        }
    }

    /// Drain damage from the source and fire the snapshot timer if due.
    /// On capture errors the recording moves to the `Error` state.
    pub fn tick(&mut self, now: Instant) -> CatResult<()> {
        if self.state != RecorderState::Recording {
            return Ok(());
        }
        if self.failed.load(Relaxed) {
            // the encoder already died; stop capturing, keep the error for
            // `finish`
            self.source.unsubscribe();
            self.pump.cancel_timer();
            self.state = RecorderState::Error;
            return Ok(());
        }
        while let Some(dirty) = self.source.poll_damage() {
            self.pump.damage(dirty, now);
        }
        match self.pump.tick(now, self.source.as_mut(), &self.cache, &self.jobs) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.source.unsubscribe();
                self.pump.cancel_timer();
                self.state = RecorderState::Error;
                Err(e)
            },
        }
    }

    /// Stop capturing. The encoder keeps draining everything already
    /// buffered or spilled; nothing is discarded.
    pub fn stop(&mut self, now: Instant) -> CatResult<()> {
        if self.state != RecorderState::Recording {
            return Err(Error::InvalidState("stop"));
        }
        self.source.unsubscribe();
        self.pump.cancel_timer();
        match self.jobs.send(Job::Quit(now)) {
            Ok(()) => {
                self.state = RecorderState::Stopped;
                Ok(())
            },
            Err(_) => {
                self.state = RecorderState::Error;
                Err(Error::ThreadSend)
            },
        }
    }

    /// True between `start` and `stop`.
    pub fn is_active(&self) -> bool {
        self.state == RecorderState::Recording
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Adjust the RAM cache budget mid-recording.
    pub fn set_max_cache(&self, bytes: usize) {
        self.cache.set_max_ram(bytes);
    }

    pub fn max_cache(&self) -> usize {
        self.cache.max_ram()
    }

    /// Bytes of frame buffers currently accounted against the RAM budget.
    pub fn cache_bytes(&self) -> usize {
        self.cache.ram_bytes()
    }

    /// Bytes currently parked in spill files.
    pub fn spill_bytes(&self) -> u64 {
        self.cache.spill_bytes()
    }

    /// Run any remaining state transitions, wait for the encoder to write
    /// the trailer, and surface its terminal error.
    pub fn finish(mut self) -> CatResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CatResult<()> {
        loop {
            let step = match self.state {
                RecorderState::Created => self.prepare(Instant::now()),
                RecorderState::Prepared => self.start(Instant::now()),
                RecorderState::Recording => self.stop(Instant::now()),
                RecorderState::Stopped | RecorderState::Error => break,
            };
            if let Err(e) = step {
                debug!("shutdown transition failed: {}", e);
                self.state = RecorderState::Error;
            }
        }
        // after an error the worker may still be blocked on the queue; a
        // trailing Quit lets it finalize what it has
        let _ = self.jobs.send(Job::Quit(Instant::now()));
        let result = match self.encoder_thread.take() {
            Some(handle) => handle.join().map_err(|_| Error::ThreadSend).and_then(|r| r),
            None => Ok(()),
        };
        if result.is_err() {
            self.state = RecorderState::Error;
        }
        result
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("recording failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ByteOrder, PixelFormat};

    struct StubSource {
        depth: u8,
    }

    impl CaptureSource for StubSource {
        fn screen_rect(&self) -> Rect {
            Rect::new(0, 0, 16, 16)
        }
        fn format(&self) -> PixelFormat {
            PixelFormat { bpp: self.depth, byte_order: ByteOrder::LittleEndian }
        }
        fn subscribe(&mut self, _area: Rect, _record_cursor: bool) -> CatResult<()> {
            Ok(())
        }
        fn unsubscribe(&mut self) {}
        fn poll_damage(&mut self) -> Option<Rect> {
            None
        }
        fn snapshot(&mut self, _src: Rect, dst: &mut [u8], _dst_stride: usize) -> CatResult<()> {
            dst.fill(0xFF);
            Ok(())
        }
        fn acknowledge(&mut self, _consumed: &Region) {}
    }

    #[test]
    fn rejects_unusable_depth() {
        let err = Recorder::new(Box::new(StubSource { depth: 2 }), Vec::new(), Config::default());
        assert!(matches!(err, Err(Error::CaptureUnavailable)));
    }

    #[test]
    fn rejects_area_off_screen() {
        let config = Config {
            area: Some(Rect::new(100, 100, 10, 10)),
            ..Config::default()
        };
        let err = Recorder::new(Box::new(StubSource { depth: 4 }), Vec::new(), config);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn operations_respect_the_state_machine() {
        let mut rec = Recorder::new(Box::new(StubSource { depth: 4 }), Vec::new(), Config::default()).unwrap();
        let now = Instant::now();
        assert!(!rec.is_active());
        assert!(matches!(rec.start(now), Err(Error::InvalidState(_))));
        assert!(matches!(rec.stop(now), Err(Error::InvalidState(_))));
        assert_eq!(rec.state(), RecorderState::Created);

        rec.prepare(now).unwrap();
        assert!(matches!(rec.prepare(now), Err(Error::InvalidState(_))));
        assert!(!rec.is_active());

        rec.start(now).unwrap();
        assert!(rec.is_active());
        assert!(rec.next_deadline().is_none());

        rec.stop(now + Duration::from_millis(50)).unwrap();
        assert!(!rec.is_active());
        assert_eq!(rec.state(), RecorderState::Stopped);
        assert!(matches!(rec.stop(now), Err(Error::InvalidState(_))));
        rec.finish().unwrap();
    }

    #[test]
    fn finish_advances_a_fresh_recorder() {
        let rec = Recorder::new(Box::new(StubSource { depth: 4 }), Vec::new(), Config::default()).unwrap();
        // never prepared or started; finish still drives it to completion
        rec.finish().unwrap();
    }
}
