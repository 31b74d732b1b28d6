//! Damage accumulation and snapshotting on the event thread.
//!
//! Damage rects pool up in `pending` until a timer fires. The timer is an
//! explicit deadline the embedder polls: the first damage after a quiet
//! spell arms it for "now" (an idle flush), every snapshot re-arms it one
//! frame duration ahead, and an empty tick disarms it.

use crate::cache::FrameCache;
use crate::error::{CatResult, Error};
use crate::image::PixelFormat;
use crate::rect::Rect;
use crate::region::Region;
use crate::source::CaptureSource;
use crate::worker::{Frame, Job};
use crossbeam_channel::Sender;
use log::warn;
use std::time::{Duration, Instant};

pub(crate) struct CapturePump {
    area: Rect,
    format: PixelFormat,
    frame_duration: Duration,
    pending: Region,
    deadline: Option<Instant>,
    spill_signalled: bool,
    last_ts: Instant,
}

impl CapturePump {
    pub fn new(area: Rect, format: PixelFormat, frame_duration: Duration, epoch: Instant) -> Self {
        Self {
            area,
            format,
            frame_duration,
            pending: Region::new(),
            deadline: None,
            spill_signalled: false,
            last_ts: epoch,
        }
    }

    /// Fold a damage rect into the pending region and make sure a flush is
    /// scheduled.
    pub fn damage(&mut self, dirty: Rect, now: Instant) {
        let Some(clipped) = dirty.intersection(&self.area) else {
            return;
        };
        self.pending.union_rect(clipped);
        if self.deadline.is_none() {
            self.deadline = Some(now);
        }
    }

    /// When the embedder should call `tick` next. `None` while idle.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_timer(&mut self) {
        self.deadline = None;
    }

    /// Fire the timer if it is due: snapshot the pending damage and enqueue
    /// it, or stop the timer when there is nothing to flush. A full frame
    /// cache drops the snapshot and leaves the damage pending for the next
    /// tick.
    pub fn tick(
        &mut self,
        now: Instant,
        source: &mut dyn CaptureSource,
        cache: &FrameCache,
        jobs: &Sender<Job>,
    ) -> CatResult<()> {
        match self.deadline {
            Some(deadline) if now >= deadline => {},
            _ => return Ok(()),
        }
        if self.pending.is_empty() {
            self.deadline = None;
            return Ok(());
        }
        match self.snapshot(now, source, cache, jobs, false) {
            Err(Error::OutOfMemory) => {
                warn!("frame cache full, deferring snapshot");
                self.deadline = Some(now + self.frame_duration);
                Ok(())
            },
            other => other,
        }
    }

    /// Snapshot the whole capture area and enqueue it for quantization.
    pub fn prime(
        &mut self,
        now: Instant,
        source: &mut dyn CaptureSource,
        cache: &FrameCache,
        jobs: &Sender<Job>,
    ) -> CatResult<()> {
        self.pending = Region::from_rect(self.area);
        self.snapshot(now, source, cache, jobs, true)
    }

    fn snapshot(
        &mut self,
        now: Instant,
        source: &mut dyn CaptureSource,
        cache: &FrameCache,
        jobs: &Sender<Job>,
        quantize: bool,
    ) -> CatResult<()> {
        let ts = self.last_ts.max(now);
        let mut image = cache.acquire(self.area, self.format)?;
        if !self.spill_signalled && cache.needs_spill() {
            jobs.send(Job::UseSpill).map_err(|_| Error::ThreadSend)?;
            self.spill_signalled = true;
        }

        let stride = image.stride();
        for rect in self.pending.rects() {
            let local = rect.translated(-self.area.x, -self.area.y);
            source.snapshot(rect, image.rows_mut(local), stride)?;
        }

        let mut region = std::mem::take(&mut self.pending);
        self.deadline = Some(ts + self.frame_duration);
        self.last_ts = ts;
        source.acknowledge(&region);
        region.translate(-self.area.x, -self.area.y);

        let frame = Frame { ts, region, image };
        let job = if quantize { Job::Quantize(frame) } else { Job::Encode(frame) };
        jobs.send(job).map_err(|_| Error::ThreadSend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ByteOrder;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;

    const FMT: PixelFormat = PixelFormat { bpp: 4, byte_order: ByteOrder::LittleEndian };

    struct FakeSource {
        screen: Rect,
        acked: Vec<Region>,
        blits: usize,
    }

    impl FakeSource {
        fn new(screen: Rect) -> Self {
            Self { screen, acked: Vec::new(), blits: 0 }
        }
    }

    impl CaptureSource for FakeSource {
        fn screen_rect(&self) -> Rect {
            self.screen
        }
        fn format(&self) -> PixelFormat {
            FMT
        }
        fn subscribe(&mut self, _area: Rect, _record_cursor: bool) -> CatResult<()> {
            Ok(())
        }
        fn unsubscribe(&mut self) {}
        fn poll_damage(&mut self) -> Option<Rect> {
            None
        }
        fn snapshot(&mut self, _src: Rect, _dst: &mut [u8], _dst_stride: usize) -> CatResult<()> {
            self.blits += 1;
            Ok(())
        }
        fn acknowledge(&mut self, consumed: &Region) {
            self.acked.push(consumed.clone());
        }
    }

    fn fixture(area: Rect, max_ram: usize) -> (CapturePump, FakeSource, Arc<FrameCache>, Instant) {
        let epoch = Instant::now();
        let pump = CapturePump::new(area, FMT, Duration::from_millis(40), epoch);
        let source = FakeSource::new(Rect::new(0, 0, 100, 100));
        (pump, source, Arc::new(FrameCache::new(max_ram, 0)), epoch)
    }

    #[test]
    fn damage_outside_the_area_is_ignored() {
        let area = Rect::new(10, 10, 20, 20);
        let (mut pump, _, _, epoch) = fixture(area, 1 << 20);
        pump.damage(Rect::new(50, 50, 5, 5), epoch);
        assert!(pump.deadline().is_none());
        pump.damage(Rect::new(0, 0, 15, 15), epoch);
        assert_eq!(pump.deadline(), Some(epoch));
    }

    #[test]
    fn tick_flushes_and_rearms_periodically() {
        let area = Rect::new(10, 10, 20, 20);
        let (mut pump, mut source, cache, epoch) = fixture(area, 1 << 20);
        let (tx, rx) = unbounded();

        pump.damage(Rect::new(12, 12, 4, 4), epoch);
        pump.tick(epoch, &mut source, &cache, &tx).unwrap();

        let job = rx.try_recv().unwrap();
        let Job::Encode(frame) = job else {
            panic!("expected an encode job")
        };
        // the dirty region was translated to image-local coordinates
        let rects: Vec<_> = frame.region.rects().collect();
        assert_eq!(rects, vec![Rect::new(2, 2, 4, 4)]);
        assert_eq!(source.blits, 1);
        assert_eq!(source.acked.len(), 1);
        assert_eq!(source.acked[0].clipbox(), Some(Rect::new(12, 12, 4, 4)));
        assert_eq!(pump.deadline(), Some(epoch + Duration::from_millis(40)));

        // quiet tick at the periodic deadline disarms the timer
        pump.tick(epoch + Duration::from_millis(40), &mut source, &cache, &tx).unwrap();
        assert!(pump.deadline().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn early_tick_does_nothing() {
        let area = Rect::new(0, 0, 20, 20);
        let (mut pump, mut source, cache, epoch) = fixture(area, 1 << 20);
        let (tx, rx) = unbounded();
        pump.damage(Rect::new(0, 0, 5, 5), epoch);
        pump.tick(epoch, &mut source, &cache, &tx).unwrap();
        let _ = rx.try_recv().unwrap();

        // damage during the periodic window keeps the armed deadline
        pump.damage(Rect::new(1, 1, 2, 2), epoch + Duration::from_millis(10));
        pump.tick(epoch + Duration::from_millis(20), &mut source, &cache, &tx).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(source.blits, 1);
    }

    #[test]
    fn full_cache_drops_the_snapshot_but_keeps_damage() {
        let area = Rect::new(0, 0, 20, 20);
        // budget fits nothing
        let (mut pump, mut source, cache, epoch) = fixture(area, 16);
        let (tx, rx) = unbounded();
        pump.damage(Rect::new(0, 0, 5, 5), epoch);
        pump.tick(epoch, &mut source, &cache, &tx).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(source.blits, 0);
        assert!(source.acked.is_empty());
        // damage is retried at the next periodic deadline
        assert_eq!(pump.deadline(), Some(epoch + Duration::from_millis(40)));
        assert!(!pump.pending.is_empty());
    }

    #[test]
    fn half_full_cache_signals_spill_once() {
        let area = Rect::new(0, 0, 20, 20);
        let frame_size = 20 * 20 * 4;
        let (mut pump, mut source, cache, epoch) = fixture(area, frame_size * 4);
        let (tx, rx) = unbounded();

        // first frame stays below the half mark at acquire time
        pump.damage(Rect::new(0, 0, 5, 5), epoch);
        pump.tick(epoch, &mut source, &cache, &tx).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Job::Encode(_))));

        // the second acquire crosses it
        let later = epoch + Duration::from_millis(40);
        pump.damage(Rect::new(0, 0, 5, 5), later);
        pump.tick(later, &mut source, &cache, &tx).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Job::UseSpill)));
        assert!(matches!(rx.try_recv(), Ok(Job::Encode(_))));

        // and the signal is not repeated
        let again = later + Duration::from_millis(40);
        pump.damage(Rect::new(0, 0, 5, 5), again);
        pump.tick(again, &mut source, &cache, &tx).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Job::Encode(_))));
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let area = Rect::new(0, 0, 20, 20);
        let (mut pump, mut source, cache, epoch) = fixture(area, 1 << 20);
        let (tx, rx) = unbounded();
        let late = epoch + Duration::from_millis(100);
        pump.damage(Rect::new(0, 0, 5, 5), epoch);
        pump.tick(late, &mut source, &cache, &tx).unwrap();
        let Ok(Job::Encode(first)) = rx.try_recv() else {
            panic!()
        };

        pump.last_ts = late + Duration::from_millis(500);
        pump.damage(Rect::new(0, 0, 5, 5), late + Duration::from_millis(400));
        pump.tick(late + Duration::from_millis(450), &mut source, &cache, &tx).unwrap();
        let Ok(Job::Encode(second)) = rx.try_recv() else {
            panic!()
        };
        assert!(second.ts >= first.ts);
        assert_eq!(second.ts, late + Duration::from_millis(500));
    }
}
