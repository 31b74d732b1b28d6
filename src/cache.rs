//! Two-tier frame cache.
//!
//! The RAM tier hands out reusable full-frame buffers to the capture side
//! and takes them back from the encoder; byte counters are atomic because
//! the two sides live on different threads. The spill tier belongs to the
//! encoder thread alone: dirty-rect bytes are appended to rotating temp
//! files and drained back in FIFO order.

use crate::error::{CatResult, Error};
use crate::image::{Image, PixelFormat};
use crate::rect::Rect;
use crate::region::Region;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Shared between pump and worker. The pump acquires buffers, the worker
/// releases them; neither side ever holds the pool lock across other work.
pub(crate) struct FrameCache {
    max_ram: AtomicUsize,
    ram_used: AtomicUsize,
    max_spill: u64,
    max_file: u64,
    spill_used: AtomicU64,
    pool: Mutex<Vec<Image>>,
}

impl FrameCache {
    pub fn new(max_ram: usize, max_spill: u64) -> Self {
        Self {
            max_ram: AtomicUsize::new(max_ram),
            ram_used: AtomicUsize::new(0),
            max_spill,
            max_file: max_spill / 16,
            spill_used: AtomicU64::new(0),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// A frame buffer covering `area`, reused from the pool when possible.
    /// Fails with `OutOfMemory` when allocating would break the RAM budget;
    /// the caller is expected to drop the snapshot and retry next tick.
    pub fn acquire(&self, area: Rect, format: PixelFormat) -> CatResult<Image> {
        let size = area.area() * format.bytes_per_pixel();
        let mut pool = self.pool.lock().map_err(|_| Error::ThreadSend)?;
        while let Some(image) = pool.pop() {
            if self.ram_used.load(Relaxed) <= self.max_ram.load(Relaxed) {
                return Ok(image);
            }
            // over budget: let pooled buffers go until we fit again
            self.ram_used.fetch_sub(image.byte_size(), Relaxed);
        }
        drop(pool);
        if self.ram_used.load(Relaxed) + size > self.max_ram.load(Relaxed) {
            return Err(Error::OutOfMemory);
        }
        self.ram_used.fetch_add(size, Relaxed);
        Ok(Image::new(area, format))
    }

    /// Return a buffer to the pool once its frame has been encoded or
    /// spilled. The bytes stay accounted until the pool is pruned.
    pub fn release(&self, image: Image) {
        match self.pool.lock() {
            Ok(mut pool) => pool.push(image),
            Err(_) => {
                self.ram_used.fetch_sub(image.byte_size(), Relaxed);
            },
        }
    }

    /// True once RAM usage has crossed half the budget; the pump uses this
    /// to signal the switch to the spill tier.
    pub fn needs_spill(&self) -> bool {
        self.ram_used.load(Relaxed) >= self.max_ram.load(Relaxed) / 2
    }

    pub fn ram_bytes(&self) -> usize {
        self.ram_used.load(Relaxed)
    }

    pub fn spill_bytes(&self) -> u64 {
        self.spill_used.load(Relaxed)
    }

    pub fn max_ram(&self) -> usize {
        self.max_ram.load(Relaxed)
    }

    /// Adjust the RAM budget mid-recording, shrinking the pool if needed.
    pub fn set_max_ram(&self, bytes: usize) {
        self.max_ram.store(bytes, Relaxed);
        if let Ok(mut pool) = self.pool.lock() {
            while self.ram_used.load(Relaxed) > bytes {
                match pool.pop() {
                    Some(image) => {
                        self.ram_used.fetch_sub(image.byte_size(), Relaxed);
                    },
                    None => break,
                }
            }
        }
    }
}

/// One frame parked on disk: the dirty-rect bytes of `region`, concatenated
/// row by row in region enumeration order.
pub(crate) struct StoredFrame {
    pub ts: Instant,
    pub region: Region,
    pub format: PixelFormat,
    pub file: Rc<RefCell<File>>,
    pub offset: u64,
    bytes: u64,
    /// Set on the frame that sealed its file; retiring it deletes the file
    owns_file: Option<PathBuf>,
}

struct WriteFile {
    file: Rc<RefCell<File>>,
    path: PathBuf,
    len: u64,
}

/// Disk tier, owned exclusively by the encoder thread.
pub(crate) struct SpillStore {
    cache: Arc<FrameCache>,
    queue: VecDeque<StoredFrame>,
    cur: Option<WriteFile>,
    /// Scratch for reading spilled rects back
    pub read_buf: Vec<u8>,
}

impl SpillStore {
    pub fn new(cache: Arc<FrameCache>) -> Self {
        Self {
            cache,
            queue: VecDeque::new(),
            cur: None,
            read_buf: vec![0; 4 * 64 * 64],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Park `region` of `image` on disk. Returns `Ok(false)` without writing
    /// when the spill budget has no room for this frame.
    pub fn store(&mut self, ts: Instant, region: &Region, image: &Image) -> CatResult<bool> {
        let bpp = image.format().bytes_per_pixel() as u64;
        let bytes: u64 = region.rects().map(|r| r.area() as u64).sum::<u64>() * bpp;
        let used = self.cache.spill_used.load(Relaxed);
        if used + bytes > self.cache.max_spill {
            warn!("spill cache full ({}/{} bytes)", used, self.cache.max_spill);
            return Ok(false);
        }

        if self.cur.is_none() {
            let (file, path) = tempfile::Builder::new()
                .prefix("gifcastcache")
                .tempfile()?
                .keep()
                .map_err(|e| Error::Io(e.error))?;
            debug!("opened spill file {}", path.display());
            self.cur = Some(WriteFile { file: Rc::new(RefCell::new(file)), path, len: 0 });
        }
        let cur = self.cur.as_mut().ok_or(Error::ThreadSend)?;

        let offset = cur.len;
        {
            // the handle is shared with readers, so reposition first
            let mut f = cur.file.borrow_mut();
            f.seek(SeekFrom::Start(offset))?;
            for rect in region.rects() {
                for row in image.rect_rows(rect) {
                    f.write_all(row)?;
                }
            }
        }
        cur.len += bytes;
        self.cache.spill_used.fetch_add(bytes, Relaxed);

        let mut stored = StoredFrame {
            ts,
            region: region.clone(),
            format: image.format(),
            file: Rc::clone(&cur.file),
            offset,
            bytes,
            owns_file: None,
        };
        if cur.len >= self.cache.max_file {
            let sealed = self.cur.take().ok_or(Error::ThreadSend)?;
            debug!("sealed spill file {} at {} bytes", sealed.path.display(), sealed.len);
            stored.owns_file = Some(sealed.path);
        }
        self.queue.push_back(stored);
        Ok(true)
    }

    /// Oldest spilled frame, if any.
    pub fn pop(&mut self) -> Option<StoredFrame> {
        self.queue.pop_front()
    }

    /// Account a processed frame and delete its file when it was the last
    /// one stored there.
    pub fn retire(&mut self, frame: StoredFrame) -> CatResult<()> {
        self.cache.spill_used.fetch_sub(frame.bytes, Relaxed);
        if let Some(path) = frame.owns_file {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Drop everything still on disk. Used on shutdown and error paths.
    pub fn cleanup(&mut self) {
        while let Some(frame) = self.queue.pop_front() {
            self.cache.spill_used.fetch_sub(frame.bytes, Relaxed);
            if let Some(path) = frame.owns_file {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("leaking spill file {}: {}", path.display(), e);
                }
            }
        }
        if let Some(cur) = self.cur.take() {
            if let Err(e) = fs::remove_file(&cur.path) {
                warn!("leaking spill file {}: {}", cur.path.display(), e);
            }
        }
    }
}
