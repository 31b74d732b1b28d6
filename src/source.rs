use crate::error::{CatResult, Error};
use crate::image::PixelFormat;
use crate::rect::Rect;
use crate::region::Region;

/// Live display surface the recorder captures from.
///
/// Implementations wrap a display-server binding that can report damage
/// (which rects changed since the last acknowledge) and blit pixels
/// synchronously. All methods are called from the thread driving the
/// recorder; nothing here runs concurrently.
pub trait CaptureSource {
    /// Bounds of the capturable surface.
    fn screen_rect(&self) -> Rect;

    /// Layout of the pixel data `snapshot` delivers.
    fn format(&self) -> PixelFormat;

    /// Start delivering damage events for `area`.
    fn subscribe(&mut self, area: Rect, record_cursor: bool) -> CatResult<()>;

    fn unsubscribe(&mut self);

    /// Next dirty rect delivered since the last poll, in screen coordinates.
    fn poll_damage(&mut self) -> Option<Rect>;

    /// Blit `src` (screen coordinates) into `dst`, whose first byte is the
    /// top-left pixel of `src` and whose rows are `dst_stride` apart.
    fn snapshot(&mut self, src: Rect, dst: &mut [u8], dst_stride: usize) -> CatResult<()>;

    /// Report damage as consumed, so the source stops re-reporting it.
    /// Called only after the pixels have been copied.
    fn acknowledge(&mut self, consumed: &Region);
}

/// The capture backend for the current platform.
///
/// Damage-driven capture needs a display-server binding (an X11 DAMAGE
/// subscription, or a compositor screencast session); this build links
/// none, so construction reports the capture subsystem as unavailable.
/// Embedders with a display connection implement [`CaptureSource`] and hand
/// it to [`crate::Recorder::new`] directly.
pub fn platform() -> CatResult<Box<dyn CaptureSource>> {
    Err(Error::CaptureUnavailable)
}
