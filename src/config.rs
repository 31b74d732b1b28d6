use crate::error::{CatResult, Error};
use crate::rect::Rect;

/// Recording settings. Every field has a default; construct with struct
/// update syntax: `Config { looping: true, ..Config::default() }`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stop after this much wall time
    pub duration_ms: u32,
    /// Wait this long before preparing the recording
    pub delay_ms: u32,
    /// Emit the Netscape looping extension
    pub looping: bool,
    /// Have the capture source composite the cursor into every snapshot
    pub record_cursor: bool,
    /// Captured screen area; `None` records the whole screen
    pub area: Option<Rect>,
    /// Minimum time between frames in milliseconds
    pub frame_duration_ms: u32,
    /// RAM frame cache budget in bytes
    pub max_cache_bytes: usize,
    /// On-disk spill budget in bytes; 0 keeps everything in RAM
    pub max_spill_bytes: u64,
    /// Palette size target, 2..=256
    pub max_colors: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            delay_ms: 1_000,
            looping: false,
            record_cursor: false,
            area: None,
            frame_duration_ms: 40,
            max_cache_bytes: 50 * 1024 * 1024,
            max_spill_bytes: 0xFF00_0000,
            max_colors: 255,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> CatResult<()> {
        if !(2..=256).contains(&self.max_colors) {
            return Err(Error::InvalidArgument("max_colors"));
        }
        if self.frame_duration_ms == 0 {
            return Err(Error::InvalidArgument("frame_duration_ms"));
        }
        if let Some(area) = self.area {
            if area.x < 0 || area.y < 0 || area.width <= 0 || area.height <= 0 {
                return Err(Error::InvalidArgument("area"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.max_cache_bytes, 52_428_800);
        assert_eq!(config.max_spill_bytes, 0xFF00_0000);
        assert_eq!(config.frame_duration_ms, 40);
        assert_eq!(config.max_colors, 255);
        assert!(!config.looping);
    }

    #[test]
    fn bad_settings_fail_fast() {
        let bad = Config { max_colors: 1, ..Config::default() };
        assert!(matches!(bad.validate(), Err(Error::InvalidArgument(_))));
        let bad = Config { max_colors: 300, ..Config::default() };
        assert!(matches!(bad.validate(), Err(Error::InvalidArgument(_))));
        let bad = Config { area: Some(Rect { x: -1, y: 0, width: 10, height: 10 }), ..Config::default() };
        assert!(matches!(bad.validate(), Err(Error::InvalidArgument(_))));
    }
}
