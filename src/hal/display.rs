//! Display control: refresh rates and frame capture
//!
//! Two concerns live here:
//! - refresh rate get/set/enumerate through a vendor backend (production
//!   parses the output of the display tool; tests inject a fake backend)
//! - downsampled frame capture for the static-screen detector: 320×200,
//!   24 bpp BGR, row stride aligned to 4 bytes, plus the mean-absolute
//!   similarity metric between successive frames

use crate::error::{EngineError, HwResult};
use crate::hal::HalCounters;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Capture geometry for the static-screen detector.
pub const CAPTURE_WIDTH: usize = 320;
pub const CAPTURE_HEIGHT: usize = 200;

/// Row stride: 3 bytes per pixel, rows padded to a 4-byte boundary.
pub fn row_stride(width: usize) -> usize {
    (width * 3 + 3) & !3
}

/// Where the displays hang off the GPUs, as seen by the vendor driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayTopology {
    /// At least one external display is wired to the discrete GPU. While
    /// true, the engine must never power the discrete GPU down.
    pub has_external_on_dgpu: bool,
    pub dgpu_display_count: u8,
}

/// A downsampled BGR frame with padded rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new_black(width: usize, height: usize) -> Self {
        let stride = row_stride(width);
        Self {
            width,
            height,
            stride,
            data: vec![0u8; stride * height],
        }
    }

    /// Similarity between two equally sized frames:
    /// `1 − Σ|p_i − q_i| / (255·N)` over the payload bytes (padding
    /// excluded). Identical frames score exactly 1.0.
    pub fn similarity(&self, other: &Frame) -> Option<f64> {
        if self.width != other.width || self.height != other.height {
            return None;
        }
        let row_bytes = self.width * 3;
        let n = (row_bytes * self.height) as f64;
        if n == 0.0 {
            return None;
        }
        let mut diff: u64 = 0;
        for y in 0..self.height {
            let a = &self.data[y * self.stride..y * self.stride + row_bytes];
            let b = &other.data[y * other.stride..y * other.stride + row_bytes];
            for (pa, pb) in a.iter().zip(b.iter()) {
                diff += pa.abs_diff(*pb) as u64;
            }
        }
        Some(1.0 - diff as f64 / (255.0 * n))
    }
}

/// Produces downsampled frames of the primary monitor.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> HwResult<Frame>;
}

/// Reads the raw framebuffer device and downsamples with nearest-neighbor
/// sampling. Assumes the common 32 bpp BGRA layout.
pub struct FramebufferSource {
    fb_path: PathBuf,
    size_path: PathBuf,
}

impl FramebufferSource {
    pub fn probe() -> Option<Self> {
        let source = Self {
            fb_path: PathBuf::from("/dev/fb0"),
            size_path: PathBuf::from("/sys/class/graphics/fb0/virtual_size"),
        };
        if source.fb_path.exists() && source.size_path.exists() {
            Some(source)
        } else {
            None
        }
    }

    fn native_size(&self) -> HwResult<(usize, usize)> {
        let raw = std::fs::read_to_string(&self.size_path)?;
        let mut parts = raw.trim().split(',');
        let w = parts
            .next()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| EngineError::HwInvalid(format!("bad fb size {:?}", raw)))?;
        let h = parts
            .next()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| EngineError::HwInvalid(format!("bad fb size {:?}", raw)))?;
        Ok((w, h))
    }
}

impl FrameSource for FramebufferSource {
    fn capture(&self) -> HwResult<Frame> {
        let (src_w, src_h) = self.native_size()?;
        if src_w == 0 || src_h == 0 {
            return Err(EngineError::HwInvalid("framebuffer reports 0x0".into()));
        }
        let mut raw = Vec::with_capacity(src_w * src_h * 4);
        std::fs::File::open(&self.fb_path)?
            .take((src_w * src_h * 4) as u64)
            .read_to_end(&mut raw)?;
        if raw.len() < src_w * src_h * 4 {
            return Err(EngineError::HwTransient(format!(
                "short framebuffer read: {} of {} bytes",
                raw.len(),
                src_w * src_h * 4
            )));
        }

        let mut frame = Frame::new_black(CAPTURE_WIDTH, CAPTURE_HEIGHT);
        for y in 0..CAPTURE_HEIGHT {
            let src_y = y * src_h / CAPTURE_HEIGHT;
            for x in 0..CAPTURE_WIDTH {
                let src_x = x * src_w / CAPTURE_WIDTH;
                let src_off = (src_y * src_w + src_x) * 4;
                let dst_off = y * frame.stride + x * 3;
                // BGRA -> BGR
                frame.data[dst_off] = raw[src_off];
                frame.data[dst_off + 1] = raw[src_off + 1];
                frame.data[dst_off + 2] = raw[src_off + 2];
            }
        }
        Ok(frame)
    }
}

/// Refresh rate backend seam.
pub trait RefreshBackend: Send + Sync {
    fn current_hz(&self) -> HwResult<u32>;
    fn set_hz(&self, hz: u32) -> HwResult<()>;
    fn enumerate_hz(&self) -> HwResult<Vec<u32>>;
}

/// Production backend over the display tool (`xrandr`). A non-zero exit
/// from a query is transient; a failed mode set is only warned about (the
/// next sample shows whether it stuck).
pub struct XrandrBackend;

impl XrandrBackend {
    pub fn probe() -> Option<Self> {
        match Command::new("xrandr").arg("--version").output() {
            Ok(out) if out.status.success() => Some(Self),
            _ => None,
        }
    }

    fn query(&self) -> HwResult<String> {
        let output = Command::new("xrandr")
            .arg("--query")
            .output()
            .map_err(|e| EngineError::HwTransient(format!("xrandr: {}", e)))?;
        if !output.status.success() {
            return Err(EngineError::HwTransient(format!(
                "xrandr exited with {:?}",
                output.status.code()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RefreshBackend for XrandrBackend {
    fn current_hz(&self) -> HwResult<u32> {
        let text = self.query()?;
        // The active mode carries a '*' after its rate, e.g. "144.00*+".
        let re = regex::Regex::new(r"(\d+)\.\d+\*").unwrap();
        re.captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| EngineError::HwInvalid("no active mode in xrandr output".into()))
    }

    fn set_hz(&self, hz: u32) -> HwResult<()> {
        let status = Command::new("xrandr")
            .arg("--rate")
            .arg(hz.to_string())
            .status()
            .map_err(|e| EngineError::HwTransient(format!("xrandr: {}", e)))?;
        if !status.success() {
            warn!("Hal: xrandr --rate {} exited with {:?}", hz, status.code());
        }
        Ok(())
    }

    fn enumerate_hz(&self) -> HwResult<Vec<u32>> {
        let text = self.query()?;
        let re = regex::Regex::new(r"(\d+)\.\d+[\s*+]").unwrap();
        let mut rates: Vec<u32> = re
            .captures_iter(&text)
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
            .filter(|hz| (24..=480).contains(hz))
            .collect();
        rates.sort_unstable();
        rates.dedup();
        if rates.is_empty() {
            return Err(EngineError::HwInvalid("no modes in xrandr output".into()));
        }
        Ok(rates)
    }
}

/// Fake backend for tests: rates are held in memory.
pub struct MemRefreshBackend {
    pub rates: Vec<u32>,
    pub current: Mutex<u32>,
}

impl MemRefreshBackend {
    pub fn new(rates: Vec<u32>, current: u32) -> Self {
        Self {
            rates,
            current: Mutex::new(current),
        }
    }
}

impl RefreshBackend for std::sync::Arc<MemRefreshBackend> {
    fn current_hz(&self) -> HwResult<u32> {
        (**self).current_hz()
    }

    fn set_hz(&self, hz: u32) -> HwResult<()> {
        (**self).set_hz(hz)
    }

    fn enumerate_hz(&self) -> HwResult<Vec<u32>> {
        (**self).enumerate_hz()
    }
}

impl RefreshBackend for MemRefreshBackend {
    fn current_hz(&self) -> HwResult<u32> {
        Ok(*self.current.lock().unwrap())
    }

    fn set_hz(&self, hz: u32) -> HwResult<()> {
        if !self.rates.contains(&hz) {
            return Err(EngineError::HwInvalid(format!("rate {} not offered", hz)));
        }
        *self.current.lock().unwrap() = hz;
        Ok(())
    }

    fn enumerate_hz(&self) -> HwResult<Vec<u32>> {
        Ok(self.rates.clone())
    }
}

/// Typed display access with counters; refresh and capture availability
/// are independent.
pub struct DisplayControl {
    refresh: Option<Box<dyn RefreshBackend>>,
    frames: Option<Box<dyn FrameSource>>,
    counters: Arc<HalCounters>,
}

impl DisplayControl {
    pub fn probe(counters: Arc<HalCounters>) -> Self {
        let refresh: Option<Box<dyn RefreshBackend>> = match XrandrBackend::probe() {
            Some(b) => Some(Box::new(b)),
            None => {
                debug!("Hal: no display tool, refresh rate control disabled");
                None
            }
        };
        let frames: Option<Box<dyn FrameSource>> = match FramebufferSource::probe() {
            Some(s) => Some(Box::new(s)),
            None => {
                debug!("Hal: no framebuffer device, frame capture disabled");
                None
            }
        };
        Self {
            refresh,
            frames,
            counters,
        }
    }

    pub fn with_backends(
        refresh: Option<Box<dyn RefreshBackend>>,
        frames: Option<Box<dyn FrameSource>>,
        counters: Arc<HalCounters>,
    ) -> Self {
        Self {
            refresh,
            frames,
            counters,
        }
    }

    pub fn has_refresh_control(&self) -> bool {
        self.refresh.is_some()
    }

    pub fn has_frame_capture(&self) -> bool {
        self.frames.is_some()
    }

    pub fn get_refresh_rate(&self) -> HwResult<u32> {
        let backend = self
            .refresh
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("refresh control absent".into()))?;
        backend.current_hz().map_err(|e| {
            self.counters.record_failure("get_refresh_rate");
            e
        })
    }

    pub fn set_refresh_rate(&self, hz: u32) -> HwResult<()> {
        let backend = self
            .refresh
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("refresh control absent".into()))?;
        backend.set_hz(hz).map_err(|e| {
            self.counters.record_failure("set_refresh_rate");
            e
        })
    }

    pub fn enumerate_refresh_rates(&self) -> HwResult<Vec<u32>> {
        let backend = self
            .refresh
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("refresh control absent".into()))?;
        backend.enumerate_hz().map_err(|e| {
            self.counters.record_failure("enumerate_refresh_rates");
            e
        })
    }

    /// Lowest rate the panel offers, for the static-screen collapse.
    pub fn lowest_refresh_rate(&self) -> HwResult<u32> {
        let rates = self.enumerate_refresh_rates()?;
        rates
            .into_iter()
            .min()
            .ok_or_else(|| EngineError::HwInvalid("empty mode list".into()))
    }

    pub fn capture_frame(&self) -> HwResult<Frame> {
        let source = self
            .frames
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("frame capture absent".into()))?;
        source.capture().map_err(|e| {
            self.counters.record_failure("capture_frame");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_aligned_to_four() {
        assert_eq!(row_stride(320), 960); // already aligned
        assert_eq!(row_stride(321), 964); // 963 -> 964
        assert_eq!(row_stride(1), 4);
    }

    #[test]
    fn identical_frames_have_similarity_one() {
        let a = Frame::new_black(CAPTURE_WIDTH, CAPTURE_HEIGHT);
        let b = a.clone();
        assert_eq!(a.similarity(&b), Some(1.0));
    }

    #[test]
    fn one_lsb_pixel_change_stays_above_threshold() {
        let a = Frame::new_black(CAPTURE_WIDTH, CAPTURE_HEIGHT);
        let mut b = a.clone();
        b.data[0] = 1; // single channel, 1 LSB
        let sim = a.similarity(&b).unwrap();
        assert!(sim > 0.99999, "similarity {} too low", sim);
        assert!(sim < 1.0);
    }

    #[test]
    fn padding_bytes_do_not_affect_similarity() {
        let mut a = Frame::new_black(321, 2);
        let b = Frame::new_black(321, 2);
        // Poke the padding byte at the end of row 0.
        let pad = a.stride - 1;
        a.data[pad] = 0xFF;
        assert_eq!(a.similarity(&b), Some(1.0));
    }

    #[test]
    fn mismatched_geometry_yields_none() {
        let a = Frame::new_black(320, 200);
        let b = Frame::new_black(160, 100);
        assert_eq!(a.similarity(&b), None);
    }

    #[test]
    fn mem_backend_round_trips_rates() {
        let control = DisplayControl::with_backends(
            Some(Box::new(MemRefreshBackend::new(vec![60, 120, 144], 144))),
            None,
            Arc::new(HalCounters::new()),
        );
        assert_eq!(control.get_refresh_rate().unwrap(), 144);
        control.set_refresh_rate(60).unwrap();
        assert_eq!(control.get_refresh_rate().unwrap(), 60);
        assert_eq!(control.lowest_refresh_rate().unwrap(), 60);
        assert!(control.set_refresh_rate(75).is_err());
    }

    #[test]
    fn missing_backends_report_unavailable() {
        let control =
            DisplayControl::with_backends(None, None, Arc::new(HalCounters::new()));
        assert!(matches!(
            control.get_refresh_rate(),
            Err(EngineError::HwUnavailable(_))
        ));
        assert!(matches!(
            control.capture_frame(),
            Err(EngineError::HwUnavailable(_))
        ));
    }
}
