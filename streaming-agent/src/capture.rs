// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame capture contract
//!
//! A [`FrameCapture`] is an open capture session owned by the agent. Each
//! call to [`FrameCapture::capture_frame`] blocks until the next frame is
//! due, grabs the display and hands back a [`FrameInfo`] borrowing the
//! session's compressed buffer.
//!
//! Raw pixels come from a [`ScreenSource`]. On Linux with the `x11`
//! feature the root window is grabbed through x11rb; elsewhere a test
//! pattern is generated.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::protocol::VideoCodecType;

/// Lowest accepted frame rate.
pub const MIN_FRAMERATE: u32 = 1;
/// Highest accepted frame rate.
pub const MAX_FRAMERATE: u32 = 240;

/// Bytes per pixel of the raw images produced by a [`ScreenSource`].
pub const SOURCE_BYTES_PER_PIXEL: usize = 4;

/// Errors raised by capture backends.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The backend could not open its capture source.
    #[error("Unable to initialize capture: {0}")]
    Init(String),

    /// The capture source could not be queried.
    #[error("Capture source unavailable: {0}")]
    SourceUnavailable(String),

    /// The grabbed image has a layout the backend cannot encode.
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// Compressing the frame failed.
    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in a frame of this size.
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A captured, compressed frame.
///
/// `buffer` belongs to the capture session and is only valid until the
/// next call into that session.
#[derive(Debug)]
pub struct FrameInfo<'a> {
    /// Frame dimensions
    pub size: FrameSize,
    /// Compressed frame data
    pub buffer: &'a [u8],
    /// Frame starts a new encoding sequence
    pub stream_start: bool,
}

/// An open capture session.
pub trait FrameCapture: Send {
    /// Wait for the next frame slot, then capture and compress a frame.
    fn capture_frame(&mut self) -> Result<FrameInfo<'_>, CaptureError>;

    /// Forget the last frame so the next one starts a new stream.
    fn reset(&mut self);

    /// Codec of the frames this session produces.
    fn video_codec_type(&self) -> VideoCodecType;
}

/// Frame rate limiter.
///
/// The baseline advances by exactly one interval after a sleep, so wake-up
/// jitter does not accumulate into drift.
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Duration,
    last: Option<Instant>,
}

impl FramePacer {
    /// Create a pacer for `fps` frames per second (clamped to 1..=240).
    pub fn new(fps: u32) -> Self {
        let fps = fps.clamp(MIN_FRAMERATE, MAX_FRAMERATE);
        Self {
            interval: Duration::from_secs(1) / fps,
            last: None,
        }
    }

    /// Time between two frames.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current scheduling baseline.
    pub fn baseline(&self) -> Option<Instant> {
        self.last
    }

    /// Account for a frame taken at `now` and return how long to sleep
    /// before taking it.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        let Some(last) = self.last else {
            self.last = Some(now);
            return None;
        };

        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.interval {
            self.last = Some(now);
            None
        } else {
            self.last = Some(last + self.interval);
            Some(self.interval - elapsed)
        }
    }

    /// Block until the next frame slot.
    pub fn wait(&mut self) {
        if let Some(delay) = self.next_delay(Instant::now()) {
            thread::sleep(delay);
        }
    }
}

/// Tracks frame dimensions to flag stream starts.
#[derive(Debug, Clone, Default)]
pub struct SizeTracker {
    last: Option<FrameSize>,
}

impl SizeTracker {
    /// Record `size`, returning true if it differs from the previous frame
    /// or no frame was recorded yet.
    pub fn update(&mut self, size: FrameSize) -> bool {
        if self.last == Some(size) {
            return false;
        }
        self.last = Some(size);
        true
    }

    /// Whether `size` would start a new stream.
    pub fn is_new(&self, size: FrameSize) -> bool {
        self.last != Some(size)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Raw display grabber.
///
/// Produces 32-bit pixels in B, G, R, X byte order, row-major without
/// padding.
pub trait ScreenSource: Send {
    /// Grab the screen into `pixels`, returning its dimensions.
    fn grab(&mut self, pixels: &mut Vec<u8>) -> Result<FrameSize, CaptureError>;
}

/// X11 root window capture
#[cfg(all(target_os = "linux", feature = "x11"))]
pub mod x11 {
    use super::*;
    use std::fmt::Display;
    use x11rb::connection::Connection;
    use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, Window};
    use x11rb::rust_connection::RustConnection;

    fn unavailable<E: Display>(e: E) -> CaptureError {
        CaptureError::SourceUnavailable(e.to_string())
    }

    /// Grabs the root window of the default screen.
    ///
    /// The display connection is closed when the source is dropped.
    pub struct X11Source {
        display: RustConnection,
        root: Window,
    }

    impl X11Source {
        /// Connect to the display named by `$DISPLAY`.
        pub fn open() -> Result<Self, CaptureError> {
            let (display, screen_num) = x11rb::connect(None)
                .map_err(|e| CaptureError::Init(format!("Unable to initialize X11: {e}")))?;

            let root = display
                .setup()
                .roots
                .get(screen_num)
                .ok_or_else(|| CaptureError::Init("Screen not found".to_string()))?
                .root;

            log::debug!("Connected to X11 screen {screen_num}");
            Ok(Self { display, root })
        }
    }

    impl ScreenSource for X11Source {
        fn grab(&mut self, pixels: &mut Vec<u8>) -> Result<FrameSize, CaptureError> {
            let geometry = self
                .display
                .get_geometry(self.root)
                .map_err(unavailable)?
                .reply()
                .map_err(unavailable)?;

            let reply = self
                .display
                .get_image(
                    ImageFormat::Z_PIXMAP,
                    self.root,
                    0,
                    0,
                    geometry.width,
                    geometry.height,
                    !0,
                )
                .map_err(unavailable)?
                .reply()
                .map_err(unavailable)?;

            let size = FrameSize::new(geometry.width.into(), geometry.height.into());
            let expected = size.pixels() * SOURCE_BYTES_PER_PIXEL;
            if reply.data.len() != expected {
                return Err(CaptureError::UnsupportedFormat(format!(
                    "depth {} image of {} bytes for {}x{}",
                    reply.depth,
                    reply.data.len(),
                    size.width,
                    size.height
                )));
            }

            *pixels = reply.data;
            Ok(size)
        }
    }
}

/// Test pattern source for platforms without a capture backend
pub mod stub {
    use super::*;

    /// Generates a moving gradient.
    ///
    /// Sizes are taken from a schedule, one per grab; the last entry
    /// repeats forever.
    pub struct PatternSource {
        sizes: Vec<FrameSize>,
        frame_count: u64,
    }

    impl PatternSource {
        pub fn new(width: u32, height: u32) -> Self {
            Self::with_schedule(vec![FrameSize::new(width, height)])
        }

        pub fn with_schedule(sizes: Vec<FrameSize>) -> Self {
            Self {
                sizes,
                frame_count: 0,
            }
        }

        /// Pattern at the default 1024x768 resolution.
        pub fn open() -> Result<Self, CaptureError> {
            Ok(Self::new(1024, 768))
        }

        fn current_size(&self) -> Option<FrameSize> {
            let index = (self.frame_count as usize).min(self.sizes.len().saturating_sub(1));
            self.sizes.get(index).copied()
        }
    }

    impl ScreenSource for PatternSource {
        fn grab(&mut self, pixels: &mut Vec<u8>) -> Result<FrameSize, CaptureError> {
            let size = self
                .current_size()
                .ok_or_else(|| CaptureError::SourceUnavailable("Empty pattern schedule".to_string()))?;

            pixels.resize(size.pixels() * SOURCE_BYTES_PER_PIXEL, 0);

            let phase = (self.frame_count % 256) as u8;
            let width = size.width as usize;
            for (i, pixel) in pixels.chunks_exact_mut(SOURCE_BYTES_PER_PIXEL).enumerate() {
                let (x, y) = (i % width, i / width);
                pixel[0] = (x as u8).wrapping_add(phase);
                pixel[1] = (y as u8).wrapping_add(phase);
                pixel[2] = ((x + y) as u8).wrapping_add(phase);
                pixel[3] = 0xff;
            }

            self.frame_count += 1;
            Ok(size)
        }
    }
}

#[cfg(all(target_os = "linux", feature = "x11"))]
pub use x11::X11Source as DefaultSource;

#[cfg(not(all(target_os = "linux", feature = "x11")))]
pub use stub::PatternSource as DefaultSource;

/// Open the platform's default screen source.
pub fn open_default_source() -> Result<Box<dyn ScreenSource>, CaptureError> {
    Ok(Box::new(DefaultSource::open()?))
}
