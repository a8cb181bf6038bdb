// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! MJPEG fallback plugin
//!
//! Grabs the whole screen and compresses every frame as a standalone JPEG.
//! Works anywhere a [`ScreenSource`] does, so it registers with a fallback
//! rank and is only chosen when nothing better is usable.

use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use log::{debug, error};

use crate::capture::{
    open_default_source, CaptureError, FrameCapture, FrameInfo, FramePacer, ScreenSource,
    SizeTracker, SOURCE_BYTES_PER_PIXEL,
};
use crate::plugin::{
    apply_options, option_value_as_int, Agent, OptionError, Plugin, PluginModule, PluginSettings,
    Rank, PLUGIN_INTERFACE_VERSION,
};
use crate::protocol::VideoCodecType;

/// Builds the screen source of a new capture session.
pub type SourceFactory = fn() -> Result<Box<dyn ScreenSource>, CaptureError>;

/// Built-in MJPEG module
pub const MODULE: PluginModule = PluginModule {
    name: "mjpeg",
    interface_version: PLUGIN_INTERFACE_VERSION,
    init,
};

fn init(agent: &mut dyn Agent) -> bool {
    let mut plugin = MjpegPlugin::new();

    for e in apply_options(&mut plugin, agent.options()) {
        error!("Error parsing plugin option: {e}");
    }

    agent.register(Box::new(plugin));
    true
}

/// Capture session producing JPEG frames.
pub struct MjpegFrameCapture {
    source: Box<dyn ScreenSource>,
    pacer: FramePacer,
    quality: u8,
    sizes: SizeTracker,
    /// Raw BGRX pixels of the last grab
    pixels: Vec<u8>,
    /// RGB conversion scratch buffer
    rgb: Vec<u8>,
    /// Last compressed frame
    frame: Vec<u8>,
}

impl MjpegFrameCapture {
    pub fn new(source: Box<dyn ScreenSource>, settings: &PluginSettings) -> Self {
        Self {
            source,
            pacer: FramePacer::new(settings.framerate),
            quality: settings.quality.clamp(1, 100) as u8,
            sizes: SizeTracker::default(),
            pixels: Vec::new(),
            rgb: Vec::new(),
            frame: Vec::new(),
        }
    }

    /// Pacer driving this session.
    pub fn pacer(&self) -> &FramePacer {
        &self.pacer
    }

    fn bgrx_to_rgb(pixels: &[u8], rgb: &mut Vec<u8>) {
        rgb.clear();
        rgb.reserve(pixels.len() / SOURCE_BYTES_PER_PIXEL * 3);
        for px in pixels.chunks_exact(SOURCE_BYTES_PER_PIXEL) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
}

impl FrameCapture for MjpegFrameCapture {
    fn capture_frame(&mut self) -> Result<FrameInfo<'_>, CaptureError> {
        self.pacer.wait();

        let size = self.source.grab(&mut self.pixels)?;
        if self.pixels.len() < size.pixels() * SOURCE_BYTES_PER_PIXEL {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} bytes for a {}x{} frame",
                self.pixels.len(),
                size.width,
                size.height
            )));
        }

        Self::bgrx_to_rgb(&self.pixels, &mut self.rgb);

        self.frame.clear();
        JpegEncoder::new_with_quality(&mut self.frame, self.quality)
            .encode(&self.rgb, size.width, size.height, ColorType::Rgb8)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        let stream_start = self.sizes.update(size);
        debug!(
            "Captured {}x{} frame, {} bytes{}",
            size.width,
            size.height,
            self.frame.len(),
            if stream_start { " (stream start)" } else { "" }
        );

        Ok(FrameInfo {
            size,
            buffer: &self.frame,
            stream_start,
        })
    }

    fn reset(&mut self) {
        self.frame.clear();
        self.sizes.reset();
    }

    fn video_codec_type(&self) -> VideoCodecType {
        VideoCodecType::Mjpeg
    }
}

/// MJPEG plugin
pub struct MjpegPlugin {
    settings: PluginSettings,
    open_source: SourceFactory,
}

impl MjpegPlugin {
    /// Plugin capturing from the platform's default source.
    pub fn new() -> Self {
        Self::with_source_factory(open_default_source)
    }

    pub fn with_source_factory(open_source: SourceFactory) -> Self {
        Self {
            settings: PluginSettings::default(),
            open_source,
        }
    }
}

impl Default for MjpegPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for MjpegPlugin {
    fn name(&self) -> &str {
        "mjpeg"
    }

    fn create_capture(&self) -> Result<Option<Box<dyn FrameCapture>>, CaptureError> {
        let source = (self.open_source)()?;
        Ok(Some(Box::new(MjpegFrameCapture::new(source, &self.settings))))
    }

    fn rank(&self) -> Rank {
        Rank::FALLBACK_MIN
    }

    fn video_codec_type(&self) -> VideoCodecType {
        VideoCodecType::Mjpeg
    }

    fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut PluginSettings {
        &mut self.settings
    }

    fn apply_option(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        match name {
            "mjpeg.quality" => {
                self.settings.quality = option_value_as_int(name, value, 0, 100)? as u32;
                Ok(())
            }
            _ => self.settings.apply(name, value),
        }
    }
}
