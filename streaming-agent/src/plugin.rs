// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Plugin interface
//!
//! A plugin is a ranked factory for the capture sessions of one codec.
//! Plugins are shipped in modules; each [`PluginModule`] declares the
//! interface version it was built against and an init entry point that
//! registers its plugins with the [`Agent`].
//!
//! # Versioning
//!
//! Bump [`PLUGIN_INTERFACE_VERSION`] on any interface change. If the change
//! only adds to the interface, leave
//! [`PLUGIN_INTERFACE_OLDEST_COMPATIBLE_VERSION`] alone; if something was
//! removed or changed, raise it to the new version.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::capture::{CaptureError, FrameCapture, MAX_FRAMERATE, MIN_FRAMERATE};
use crate::protocol::VideoCodecType;

/// Interface version of this agent
pub const PLUGIN_INTERFACE_VERSION: u32 = 3;

/// Oldest plugin interface version still accepted
pub const PLUGIN_INTERFACE_OLDEST_COMPATIBLE_VERSION: u32 = 3;

/// Whether a module built against `version` may be loaded.
pub fn is_compatible_version(version: u32) -> bool {
    (PLUGIN_INTERFACE_OLDEST_COMPATIBLE_VERSION..=PLUGIN_INTERFACE_VERSION).contains(&version)
}

/// Plugin usability score.
///
/// Only the ordering matters. Values fall in bands:
///
/// | Band | Meaning |
/// |------|---------|
/// | `DONT_USE` | must not be used right now |
/// | `FALLBACK_MIN` .. | fallback only |
/// | `SOFTWARE_MIN` .. | encodes in software |
/// | `HARDWARE_MIN` .. | encodes in hardware |
/// | `SPECIFIC_HARDWARE_MIN` .. | drives specific capture hardware |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Rank(pub u32);

impl Rank {
    pub const DONT_USE: Rank = Rank(0);
    pub const FALLBACK_MIN: Rank = Rank(1);
    pub const SOFTWARE_MIN: Rank = Rank(0x4000_0000);
    pub const HARDWARE_MIN: Rank = Rank(0x8000_0000);
    pub const SPECIFIC_HARDWARE_MIN: Rank = Rank(0xC000_0000);

    pub fn is_usable(&self) -> bool {
        *self != Rank::DONT_USE
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let band = if *self >= Rank::SPECIFIC_HARDWARE_MIN {
            "specific-hardware"
        } else if *self >= Rank::HARDWARE_MIN {
            "hardware"
        } else if *self >= Rank::SOFTWARE_MIN {
            "software"
        } else if *self >= Rank::FALLBACK_MIN {
            "fallback"
        } else {
            "dont-use"
        };
        write!(f, "{band}({:#x})", self.0)
    }
}

/// Errors raised when applying a plugin option.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("Invalid value '{value}' for option '{name}'")]
    InvalidValue { name: String, value: String },

    #[error("Value '{value}' for option '{name}' is out of range [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: String,
        min: i64,
        max: i64,
    },

    #[error("Invalid option '{name}'")]
    Unknown { name: String },

    #[error("Invalid option syntax '{0}', expected NAME=VALUE")]
    Syntax(String),
}

/// A `name=value` configuration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureOption {
    pub name: String,
    pub value: String,
}

impl ConfigureOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether the option is meant for plugins of `codec`.
    ///
    /// Unscoped names apply to everyone; `codec.name` applies to `codec`.
    pub fn applies_to(&self, codec: VideoCodecType) -> bool {
        match self.name.split_once('.') {
            Some((scope, _)) => scope == codec.name(),
            None => true,
        }
    }
}

impl FromStr for ConfigureOption {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok(Self::new(name, value)),
            _ => Err(OptionError::Syntax(s.to_string())),
        }
    }
}

/// Parse `value` as an integer within `min..=max`.
pub fn option_value_as_int(name: &str, value: &str, min: i64, max: i64) -> Result<i64, OptionError> {
    let parsed: i64 = value.trim().parse().map_err(|_| OptionError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })?;

    if parsed < min || parsed > max {
        return Err(OptionError::OutOfRange {
            name: name.to_string(),
            value: value.to_string(),
            min,
            max,
        });
    }
    Ok(parsed)
}

/// Settings every plugin recognizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSettings {
    /// Frames per second, 1-240
    pub framerate: u32,
    /// Normalized quality, 0-100 (100 = best)
    pub quality: u32,
    /// Target average bitrate
    pub avg_bitrate: u32,
    /// Target maximum bitrate
    pub max_bitrate: u32,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            framerate: 30,
            quality: 80,
            avg_bitrate: 3_000_000,
            max_bitrate: 8_000_000,
        }
    }
}

impl PluginSettings {
    /// Apply one of the base options.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        let bitrate_max = i64::from(i32::MAX);
        match name {
            "framerate" => {
                self.framerate = option_value_as_int(
                    name,
                    value,
                    MIN_FRAMERATE.into(),
                    MAX_FRAMERATE.into(),
                )? as u32;
            }
            "quality" => self.quality = option_value_as_int(name, value, 0, 100)? as u32,
            "avg_bitrate" => self.avg_bitrate = option_value_as_int(name, value, 1, bitrate_max)? as u32,
            "max_bitrate" => self.max_bitrate = option_value_as_int(name, value, 1, bitrate_max)? as u32,
            _ => {
                return Err(OptionError::Unknown {
                    name: name.to_string(),
                })
            }
        }
        Ok(())
    }
}

/// A ranked capture factory for one codec.
pub trait Plugin: Send {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Open a capture session.
    ///
    /// `Ok(None)` means the plugin cannot initialize right now.
    fn create_capture(&self) -> Result<Option<Box<dyn FrameCapture>>, CaptureError>;

    /// Current rank. Conditions change, so this is queried before every
    /// selection.
    fn rank(&self) -> Rank;

    /// Codec produced by this plugin's sessions.
    fn video_codec_type(&self) -> VideoCodecType;

    fn settings(&self) -> &PluginSettings;

    fn settings_mut(&mut self) -> &mut PluginSettings;

    /// Apply one option. Plugins with codec specific options handle those
    /// first and defer the rest here.
    fn apply_option(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        self.settings_mut().apply(name, value)
    }
}

/// Apply the options meant for `plugin`'s codec, collecting failures.
///
/// A failing option leaves the plugin untouched and does not stop the
/// remaining ones from being applied.
pub fn apply_options(plugin: &mut dyn Plugin, options: &[ConfigureOption]) -> Vec<OptionError> {
    let codec = plugin.video_codec_type();
    options
        .iter()
        .filter(|option| option.applies_to(codec))
        .filter_map(|option| plugin.apply_option(&option.name, &option.value).err())
        .collect()
}

/// Host side interface handed to module init entry points.
pub trait Agent {
    /// Register a plugin.
    fn register(&mut self, plugin: Box<dyn Plugin>);

    /// Options configured for plugins.
    fn options(&self) -> &[ConfigureOption];
}

/// Module init entry point.
///
/// Returns whether the module should stay loaded. A module may return true
/// after a partial failure when it cannot be safely unloaded.
pub type PluginInitFn = fn(&mut dyn Agent) -> bool;

/// A plugin module descriptor.
#[derive(Debug, Clone, Copy)]
pub struct PluginModule {
    pub name: &'static str,
    /// Interface version the module was built against
    pub interface_version: u32,
    pub init: PluginInitFn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_bands_ordered() {
        assert!(Rank::DONT_USE < Rank::FALLBACK_MIN);
        assert!(Rank::FALLBACK_MIN < Rank::SOFTWARE_MIN);
        assert!(Rank::SOFTWARE_MIN < Rank::HARDWARE_MIN);
        assert!(Rank::HARDWARE_MIN < Rank::SPECIFIC_HARDWARE_MIN);
        assert!(!Rank::DONT_USE.is_usable());
        assert!(Rank::FALLBACK_MIN.is_usable());
    }

    #[test]
    fn test_rank_display() {
        assert_eq!(Rank::DONT_USE.to_string(), "dont-use(0x0)");
        assert_eq!(Rank(Rank::SOFTWARE_MIN.0 + 5).to_string(), "software(0x40000005)");
        assert_eq!(Rank::SPECIFIC_HARDWARE_MIN.to_string(), "specific-hardware(0xc0000000)");
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible_version(PLUGIN_INTERFACE_VERSION));
        assert!(!is_compatible_version(PLUGIN_INTERFACE_VERSION + 1));
        assert!(!is_compatible_version(PLUGIN_INTERFACE_OLDEST_COMPATIBLE_VERSION - 1));
        assert!(!is_compatible_version(0));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = PluginSettings::default();
        assert_eq!(settings.framerate, 30);
        assert_eq!(settings.quality, 80);
        assert_eq!(settings.avg_bitrate, 3_000_000);
        assert_eq!(settings.max_bitrate, 8_000_000);
    }

    #[test]
    fn test_framerate_range() {
        let mut settings = PluginSettings::default();

        let err = settings.apply("framerate", "0").unwrap_err();
        assert!(err.to_string().contains("framerate"));
        assert!(err.to_string().contains('0'));

        let err = settings.apply("framerate", "300").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Value '300' for option 'framerate' is out of range [1, 240]"
        );
        assert_eq!(settings.framerate, 30);

        settings.apply("framerate", "60").unwrap();
        assert_eq!(settings.framerate, 60);
    }

    #[test]
    fn test_invalid_value_keeps_settings() {
        let mut settings = PluginSettings::default();
        let err = settings.apply("quality", "high").unwrap_err();
        assert_eq!(
            err,
            OptionError::InvalidValue {
                name: "quality".to_string(),
                value: "high".to_string()
            }
        );
        assert_eq!(settings, PluginSettings::default());
    }

    #[test]
    fn test_bitrates() {
        let mut settings = PluginSettings::default();
        settings.apply("avg_bitrate", "1000000").unwrap();
        settings.apply("max_bitrate", " 2000000 ").unwrap();
        assert_eq!(settings.avg_bitrate, 1_000_000);
        assert_eq!(settings.max_bitrate, 2_000_000);
        assert!(settings.apply("max_bitrate", "0").is_err());
        assert!(settings.apply("avg_bitrate", "99999999999").is_err());
    }

    #[test]
    fn test_unknown_option() {
        let mut settings = PluginSettings::default();
        assert_eq!(
            settings.apply("gamma", "1").unwrap_err().to_string(),
            "Invalid option 'gamma'"
        );
    }

    #[test]
    fn test_configure_option_parse() {
        let option: ConfigureOption = "framerate=25".parse().unwrap();
        assert_eq!(option, ConfigureOption::new("framerate", "25"));

        let option: ConfigureOption = "mjpeg.quality=a=b".parse().unwrap();
        assert_eq!(option.value, "a=b");

        assert!("framerate".parse::<ConfigureOption>().is_err());
        assert!("=5".parse::<ConfigureOption>().is_err());
    }

    #[test]
    fn test_option_scope() {
        assert!(ConfigureOption::new("framerate", "1").applies_to(VideoCodecType::Vp8));
        assert!(ConfigureOption::new("mjpeg.quality", "1").applies_to(VideoCodecType::Mjpeg));
        assert!(!ConfigureOption::new("mjpeg.quality", "1").applies_to(VideoCodecType::H264));
    }
}
