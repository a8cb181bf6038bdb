// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Plugin registry
//!
//! Holds every plugin registered at startup and picks the best one to
//! capture with. Plugins are only added while modules are loaded, before
//! the capture loop starts; afterwards the registry is read only.

use log::{debug, info, warn};
use serde::Serialize;

use crate::mjpeg;
use crate::plugin::{
    is_compatible_version, Agent, ConfigureOption, Plugin, PluginModule, PluginSettings, Rank,
    PLUGIN_INTERFACE_OLDEST_COMPATIBLE_VERSION, PLUGIN_INTERFACE_VERSION,
};
use crate::protocol::VideoCodecType;

/// Modules linked into the agent.
pub const BUILTIN_MODULES: &[PluginModule] = &[mjpeg::MODULE];

/// Index of a plugin in registration order.
pub type PluginId = usize;

/// Summary of a registered plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: PluginId,
    pub name: String,
    pub codec: VideoCodecType,
    pub rank: Rank,
    pub settings: PluginSettings,
}

/// Registered plugins
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
    options: Vec<ConfigureOption>,
    modules: Vec<&'static str>,
}

impl PluginRegistry {
    /// Create an empty registry handing `options` to module init entry
    /// points.
    pub fn new(options: Vec<ConfigureOption>) -> Self {
        Self {
            plugins: Vec::new(),
            options,
            modules: Vec::new(),
        }
    }

    /// Check a module's version and run its init entry point.
    ///
    /// Returns whether the module was kept. Plugins registered by a module
    /// that asks to be unloaded are dropped again.
    pub fn load_module(&mut self, module: &PluginModule) -> bool {
        if !is_compatible_version(module.interface_version) {
            warn!(
                "Rejecting plugin module {}: interface version {} (supported {}..={})",
                module.name,
                module.interface_version,
                PLUGIN_INTERFACE_OLDEST_COMPATIBLE_VERSION,
                PLUGIN_INTERFACE_VERSION
            );
            return false;
        }

        let registered = self.plugins.len();
        if !(module.init)(self) {
            warn!("Plugin module {} failed to initialize", module.name);
            self.plugins.truncate(registered);
            return false;
        }

        info!(
            "Loaded plugin module {} ({} plugins)",
            module.name,
            self.plugins.len() - registered
        );
        self.modules.push(module.name);
        true
    }

    /// Load every built-in module, returning how many were kept.
    pub fn load_builtin_modules(&mut self) -> usize {
        BUILTIN_MODULES
            .iter()
            .filter(|module| self.load_module(module))
            .count()
    }

    /// Names of the loaded modules.
    pub fn modules(&self) -> &[&'static str] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugin(&self, id: PluginId) -> Option<&dyn Plugin> {
        self.plugins.get(id).map(|plugin| plugin.as_ref())
    }

    /// Pick the plugin with the highest usable rank.
    ///
    /// Ranks are queried afresh. Plugins in `excluded`, or whose codec is
    /// not in `accepted` when given, are skipped. Ties go to the plugin
    /// registered first.
    pub fn select(
        &self,
        accepted: Option<&[VideoCodecType]>,
        excluded: &[PluginId],
    ) -> Option<PluginId> {
        let mut best: Option<(PluginId, Rank)> = None;

        for (id, plugin) in self.plugins.iter().enumerate() {
            if excluded.contains(&id) {
                continue;
            }
            let codec = plugin.video_codec_type();
            if accepted.is_some_and(|codecs| !codecs.contains(&codec)) {
                continue;
            }

            let rank = plugin.rank();
            debug!("Plugin {} ({}) ranks {rank}", plugin.name(), codec.name());
            if !rank.is_usable() {
                continue;
            }
            if best.map_or(true, |(_, best_rank)| rank > best_rank) {
                best = Some((id, rank));
            }
        }

        best.map(|(id, _)| id)
    }

    /// Describe every registered plugin.
    pub fn describe(&self) -> Vec<PluginInfo> {
        self.plugins
            .iter()
            .enumerate()
            .map(|(id, plugin)| PluginInfo {
                id,
                name: plugin.name().to_string(),
                codec: plugin.video_codec_type(),
                rank: plugin.rank(),
                settings: plugin.settings().clone(),
            })
            .collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Agent for PluginRegistry {
    fn register(&mut self, plugin: Box<dyn Plugin>) {
        info!(
            "Registered plugin {} ({})",
            plugin.name(),
            plugin.video_codec_type().name()
        );
        self.plugins.push(plugin);
    }

    fn options(&self) -> &[ConfigureOption] {
        &self.options
    }
}
