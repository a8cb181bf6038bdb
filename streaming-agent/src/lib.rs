// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Streaming Agent
//!
//! This crate provides the guest-side agent that streams the display of a
//! virtual machine to the host's display server.
//!
//! # Overview
//!
//! The agent runs inside the VM and talks to the host over a virtio
//! character device (the stream port). It:
//!
//! - **Selects a plugin**: every registered codec plugin reports a rank,
//!   and the best usable one opens a capture session
//! - **Captures frames**: the session grabs the screen at the configured
//!   frame rate and compresses each frame
//! - **Streams frames**: each frame is framed as a stream message and
//!   written to the port in full before the next capture starts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Plugin Registry                           │
//! │  - Module version check                                     │
//! │  - Rank based selection                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Capture Session                           │
//! │  - Frame pacing                                             │
//! │  - Stream start detection                                   │
//! │  - Encoding (MJPEG fallback)                                │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Stream Port                               │
//! │  - Format / Data messages                                   │
//! │  - Retried complete reads and writes                        │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Host Display Server                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use streaming_agent::{AgentConfig, PluginRegistry, StreamingAgent};
//!
//! let mut registry = PluginRegistry::new(config.options.clone());
//! registry.load_builtin_modules();
//!
//! let mut agent = StreamingAgent::new(config, registry);
//! agent.run(port.as_fd(), &running)?;
//! ```
//!
//! # Modules
//!
//! - [`port`]: Complete reads and writes on the stream port
//! - [`protocol`]: Stream message definitions
//! - [`capture`]: Frame capture contract and screen sources
//! - [`plugin`]: Plugin interface and options
//! - [`mjpeg`]: MJPEG fallback plugin
//! - [`registry`]: Plugin registration and selection
//! - [`agent`]: Streaming loop

pub mod agent;
pub mod capture;
pub mod mjpeg;
pub mod plugin;
pub mod port;
pub mod protocol;
pub mod registry;

pub use agent::{AgentConfig, AgentError, StepOutcome, StreamingAgent};
pub use capture::{CaptureError, FrameCapture, FrameInfo, FrameSize};
pub use plugin::{Agent, ConfigureOption, Plugin, PluginModule, Rank};
pub use port::PortError;
pub use protocol::VideoCodecType;
pub use registry::PluginRegistry;
