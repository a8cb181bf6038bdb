// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Streaming agent main implementation
//!
//! Drives the capture loop: listens for server requests on the stream
//! port, keeps one capture session open on the best ranked plugin, and
//! sends every captured frame to the server. A failing plugin is dropped
//! and the next best one takes over.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::capture::{CaptureError, FrameCapture};
use crate::plugin::ConfigureOption;
use crate::port::{self, PortError};
use crate::protocol::{self, ProtocolError, ServerMessage, VideoCodecType};
use crate::registry::{PluginId, PluginRegistry};

/// Default stream port device
pub const DEFAULT_PORT_PATH: &str = "/dev/virtio-ports/org.spice-space.stream.0";

/// Streaming agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Stream port device path
    pub port_path: String,
    /// Options handed to plugin modules
    pub options: Vec<ConfigureOption>,
    /// How long to wait for server messages while idle
    pub poll_interval: Duration,
    /// Delay before retrying when no plugin is usable
    pub retry_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port_path: DEFAULT_PORT_PATH.to_string(),
            options: Vec::new(),
            poll_interval: Duration::from_millis(100),
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Errors that end the streaming loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Stream port failure: {0}")]
    Port(#[from] PortError),

    #[error("Stream protocol failure: {0}")]
    Protocol(#[from] ProtocolError),
}

impl AgentError {
    /// True when the server closed the port.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AgentError::Port(e) | AgentError::Protocol(ProtocolError::Port(e)) => e.is_eof(),
            _ => false,
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Streaming has not been requested
    Idle,
    /// No plugin could open a capture session
    NoPlugin,
    /// The active session failed and was dropped
    CaptureFailed,
    /// A frame was sent
    FrameSent { stream_start: bool },
}

/// Open capture session bound to a plugin.
struct CaptureSession {
    plugin: PluginId,
    codec: VideoCodecType,
    capture: Box<dyn FrameCapture>,
}

enum FrameError {
    Capture(CaptureError),
    Protocol(ProtocolError),
}

/// Capture one frame from `session` and send it.
///
/// The frame buffer is borrowed from the session and fully written before
/// this returns.
fn stream_frame(session: &mut CaptureSession, fd: BorrowedFd<'_>) -> Result<bool, FrameError> {
    let frame = session.capture.capture_frame().map_err(FrameError::Capture)?;

    if frame.stream_start {
        info!(
            "Starting {} stream at {}x{}",
            session.codec.name(),
            frame.size.width,
            frame.size.height
        );
        protocol::send_format(fd, frame.size, session.codec).map_err(FrameError::Protocol)?;
    }
    protocol::send_data(fd, frame.buffer).map_err(FrameError::Protocol)?;

    Ok(frame.stream_start)
}

/// Streaming state requested by the server
#[derive(Debug, Default)]
struct StreamRequest {
    active: bool,
    codecs: Vec<VideoCodecType>,
}

/// Streaming agent
pub struct StreamingAgent {
    /// Configuration
    config: AgentConfig,
    /// Registered plugins
    registry: PluginRegistry,
    /// Active capture session
    session: Option<CaptureSession>,
    /// What the server asked for
    request: StreamRequest,
    /// Plugin that failed last and sits out the next selection
    last_failed: Option<PluginId>,
    /// Frames sent so far
    frame_count: u64,
}

impl StreamingAgent {
    /// Create an agent over an already populated registry.
    pub fn new(config: AgentConfig, registry: PluginRegistry) -> Self {
        Self {
            config,
            registry,
            session: None,
            request: StreamRequest::default(),
            last_failed: None,
            frame_count: 0,
        }
    }

    /// Whether the server has asked for frames.
    pub fn is_streaming(&self) -> bool {
        self.request.active
    }

    /// Plugin backing the current capture session.
    pub fn active_plugin(&self) -> Option<PluginId> {
        self.session.as_ref().map(|session| session.plugin)
    }

    /// Get frame count
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Start streaming with the given codecs without waiting for the
    /// server to ask.
    pub fn request_stream(&mut self, codecs: Vec<VideoCodecType>) {
        self.apply_start_stop(codecs);
    }

    fn apply_start_stop(&mut self, codecs: Vec<VideoCodecType>) {
        if codecs.is_empty() {
            if self.request.active {
                info!("Server stopped streaming");
            }
            self.request = StreamRequest::default();
            self.stop_session();
            return;
        }

        if self.request.codecs != codecs {
            info!(
                "Server accepts codecs: {}",
                codecs.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
            );
            self.stop_session();
        }
        self.request = StreamRequest {
            active: true,
            codecs,
        };
    }

    fn handle_message(&mut self, fd: BorrowedFd<'_>, message: ServerMessage) -> Result<(), AgentError> {
        match message {
            ServerMessage::Capabilities(caps) => {
                debug!("Server capabilities: {caps:02x?}");
                protocol::send_capabilities(fd)?;
            }
            ServerMessage::StartStop(codecs) => self.apply_start_stop(codecs),
        }
        Ok(())
    }

    /// Handle server messages, waiting at most `timeout` for the first.
    fn process_incoming(&mut self, fd: BorrowedFd<'_>, timeout: Duration) -> Result<(), AgentError> {
        let mut timeout = timeout;
        while port::poll_readable(fd, timeout)? {
            match protocol::read_server_message(fd) {
                Ok(message) => self.handle_message(fd, message)?,
                Err(e @ ProtocolError::Port(_)) => return Err(e.into()),
                Err(e) => {
                    // Best effort: the port may already be unusable.
                    if let Err(notify) = protocol::send_error(fd, 0, &e.to_string()) {
                        warn!("Failed to report protocol error: {notify}");
                    }
                    return Err(e.into());
                }
            }
            timeout = Duration::ZERO;
        }
        Ok(())
    }

    /// Open a session on the best usable plugin.
    fn start_session(&mut self) -> Option<CaptureSession> {
        let mut excluded: Vec<PluginId> = self.last_failed.take().into_iter().collect();
        let accepted = Some(self.request.codecs.as_slice()).filter(|codecs| !codecs.is_empty());

        loop {
            let id = self.registry.select(accepted, &excluded)?;
            let plugin = self.registry.plugin(id)?;

            match plugin.create_capture() {
                Ok(Some(capture)) => {
                    info!("Capturing with plugin {}", plugin.name());
                    return Some(CaptureSession {
                        plugin: id,
                        codec: capture.video_codec_type(),
                        capture,
                    });
                }
                Ok(None) => info!("Plugin {} cannot capture right now", plugin.name()),
                Err(e) => warn!("Plugin {} failed to start capture: {e}", plugin.name()),
            }
            excluded.push(id);
        }
    }

    fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Closing capture session of plugin {}", session.plugin);
        }
    }

    /// Run one iteration of the streaming loop.
    ///
    /// Capture failures are recovered here by dropping the session; port
    /// and protocol failures are returned.
    pub fn step(&mut self, fd: BorrowedFd<'_>) -> Result<StepOutcome, AgentError> {
        let timeout = if self.request.active {
            Duration::ZERO
        } else {
            self.config.poll_interval
        };
        self.process_incoming(fd, timeout)?;

        if !self.request.active {
            return Ok(StepOutcome::Idle);
        }

        if self.session.is_none() {
            self.session = self.start_session();
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(StepOutcome::NoPlugin);
        };

        let plugin = session.plugin;
        match stream_frame(session, fd) {
            Ok(stream_start) => {
                self.frame_count += 1;
                Ok(StepOutcome::FrameSent { stream_start })
            }
            Err(FrameError::Capture(e)) => {
                warn!("Capture with plugin {plugin} failed: {e}");
                self.stop_session();
                self.last_failed = Some(plugin);
                Ok(StepOutcome::CaptureFailed)
            }
            Err(FrameError::Protocol(e)) => Err(e.into()),
        }
    }

    /// Stream until `running` is cleared or the port fails.
    pub fn run(&mut self, fd: BorrowedFd<'_>, running: &AtomicBool) -> Result<(), AgentError> {
        info!("Streaming agent running with {} plugins", self.registry.len());

        let mut warned = false;
        while running.load(Ordering::SeqCst) {
            match self.step(fd) {
                Ok(StepOutcome::NoPlugin) => {
                    if !warned {
                        warn!("No usable plugin, retrying every {:?}", self.config.retry_interval);
                        warned = true;
                    }
                    thread::sleep(self.config.retry_interval);
                }
                Ok(StepOutcome::FrameSent { .. }) => warned = false,
                Ok(_) => {}
                Err(e) => {
                    self.stop_session();
                    return Err(e);
                }
            }
        }

        self.stop_session();
        info!("Streaming agent stopped after {} frames", self.frame_count);
        Ok(())
    }
}

impl Drop for StreamingAgent {
    fn drop(&mut self) {
        self.stop_session();
    }
}
