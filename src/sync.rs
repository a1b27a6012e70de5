//! Blocking frame grabs for callers that do not want callbacks.

use crate::context::Context;
use crate::device::Device;
use crate::event_loop;
use crate::modes::FrameMode;
use crate::stream::{Frame, StreamState};
use crate::types::{Format, LedMode, Resolution, StreamKind, TiltState};
use crate::{KinectError, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

impl Device {
    /// Block until the stream exposes a frame newer than the one current at
    /// call time and return it.
    ///
    /// A stopped stream is started with its configured format and left
    /// running afterwards. When the context's event thread is running this
    /// waits for it; otherwise the calling thread drives the event loop.
    pub fn get_frame(&self, kind: StreamKind, timeout: Duration) -> Result<Frame> {
        if event_loop::in_callback() {
            return Err(KinectError::invalid_state(
                "get_frame called from inside a frame callback",
            ));
        }
        let slot = self.shared.slot(kind);
        let after = slot.sequence();

        if self.stream_state(kind) == StreamState::Stopped {
            match self.start(kind) {
                Ok(()) => {}
                // Another caller started it first.
                Err(KinectError::InvalidState(_))
                    if self.stream_state(kind) == StreamState::Running => {}
                Err(e) => return Err(e),
            }
        }

        let deadline = Instant::now() + timeout;
        let step = self.ctx.config().poll_timeout;
        loop {
            if let Some(frame) = slot.wait_newer(after, Instant::now()) {
                return Ok(frame);
            }
            if !self.is_open() {
                return Err(KinectError::invalid_state("device closed while waiting"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(KinectError::Timeout);
            }
            if self.ctx.event_loop().has_runner() {
                let wait_until = deadline.min(now + step);
                if let Some(frame) = slot.wait_newer(after, wait_until) {
                    return Ok(frame);
                }
            } else {
                event_loop::process_once(&self.ctx, (deadline - now).min(step))?;
            }
        }
    }

    pub fn get_depth(&self, timeout: Duration) -> Result<Frame> {
        self.get_frame(StreamKind::Depth, timeout)
    }

    pub fn get_video(&self, timeout: Duration) -> Result<Frame> {
        self.get_frame(StreamKind::Video, timeout)
    }
}

/// Grab frames by device index without managing devices or streams.
///
/// Devices are opened on first use and their streams started on the first
/// grab. [`Grabber::stop`] stops every stream and closes every device.
pub struct Grabber {
    ctx: Context,
    devices: HashMap<usize, Device>,
}

impl Grabber {
    /// Initialise a context with default settings and wrap it.
    pub fn new() -> Result<Grabber> {
        Ok(Grabber::with_context(Context::init()?))
    }

    pub fn with_context(ctx: Context) -> Grabber {
        Grabber {
            ctx,
            devices: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn device(&mut self, index: usize) -> Result<&Device> {
        if !self.devices.contains_key(&index) {
            let device = self.ctx.open(index)?;
            self.devices.insert(index, device);
        }
        self.devices.get(&index).ok_or(KinectError::DeviceNotFound)
    }

    pub fn depth(&mut self, index: usize, timeout: Duration) -> Result<Frame> {
        self.device(index)?.get_frame(StreamKind::Depth, timeout)
    }

    pub fn video(&mut self, index: usize, timeout: Duration) -> Result<Frame> {
        self.device(index)?.get_frame(StreamKind::Video, timeout)
    }

    /// Change a stream's format. A running stream is stopped first and
    /// restarts with the new format on the next grab.
    pub fn set_format(
        &mut self,
        index: usize,
        resolution: Resolution,
        format: impl Into<Format>,
    ) -> Result<FrameMode> {
        let format = format.into();
        let device = self.device(index)?;
        device.stop(format.kind());
        device.set_format(format.kind(), resolution, format)
    }

    pub fn set_tilt_degrees(&mut self, index: usize, degrees: f64) -> Result<()> {
        self.device(index)?.set_tilt_degrees(degrees)
    }

    pub fn set_led(&mut self, index: usize, mode: LedMode) -> Result<()> {
        self.device(index)?.set_led(mode)
    }

    pub fn tilt_state(&mut self, index: usize) -> Result<TiltState> {
        self.device(index)?.tilt_state()
    }

    /// Stop all streams and close all devices opened by this grabber.
    pub fn stop(&mut self) {
        for (_, device) in self.devices.drain() {
            device.close();
        }
    }
}

impl Drop for Grabber {
    fn drop(&mut self) {
        self.stop();
    }
}
