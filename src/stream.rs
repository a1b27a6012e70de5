//! Per-stream state machine and double-buffered frame storage.

use crate::codec::{Codec, Decoded, Marker};
use crate::modes::{self, FrameMode};
use crate::types::{Format, Resolution, StreamKind};
use crate::{KinectError, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// One complete, decoded unit of stream data.
///
/// Cloning is cheap: the payload is shared and never mutated after publish.
#[derive(Clone)]
pub struct Frame {
    pub kind: StreamKind,
    /// Per-stream capture counter, starting at 1.
    pub sequence: u64,
    /// Device clock timestamp from the first packet of the frame.
    pub timestamp: u32,
    pub mode: FrameMode,
    payload: Arc<Vec<u8>>,
}

impl Frame {
    pub fn width(&self) -> u16 {
        self.mode.width
    }

    pub fn height(&self) -> u16 {
        self.mode.height
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.mode.data_bits_per_pixel
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Depth or IR sample at (x, y) for 16-bit unpacked formats.
    pub fn sample_u16(&self, x: u16, y: u16) -> Option<u16> {
        if x >= self.mode.width || y >= self.mode.height || self.mode.bytes != self.mode.pixels() * 2
        {
            return None;
        }
        let offset = (y as usize * self.mode.width as usize + x as usize) * 2;
        let bytes = self.payload.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("format", &self.mode.format)
            .field("width", &self.mode.width)
            .field("height", &self.mode.height)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Running,
}

/// The exposed side of a stream's double buffer.
///
/// Publishing replaces the frame under the lock, so a reader either sees the
/// previous complete frame or the new one.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
    published: Condvar,
}

impl FrameSlot {
    pub fn latest(&self) -> Option<Frame> {
        self.latest.lock().ok().and_then(|f| f.clone())
    }

    /// Sequence of the exposed frame, 0 when none has been published.
    pub fn sequence(&self) -> u64 {
        self.latest
            .lock()
            .ok()
            .and_then(|f| f.as_ref().map(|f| f.sequence))
            .unwrap_or(0)
    }

    fn publish(&self, frame: Frame) -> Option<Frame> {
        let previous = match self.latest.lock() {
            Ok(mut slot) => slot.replace(frame),
            Err(_) => return None,
        };
        self.published.notify_all();
        previous
    }

    /// Block until a frame newer than `after` is published or `deadline` passes.
    pub fn wait_newer(&self, after: u64, deadline: Instant) -> Option<Frame> {
        let mut guard = self.latest.lock().ok()?;
        loop {
            if let Some(frame) = guard.as_ref().filter(|f| f.sequence > after) {
                return Some(frame.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self.published.wait_timeout(guard, deadline - now).ok()?.0;
        }
    }

    /// Wake any waiters without publishing.
    pub fn wake(&self) {
        self.published.notify_all();
    }
}

/// Per-device, per-stream state: negotiated mode, fill buffer, exposed slot.
pub struct Stream {
    kind: StreamKind,
    state: StreamState,
    mode: FrameMode,
    raw_size: usize,
    /// Fill side: raw bytes of the frame in progress.
    fill: Vec<u8>,
    /// Reclaimed payload buffer from an earlier frame no consumer still holds.
    spare: Option<Arc<Vec<u8>>>,
    synced: bool,
    next_sequence: u8,
    frame_timestamp: u32,
    frames: u64,
    dropped: u64,
    ready: bool,
    slot: Arc<FrameSlot>,
}

impl Stream {
    pub fn new(kind: StreamKind, codec: &dyn Codec) -> Stream {
        let mode = modes::default_mode(kind);
        Stream {
            kind,
            state: StreamState::Stopped,
            mode,
            raw_size: codec.raw_frame_size(&mode),
            fill: Vec::new(),
            spare: None,
            synced: false,
            next_sequence: 0,
            frame_timestamp: 0,
            frames: 0,
            dropped: 0,
            ready: false,
            slot: Arc::new(FrameSlot::default()),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    pub fn slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }

    /// Frames discarded because of packet loss or short fills.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Negotiate a new mode. Only legal while stopped.
    pub fn set_format(
        &mut self,
        resolution: Resolution,
        format: Format,
        codec: &dyn Codec,
    ) -> Result<FrameMode> {
        self.require(StreamState::Stopped, "set_format")?;
        if format.kind() != self.kind {
            return Err(KinectError::UnsupportedFormat(format!(
                "{:?} is not a {:?} format",
                format, self.kind
            )));
        }
        let mode = modes::find_mode(resolution, format)?;
        self.mode = mode;
        self.raw_size = codec.raw_frame_size(&mode);
        log::debug!("{:?} stream format set to {:?}", self.kind, mode);
        Ok(mode)
    }

    fn require(&self, expected: StreamState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(KinectError::invalid_state(format!(
                "{} on {:?} stream requires {:?}, stream is {:?}",
                op, self.kind, expected, self.state
            )));
        }
        Ok(())
    }

    /// Check that `Stopped -> Running` is legal.
    pub fn check_start(&self) -> Result<()> {
        self.require(StreamState::Stopped, "start")
    }

    pub(crate) fn mark_running(&mut self) {
        self.reset_fill();
        self.ready = false;
        self.state = StreamState::Running;
    }

    /// `Running -> Stopped`. Returns false when the stream was already stopped.
    pub(crate) fn mark_stopped(&mut self) -> bool {
        if self.state == StreamState::Stopped {
            return false;
        }
        self.state = StreamState::Stopped;
        self.reset_fill();
        self.ready = false;
        self.slot.wake();
        true
    }

    fn reset_fill(&mut self) {
        self.fill.clear();
        self.synced = false;
    }

    /// Feed one decoded packet. Returns true when it completed a frame.
    pub fn ingest(&mut self, packet: &Decoded<'_>, codec: &dyn Codec) -> bool {
        if self.state != StreamState::Running {
            return false;
        }
        match packet.marker {
            Marker::Start => {
                if self.synced && !self.fill.is_empty() {
                    log::debug!(
                        "{:?} frame restarted after {} of {} bytes",
                        self.kind,
                        self.fill.len(),
                        self.raw_size
                    );
                    self.dropped += 1;
                }
                self.fill.clear();
                self.synced = true;
                self.frame_timestamp = packet.timestamp;
            }
            Marker::Middle | Marker::End => {
                if !self.synced {
                    log::trace!("{:?} packet before frame start, skipping", self.kind);
                    return false;
                }
                if packet.sequence != self.next_sequence {
                    log::warn!(
                        "{:?} lost packets (expected seq {}, got {}), dropping frame",
                        self.kind,
                        self.next_sequence,
                        packet.sequence
                    );
                    self.dropped += 1;
                    self.reset_fill();
                    return false;
                }
            }
        }
        self.next_sequence = packet.sequence.wrapping_add(1);

        if self.fill.len() + packet.payload.len() > self.raw_size {
            log::warn!(
                "{:?} frame overflow ({} + {} > {} bytes), dropping frame",
                self.kind,
                self.fill.len(),
                packet.payload.len(),
                self.raw_size
            );
            self.dropped += 1;
            self.reset_fill();
            return false;
        }
        self.fill.extend_from_slice(packet.payload);

        let full = self.fill.len() == self.raw_size;
        if packet.is_frame_complete() && !full {
            log::warn!(
                "{:?} short frame ({} of {} bytes), dropping",
                self.kind,
                self.fill.len(),
                self.raw_size
            );
            self.dropped += 1;
            self.reset_fill();
            return false;
        }
        if full {
            self.complete(codec);
            return true;
        }
        false
    }

    /// Unpack the fill buffer into the spare payload and publish it.
    fn complete(&mut self, codec: &dyn Codec) {
        let mut payload = self
            .spare
            .take()
            .filter(|a| Arc::strong_count(a) == 1)
            .unwrap_or_else(|| Arc::new(Vec::with_capacity(self.mode.bytes)));
        match Arc::get_mut(&mut payload) {
            Some(buf) => codec.unpack(&self.mode, &self.fill, buf),
            None => {
                let mut buf = Vec::with_capacity(self.mode.bytes);
                codec.unpack(&self.mode, &self.fill, &mut buf);
                payload = Arc::new(buf);
            }
        }
        self.frames += 1;
        let frame = Frame {
            kind: self.kind,
            sequence: self.frames,
            timestamp: self.frame_timestamp,
            mode: self.mode,
            payload,
        };
        // The frame that just left the exposed slot becomes the next spare.
        self.spare = self.slot.publish(frame).map(|old| old.payload);
        self.ready = true;
        self.reset_fill();
    }

    /// Consume the frame-ready condition.
    pub fn take_ready(&mut self) -> bool {
        std::mem::take(&mut self.ready)
    }
}
