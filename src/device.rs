use crate::codec::Codec;
use crate::context::ContextInner;
use crate::modes::FrameMode;
use crate::protocol::{self, CMD_WRITE_REGISTER};
use crate::stream::{Frame, FrameSlot, Stream, StreamState};
use crate::transport::{RawPacket, Transport};
use crate::types::{
    DeviceInfo, Format, LedMode, Resolution, StreamKind, StreamSet, Subdevice, Subdevices,
    TiltState,
};
use crate::{KinectError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Frame handler invoked from the event loop with the device and the newly
/// exposed frame. The frame reference is only valid for the call.
pub type FrameCallback = Box<dyn FnMut(&Device, &Frame) + Send>;

#[derive(Default)]
struct HandlerSlot {
    callback: Option<FrameCallback>,
    generation: u64,
}

#[derive(Default)]
struct Handlers {
    depth: HandlerSlot,
    video: HandlerSlot,
}

impl Handlers {
    fn slot(&mut self, kind: StreamKind) -> &mut HandlerSlot {
        match kind {
            StreamKind::Depth => &mut self.depth,
            StreamKind::Video => &mut self.video,
        }
    }
}

/// State shared between a [`Device`] handle, its context and the event loop.
pub(crate) struct DeviceShared {
    info: DeviceInfo,
    transport: Box<dyn Transport>,
    codec: Arc<dyn Codec>,
    depth: Mutex<Stream>,
    video: Mutex<Stream>,
    handlers: Mutex<Handlers>,
    tilt: Mutex<Option<TiltState>>,
    led: Mutex<Option<LedMode>>,
    tag: AtomicU16,
    reply_attempts: u32,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceShared {
    pub(crate) fn new(
        info: DeviceInfo,
        transport: Box<dyn Transport>,
        codec: Arc<dyn Codec>,
        reply_attempts: u32,
    ) -> DeviceShared {
        DeviceShared {
            depth: Mutex::new(Stream::new(StreamKind::Depth, codec.as_ref())),
            video: Mutex::new(Stream::new(StreamKind::Video, codec.as_ref())),
            info,
            transport,
            codec,
            handlers: Mutex::new(Handlers::default()),
            tilt: Mutex::new(None),
            led: Mutex::new(None),
            tag: AtomicU16::new(1),
            reply_attempts: reply_attempts.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stream(&self, kind: StreamKind) -> MutexGuard<'_, Stream> {
        match kind {
            StreamKind::Depth => lock(&self.depth),
            StreamKind::Video => lock(&self.video),
        }
    }

    pub(crate) fn slot(&self, kind: StreamKind) -> Arc<FrameSlot> {
        self.stream(kind).slot()
    }

    /// Streams currently running, for the transport poll.
    pub(crate) fn active_streams(&self) -> StreamSet {
        let mut set = StreamSet::empty();
        for kind in StreamKind::ALL {
            if self.stream(kind).state() == StreamState::Running {
                set |= kind.as_set();
            }
        }
        set
    }

    pub(crate) fn poll(&self, active: StreamSet, timeout: Duration) -> Result<Vec<RawPacket>> {
        self.transport.poll(active, timeout)
    }

    /// Feed a batch of packets to the streams. Returns the streams whose
    /// frame-ready condition became true.
    pub(crate) fn ingest(&self, packets: &[RawPacket]) -> StreamSet {
        let codec = self.codec.as_ref();
        let mut depth = lock(&self.depth);
        let mut video = lock(&self.video);
        for packet in packets {
            let Some(decoded) = codec.decode(packet) else {
                log::trace!("Skipping undecodable {:?} packet", packet.kind);
                continue;
            };
            match packet.kind {
                StreamKind::Depth => depth.ingest(&decoded, codec),
                StreamKind::Video => video.ingest(&decoded, codec),
            };
        }
        let mut ready = StreamSet::empty();
        if depth.take_ready() {
            ready |= StreamSet::DEPTH;
        }
        if video.take_ready() {
            ready |= StreamSet::VIDEO;
        }
        ready
    }

    pub(crate) fn latest_frame(&self, kind: StreamKind) -> Option<Frame> {
        self.stream(kind).slot().latest()
    }

    /// Invoke the registered handler for `kind`, if any.
    ///
    /// The handler is taken out of its slot for the call so it may replace or
    /// clear its own registration.
    pub(crate) fn dispatch(&self, device: &Device, kind: StreamKind, frame: &Frame) {
        let (callback, generation) = {
            let mut handlers = lock(&self.handlers);
            let slot = handlers.slot(kind);
            (slot.callback.take(), slot.generation)
        };
        let Some(mut callback) = callback else {
            return;
        };
        // A panicking callback is dropped so the loop keeps serving the rest.
        if panic::catch_unwind(AssertUnwindSafe(|| callback(device, frame))).is_err() {
            log::warn!(
                "Device {}: {:?} callback panicked, removing it",
                self.info.index,
                kind
            );
            return;
        }
        let mut handlers = lock(&self.handlers);
        let slot = handlers.slot(kind);
        if slot.generation == generation && slot.callback.is_none() {
            slot.callback = Some(callback);
        }
    }

    fn set_handler(&self, kind: StreamKind, callback: Option<FrameCallback>) {
        let mut handlers = lock(&self.handlers);
        let slot = handlers.slot(kind);
        slot.callback = callback;
        slot.generation += 1;
    }

    fn require_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KinectError::invalid_state("device is closed"));
        }
        Ok(())
    }

    fn require_subdevice(&self, sub: Subdevice) -> Result<()> {
        self.require_open()?;
        if !self.transport.subdevices().contains_subdevice(sub) {
            return Err(KinectError::invalid_state(format!(
                "{:?} subdevice not open",
                sub
            )));
        }
        Ok(())
    }

    /// Write one camera register and wait for the acknowledgement.
    fn write_register(&self, reg: u16, value: u16) -> Result<()> {
        let tag = self.tag.fetch_add(1, Ordering::Relaxed);
        let command = protocol::build_write_register(tag, reg, value);
        self.transport
            .control_transfer(Subdevice::Camera, &protocol::command_request(command))?;

        for _ in 0..self.reply_attempts {
            let reply = self
                .transport
                .control_transfer(Subdevice::Camera, &protocol::reply_request())?;
            if reply.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            let data = protocol::validate_reply(&reply, CMD_WRITE_REGISTER, tag)?;
            if data.len() >= 2 && u16::from_le_bytes([data[0], data[1]]) != 0 {
                return Err(KinectError::transport(format!(
                    "register {:#06x} write rejected (status {:02x?})",
                    reg, data
                )));
            }
            log::trace!("write_register({:#06x}, {:#06x}) acknowledged", reg, value);
            return Ok(());
        }
        Err(KinectError::transport(format!(
            "no reply to register {:#06x} write",
            reg
        )))
    }

    fn write_registers(&self, sequence: &[(u16, u16)]) -> Result<()> {
        for &(reg, value) in sequence {
            self.write_register(reg, value)?;
        }
        Ok(())
    }

    fn start_stream(&self, kind: StreamKind) -> Result<()> {
        self.require_subdevice(Subdevice::Camera)?;
        let mut stream = self.stream(kind);
        stream.check_start()?;
        let mode = stream.mode();
        let sequence = match kind {
            StreamKind::Depth => protocol::depth_start_sequence(&mode),
            StreamKind::Video => protocol::video_start_sequence(&mode),
        };
        self.write_registers(&sequence)?;
        stream.mark_running();
        log::info!(
            "Device {}: {:?} stream started ({:?} {}x{})",
            self.info.index,
            kind,
            mode.format,
            mode.width,
            mode.height
        );
        Ok(())
    }

    fn stop_stream(&self, kind: StreamKind) {
        let mut stream = self.stream(kind);
        if !stream.mark_stopped() {
            return;
        }
        let sequence = match kind {
            StreamKind::Depth => protocol::depth_stop_sequence(),
            StreamKind::Video => protocol::video_stop_sequence(),
        };
        if let Err(e) = self.write_registers(&sequence) {
            log::warn!(
                "Device {}: {:?} stop command failed: {} (stopped locally)",
                self.info.index,
                kind,
                e
            );
        }
        log::info!("Device {}: {:?} stream stopped", self.info.index, kind);
    }

    /// Stop streams, drop handlers and release the transport. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        for kind in StreamKind::ALL {
            self.stop_stream(kind);
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for kind in StreamKind::ALL {
            self.set_handler(kind, None);
        }
        self.transport.close();
        log::info!("Device {} closed", self.info.index);
    }
}

/// An opened physical unit.
///
/// Handles are cheap to clone; all clones refer to the same unit. The unit is
/// released by [`Device::close`] or when its context shuts down.
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) ctx: Arc<ContextInner>,
}

impl Device {
    pub fn info(&self) -> &DeviceInfo {
        self.shared.info()
    }

    pub fn serial(&self) -> Option<&str> {
        self.shared.info().serial.as_deref()
    }

    /// Subdevices that were opened on this unit.
    pub fn subdevices(&self) -> Subdevices {
        self.shared.transport.subdevices()
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Stop any running streams and release the unit. Idempotent.
    pub fn close(&self) {
        self.shared.close();
        self.ctx.forget_device(&self.shared);
    }

    // -- Streams --

    pub fn stream_state(&self, kind: StreamKind) -> StreamState {
        self.shared.stream(kind).state()
    }

    /// Mode the stream will use (or is using).
    pub fn mode(&self, kind: StreamKind) -> FrameMode {
        self.shared.stream(kind).mode()
    }

    /// Negotiate the stream's resolution and format. Only legal while stopped.
    pub fn set_format(
        &self,
        kind: StreamKind,
        resolution: Resolution,
        format: impl Into<Format>,
    ) -> Result<FrameMode> {
        self.shared.require_open()?;
        self.shared
            .stream(kind)
            .set_format(resolution, format.into(), self.shared.codec.as_ref())
    }

    pub fn set_depth_format(&self, resolution: Resolution, format: crate::DepthFormat) -> Result<FrameMode> {
        self.set_format(StreamKind::Depth, resolution, format)
    }

    pub fn set_video_format(&self, resolution: Resolution, format: crate::VideoFormat) -> Result<FrameMode> {
        self.set_format(StreamKind::Video, resolution, format)
    }

    /// `Stopped -> Running`: send the start sequence to the camera.
    pub fn start(&self, kind: StreamKind) -> Result<()> {
        self.shared.start_stream(kind)
    }

    /// `Running -> Stopped`. No-op when already stopped; device errors are
    /// logged, not returned.
    pub fn stop(&self, kind: StreamKind) {
        self.shared.stop_stream(kind)
    }

    pub fn start_depth(&self) -> Result<()> {
        self.start(StreamKind::Depth)
    }

    pub fn start_video(&self) -> Result<()> {
        self.start(StreamKind::Video)
    }

    pub fn stop_depth(&self) {
        self.stop(StreamKind::Depth)
    }

    pub fn stop_video(&self) {
        self.stop(StreamKind::Video)
    }

    /// Most recently exposed frame, without waiting.
    pub fn latest_frame(&self, kind: StreamKind) -> Option<Frame> {
        self.shared.latest_frame(kind)
    }

    /// Frames dropped by the stream's reassembly.
    pub fn dropped_frames(&self, kind: StreamKind) -> u64 {
        self.shared.stream(kind).dropped_frames()
    }

    // -- Callbacks --

    /// Register the frame handler for `kind`, replacing any previous one.
    pub fn set_callback<F>(&self, kind: StreamKind, callback: F)
    where
        F: FnMut(&Device, &Frame) + Send + 'static,
    {
        self.shared.set_handler(kind, Some(Box::new(callback)));
    }

    pub fn set_depth_callback<F>(&self, callback: F)
    where
        F: FnMut(&Device, &Frame) + Send + 'static,
    {
        self.set_callback(StreamKind::Depth, callback)
    }

    pub fn set_video_callback<F>(&self, callback: F)
    where
        F: FnMut(&Device, &Frame) + Send + 'static,
    {
        self.set_callback(StreamKind::Video, callback)
    }

    pub fn clear_callback(&self, kind: StreamKind) {
        self.shared.set_handler(kind, None);
    }

    // -- Motor, LED, accelerometer --

    /// Tilt the sensor head.
    ///
    /// Angles beyond ±31° are rejected; angles beyond the ±27° mechanical
    /// range are clamped to it.
    pub fn set_tilt_degrees(&self, degrees: f64) -> Result<()> {
        let request = protocol::set_tilt_request(degrees)?;
        self.shared.require_subdevice(Subdevice::Motor)?;
        self.shared
            .transport
            .control_transfer(Subdevice::Motor, &request)?;
        log::debug!("Device {}: tilt set to {}°", self.shared.info.index, degrees);
        Ok(())
    }

    pub fn set_led(&self, mode: LedMode) -> Result<()> {
        self.shared.require_subdevice(Subdevice::Motor)?;
        self.shared
            .transport
            .control_transfer(Subdevice::Motor, &protocol::set_led_request(mode))?;
        *lock(&self.shared.led) = Some(mode);
        log::debug!("Device {}: LED set to {:?}", self.shared.info.index, mode);
        Ok(())
    }

    /// Set the LED from a raw mode value, rejecting unsupported values.
    pub fn set_led_raw(&self, raw: u8) -> Result<()> {
        self.set_led(LedMode::from_raw(raw)?)
    }

    /// Last LED mode successfully set through this handle.
    pub fn led(&self) -> Option<LedMode> {
        *lock(&self.shared.led)
    }

    /// Read the accelerometer and motor state from the device.
    pub fn tilt_state(&self) -> Result<TiltState> {
        self.shared.require_subdevice(Subdevice::Motor)?;
        let data = self
            .shared
            .transport
            .control_transfer(Subdevice::Motor, &protocol::tilt_state_request())?;
        let state = protocol::parse_tilt_state(&data)?;
        *lock(&self.shared.tilt) = Some(state);
        Ok(state)
    }

    /// Tilt state from the last successful [`Device::tilt_state`] read.
    pub fn cached_tilt_state(&self) -> Option<TiltState> {
        *lock(&self.shared.tilt)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.shared.info)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{self, SyntheticBackend};
    use crate::types::{DepthFormat, LedMode, Resolution, StreamKind, Subdevices, TiltStatus};
    use crate::{ContextConfig, KinectError, StreamState};

    #[test]
    fn test_start_sends_register_sequence() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();

        dev.start(StreamKind::Depth).unwrap();
        assert_eq!(dev.stream_state(StreamKind::Depth), StreamState::Running);
        let writes = units[0].register_writes();
        assert_eq!(writes.first(), Some(&(0x105, 0x00)));
        assert!(writes.contains(&(0x06, 0x02)));

        // Starting a running stream is a state error.
        assert!(matches!(
            dev.start(StreamKind::Depth),
            Err(KinectError::InvalidState(_))
        ));
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_start_failure_leaves_stream_stopped() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();

        units[0].fail_controls(true);
        assert!(matches!(
            dev.start(StreamKind::Video),
            Err(KinectError::Transport(_))
        ));
        assert_eq!(dev.stream_state(StreamKind::Video), StreamState::Stopped);
        units[0].fail_controls(false);
        dev.start(StreamKind::Video).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_stop_tolerates_transport_failure() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();

        dev.start(StreamKind::Depth).unwrap();
        units[0].fail_controls(true);
        dev.stop(StreamKind::Depth);
        assert_eq!(dev.stream_state(StreamKind::Depth), StreamState::Stopped);

        // Stop on a stopped stream sends nothing.
        units[0].fail_controls(false);
        let before = units[0].register_writes().len();
        dev.stop(StreamKind::Depth);
        assert_eq!(units[0].register_writes().len(), before);
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_set_format_while_running_is_rejected() {
        let _serial = testing::serial();
        let (backend, _units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();

        dev.set_depth_format(Resolution::Medium, DepthFormat::Bit11)
            .unwrap();
        dev.start_depth().unwrap();
        let err = dev
            .set_depth_format(Resolution::Medium, DepthFormat::Bit10)
            .unwrap_err();
        assert!(matches!(err, KinectError::InvalidState(_)));
        assert_eq!(dev.mode(StreamKind::Depth).data_bits_per_pixel, 11);
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_unsupported_format() {
        let _serial = testing::serial();
        let (backend, _units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();

        assert!(matches!(
            dev.set_depth_format(Resolution::High, DepthFormat::Bit11),
            Err(KinectError::UnsupportedFormat(_))
        ));
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_tilt_and_led() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();

        dev.set_tilt_degrees(15.0).unwrap();
        dev.set_tilt_degrees(29.0).unwrap();
        assert_eq!(units[0].motor_writes(), vec![(0x31, 30), (0x31, 54)]);
        assert!(matches!(
            dev.set_tilt_degrees(45.0),
            Err(KinectError::InvalidParameter(_))
        ));

        dev.set_led(LedMode::BlinkGreen).unwrap();
        assert_eq!(dev.led(), Some(LedMode::BlinkGreen));
        assert!(matches!(
            dev.set_led_raw(9),
            Err(KinectError::InvalidParameter(_))
        ));
        assert_eq!(dev.led(), Some(LedMode::BlinkGreen));
        assert_eq!(units[0].motor_writes().last(), Some(&(0x06, 4)));
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_tilt_state_read_and_cache() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();

        assert!(dev.cached_tilt_state().is_none());
        units[0].set_tilt_reply([0, 0, 0x03, 0x33, 0, 0, 0, 0, 0x14, 0x00]);
        let state = dev.tilt_state().unwrap();
        assert_eq!(state.accelerometer, [819, 0, 0]);
        assert_eq!(state.degrees(), Some(10.0));
        assert_eq!(state.status, Some(TiltStatus::Stopped));
        assert_eq!(dev.cached_tilt_state(), Some(state));

        units[0].fail_controls(true);
        assert!(matches!(dev.tilt_state(), Err(KinectError::Transport(_))));
        assert_eq!(dev.cached_tilt_state(), Some(state));
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_motor_ops_need_motor_subdevice() {
        let _serial = testing::serial();
        let (backend, _units) = SyntheticBackend::with_devices(1);
        let config = ContextConfig {
            subdevices: Subdevices::CAMERA,
            ..testing::config()
        };
        let ctx = testing::context_with(backend, config);
        let dev = ctx.open(0).unwrap();

        assert!(matches!(
            dev.set_led(LedMode::Red),
            Err(KinectError::InvalidState(_))
        ));
        dev.start_depth().unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_callback_replacement() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();
        testing::use_passthrough_depth(&dev);

        let (tx, rx) = crossbeam_channel::unbounded();
        let first = tx.clone();
        dev.set_depth_callback(move |_, f| {
            let _ = first.send(("first", f.sequence));
        });
        let second = tx;
        dev.set_depth_callback(move |_, f| {
            let _ = second.send(("second", f.sequence));
        });
        dev.start_depth().unwrap();

        units[0].queue_frames(StreamKind::Depth, &[1]);
        ctx.process_once(std::time::Duration::from_millis(10)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ("second", 1));
        assert!(rx.try_recv().is_err());

        dev.clear_callback(StreamKind::Depth);
        units[0].queue_frames(StreamKind::Depth, &[2]);
        ctx.process_once(std::time::Duration::from_millis(10)).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(dev.latest_frame(StreamKind::Depth).unwrap().sequence, 2);
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();
        dev.start_depth().unwrap();

        dev.close();
        dev.close();
        assert!(!dev.is_open());
        assert!(units[0].is_closed());
        assert_eq!(dev.stream_state(StreamKind::Depth), StreamState::Stopped);
        assert!(matches!(
            dev.start_depth(),
            Err(KinectError::InvalidState(_))
        ));
        // The unit can be opened again once closed.
        let again = ctx.open(0).unwrap();
        assert!(again.is_open());
        ctx.shutdown().unwrap();
    }
}
