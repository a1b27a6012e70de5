//! Synthetic backend for unit tests.
//!
//! Each [`SyntheticUnit`] behaves like a camera/motor pair: it acknowledges
//! register writes, tracks the stream registers to size its frames, answers
//! tilt state reads and emits stream packets in the wire format. Every byte of
//! a generated frame carries that frame's marker value.

use crate::context::Context;
use crate::device::Device;
use crate::protocol::{
    self, CMD_WRITE_REGISTER, DEPTH_PACKET_SIZE, FLAG_DEPTH, FLAG_END, FLAG_MIDDLE, FLAG_START,
    FLAG_VIDEO, PACKET_HEADER_SIZE, PACKET_MAGIC, REQ_TILT_STATE, TILT_STATE_SIZE,
    VIDEO_PACKET_SIZE,
};
use crate::transport::{Backend, ControlRequest, RawPacket, Transport};
use crate::types::{
    DepthFormat, DeviceInfo, Resolution, StreamKind, StreamSet, Subdevice, Subdevices,
};
use crate::{ContextConfig, KinectError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialise tests that create a context.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn config() -> ContextConfig {
    ContextConfig {
        subdevices: Subdevices::MOTOR | Subdevices::CAMERA,
        poll_timeout: Duration::from_millis(5),
        control_timeout: Duration::from_millis(100),
        reply_attempts: 10,
    }
}

pub(crate) fn context(backend: SyntheticBackend) -> Context {
    context_with(backend, config())
}

pub(crate) fn context_with(backend: SyntheticBackend, config: ContextConfig) -> Context {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::builder()
        .backend(backend)
        .config(config)
        .init()
        .unwrap()
}

pub(crate) fn serial_of(index: usize) -> String {
    format!("SYN{:08}", index)
}

/// Use a depth format whose payload is the raw frame, so markers survive.
pub(crate) fn use_passthrough_depth(dev: &Device) {
    dev.set_depth_format(Resolution::Medium, DepthFormat::Bit11Packed)
        .unwrap();
}

/// Split one raw frame into wire packets.
pub(crate) fn packetize(kind: StreamKind, raw: &[u8], seq: &mut u8, timestamp: u32) -> Vec<RawPacket> {
    let (flag, packet_size) = match kind {
        StreamKind::Depth => (FLAG_DEPTH, DEPTH_PACKET_SIZE),
        StreamKind::Video => (FLAG_VIDEO, VIDEO_PACKET_SIZE),
    };
    let chunks: Vec<&[u8]> = raw.chunks(packet_size - PACKET_HEADER_SIZE).collect();
    let last = chunks.len().saturating_sub(1);
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let position = match i {
                0 => FLAG_START,
                i if i == last => FLAG_END,
                _ => FLAG_MIDDLE,
            };
            let mut data = Vec::with_capacity(PACKET_HEADER_SIZE + chunk.len());
            data.extend_from_slice(&PACKET_MAGIC);
            data.push(0);
            data.push(flag | position);
            data.push(0);
            data.push(*seq);
            data.extend_from_slice(&[0, 0]);
            data.extend_from_slice(&timestamp.to_le_bytes());
            data.extend_from_slice(chunk);
            *seq = seq.wrapping_add(1);
            RawPacket { kind, data }
        })
        .collect()
}

fn dims(resolution_register: u16) -> (usize, usize) {
    match resolution_register {
        0x02 => (1280, 1024),
        _ => (640, 480),
    }
}

#[derive(Default)]
struct UnitState {
    registers: HashMap<u16, u16>,
    register_writes: Vec<(u16, u16)>,
    motor_writes: Vec<(u8, u16)>,
    pending_reply: Option<Vec<u8>>,
    queued: [VecDeque<RawPacket>; 2],
    auto: [bool; 2],
    markers: [u8; 2],
    sequences: [u8; 2],
    timestamp: u32,
    tilt_reply: [u8; TILT_STATE_SIZE],
    fail_controls: bool,
    fail_next_poll: bool,
    opened: bool,
    ever_opened: bool,
    polls_after_close: usize,
}

impl UnitState {
    fn register(&self, reg: u16) -> u16 {
        self.registers.get(&reg).copied().unwrap_or(0)
    }

    /// Raw frame size implied by the stream registers last written.
    fn raw_frame_size(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Depth => {
                let bits = if self.register(0x12) == 0x03 { 11 } else { 10 };
                let (w, h) = dims(self.register(0x13));
                w * h * bits / 8
            }
            StreamKind::Video if self.register(0x05) == 0x03 => {
                let (w, h) = match self.register(0x1a) {
                    0x02 => (1280, 1024),
                    _ => (640, 488),
                };
                w * h * 10 / 8
            }
            StreamKind::Video => {
                let (w, h) = dims(self.register(0x0d));
                if self.register(0x0c) == 0x05 {
                    w * h * 2
                } else {
                    w * h
                }
            }
        }
    }

    fn next_marker(&mut self, kind: StreamKind) -> u8 {
        let m = &mut self.markers[kind as usize];
        *m = m.wrapping_add(1).max(1);
        *m
    }

    fn queue_frame(&mut self, kind: StreamKind, marker: u8) {
        let raw = vec![marker; self.raw_frame_size(kind)];
        self.timestamp = self.timestamp.wrapping_add(1000);
        let timestamp = self.timestamp;
        let packets = packetize(kind, &raw, &mut self.sequences[kind as usize], timestamp);
        self.queued[kind as usize].extend(packets);
    }
}

/// One simulated physical unit, shared between the backend and the test.
#[derive(Default)]
pub(crate) struct SyntheticUnit {
    state: Mutex<UnitState>,
}

impl SyntheticUnit {
    fn state(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue one frame per marker, delivered by the next poll.
    pub(crate) fn queue_frames(&self, kind: StreamKind, markers: &[u8]) {
        let mut state = self.state();
        for &marker in markers {
            state.queue_frame(kind, marker);
        }
    }

    /// Queue a raw packet as-is.
    pub(crate) fn queue_raw(&self, kind: StreamKind, data: Vec<u8>) {
        self.state().queued[kind as usize].push_back(RawPacket { kind, data });
    }

    /// Generate a fresh frame on every poll of `kind`.
    pub(crate) fn set_auto_frames(&self, kind: StreamKind, on: bool) {
        self.state().auto[kind as usize] = on;
    }

    pub(crate) fn fail_controls(&self, fail: bool) {
        self.state().fail_controls = fail;
    }

    pub(crate) fn fail_next_poll(&self) {
        self.state().fail_next_poll = true;
    }

    pub(crate) fn set_tilt_reply(&self, reply: [u8; TILT_STATE_SIZE]) {
        self.state().tilt_reply = reply;
    }

    pub(crate) fn register_writes(&self) -> Vec<(u16, u16)> {
        self.state().register_writes.clone()
    }

    pub(crate) fn motor_writes(&self) -> Vec<(u8, u16)> {
        self.state().motor_writes.clone()
    }

    pub(crate) fn is_opened(&self) -> bool {
        self.state().opened
    }

    /// True once the unit has been opened and then released.
    pub(crate) fn is_closed(&self) -> bool {
        let state = self.state();
        state.ever_opened && !state.opened
    }

    pub(crate) fn polls_after_close(&self) -> usize {
        self.state().polls_after_close
    }
}

struct BackendInner {
    units: Mutex<Vec<Arc<SyntheticUnit>>>,
    fail_enumerate: bool,
}

#[derive(Clone)]
pub(crate) struct SyntheticBackend {
    inner: Arc<BackendInner>,
}

impl SyntheticBackend {
    pub(crate) fn with_devices(count: usize) -> (SyntheticBackend, Vec<Arc<SyntheticUnit>>) {
        let units: Vec<_> = (0..count).map(|_| Arc::new(SyntheticUnit::default())).collect();
        let backend = SyntheticBackend {
            inner: Arc::new(BackendInner {
                units: Mutex::new(units.clone()),
                fail_enumerate: false,
            }),
        };
        (backend, units)
    }

    /// A backend whose enumeration always fails.
    pub(crate) fn failing() -> SyntheticBackend {
        SyntheticBackend {
            inner: Arc::new(BackendInner {
                units: Mutex::new(Vec::new()),
                fail_enumerate: true,
            }),
        }
    }

    /// Attach another unit.
    pub(crate) fn plug(&self) -> Arc<SyntheticUnit> {
        let unit = Arc::new(SyntheticUnit::default());
        self.units().push(unit.clone());
        unit
    }

    fn units(&self) -> MutexGuard<'_, Vec<Arc<SyntheticUnit>>> {
        self.inner.units.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Backend for SyntheticBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        if self.inner.fail_enumerate {
            return Err(KinectError::transport("synthetic enumeration failure"));
        }
        Ok((0..self.units().len())
            .map(|index| DeviceInfo {
                index,
                serial: Some(serial_of(index)),
                bus: 1,
                address: index as u8 + 1,
            })
            .collect())
    }

    fn open(&self, info: &DeviceInfo, subdevices: Subdevices) -> Result<Box<dyn Transport>> {
        let unit = self
            .units()
            .get(info.address as usize - 1)
            .cloned()
            .ok_or(KinectError::DeviceNotFound)?;
        {
            let mut state = unit.state();
            state.opened = true;
            state.ever_opened = true;
        }
        Ok(Box::new(SyntheticTransport {
            unit,
            subdevices,
            closed: AtomicBool::new(false),
        }))
    }
}

struct SyntheticTransport {
    unit: Arc<SyntheticUnit>,
    subdevices: Subdevices,
    closed: AtomicBool,
}

impl SyntheticTransport {
    fn camera_transfer(state: &mut UnitState, request: &ControlRequest) -> Result<Vec<u8>> {
        if request.is_read() {
            return Ok(state.pending_reply.take().unwrap_or_default());
        }
        let cmd = &request.payload;
        if cmd.len() < 8 || cmd[0..2] != protocol::CMD_MAGIC {
            return Err(KinectError::transport("malformed camera command"));
        }
        let opcode = u16::from_le_bytes([cmd[4], cmd[5]]);
        let tag = u16::from_le_bytes([cmd[6], cmd[7]]);
        if opcode == CMD_WRITE_REGISTER && cmd.len() >= 12 {
            let reg = u16::from_le_bytes([cmd[8], cmd[9]]);
            let value = u16::from_le_bytes([cmd[10], cmd[11]]);
            state.registers.insert(reg, value);
            state.register_writes.push((reg, value));
        }
        state.pending_reply = Some(protocol::build_reply(opcode, tag, &[0, 0]));
        Ok(Vec::new())
    }

    fn motor_transfer(state: &mut UnitState, request: &ControlRequest) -> Result<Vec<u8>> {
        if request.is_read() && request.request == REQ_TILT_STATE {
            return Ok(state.tilt_reply.to_vec());
        }
        state.motor_writes.push((request.request, request.value));
        Ok(Vec::new())
    }
}

impl Transport for SyntheticTransport {
    fn subdevices(&self) -> Subdevices {
        self.subdevices
    }

    fn control_transfer(&self, target: Subdevice, request: &ControlRequest) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KinectError::transport("transport closed"));
        }
        if !self.subdevices.contains_subdevice(target) {
            return Err(KinectError::invalid_state(format!("{:?} not open", target)));
        }
        let mut state = self.unit.state();
        if state.fail_controls {
            return Err(KinectError::transport("synthetic control failure"));
        }
        match target {
            Subdevice::Camera => Self::camera_transfer(&mut state, request),
            Subdevice::Motor => Self::motor_transfer(&mut state, request),
        }
    }

    fn poll(&self, active: StreamSet, timeout: Duration) -> Result<Vec<RawPacket>> {
        let mut packets = Vec::new();
        {
            let mut state = self.unit.state();
            if self.closed.load(Ordering::Acquire) {
                state.polls_after_close += 1;
                return Err(KinectError::transport("transport closed"));
            }
            if std::mem::take(&mut state.fail_next_poll) {
                return Err(KinectError::transport("synthetic poll failure"));
            }
            for kind in StreamKind::ALL {
                if !active.contains(kind.as_set()) {
                    continue;
                }
                if state.auto[kind as usize] {
                    let marker = state.next_marker(kind);
                    state.queue_frame(kind, marker);
                }
                packets.extend(state.queued[kind as usize].drain(..));
            }
        }
        if packets.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(packets)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unit.state().opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, KinectCodec, Marker};

    #[test]
    fn test_packetize_marks_frame_boundaries() {
        let raw = vec![9u8; 4000];
        let mut seq = 250;
        let packets = packetize(StreamKind::Depth, &raw, &mut seq, 77);
        assert_eq!(packets.len(), 3);
        assert_eq!(seq, 253u8);
        let markers: Vec<Marker> = packets
            .iter()
            .map(|p| KinectCodec.decode(p).unwrap().marker)
            .collect();
        assert_eq!(markers, vec![Marker::Start, Marker::Middle, Marker::End]);
        let total: usize = packets
            .iter()
            .map(|p| KinectCodec.decode(p).unwrap().payload.len())
            .sum();
        assert_eq!(total, raw.len());
    }
}
