use crate::protocol::{
    self, CAMERA_INTERFACE, DEPTH_ENDPOINT, DEPTH_PACKET_SIZE, PID_CAMERA, PID_MOTOR, VID,
    VIDEO_ENDPOINT, VIDEO_PACKET_SIZE,
};
use crate::transport::{Backend, ControlRequest, RawPacket, Transport};
use crate::types::{DeviceInfo, StreamKind, StreamSet, Subdevice, Subdevices};
use crate::{KinectError, Result};
use rusb::ffi::{self, constants::*};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// Isochronous transfers kept in flight per stream.
const TRANSFERS_PER_STREAM: usize = 16;
/// Packets carried by each isochronous transfer.
const PACKETS_PER_TRANSFER: usize = 16;
/// libusb reads a zero timeout as "wait forever".
const MIN_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1);
/// How long teardown waits for cancelled transfers to come back.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

fn transfer_timeout(timeout: Duration) -> Duration {
    timeout.max(MIN_TRANSFER_TIMEOUT)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// libusb-backed device access.
///
/// Control transfers go through rusb. The stream endpoints are isochronous,
/// which rusb does not wrap, so they are driven through `rusb::ffi`.
pub struct UsbBackend {
    context: Context,
    control_timeout: Duration,
}

impl UsbBackend {
    pub fn new(control_timeout: Duration) -> Result<UsbBackend> {
        let context = Context::new().map_err(|e| KinectError::Init(format!("libusb: {}", e)))?;
        Ok(UsbBackend {
            context,
            control_timeout,
        })
    }

    fn find_by_pid(&self, pid: u16) -> Result<Vec<Device<Context>>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| KinectError::transport(format!("enumerate: {}", e)))?;
        Ok(devices
            .iter()
            .filter(|d| {
                d.device_descriptor()
                    .map(|desc| desc.vendor_id() == VID && desc.product_id() == pid)
                    .unwrap_or(false)
            })
            .collect())
    }

    fn cameras(&self) -> Result<Vec<Device<Context>>> {
        let mut cameras = self.find_by_pid(PID_CAMERA)?;
        cameras.sort_by_key(|d| (d.bus_number(), d.address()));
        Ok(cameras)
    }

    /// Find the motor that shares a hub with `camera`.
    fn paired_motor(&self, camera: &Device<Context>) -> Result<Option<Device<Context>>> {
        let hub = |d: &Device<Context>| -> Option<Vec<u8>> {
            let mut ports = d.port_numbers().ok()?;
            ports.pop();
            Some(ports)
        };
        let camera_hub = hub(camera);
        Ok(self
            .find_by_pid(PID_MOTOR)?
            .into_iter()
            .find(|m| m.bus_number() == camera.bus_number() && hub(m) == camera_hub))
    }

    fn read_serial(&self, device: &Device<Context>) -> Option<String> {
        let desc = device.device_descriptor().ok()?;
        let handle = device.open().ok()?;
        handle.read_serial_number_string_ascii(&desc).ok()
    }
}

impl Backend for UsbBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let cameras = self.cameras()?;
        Ok(cameras
            .iter()
            .enumerate()
            .map(|(index, camera)| DeviceInfo {
                index,
                serial: self.read_serial(camera),
                bus: camera.bus_number(),
                address: camera.address(),
            })
            .collect())
    }

    fn open(&self, info: &DeviceInfo, subdevices: Subdevices) -> Result<Box<dyn Transport>> {
        let camera = self
            .cameras()?
            .into_iter()
            .find(|d| d.bus_number() == info.bus && d.address() == info.address)
            .ok_or(KinectError::DeviceNotFound)?;

        let camera_handle = if subdevices.contains(Subdevices::CAMERA) {
            let handle = camera.open()?;
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                log::debug!("Auto-detach unavailable: {}", e);
            }
            handle.claim_interface(CAMERA_INTERFACE)?;
            log::info!(
                "Opened camera at bus {} addr {}",
                info.bus,
                info.address
            );
            Some(handle)
        } else {
            None
        };

        let motor_handle = if subdevices.contains(Subdevices::MOTOR) {
            match self.paired_motor(&camera)? {
                Some(motor) => {
                    let handle = motor.open()?;
                    log::info!(
                        "Opened motor at bus {} addr {}",
                        motor.bus_number(),
                        motor.address()
                    );
                    Some(handle)
                }
                None => {
                    log::warn!("No motor paired with camera at bus {} addr {}", info.bus, info.address);
                    None
                }
            }
        } else {
            None
        };

        if camera_handle.is_none() && motor_handle.is_none() {
            return Err(KinectError::DeviceNotFound);
        }

        Ok(Box::new(UsbTransport {
            streams: Mutex::new([None, None]),
            context: self.context.clone(),
            camera: RwLock::new(camera_handle),
            motor: RwLock::new(motor_handle),
            control_timeout: transfer_timeout(self.control_timeout),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Packets collected by the completion callback of one stream.
struct IsoRing {
    kind: StreamKind,
    packets: Mutex<Vec<RawPacket>>,
    stopping: AtomicBool,
    in_flight: AtomicUsize,
}

/// Copy out one packet per descriptor. Isochronous packets sit at fixed
/// offsets in the buffer but carry their own actual lengths.
fn collect_iso_packets(
    kind: StreamKind,
    buffer: &[u8],
    descriptors: &[ffi::libusb_iso_packet_descriptor],
    out: &mut Vec<RawPacket>,
) {
    let mut offset = 0usize;
    for desc in descriptors {
        let len = (desc.actual_length as usize).min(desc.length as usize);
        if desc.status == LIBUSB_TRANSFER_COMPLETED && len > 0 {
            if let Some(data) = buffer.get(offset..offset + len) {
                out.push(RawPacket {
                    kind,
                    data: data.to_vec(),
                });
            }
        }
        offset += desc.length as usize;
    }
}

extern "system" fn iso_transfer_complete(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: `user_data` points at the `IsoRing` owned by the `IsoStream`
    // that submitted this transfer, which is not freed while any of its
    // transfers are in flight. The buffer and descriptor array were sized
    // for `num_iso_packets` packets at allocation.
    let ring = unsafe { &*((*transfer).user_data as *const IsoRing) };
    let status = unsafe { (*transfer).status };
    if status == LIBUSB_TRANSFER_COMPLETED {
        let (buffer, descriptors) = unsafe {
            let count = (*transfer).num_iso_packets.max(0) as usize;
            let descriptors = std::slice::from_raw_parts(
                std::ptr::addr_of!((*transfer).iso_packet_desc)
                    as *const ffi::libusb_iso_packet_descriptor,
                count,
            );
            let buffer = std::slice::from_raw_parts(
                (*transfer).buffer,
                (*transfer).length.max(0) as usize,
            );
            (buffer, descriptors)
        };
        collect_iso_packets(ring.kind, buffer, descriptors, &mut lock(&ring.packets));
    }

    let resubmit = !ring.stopping.load(Ordering::Acquire)
        && status != LIBUSB_TRANSFER_CANCELLED
        && status != LIBUSB_TRANSFER_NO_DEVICE;
    if resubmit {
        // SAFETY: the transfer is fully set up and no longer owned by libusb.
        let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
        if rc == 0 {
            return;
        }
        log::warn!("{:?} transfer resubmit failed: error {}", ring.kind, rc);
    } else if status == LIBUSB_TRANSFER_NO_DEVICE {
        log::warn!("{:?} stream lost its device", ring.kind);
    }
    ring.in_flight.fetch_sub(1, Ordering::AcqRel);
}

/// Run libusb's event handling for at most `timeout`; completion callbacks
/// fire on this thread.
fn handle_events(context: &Context, timeout: Duration) -> Result<()> {
    let timeout = transfer_timeout(timeout);
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: the context outlives the call and `tv` is a valid timeval.
    let rc = unsafe {
        ffi::libusb_handle_events_timeout_completed(context.as_raw(), &tv, std::ptr::null_mut())
    };
    match rc {
        0 | LIBUSB_ERROR_INTERRUPTED => Ok(()),
        rc => Err(KinectError::transport(format!("handle events: error {}", rc))),
    }
}

/// A ring of isochronous transfers kept queued on one stream endpoint.
struct IsoStream {
    context: Context,
    ring: Box<IsoRing>,
    transfers: Vec<*mut ffi::libusb_transfer>,
    buffers: Vec<Box<[u8]>>,
}

// SAFETY: the transfer pointers are only touched under the transport's
// stream lock or by libusb's completion callback, which synchronises
// through the ring's atomics and mutex.
unsafe impl Send for IsoStream {}

impl IsoStream {
    fn start(context: &Context, handle: &DeviceHandle<Context>, kind: StreamKind) -> Result<IsoStream> {
        let (endpoint, packet_size) = match kind {
            StreamKind::Depth => (DEPTH_ENDPOINT, DEPTH_PACKET_SIZE),
            StreamKind::Video => (VIDEO_ENDPOINT, VIDEO_PACKET_SIZE),
        };
        let mut stream = IsoStream {
            context: context.clone(),
            ring: Box::new(IsoRing {
                kind,
                packets: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            transfers: Vec::with_capacity(TRANSFERS_PER_STREAM),
            buffers: Vec::with_capacity(TRANSFERS_PER_STREAM),
        };
        let user_data = &*stream.ring as *const IsoRing as *mut c_void;

        for _ in 0..TRANSFERS_PER_STREAM {
            let mut buffer = vec![0u8; packet_size * PACKETS_PER_TRANSFER].into_boxed_slice();
            // SAFETY: plain allocation; checked for null below.
            let transfer = unsafe { ffi::libusb_alloc_transfer(PACKETS_PER_TRANSFER as c_int) };
            if transfer.is_null() {
                return Err(KinectError::transport(format!("{:?}: transfer allocation failed", kind)));
            }
            // SAFETY: `transfer` has room for PACKETS_PER_TRANSFER descriptors
            // and `buffer` stays alive (and unmoved on the heap) in
            // `stream.buffers` until the transfer is freed.
            unsafe {
                ffi::libusb_fill_iso_transfer(
                    transfer,
                    handle.as_raw(),
                    endpoint,
                    buffer.as_mut_ptr(),
                    buffer.len() as c_int,
                    PACKETS_PER_TRANSFER as c_int,
                    iso_transfer_complete,
                    user_data,
                    0,
                );
                ffi::libusb_set_iso_packet_lengths(transfer, packet_size as c_uint);
            }
            stream.transfers.push(transfer);
            stream.buffers.push(buffer);

            stream.ring.in_flight.fetch_add(1, Ordering::AcqRel);
            // SAFETY: the transfer was filled above.
            let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
            if rc != 0 {
                stream.ring.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(KinectError::transport(format!(
                    "{:?}: submit isochronous transfer: error {}",
                    kind, rc
                )));
            }
        }
        log::info!(
            "{:?} stream: {} isochronous transfers queued on endpoint {:#04x}",
            kind,
            TRANSFERS_PER_STREAM,
            endpoint
        );
        Ok(stream)
    }

    /// True when every transfer has completed without being resubmitted.
    fn is_stalled(&self) -> bool {
        self.ring.in_flight.load(Ordering::Acquire) == 0
    }

    fn take_packets(&self, out: &mut Vec<RawPacket>) {
        out.append(&mut lock(&self.ring.packets));
    }
}

impl Drop for IsoStream {
    fn drop(&mut self) {
        self.ring.stopping.store(true, Ordering::Release);
        for &transfer in &self.transfers {
            // SAFETY: the transfer is allocated; cancelling one that is not
            // in flight returns an error that is safe to ignore.
            unsafe {
                ffi::libusb_cancel_transfer(transfer);
            }
        }
        let deadline = Instant::now() + CANCEL_GRACE;
        while !self.is_stalled() && Instant::now() < deadline {
            if let Err(e) = handle_events(&self.context, Duration::from_millis(10)) {
                log::warn!("{:?} stream teardown: {}", self.ring.kind, e);
                break;
            }
        }
        if !self.is_stalled() {
            // libusb may still write into these; leak rather than free.
            log::warn!("{:?} stream: transfers still pending, leaking buffers", self.ring.kind);
            let kind = self.ring.kind;
            std::mem::forget(std::mem::take(&mut self.buffers));
            std::mem::forget(std::mem::replace(
                &mut self.ring,
                Box::new(IsoRing {
                    kind,
                    packets: Mutex::new(Vec::new()),
                    stopping: AtomicBool::new(true),
                    in_flight: AtomicUsize::new(0),
                }),
            ));
            return;
        }
        for &transfer in &self.transfers {
            // SAFETY: no transfer is in flight any more.
            unsafe { ffi::libusb_free_transfer(transfer) };
        }
        log::debug!("{:?} stream transfers released", self.ring.kind);
    }
}

/// One opened unit: camera and motor handles.
///
/// Transfers share the read lock; only `close` takes the write lock.
struct UsbTransport {
    /// Isochronous rings, indexed by `StreamKind`. Declared first so they are
    /// reaped before the handles close.
    streams: Mutex<[Option<IsoStream>; 2]>,
    context: Context,
    camera: RwLock<Option<DeviceHandle<Context>>>,
    motor: RwLock<Option<DeviceHandle<Context>>>,
    control_timeout: Duration,
    closed: AtomicBool,
}

impl UsbTransport {
    fn with_handle<T>(
        &self,
        target: Subdevice,
        f: impl FnOnce(&DeviceHandle<Context>) -> Result<T>,
    ) -> Result<T> {
        let slot = match target {
            Subdevice::Camera => &self.camera,
            Subdevice::Motor => &self.motor,
        };
        let guard = slot
            .read()
            .map_err(|_| KinectError::transport("USB handle lock poisoned"))?;
        let handle = guard
            .as_ref()
            .ok_or_else(|| KinectError::invalid_state(format!("{:?} subdevice not open", target)))?;
        f(handle)
    }
}

impl Transport for UsbTransport {
    fn subdevices(&self) -> Subdevices {
        let mut subs = Subdevices::empty();
        if self.camera.read().map(|h| h.is_some()).unwrap_or(false) {
            subs |= Subdevices::CAMERA;
        }
        if self.motor.read().map(|h| h.is_some()).unwrap_or(false) {
            subs |= Subdevices::MOTOR;
        }
        subs
    }

    fn control_transfer(&self, target: Subdevice, request: &ControlRequest) -> Result<Vec<u8>> {
        let timeout = self.control_timeout;
        self.with_handle(target, |handle| {
            if request.is_read() {
                let mut buf = vec![0u8; request.length];
                let n = handle
                    .read_control(
                        request.request_type,
                        request.request,
                        request.value,
                        request.index,
                        &mut buf,
                        timeout,
                    )
                    .map_err(|e| KinectError::transport(format!("control read: {}", e)))?;
                buf.truncate(n);
                Ok(buf)
            } else {
                handle
                    .write_control(
                        request.request_type,
                        request.request,
                        request.value,
                        request.index,
                        &request.payload,
                        timeout,
                    )
                    .map_err(|e| KinectError::transport(format!("control write: {}", e)))?;
                Ok(Vec::new())
            }
        })
    }

    fn poll(&self, active: StreamSet, timeout: Duration) -> Result<Vec<RawPacket>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KinectError::invalid_state("transport closed"));
        }
        let mut streams = lock(&self.streams);
        self.with_handle(Subdevice::Camera, |handle| {
            for kind in StreamKind::ALL {
                let slot = &mut streams[kind as usize];
                match (active.contains(kind.as_set()), slot.is_some()) {
                    (true, false) => *slot = Some(IsoStream::start(&self.context, handle, kind)?),
                    // Dropping the ring cancels and reaps its transfers.
                    (false, true) => *slot = None,
                    _ => {}
                }
            }
            Ok(())
        })?;

        let mut packets = Vec::new();
        if streams.iter().all(Option::is_none) {
            return Ok(packets);
        }
        handle_events(&self.context, timeout)?;
        for stream in streams.iter().flatten() {
            stream.take_packets(&mut packets);
        }
        let stalled = streams
            .iter()
            .flatten()
            .find(|s| s.is_stalled())
            .map(|s| s.ring.kind);
        if let Some(kind) = stalled {
            streams[kind as usize] = None;
            if packets.is_empty() {
                return Err(KinectError::transport(format!(
                    "{:?} stream stalled, no transfers in flight",
                    kind
                )));
            }
        }
        Ok(packets)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.streams) = [None, None];
        if let Ok(mut camera) = self.camera.write() {
            if let Some(handle) = camera.take() {
                let _ = handle.release_interface(protocol::CAMERA_INTERFACE);
            }
        }
        if let Ok(mut motor) = self.motor.write() {
            motor.take();
        }
        log::info!("USB transport closed");
    }
}
