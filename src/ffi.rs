//! C FFI layer for kinect.
//!
//! Provides an opaque handle-based API for C/C++ consumers. Functions that
//! can fail return NULL or -1 and record a message for `kn_last_error()`.

use crate::context::Context;
use crate::device::Device;
use crate::error::LastError;
use crate::types::{DepthFormat, LedMode, Resolution, StreamKind, TiltStatus, VideoFormat};
use crate::{KinectError, Result};
use std::ffi::{c_char, c_int, CStr};
use std::time::Duration;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque context handle for C consumers.
pub struct KnContext(Context);

/// Opaque device handle for C consumers.
pub struct KnDevice(Device);

/// Accelerometer and motor state in C-compatible layout.
#[repr(C)]
pub struct KnTiltState {
    /// Raw accelerometer counts [x, y, z].
    pub accelerometer: [i16; 3],
    /// Accelerometer in m/s² [x, y, z].
    pub mks_accel: [f64; 3],
    /// Tilt angle in degrees; NaN while the motor reports unknown.
    pub tilt_degrees: f64,
    /// 0 stopped, 1 at limit, 4 moving, -1 unknown.
    pub status: c_int,
}

/// Metadata of a frame copied by `kn_get_frame`.
#[repr(C)]
pub struct KnFrameInfo {
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u8,
    pub bytes: usize,
    pub sequence: u64,
    pub timestamp: u32,
}

fn report<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(v) => {
            LAST_ERROR.clear();
            Some(v)
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            None
        }
    }
}

fn status_code(result: Result<()>) -> c_int {
    match report(result) {
        Some(()) => 0,
        None => -1,
    }
}

fn null_handle() -> c_int {
    LAST_ERROR.set(&KinectError::InvalidParameter("null handle".into()));
    -1
}

fn stream_kind(raw: c_int) -> Result<StreamKind> {
    match raw {
        0 => Ok(StreamKind::Depth),
        1 => Ok(StreamKind::Video),
        other => Err(KinectError::InvalidParameter(format!("stream kind {}", other))),
    }
}

fn resolution(raw: c_int) -> Result<Resolution> {
    match raw {
        0 => Ok(Resolution::Low),
        1 => Ok(Resolution::Medium),
        2 => Ok(Resolution::High),
        other => Err(KinectError::InvalidParameter(format!("resolution {}", other))),
    }
}

fn video_format(raw: c_int) -> Result<VideoFormat> {
    Ok(match raw {
        0 => VideoFormat::Rgb,
        1 => VideoFormat::Bayer,
        2 => VideoFormat::Ir8Bit,
        3 => VideoFormat::Ir10Bit,
        4 => VideoFormat::Ir10BitPacked,
        5 => VideoFormat::YuvRgb,
        6 => VideoFormat::YuvRaw,
        other => {
            return Err(KinectError::InvalidParameter(format!("video format {}", other)))
        }
    })
}

fn depth_format(raw: c_int) -> Result<DepthFormat> {
    Ok(match raw {
        0 => DepthFormat::Bit11,
        1 => DepthFormat::Bit10,
        2 => DepthFormat::Bit11Packed,
        3 => DepthFormat::Bit10Packed,
        other => {
            return Err(KinectError::InvalidParameter(format!("depth format {}", other)))
        }
    })
}

fn led_mode(raw: c_int) -> Result<LedMode> {
    u8::try_from(raw)
        .map_err(|_| KinectError::InvalidParameter(format!("unsupported LED mode {}", raw)))
        .and_then(LedMode::from_raw)
}

/// Initialise a context with configuration from the environment.
/// Returns NULL on error (check kn_last_error()).
#[no_mangle]
pub extern "C" fn kn_init() -> *mut KnContext {
    match report(Context::init()) {
        Some(ctx) => Box::into_raw(Box::new(KnContext(ctx))),
        None => std::ptr::null_mut(),
    }
}

/// Shut down a context, closing its devices, and free it.
///
/// # Safety
/// `ctx` must be a pointer returned by `kn_init`, or null. Device handles
/// opened from it stay valid to free but report errors.
#[no_mangle]
pub unsafe extern "C" fn kn_shutdown(ctx: *mut KnContext) {
    if !ctx.is_null() {
        let ctx = Box::from_raw(ctx);
        if let Err(e) = ctx.0.shutdown() {
            LAST_ERROR.set(&e);
        }
    }
}

/// Number of attached devices, or -1 on error.
///
/// # Safety
/// `ctx` must be a valid context pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_num_devices(ctx: *const KnContext) -> c_int {
    if ctx.is_null() {
        return null_handle();
    }
    match report((*ctx).0.num_devices()) {
        Some(n) => n as c_int,
        None => -1,
    }
}

/// Run one event loop iteration. Returns 0 on success, -1 on error.
///
/// # Safety
/// `ctx` must be a valid context pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_process_events(ctx: *const KnContext, timeout_ms: u32) -> c_int {
    if ctx.is_null() {
        return null_handle();
    }
    status_code((*ctx).0.process_once(Duration::from_millis(timeout_ms as u64)))
}

/// Open a device by enumeration index. Returns NULL on error.
///
/// # Safety
/// `ctx` must be a valid context pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_open_device(ctx: *const KnContext, index: c_int) -> *mut KnDevice {
    if ctx.is_null() || index < 0 {
        LAST_ERROR.set(&KinectError::InvalidParameter("null context or negative index".into()));
        return std::ptr::null_mut();
    }
    match report((*ctx).0.open(index as usize)) {
        Some(dev) => Box::into_raw(Box::new(KnDevice(dev))),
        None => std::ptr::null_mut(),
    }
}

/// Open a device by its serial number. Returns NULL on error.
///
/// # Safety
/// `ctx` must be a valid context pointer and `serial` a null-terminated
/// string, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_open_device_by_serial(
    ctx: *const KnContext,
    serial: *const c_char,
) -> *mut KnDevice {
    if ctx.is_null() || serial.is_null() {
        LAST_ERROR.set(&KinectError::InvalidParameter("null argument".into()));
        return std::ptr::null_mut();
    }
    let serial = CStr::from_ptr(serial).to_string_lossy();
    match report((*ctx).0.open(&*serial)) {
        Some(dev) => Box::into_raw(Box::new(KnDevice(dev))),
        None => std::ptr::null_mut(),
    }
}

/// Close a device and free its handle.
///
/// # Safety
/// `dev` must be a pointer returned by `kn_open_device*`, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_close_device(dev: *mut KnDevice) {
    if !dev.is_null() {
        let dev = Box::from_raw(dev);
        dev.0.close();
    }
}

/// Set the depth stream format. Returns 0 on success, -1 on error.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_set_depth_format(
    dev: *const KnDevice,
    resolution_id: c_int,
    format_id: c_int,
) -> c_int {
    if dev.is_null() {
        return null_handle();
    }
    let dev = &(*dev).0;
    status_code((|| {
        dev.set_depth_format(resolution(resolution_id)?, depth_format(format_id)?)
            .map(|_| ())
    })())
}

/// Set the video stream format. Returns 0 on success, -1 on error.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_set_video_format(
    dev: *const KnDevice,
    resolution_id: c_int,
    format_id: c_int,
) -> c_int {
    if dev.is_null() {
        return null_handle();
    }
    let dev = &(*dev).0;
    status_code((|| {
        dev.set_video_format(resolution(resolution_id)?, video_format(format_id)?)
            .map(|_| ())
    })())
}

/// Start a stream. `kind`: 0 = depth, 1 = video.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_start_stream(dev: *const KnDevice, kind: c_int) -> c_int {
    if dev.is_null() {
        return null_handle();
    }
    let dev = &(*dev).0;
    status_code(stream_kind(kind).and_then(|k| dev.start(k)))
}

/// Stop a stream. No-op when already stopped.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_stop_stream(dev: *const KnDevice, kind: c_int) -> c_int {
    if dev.is_null() {
        return null_handle();
    }
    let dev = &(*dev).0;
    status_code(stream_kind(kind).map(|k| dev.stop(k)))
}

/// Grab one fresh frame into `buf`, starting the stream if needed.
///
/// Returns the number of bytes written, or -1 on error (including a buffer
/// smaller than the frame). `info` may be null.
///
/// # Safety
/// `dev` must be a valid device pointer; `buf` must point to `len` writable
/// bytes; `info` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn kn_get_frame(
    dev: *const KnDevice,
    kind: c_int,
    timeout_ms: u32,
    buf: *mut u8,
    len: usize,
    info: *mut KnFrameInfo,
) -> c_int {
    if dev.is_null() || buf.is_null() {
        return null_handle();
    }
    let dev = &(*dev).0;
    let frame = match report(
        stream_kind(kind).and_then(|k| dev.get_frame(k, Duration::from_millis(timeout_ms as u64))),
    ) {
        Some(frame) => frame,
        None => return -1,
    };
    let payload = frame.payload();
    if payload.len() > len {
        LAST_ERROR.set(&KinectError::InvalidParameter(format!(
            "buffer of {} bytes too small for {}-byte frame",
            len,
            payload.len()
        )));
        return -1;
    }
    std::ptr::copy_nonoverlapping(payload.as_ptr(), buf, payload.len());
    if !info.is_null() {
        info.write(KnFrameInfo {
            width: frame.width(),
            height: frame.height(),
            bits_per_pixel: frame.bits_per_pixel(),
            bytes: payload.len(),
            sequence: frame.sequence,
            timestamp: frame.timestamp,
        });
    }
    payload.len() as c_int
}

/// Tilt the sensor head. Returns 0 on success, -1 on error.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_set_tilt_degrees(dev: *const KnDevice, degrees: f64) -> c_int {
    if dev.is_null() {
        return null_handle();
    }
    status_code((*dev).0.set_tilt_degrees(degrees))
}

/// Set the LED mode (0 off, 1 green, 2 red, 3 yellow, 4 blink green,
/// 6 blink red/yellow).
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_set_led(dev: *const KnDevice, mode: c_int) -> c_int {
    if dev.is_null() {
        return null_handle();
    }
    let dev = &(*dev).0;
    status_code(led_mode(mode).and_then(|m| dev.set_led(m)))
}

/// Read the accelerometer and motor state.
///
/// # Safety
/// `dev` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn kn_get_tilt_state(dev: *const KnDevice, out: *mut KnTiltState) -> c_int {
    if dev.is_null() || out.is_null() {
        return null_handle();
    }
    match report((*dev).0.tilt_state()) {
        Some(state) => {
            out.write(KnTiltState {
                accelerometer: state.accelerometer,
                mks_accel: state.mks_accel(),
                tilt_degrees: state.degrees().unwrap_or(f64::NAN),
                status: state.status.map(|s: TiltStatus| s as c_int).unwrap_or(-1),
            });
            0
        }
        None => -1,
    }
}

/// Get the last error message. Returns NULL if the last call succeeded.
/// The returned pointer is valid until the next kinect API call.
#[no_mangle]
pub extern "C" fn kn_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}
