use crate::modes::FrameMode;
use crate::transport::ControlRequest;
use crate::types::{DepthFormat, Format, LedMode, Resolution, TiltState, TiltStatus, VideoFormat};
use crate::{KinectError, Result};

// -- USB identifiers --
pub const VID: u16 = 0x045E;
pub const PID_MOTOR: u16 = 0x02B0;
pub const PID_CAMERA: u16 = 0x02AE;
pub const CAMERA_INTERFACE: u8 = 0;
pub const VIDEO_ENDPOINT: u8 = 0x81;
pub const DEPTH_ENDPOINT: u8 = 0x82;

// -- Stream packet geometry --
pub const PACKET_HEADER_SIZE: usize = 12;
pub const DEPTH_PACKET_SIZE: usize = 1760;
pub const VIDEO_PACKET_SIZE: usize = 1920;
pub const PACKET_MAGIC: [u8; 2] = *b"RB";
pub const FLAG_DEPTH: u8 = 0x70;
pub const FLAG_VIDEO: u8 = 0x80;
pub const FLAG_START: u8 = 0x01;
pub const FLAG_MIDDLE: u8 = 0x02;
pub const FLAG_END: u8 = 0x05;

// -- Camera command framing --
pub const CMD_MAGIC: [u8; 2] = *b"GM";
pub const REPLY_MAGIC: [u8; 2] = *b"RB";
pub const CMD_HEADER_SIZE: usize = 8;
pub const CMD_WRITE_REGISTER: u16 = 0x0003;
pub const REPLY_BUFFER_SIZE: usize = 0x200;

// -- Vendor requests --
pub const REQ_TYPE_OUT: u8 = 0x40;
pub const REQ_TYPE_IN: u8 = 0xC0;
pub const REQ_LED: u8 = 0x06;
pub const REQ_SET_TILT: u8 = 0x31;
pub const REQ_TILT_STATE: u8 = 0x32;
pub const TILT_STATE_SIZE: usize = 10;
/// Tilt angle byte reported while the motor position is unknown.
pub const TILT_ANGLE_UNKNOWN: u8 = 0x80;

// -- Tilt limits (degrees) --
pub const TILT_SOFT_LIMIT_DEGREES: f64 = 31.0;
pub const TILT_MECHANICAL_LIMIT_DEGREES: f64 = 27.0;

/// Build a camera command: [magic, len_words, cmd, tag] (LE) followed by data.
pub fn build_command(cmd: u16, tag: u16, data: &[u8]) -> Vec<u8> {
    let words = (data.len() / 2) as u16;
    let mut buf = Vec::with_capacity(CMD_HEADER_SIZE + data.len());
    buf.extend_from_slice(&CMD_MAGIC);
    buf.extend_from_slice(&words.to_le_bytes());
    buf.extend_from_slice(&cmd.to_le_bytes());
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Build a register write command.
pub fn build_write_register(tag: u16, reg: u16, value: u16) -> Vec<u8> {
    let mut data = [0u8; 4];
    data[0..2].copy_from_slice(&reg.to_le_bytes());
    data[2..4].copy_from_slice(&value.to_le_bytes());
    build_command(CMD_WRITE_REGISTER, tag, &data)
}

/// Validate a camera reply against the command it answers and return its data.
pub fn validate_reply(reply: &[u8], cmd: u16, tag: u16) -> Result<&[u8]> {
    if reply.len() < CMD_HEADER_SIZE {
        return Err(KinectError::transport(format!(
            "reply too short ({} bytes)",
            reply.len()
        )));
    }
    if reply[0..2] != REPLY_MAGIC {
        return Err(KinectError::transport(format!(
            "bad reply magic {:02x?}",
            &reply[0..2]
        )));
    }
    let words = u16::from_le_bytes([reply[2], reply[3]]) as usize;
    let echo_cmd = u16::from_le_bytes([reply[4], reply[5]]);
    let echo_tag = u16::from_le_bytes([reply[6], reply[7]]);
    if echo_cmd != cmd || echo_tag != tag {
        return Err(KinectError::transport(format!(
            "reply mismatch: cmd={:#06x} tag={} (expected cmd={:#06x} tag={})",
            echo_cmd, echo_tag, cmd, tag
        )));
    }
    let end = (CMD_HEADER_SIZE + words * 2).min(reply.len());
    Ok(&reply[CMD_HEADER_SIZE..end])
}

/// Build the reply a camera sends for a command. Used by synthetic transports.
pub fn build_reply(cmd: u16, tag: u16, data: &[u8]) -> Vec<u8> {
    let mut reply = build_command(cmd, tag, data);
    reply[0..2].copy_from_slice(&REPLY_MAGIC);
    reply
}

/// Control transfer that carries a camera command.
pub fn command_request(command: Vec<u8>) -> ControlRequest {
    ControlRequest::write(REQ_TYPE_OUT, 0, 0, 0, command)
}

/// Control transfer that fetches a pending camera reply.
pub fn reply_request() -> ControlRequest {
    ControlRequest::read(REQ_TYPE_IN, 0, 0, 0, REPLY_BUFFER_SIZE)
}

fn resolution_register(resolution: Resolution) -> u16 {
    match resolution {
        Resolution::Low => 0x00,
        Resolution::Medium => 0x01,
        Resolution::High => 0x02,
    }
}

fn framerate_register(mode: &FrameMode) -> u16 {
    if mode.framerate >= 30 {
        0x1e
    } else {
        0x0f
    }
}

/// Register writes that start the depth stream in `mode`.
pub fn depth_start_sequence(mode: &FrameMode) -> Vec<(u16, u16)> {
    let depth_format = match mode.format {
        Format::Depth(DepthFormat::Bit11 | DepthFormat::Bit11Packed) => 0x03,
        _ => 0x02,
    };
    vec![
        (0x105, 0x00), // projector auto-cycle off
        (0x06, 0x00),  // depth stream off
        (0x12, depth_format),
        (0x13, resolution_register(mode.resolution)),
        (0x14, framerate_register(mode)),
        (0x06, 0x02), // depth stream on
        (0x17, 0x00), // no hflip
    ]
}

pub fn depth_stop_sequence() -> Vec<(u16, u16)> {
    vec![(0x06, 0x00)]
}

/// Register writes that start the video stream in `mode`.
pub fn video_start_sequence(mode: &FrameMode) -> Vec<(u16, u16)> {
    let res = resolution_register(mode.resolution);
    let fps = framerate_register(mode);
    match mode.format {
        Format::Video(VideoFormat::Ir8Bit | VideoFormat::Ir10Bit | VideoFormat::Ir10BitPacked) => {
            vec![
                (0x05, 0x00),
                (0x105, 0x00),
                (0x19, 0x00),
                (0x1a, res),
                (0x1b, fps),
                (0x05, 0x03), // IR stream on
                (0x17, 0x00),
            ]
        }
        Format::Video(VideoFormat::YuvRgb | VideoFormat::YuvRaw) => vec![
            (0x05, 0x00),
            (0x0c, 0x05), // UYVY
            (0x0d, res),
            (0x0e, fps),
            (0x05, 0x01),
            (0x47, 0x00),
        ],
        _ => vec![
            (0x05, 0x00),
            (0x0c, 0x00), // Bayer
            (0x0d, res),
            (0x0e, fps),
            (0x05, 0x01),
            (0x47, 0x00),
        ],
    }
}

pub fn video_stop_sequence() -> Vec<(u16, u16)> {
    vec![(0x05, 0x00)]
}

/// Validate a tilt angle and convert it to the motor's half-degree units.
///
/// Angles outside the soft limit are rejected; angles between the mechanical
/// and soft limits are clamped to the mechanical range.
pub fn tilt_wire_value(degrees: f64) -> Result<i16> {
    if !degrees.is_finite() || degrees.abs() > TILT_SOFT_LIMIT_DEGREES {
        return Err(KinectError::InvalidParameter(format!(
            "tilt {} outside ±{} degrees",
            degrees, TILT_SOFT_LIMIT_DEGREES
        )));
    }
    let clamped = degrees.clamp(
        -TILT_MECHANICAL_LIMIT_DEGREES,
        TILT_MECHANICAL_LIMIT_DEGREES,
    );
    Ok((clamped * 2.0).round() as i16)
}

pub fn set_tilt_request(degrees: f64) -> Result<ControlRequest> {
    let value = tilt_wire_value(degrees)?;
    Ok(ControlRequest::write(
        REQ_TYPE_OUT,
        REQ_SET_TILT,
        value as u16,
        0,
        Vec::new(),
    ))
}

pub fn set_led_request(mode: LedMode) -> ControlRequest {
    ControlRequest::write(REQ_TYPE_OUT, REQ_LED, mode as u16, 0, Vec::new())
}

pub fn tilt_state_request() -> ControlRequest {
    ControlRequest::read(REQ_TYPE_IN, REQ_TILT_STATE, 0, 0, TILT_STATE_SIZE)
}

/// Parse the 10-byte motor state reply.
///
/// Layout:
/// - `[0..2]`: unused
/// - `[2..8]`: 3x int16 BE accelerometer counts
/// - `[8]`: tilt angle, int8 in half degrees (0x80 = unknown)
/// - `[9]`: tilt status
pub fn parse_tilt_state(data: &[u8]) -> Result<TiltState> {
    if data.len() < TILT_STATE_SIZE {
        return Err(KinectError::transport(format!(
            "tilt state reply too short ({} bytes)",
            data.len()
        )));
    }
    let ux = i16::from_be_bytes([data[2], data[3]]);
    let uy = i16::from_be_bytes([data[4], data[5]]);
    let uz = i16::from_be_bytes([data[6], data[7]]);
    let tilt_angle = if data[8] == TILT_ANGLE_UNKNOWN {
        None
    } else {
        Some(data[8] as i8)
    };
    Ok(TiltState {
        accelerometer: [ux, uy, uz],
        tilt_angle,
        status: TiltStatus::from_raw(data[9]),
    })
}
