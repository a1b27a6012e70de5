use crate::{KinectError, Result};

/// One of the two data channels a device can emit.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Depth = 0,
    Video = 1,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Depth, StreamKind::Video];

    pub fn as_set(self) -> StreamSet {
        match self {
            StreamKind::Depth => StreamSet::DEPTH,
            StreamKind::Video => StreamSet::VIDEO,
        }
    }
}

/// Sensor resolution class.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// 320x240. Listed for completeness; no stream supports it.
    Low = 0,
    /// 640x480 (640x488 for IR).
    Medium = 1,
    /// 1280x1024.
    High = 2,
}

/// Video stream pixel formats.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoFormat {
    /// Demosaiced 24-bit RGB.
    Rgb = 0,
    /// Raw GRBG Bayer, 8 bits per pixel.
    Bayer = 1,
    /// IR scaled down to 8 bits per pixel.
    Ir8Bit = 2,
    /// IR unpacked into little-endian u16.
    Ir10Bit = 3,
    /// IR as delivered by the sensor: 10-bit big-endian bitstream.
    Ir10BitPacked = 4,
    /// UYVY converted to 24-bit RGB.
    YuvRgb = 5,
    /// Raw UYVY, 16 bits per pixel.
    YuvRaw = 6,
}

/// Depth stream formats.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthFormat {
    /// 11-bit depth unpacked into little-endian u16.
    Bit11 = 0,
    /// 10-bit depth unpacked into little-endian u16.
    Bit10 = 1,
    /// 11-bit big-endian bitstream as delivered by the sensor.
    Bit11Packed = 2,
    /// 10-bit big-endian bitstream as delivered by the sensor.
    Bit10Packed = 3,
}

/// A pixel or depth format for either stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Video(VideoFormat),
    Depth(DepthFormat),
}

impl Format {
    pub fn kind(self) -> StreamKind {
        match self {
            Format::Video(_) => StreamKind::Video,
            Format::Depth(_) => StreamKind::Depth,
        }
    }
}

impl From<VideoFormat> for Format {
    fn from(f: VideoFormat) -> Self {
        Format::Video(f)
    }
}

impl From<DepthFormat> for Format {
    fn from(f: DepthFormat) -> Self {
        Format::Depth(f)
    }
}

/// Front-panel LED modes supported by the motor subdevice.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    Off = 0,
    Green = 1,
    Red = 2,
    Yellow = 3,
    BlinkGreen = 4,
    BlinkRedYellow = 6,
}

impl LedMode {
    /// Validate a raw LED value.
    pub fn from_raw(raw: u8) -> Result<LedMode> {
        match raw {
            0 => Ok(LedMode::Off),
            1 => Ok(LedMode::Green),
            2 => Ok(LedMode::Red),
            3 => Ok(LedMode::Yellow),
            4 => Ok(LedMode::BlinkGreen),
            6 => Ok(LedMode::BlinkRedYellow),
            other => Err(KinectError::InvalidParameter(format!(
                "unsupported LED mode {}",
                other
            ))),
        }
    }
}

/// Motor status byte reported alongside the tilt angle.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltStatus {
    Stopped = 0,
    AtLimit = 1,
    Moving = 4,
}

impl TiltStatus {
    pub(crate) fn from_raw(raw: u8) -> Option<TiltStatus> {
        match raw {
            0x00 => Some(TiltStatus::Stopped),
            0x01 => Some(TiltStatus::AtLimit),
            0x04 => Some(TiltStatus::Moving),
            _ => None,
        }
    }
}

/// Decoded accelerometer and motor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiltState {
    /// Raw accelerometer counts [x, y, z].
    pub accelerometer: [i16; 3],
    /// Tilt angle in half-degree units, `None` while the motor reports unknown.
    pub tilt_angle: Option<i8>,
    /// Motor status, `None` for values outside the documented set.
    pub status: Option<TiltStatus>,
}

/// Accelerometer counts per 1 g.
pub const COUNTS_PER_G: f64 = 819.0;
/// Standard gravity in m/s².
pub const GRAVITY: f64 = 9.80665;

impl TiltState {
    /// Tilt angle in degrees.
    pub fn degrees(&self) -> Option<f64> {
        self.tilt_angle.map(|a| a as f64 / 2.0)
    }

    /// Accelerometer reading in m/s².
    pub fn mks_accel(&self) -> [f64; 3] {
        self.accelerometer
            .map(|c| c as f64 / COUNTS_PER_G * GRAVITY)
    }
}

/// Identity of one attached device, as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in the enumeration order.
    pub index: usize,
    /// Camera serial number, when the descriptor could be read.
    pub serial: Option<String>,
    pub bus: u8,
    pub address: u8,
}

/// Selects a device by enumeration index or serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Index(usize),
    Serial(String),
}

impl DeviceSelector {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        match self {
            DeviceSelector::Index(i) => info.index == *i,
            DeviceSelector::Serial(s) => info.serial.as_deref() == Some(s.as_str()),
        }
    }
}

impl From<usize> for DeviceSelector {
    fn from(index: usize) -> Self {
        DeviceSelector::Index(index)
    }
}

impl From<&str> for DeviceSelector {
    fn from(serial: &str) -> Self {
        DeviceSelector::Serial(serial.to_string())
    }
}

/// USB subdevice addressed by a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subdevice {
    Motor,
    Camera,
}

bitflags::bitflags! {
    /// Subdevices a context opens on each physical unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct Subdevices: u32 {
        const MOTOR  = 1 << 0;
        const CAMERA = 1 << 1;
    }
}

impl Subdevices {
    pub fn contains_subdevice(self, sub: Subdevice) -> bool {
        match sub {
            Subdevice::Motor => self.contains(Subdevices::MOTOR),
            Subdevice::Camera => self.contains(Subdevices::CAMERA),
        }
    }
}

bitflags::bitflags! {
    /// Set of streams, used to tell the transport which endpoints to poll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamSet: u8 {
        const DEPTH = 1 << 0;
        const VIDEO = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_led_from_raw() {
        assert_eq!(LedMode::from_raw(6).unwrap(), LedMode::BlinkRedYellow);
        assert!(matches!(
            LedMode::from_raw(5),
            Err(KinectError::InvalidParameter(_))
        ));
        assert!(LedMode::from_raw(200).is_err());
    }

    #[test]
    fn test_tilt_state_conversions() {
        let state = TiltState {
            accelerometer: [0, 819, -819],
            tilt_angle: Some(-30),
            status: Some(TiltStatus::Stopped),
        };
        assert_eq!(state.degrees(), Some(-15.0));
        let mks = state.mks_accel();
        assert!(mks[0].abs() < 1e-9);
        assert!((mks[1] - GRAVITY).abs() < 1e-9);
        assert!((mks[2] + GRAVITY).abs() < 1e-9);
    }

    #[test]
    fn test_selector_matches_serial() {
        let info = DeviceInfo {
            index: 1,
            serial: Some("A00362A04593047A".into()),
            bus: 1,
            address: 7,
        };
        assert!(DeviceSelector::from(1).matches(&info));
        assert!(DeviceSelector::from("A00362A04593047A").matches(&info));
        assert!(!DeviceSelector::from(0).matches(&info));
    }
}
