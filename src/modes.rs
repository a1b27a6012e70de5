//! Table of stream modes the device firmware supports.

use crate::types::{DepthFormat, Format, Resolution, StreamKind, VideoFormat};
use crate::{KinectError, Result};

/// A fully-resolved stream mode: resolution, format and output geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMode {
    pub resolution: Resolution,
    pub format: Format,
    /// Size of one delivered frame payload in bytes.
    pub bytes: usize,
    pub width: u16,
    pub height: u16,
    pub data_bits_per_pixel: u8,
    pub padding_bits_per_pixel: u8,
    pub framerate: u8,
}

impl FrameMode {
    pub fn kind(&self) -> StreamKind {
        self.format.kind()
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

const fn mode(
    resolution: Resolution,
    format: Format,
    width: u16,
    height: u16,
    bytes_per_pixel_x8: usize,
    data_bits: u8,
    padding_bits: u8,
    framerate: u8,
) -> FrameMode {
    FrameMode {
        resolution,
        format,
        bytes: width as usize * height as usize * bytes_per_pixel_x8 / 8,
        width,
        height,
        data_bits_per_pixel: data_bits,
        padding_bits_per_pixel: padding_bits,
        framerate,
    }
}

use DepthFormat as D;
use Resolution::{High, Medium};
use VideoFormat as V;

const VIDEO_MODES: [FrameMode; 12] = [
    mode(High, Format::Video(V::Rgb), 1280, 1024, 24, 24, 0, 10),
    mode(Medium, Format::Video(V::Rgb), 640, 480, 24, 24, 0, 30),
    mode(High, Format::Video(V::Bayer), 1280, 1024, 8, 8, 0, 10),
    mode(Medium, Format::Video(V::Bayer), 640, 480, 8, 8, 0, 30),
    mode(High, Format::Video(V::Ir8Bit), 1280, 1024, 8, 8, 0, 10),
    mode(Medium, Format::Video(V::Ir8Bit), 640, 488, 8, 8, 0, 30),
    mode(High, Format::Video(V::Ir10Bit), 1280, 1024, 16, 10, 6, 10),
    mode(Medium, Format::Video(V::Ir10Bit), 640, 488, 16, 10, 6, 30),
    mode(High, Format::Video(V::Ir10BitPacked), 1280, 1024, 10, 10, 0, 10),
    mode(Medium, Format::Video(V::Ir10BitPacked), 640, 488, 10, 10, 0, 30),
    mode(Medium, Format::Video(V::YuvRgb), 640, 480, 24, 24, 0, 15),
    mode(Medium, Format::Video(V::YuvRaw), 640, 480, 16, 16, 0, 15),
];

const DEPTH_MODES: [FrameMode; 4] = [
    mode(Medium, Format::Depth(D::Bit11), 640, 480, 16, 11, 5, 30),
    mode(Medium, Format::Depth(D::Bit10), 640, 480, 16, 10, 6, 30),
    mode(Medium, Format::Depth(D::Bit11Packed), 640, 480, 11, 11, 0, 30),
    mode(Medium, Format::Depth(D::Bit10Packed), 640, 480, 10, 10, 0, 30),
];

/// All supported video modes.
pub fn video_modes() -> &'static [FrameMode] {
    &VIDEO_MODES
}

/// All supported depth modes.
pub fn depth_modes() -> &'static [FrameMode] {
    &DEPTH_MODES
}

/// All supported modes for a stream.
pub fn modes_for(kind: StreamKind) -> &'static [FrameMode] {
    match kind {
        StreamKind::Depth => depth_modes(),
        StreamKind::Video => video_modes(),
    }
}

/// Look up the mode for a (resolution, format) pair.
pub fn find_mode(resolution: Resolution, format: impl Into<Format>) -> Result<FrameMode> {
    let format = format.into();
    modes_for(format.kind())
        .iter()
        .find(|m| m.resolution == resolution && m.format == format)
        .copied()
        .ok_or_else(|| {
            KinectError::UnsupportedFormat(format!("{:?} at {:?} resolution", format, resolution))
        })
}

/// Mode a stream uses until the application picks one.
pub fn default_mode(kind: StreamKind) -> FrameMode {
    match kind {
        StreamKind::Depth => DEPTH_MODES[0],
        StreamKind::Video => VIDEO_MODES[1],
    }
}
