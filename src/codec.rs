//! Stream packet decoding and format-specific bit unpacking.

use crate::modes::FrameMode;
use crate::protocol::{
    FLAG_DEPTH, FLAG_END, FLAG_MIDDLE, FLAG_START, FLAG_VIDEO, PACKET_HEADER_SIZE, PACKET_MAGIC,
};
use crate::transport::RawPacket;
use crate::types::{DepthFormat, Format, StreamKind, VideoFormat};

/// Position of a packet within its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    Middle,
    End,
}

/// A decoded stream packet: payload bytes plus framing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub marker: Marker,
    /// Wrapping per-stream packet counter.
    pub sequence: u8,
    /// Device clock timestamp.
    pub timestamp: u32,
    pub payload: &'a [u8],
}

impl Decoded<'_> {
    /// True when this packet closes a frame.
    pub fn is_frame_complete(&self) -> bool {
        self.marker == Marker::End
    }
}

/// Protocol capability: turns raw packets into frame bytes.
pub trait Codec: Send + Sync {
    /// Decode one packet. `None` means the packet is not stream data for its
    /// kind and should be skipped.
    fn decode<'a>(&self, packet: &'a RawPacket) -> Option<Decoded<'a>>;

    /// Number of raw bytes that make up one frame in `mode`.
    fn raw_frame_size(&self, mode: &FrameMode) -> usize;

    /// Convert one complete raw frame into the delivered payload layout.
    fn unpack(&self, mode: &FrameMode, raw: &[u8], out: &mut Vec<u8>);
}

/// Codec for the camera's native stream packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct KinectCodec;

impl Codec for KinectCodec {
    fn decode<'a>(&self, packet: &'a RawPacket) -> Option<Decoded<'a>> {
        let data = &packet.data;
        if data.len() < PACKET_HEADER_SIZE || data[0..2] != PACKET_MAGIC {
            return None;
        }
        let flag = data[3];
        let stream_bits = match packet.kind {
            StreamKind::Depth => FLAG_DEPTH,
            StreamKind::Video => FLAG_VIDEO,
        };
        if flag & 0xf0 != stream_bits {
            return None;
        }
        let marker = match flag & 0x0f {
            FLAG_START => Marker::Start,
            FLAG_MIDDLE => Marker::Middle,
            FLAG_END => Marker::End,
            _ => return None,
        };
        Some(Decoded {
            marker,
            sequence: data[5],
            timestamp: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            payload: &data[PACKET_HEADER_SIZE..],
        })
    }

    fn raw_frame_size(&self, mode: &FrameMode) -> usize {
        let px = mode.pixels();
        match mode.format {
            Format::Depth(DepthFormat::Bit11 | DepthFormat::Bit11Packed) => px * 11 / 8,
            Format::Depth(DepthFormat::Bit10 | DepthFormat::Bit10Packed) => px * 10 / 8,
            Format::Video(VideoFormat::Rgb | VideoFormat::Bayer) => px,
            Format::Video(
                VideoFormat::Ir8Bit | VideoFormat::Ir10Bit | VideoFormat::Ir10BitPacked,
            ) => px * 10 / 8,
            Format::Video(VideoFormat::YuvRgb | VideoFormat::YuvRaw) => px * 2,
        }
    }

    fn unpack(&self, mode: &FrameMode, raw: &[u8], out: &mut Vec<u8>) {
        let (w, h) = (mode.width as usize, mode.height as usize);
        out.clear();
        match mode.format {
            Format::Depth(DepthFormat::Bit11) => unpack_bits_to_u16(raw, 11, w * h, out),
            Format::Depth(DepthFormat::Bit10) => unpack_bits_to_u16(raw, 10, w * h, out),
            Format::Video(VideoFormat::Ir10Bit) => unpack_bits_to_u16(raw, 10, w * h, out),
            Format::Video(VideoFormat::Ir8Bit) => unpack_ir_to_8bit(raw, w * h, out),
            Format::Video(VideoFormat::Rgb) => bayer_to_rgb(raw, w, h, out),
            Format::Video(VideoFormat::YuvRgb) => uyvy_to_rgb(raw, w, h, out),
            Format::Depth(DepthFormat::Bit11Packed | DepthFormat::Bit10Packed)
            | Format::Video(
                VideoFormat::Bayer | VideoFormat::Ir10BitPacked | VideoFormat::YuvRaw,
            ) => out.extend_from_slice(raw),
        }
    }
}

/// Unpack a big-endian bitstream of `bits`-wide values into little-endian u16.
pub fn unpack_bits_to_u16(raw: &[u8], bits: u32, count: usize, out: &mut Vec<u8>) {
    out.reserve(count * 2);
    let mask = (1u32 << bits) - 1;
    let mut buffer: u32 = 0;
    let mut bits_in: u32 = 0;
    let mut bytes = raw.iter();
    for _ in 0..count {
        while bits_in < bits {
            let byte = bytes.next().copied().unwrap_or(0);
            buffer = (buffer << 8) | byte as u32;
            bits_in += 8;
        }
        bits_in -= bits;
        let value = ((buffer >> bits_in) & mask) as u16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn unpack_ir_to_8bit(raw: &[u8], count: usize, out: &mut Vec<u8>) {
    let mut wide = Vec::with_capacity(count * 2);
    unpack_bits_to_u16(raw, 10, count, &mut wide);
    out.extend(
        wide.chunks_exact(2)
            .map(|c| (u16::from_le_bytes([c[0], c[1]]) >> 2) as u8),
    );
}

/// Demosaic a GRBG Bayer image using each pixel's 2x2 cell.
pub fn bayer_to_rgb(raw: &[u8], width: usize, height: usize, out: &mut Vec<u8>) {
    out.reserve(width * height * 3);
    let px = |x: usize, y: usize| -> u16 {
        let x = x.min(width.saturating_sub(1));
        let y = y.min(height.saturating_sub(1));
        raw.get(y * width + x).copied().unwrap_or(0) as u16
    };
    for y in 0..height {
        let cy = y & !1;
        for x in 0..width {
            let cx = x & !1;
            let g = (px(cx, cy) + px(cx + 1, cy + 1)) / 2;
            let r = px(cx + 1, cy);
            let b = px(cx, cy + 1);
            out.extend_from_slice(&[r as u8, g as u8, b as u8]);
        }
    }
}

/// Convert UYVY 4:2:2 into 24-bit RGB (BT.601).
pub fn uyvy_to_rgb(raw: &[u8], width: usize, height: usize, out: &mut Vec<u8>) {
    out.reserve(width * height * 3);
    let convert = |y: u8, u: u8, v: u8| -> [u8; 3] {
        let y = y as f32;
        let u = u as f32 - 128.0;
        let v = v as f32 - 128.0;
        let r = y + 1.402 * v;
        let g = y - 0.344 * u - 0.714 * v;
        let b = y + 1.772 * u;
        [
            r.clamp(0.0, 255.0) as u8,
            g.clamp(0.0, 255.0) as u8,
            b.clamp(0.0, 255.0) as u8,
        ]
    };
    for quad in raw.chunks_exact(4).take(width * height / 2) {
        let (u, y0, v, y1) = (quad[0], quad[1], quad[2], quad[3]);
        out.extend_from_slice(&convert(y0, u, v));
        out.extend_from_slice(&convert(y1, u, v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::find_mode;
    use crate::types::Resolution;

    fn packet(kind: StreamKind, flag: u8, seq: u8, ts: u32, payload: &[u8]) -> RawPacket {
        let mut data = vec![b'R', b'B', 0, flag, 0, seq, 0, 0];
        data.extend_from_slice(&ts.to_le_bytes());
        data.extend_from_slice(payload);
        RawPacket { kind, data }
    }

    #[test]
    fn test_decode_depth_packet() {
        let p = packet(StreamKind::Depth, 0x71, 3, 0xDEADBEEF, &[1, 2, 3]);
        let d = KinectCodec.decode(&p).unwrap();
        assert_eq!(d.marker, Marker::Start);
        assert_eq!(d.sequence, 3);
        assert_eq!(d.timestamp, 0xDEADBEEF);
        assert_eq!(d.payload, &[1, 2, 3]);
        assert!(!d.is_frame_complete());

        let end = packet(StreamKind::Depth, 0x75, 4, 0, &[]);
        assert!(KinectCodec.decode(&end).unwrap().is_frame_complete());
    }

    #[test]
    fn test_decode_rejects_foreign_packets() {
        // Video flag on a depth packet.
        let p = packet(StreamKind::Depth, 0x81, 0, 0, &[0]);
        assert!(KinectCodec.decode(&p).is_none());
        // Unknown position nibble.
        let p = packet(StreamKind::Video, 0x83, 0, 0, &[0]);
        assert!(KinectCodec.decode(&p).is_none());
        // Short / bad magic.
        let p = RawPacket {
            kind: StreamKind::Video,
            data: vec![b'X', b'B', 0, 0x81],
        };
        assert!(KinectCodec.decode(&p).is_none());
    }

    #[test]
    fn test_unpack_11bit() {
        // Values 0x7FF, 0x001 packed MSB-first: 11111111 11100000 00001xxx
        let raw = [0xFF, 0xE0, 0x04];
        let mut out = Vec::new();
        unpack_bits_to_u16(&raw, 11, 2, &mut out);
        assert_eq!(out, vec![0xFF, 0x07, 0x01, 0x00]);
    }

    #[test]
    fn test_unpack_10bit() {
        // 0x3FF, 0x000, 0x155, 0x2AA
        // 1111111111 0000000000 0101010101 1010101010
        let raw = [0xFF, 0xC0, 0x05, 0x56, 0xAA];
        let mut out = Vec::new();
        unpack_bits_to_u16(&raw, 10, 4, &mut out);
        let values: Vec<u16> = out
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![0x3FF, 0x000, 0x155, 0x2AA]);
    }

    #[test]
    fn test_bayer_cell() {
        // GRBG 2x2: G=100 R=200 / B=50 G=120
        let raw = [100, 200, 50, 120];
        let mut out = Vec::new();
        bayer_to_rgb(&raw, 2, 2, &mut out);
        assert_eq!(out.len(), 12);
        assert_eq!(&out[0..3], &[200, 110, 50]);
        assert_eq!(&out[9..12], &[200, 110, 50]);
    }

    #[test]
    fn test_uyvy_gray() {
        let raw = [128, 50, 128, 200];
        let mut out = Vec::new();
        uyvy_to_rgb(&raw, 2, 1, &mut out);
        assert_eq!(out, vec![50, 50, 50, 200, 200, 200]);
    }

    #[test]
    fn test_unpacked_sizes_match_mode_table() {
        let codec = KinectCodec;
        let modes = [
            find_mode(Resolution::Medium, DepthFormat::Bit11).unwrap(),
            find_mode(Resolution::Medium, DepthFormat::Bit10Packed).unwrap(),
            find_mode(Resolution::Medium, VideoFormat::Ir8Bit).unwrap(),
            find_mode(Resolution::Medium, VideoFormat::YuvRgb).unwrap(),
        ];
        for mode in modes {
            let raw = vec![0x5Au8; codec.raw_frame_size(&mode)];
            let mut out = Vec::new();
            codec.unpack(&mode, &raw, &mut out);
            assert_eq!(out.len(), mode.bytes, "{:?}", mode.format);
        }
    }
}
