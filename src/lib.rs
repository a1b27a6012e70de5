//! # kinect - host-side driver for Kinect-class depth/RGB cameras
//!
//! Talks to the camera and motor subdevices over libusb (via rusb). Provides:
//! - Context and device lifecycle, enumeration by index or serial
//! - Depth and video streams with format negotiation and double-buffered frames
//! - Callback dispatch from a caller-driven or background event loop
//! - A blocking frame-grab facade
//! - Tilt motor, LED and accelerometer control
//! - C FFI for integration with C/C++ consumers
//!
//! ## Quick Start
//! ```no_run
//! use kinect::{Context, StreamKind};
//! use std::time::Duration;
//!
//! let ctx = Context::init().unwrap();
//! let device = ctx.open(0).unwrap();
//!
//! let frame = device.get_frame(StreamKind::Depth, Duration::from_secs(2)).unwrap();
//! println!("{}x{} depth, seq {}", frame.width(), frame.height(), frame.sequence);
//!
//! device.set_depth_callback(|_, frame| println!("depth seq {}", frame.sequence));
//! ctx.start_event_thread().unwrap();
//! std::thread::sleep(Duration::from_secs(1));
//! ctx.shutdown().unwrap();
//! ```

pub mod error;
pub mod types;
pub mod modes;
pub mod protocol;
pub mod codec;
pub mod transport;
pub mod usb;
pub mod stream;
pub mod device;
pub mod event_loop;
pub mod context;
pub mod sync;
pub mod config;
pub mod ffi;

#[cfg(test)]
mod testing;

pub use error::KinectError;
pub use types::*;
pub use modes::{default_mode, depth_modes, find_mode, video_modes, FrameMode};
pub use codec::{Codec, KinectCodec};
pub use transport::{Backend, Transport};
pub use usb::UsbBackend;
pub use stream::{Frame, StreamState};
pub use device::{Device, FrameCallback};
pub use event_loop::{LoopControl, LoopState};
pub use context::{Context, ContextBuilder};
pub use sync::Grabber;
pub use config::ContextConfig;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, KinectError>;
