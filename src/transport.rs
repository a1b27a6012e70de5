//! Transport capability the driver is built on.
//!
//! A [`Backend`] enumerates and opens physical units; each opened unit is a
//! [`Transport`] that performs control transfers and delivers raw stream
//! packets. [`crate::usb::UsbBackend`] is the libusb implementation.

use crate::types::{DeviceInfo, StreamKind, StreamSet, Subdevice, Subdevices};
use crate::Result;
use std::time::Duration;

/// A USB control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Data stage for host-to-device transfers.
    pub payload: Vec<u8>,
    /// Buffer length for device-to-host transfers.
    pub length: usize,
}

impl ControlRequest {
    pub fn write(request_type: u8, request: u8, value: u16, index: u16, payload: Vec<u8>) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            payload,
            length: 0,
        }
    }

    pub fn read(request_type: u8, request: u8, value: u16, index: u16, length: usize) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            payload: Vec::new(),
            length,
        }
    }

    /// True for device-to-host transfers.
    pub fn is_read(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// One raw stream packet as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub kind: StreamKind,
    pub data: Vec<u8>,
}

/// Enumerates and opens physical units.
pub trait Backend: Send + Sync {
    /// Re-query the attached devices.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Open the given unit's selected subdevices.
    fn open(&self, info: &DeviceInfo, subdevices: Subdevices) -> Result<Box<dyn Transport>>;
}

/// One opened physical unit.
///
/// Methods take `&self` so control transfers can be issued while another
/// thread is inside [`Transport::poll`].
pub trait Transport: Send + Sync {
    /// Subdevices that were actually opened.
    fn subdevices(&self) -> Subdevices;

    /// Perform a control transfer. Returns the data stage for reads and an
    /// empty vector for writes.
    fn control_transfer(&self, target: Subdevice, request: &ControlRequest) -> Result<Vec<u8>>;

    /// Wait up to `timeout` for packets on the endpoints of `active` streams.
    /// An empty result is a timeout, not an error.
    fn poll(&self, active: StreamSet, timeout: Duration) -> Result<Vec<RawPacket>>;

    /// Release the connection. Idempotent.
    fn close(&self);
}
