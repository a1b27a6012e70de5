use std::fmt;

/// Errors that can occur when driving a Kinect-class device.
#[derive(Debug, thiserror::Error)]
pub enum KinectError {
    #[error("Context init failed: {0}")]
    Init(String),

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Device busy (already opened)")]
    DeviceBusy,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout waiting for frame")]
    Timeout,
}

impl KinectError {
    pub(crate) fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState(message.into())
    }

    pub(crate) fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// True for transient USB failures that are safe to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, KinectError::Transport(_) | KinectError::Timeout)
    }
}

impl From<rusb::Error> for KinectError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Busy | rusb::Error::Access => KinectError::DeviceBusy,
            rusb::Error::NoDevice | rusb::Error::NotFound => KinectError::DeviceNotFound,
            other => KinectError::Transport(other.to_string()),
        }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &KinectError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_error_mapping() {
        assert!(matches!(
            KinectError::from(rusb::Error::Busy),
            KinectError::DeviceBusy
        ));
        assert!(matches!(
            KinectError::from(rusb::Error::Access),
            KinectError::DeviceBusy
        ));
        assert!(matches!(
            KinectError::from(rusb::Error::NoDevice),
            KinectError::DeviceNotFound
        ));
        let err = KinectError::from(rusb::Error::Pipe);
        assert!(matches!(err, KinectError::Transport(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_last_error_is_nul_terminated() {
        let slot = LastError::new();
        assert!(slot.as_ptr().is_null());
        slot.set(&KinectError::Timeout);
        let msg = unsafe { std::ffi::CStr::from_ptr(slot.as_ptr()) };
        assert_eq!(msg.to_str().unwrap(), "Timeout waiting for frame");
        slot.clear();
        assert!(slot.as_ptr().is_null());
    }
}
