use crate::types::Subdevices;
use std::time::Duration;

/// Context tuning knobs.
///
/// `ContextConfig::from_env()` reads overrides from:
/// - `KINECT_SUBDEVICES`: comma list of `motor`, `camera`
/// - `KINECT_POLL_TIMEOUT_MS`: event thread poll timeout
/// - `KINECT_CONTROL_TIMEOUT_MS`: USB control transfer timeout
/// - `KINECT_REPLY_ATTEMPTS`: camera reply polls per command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Subdevices opened on each unit.
    pub subdevices: Subdevices,
    /// Timeout for each `process_once` issued by the event thread and the
    /// synchronous facade.
    pub poll_timeout: Duration,
    pub control_timeout: Duration,
    /// How many times to poll for a camera command reply before giving up.
    pub reply_attempts: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            subdevices: Subdevices::MOTOR | Subdevices::CAMERA,
            poll_timeout: Duration::from_millis(50),
            control_timeout: Duration::from_secs(1),
            reply_attempts: 100,
        }
    }
}

impl ContextConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            subdevices: read_env_subdevices("KINECT_SUBDEVICES", defaults.subdevices),
            poll_timeout: read_env_millis("KINECT_POLL_TIMEOUT_MS", defaults.poll_timeout),
            control_timeout: read_env_millis("KINECT_CONTROL_TIMEOUT_MS", defaults.control_timeout),
            reply_attempts: read_env_u32("KINECT_REPLY_ATTEMPTS", defaults.reply_attempts),
        };
        log::debug!("Context config: {:?}", config);
        config
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

fn read_env_u32(name: &str, default: u32) -> u32 {
    read_env_string(name)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_env_millis(name: &str, default: Duration) -> Duration {
    read_env_string(name)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn read_env_subdevices(name: &str, default: Subdevices) -> Subdevices {
    read_env_string(name)
        .and_then(|v| parse_subdevices(&v))
        .unwrap_or(default)
}

/// Parse a comma list such as `motor,camera`. Unknown names invalidate the list.
pub(crate) fn parse_subdevices(list: &str) -> Option<Subdevices> {
    let mut subs = Subdevices::empty();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name {
            "motor" => subs |= Subdevices::MOTOR,
            "camera" => subs |= Subdevices::CAMERA,
            other => {
                log::warn!("Unknown subdevice '{}' (supported: motor|camera)", other);
                return None;
            }
        }
    }
    (!subs.is_empty()).then_some(subs)
}
