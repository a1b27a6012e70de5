use crate::codec::{Codec, KinectCodec};
use crate::config::ContextConfig;
use crate::device::{Device, DeviceShared};
use crate::event_loop::{self, EventLoop, LoopControl, LoopState, Runner};
use crate::transport::Backend;
use crate::types::{DeviceInfo, DeviceSelector};
use crate::usb::UsbBackend;
use crate::{KinectError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Set while a context is alive in this process.
static CONTEXT_LIVE: AtomicBool = AtomicBool::new(false);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by a context, its devices and its event thread.
pub(crate) struct ContextInner {
    config: ContextConfig,
    /// `None` once the context has shut down.
    backend: Mutex<Option<Box<dyn Backend>>>,
    codec: Arc<dyn Codec>,
    devices: Mutex<Vec<Arc<DeviceShared>>>,
    event_loop: EventLoop,
}

impl ContextInner {
    pub(crate) fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Handles for every open device.
    pub(crate) fn devices(self: &Arc<Self>) -> Vec<Device> {
        lock(&self.devices)
            .iter()
            .map(|shared| Device {
                shared: shared.clone(),
                ctx: self.clone(),
            })
            .collect()
    }

    pub(crate) fn forget_device(&self, shared: &Arc<DeviceShared>) {
        lock(&self.devices).retain(|d| !Arc::ptr_eq(d, shared));
    }
}

/// Builder for a [`Context`] with a non-default backend, codec or config.
#[derive(Default)]
pub struct ContextBuilder {
    backend: Option<Box<dyn Backend>>,
    codec: Option<Arc<dyn Codec>>,
    config: Option<ContextConfig>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Create the context. Fails with [`KinectError::Init`] if another
    /// context is live or the transport cannot be initialised.
    pub fn init(self) -> Result<Context> {
        if CONTEXT_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KinectError::Init(
                "a context is already live in this process".into(),
            ));
        }
        match self.build() {
            Ok(ctx) => Ok(ctx),
            Err(e) => {
                CONTEXT_LIVE.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn build(self) -> Result<Context> {
        let config = self.config.unwrap_or_else(ContextConfig::from_env);
        let backend = match self.backend {
            Some(backend) => backend,
            None => Box::new(UsbBackend::new(config.control_timeout)?),
        };
        let found = backend
            .enumerate()
            .map_err(|e| KinectError::Init(format!("device enumeration: {}", e)))?;
        log::info!("Context initialised, {} device(s) attached", found.len());

        Ok(Context {
            inner: Arc::new(ContextInner {
                config,
                backend: Mutex::new(Some(backend)),
                codec: self.codec.unwrap_or_else(|| Arc::new(KinectCodec)),
                devices: Mutex::new(Vec::new()),
                event_loop: EventLoop::new(),
            }),
        })
    }
}

/// Process-wide driver handle.
///
/// At most one context is live per process. Dropping the context shuts it
/// down.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Initialise the USB transport with configuration from the environment.
    pub fn init() -> Result<Context> {
        ContextBuilder::new().init()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub fn config(&self) -> &ContextConfig {
        self.inner.config()
    }

    fn with_backend<T>(&self, f: impl FnOnce(&dyn Backend) -> Result<T>) -> Result<T> {
        let backend = lock(&self.inner.backend);
        match backend.as_deref() {
            Some(backend) => f(backend),
            None => Err(KinectError::invalid_state("context is shut down")),
        }
    }

    /// Re-query the attached devices.
    pub fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        self.with_backend(|backend| backend.enumerate())
    }

    pub fn num_devices(&self) -> Result<usize> {
        self.enumerate().map(|devices| devices.len())
    }

    /// Open a device by enumeration index or serial.
    ///
    /// Fails with [`KinectError::DeviceNotFound`] when nothing matches and
    /// [`KinectError::DeviceBusy`] when the unit is already open.
    pub fn open(&self, selector: impl Into<DeviceSelector>) -> Result<Device> {
        let selector = selector.into();
        self.with_backend(|backend| {
            let mut devices = lock(&self.inner.devices);
            let info = backend
                .enumerate()?
                .into_iter()
                .find(|info| selector.matches(info))
                .ok_or(KinectError::DeviceNotFound)?;
            if devices
                .iter()
                .any(|d| d.info().bus == info.bus && d.info().address == info.address)
            {
                return Err(KinectError::DeviceBusy);
            }

            let transport = backend.open(&info, self.inner.config.subdevices)?;
            log::info!(
                "Opened device {} (serial {:?}, subdevices {:?})",
                info.index,
                info.serial,
                transport.subdevices()
            );
            let shared = Arc::new(DeviceShared::new(
                info,
                transport,
                self.inner.codec.clone(),
                self.inner.config.reply_attempts,
            ));
            devices.push(shared.clone());
            Ok(Device {
                shared,
                ctx: self.inner.clone(),
            })
        })
    }

    /// Handles for every device opened through this context.
    pub fn open_devices(&self) -> Vec<Device> {
        self.inner.devices()
    }

    /// Run one event loop iteration, blocking for at most `timeout`.
    pub fn process_once(&self, timeout: Duration) -> Result<()> {
        event_loop::process_once(&self.inner, timeout)
    }

    /// Drive the event loop on this thread, calling `body` after each
    /// iteration until it returns [`LoopControl::Break`].
    pub fn run_loop<F>(&self, body: F) -> Result<()>
    where
        F: FnMut() -> LoopControl,
    {
        event_loop::run_loop(&self.inner, self.inner.config.poll_timeout, body)
    }

    /// Start continuous processing on a background thread.
    pub fn start_event_thread(&self) -> Result<()> {
        if self.inner.event_loop.state() == LoopState::Stopped {
            return Err(KinectError::invalid_state("context is shut down"));
        }
        let inner = self.inner.clone();
        self.inner
            .event_loop
            .start_runner(|| Runner::spawn(inner.clone(), inner.config.poll_timeout))
    }

    /// Stop the background thread, letting its current iteration finish.
    /// No-op when no thread is running.
    pub fn stop_event_thread(&self) -> Result<()> {
        if event_loop::in_callback() {
            return Err(KinectError::invalid_state(
                "cannot stop the event thread from a frame callback",
            ));
        }
        if let Some(runner) = self.inner.event_loop.take_runner() {
            runner.stop(self.inner.config.poll_timeout * 4);
        }
        Ok(())
    }

    pub fn is_event_thread_running(&self) -> bool {
        self.inner.event_loop.has_runner()
    }

    pub fn loop_state(&self) -> LoopState {
        self.inner.event_loop.state()
    }

    /// Stop the event loop, close every device and release the transport.
    ///
    /// Waits for an in-flight `process_once` to finish before releasing
    /// anything. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if event_loop::in_callback() {
            return Err(KinectError::invalid_state(
                "cannot shut down from a frame callback",
            ));
        }
        if !self.inner.event_loop.mark_stopped() {
            return Ok(());
        }
        if let Some(runner) = self.inner.event_loop.take_runner() {
            runner.stop(self.inner.config.poll_timeout * 4);
        }
        let _owner = self.inner.event_loop.quiesce();

        let devices: Vec<_> = lock(&self.inner.devices).drain(..).collect();
        for device in &devices {
            device.close();
        }
        lock(&self.inner.backend).take();
        CONTEXT_LIVE.store(false, Ordering::Release);
        log::info!("Context shut down ({} device(s) closed)", devices.len());
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Context drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.inner.config)
            .field("loop_state", &self.loop_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{self, SyntheticBackend};
    use crate::types::{DeviceSelector, StreamKind};
    use crate::{Context, KinectError, LoopState, StreamState};

    #[test]
    fn test_second_init_fails_until_shutdown() {
        let _serial = testing::serial();
        let (backend, _units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);

        let (other, _) = SyntheticBackend::with_devices(1);
        let err = Context::builder()
            .backend(other)
            .config(testing::config())
            .init()
            .unwrap_err();
        assert!(matches!(err, KinectError::Init(_)));

        ctx.shutdown().unwrap();
        let (again, _) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(again);
        assert_eq!(ctx.num_devices().unwrap(), 1);
    }

    #[test]
    fn test_init_failure_maps_to_init_error() {
        let _serial = testing::serial();
        let err = Context::builder()
            .backend(SyntheticBackend::failing())
            .config(testing::config())
            .init()
            .unwrap_err();
        assert!(matches!(err, KinectError::Init(_)));

        // The failed init did not leave a live context behind.
        let (backend, _units) = SyntheticBackend::with_devices(0);
        let ctx = testing::context(backend);
        assert_eq!(ctx.num_devices().unwrap(), 0);
    }

    #[test]
    fn test_enumerate_is_requeried() {
        let _serial = testing::serial();
        let (backend, _units) = SyntheticBackend::with_devices(1);
        let handle = backend.clone();
        let ctx = testing::context(backend);
        assert_eq!(ctx.num_devices().unwrap(), 1);
        handle.plug();
        let devices = ctx.enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].index, 1);
    }

    #[test]
    fn test_open_errors() {
        let _serial = testing::serial();
        let (backend, _units) = SyntheticBackend::with_devices(2);
        let ctx = testing::context(backend);

        assert!(matches!(ctx.open(5), Err(KinectError::DeviceNotFound)));
        assert!(matches!(
            ctx.open("no-such-serial"),
            Err(KinectError::DeviceNotFound)
        ));

        let first = ctx.open(0).unwrap();
        assert!(matches!(ctx.open(0), Err(KinectError::DeviceBusy)));
        let serial = first.serial().unwrap().to_string();
        assert!(matches!(
            ctx.open(DeviceSelector::Serial(serial)),
            Err(KinectError::DeviceBusy)
        ));

        let second = ctx.open(testing::serial_of(1).as_str()).unwrap();
        assert_eq!(second.info().index, 1);
        assert_eq!(ctx.open_devices().len(), 2);
    }

    #[test]
    fn test_shutdown_closes_devices_and_is_idempotent() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = testing::context(backend);
        let dev = ctx.open(0).unwrap();
        dev.start(StreamKind::Video).unwrap();

        ctx.shutdown().unwrap();
        ctx.shutdown().unwrap();
        assert_eq!(ctx.loop_state(), LoopState::Stopped);
        assert!(units[0].is_closed());
        assert!(!dev.is_open());
        assert_eq!(dev.stream_state(StreamKind::Video), StreamState::Stopped);
        assert!(matches!(ctx.open(0), Err(KinectError::InvalidState(_))));
        assert!(matches!(ctx.enumerate(), Err(KinectError::InvalidState(_))));
        assert!(matches!(
            ctx.start_event_thread(),
            Err(KinectError::InvalidState(_))
        ));
    }

    #[test]
    fn test_drop_releases_context() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        {
            let ctx = testing::context(backend);
            ctx.open(0).unwrap();
        }
        assert!(units[0].is_closed());
        let (backend, _units) = SyntheticBackend::with_devices(1);
        let _ctx = testing::context(backend);
    }

    #[test]
    fn test_shutdown_from_callback_is_rejected() {
        let _serial = testing::serial();
        let (backend, units) = SyntheticBackend::with_devices(1);
        let ctx = std::sync::Arc::new(testing::context(backend));
        let dev = ctx.open(0).unwrap();
        testing::use_passthrough_depth(&dev);

        let inner = ctx.clone();
        let (tx, rx) = crossbeam_channel::unbounded();
        dev.set_depth_callback(move |_, _| {
            let _ = tx.send(inner.shutdown());
        });
        dev.start_depth().unwrap();
        units[0].queue_frames(StreamKind::Depth, &[1]);
        ctx.process_once(std::time::Duration::from_millis(5)).unwrap();

        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(KinectError::InvalidState(_))));
        assert_ne!(ctx.loop_state(), LoopState::Stopped);
        ctx.shutdown().unwrap();
    }
}
