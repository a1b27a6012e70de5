//! Transport polling, decode and callback dispatch.

use crate::context::ContextInner;
use crate::device::Device;
use crate::types::StreamKind;
use crate::{KinectError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Event loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Stopped,
}

impl LoopState {
    fn from_u8(v: u8) -> LoopState {
        match v {
            0 => LoopState::Idle,
            1 => LoopState::Polling,
            _ => LoopState::Stopped,
        }
    }
}

/// Returned by a [`crate::Context::run_loop`] body to keep going or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Break,
}

thread_local! {
    static IN_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside `process_once` for the guard's lifetime.
struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Result<ReentryGuard> {
        if IN_LOOP.with(|f| f.replace(true)) {
            return Err(KinectError::invalid_state(
                "event loop called from inside a frame callback",
            ));
        }
        Ok(ReentryGuard)
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_LOOP.with(|f| f.set(false));
    }
}

/// True when called from a frame callback on this thread.
pub(crate) fn in_callback() -> bool {
    IN_LOOP.with(|f| f.get())
}

/// Loop ownership and state for one context.
pub(crate) struct EventLoop {
    /// Held for the whole of each iteration; serialises the event thread,
    /// synchronous callers and shutdown.
    lock: Mutex<()>,
    state: AtomicU8,
    runner: Mutex<Option<Runner>>,
}

impl EventLoop {
    pub(crate) fn new() -> EventLoop {
        EventLoop {
            lock: Mutex::new(()),
            state: AtomicU8::new(LoopState::Idle as u8),
            runner: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Mark the loop stopped. Returns false when it already was.
    pub(crate) fn mark_stopped(&self) -> bool {
        self.state.swap(LoopState::Stopped as u8, Ordering::AcqRel) != LoopState::Stopped as u8
    }

    /// Wait for any in-flight iteration to finish.
    pub(crate) fn quiesce(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// True while a runner thread is installed and still alive.
    pub(crate) fn has_runner(&self) -> bool {
        self.runner
            .lock()
            .map(|r| r.as_ref().is_some_and(|runner| !runner.is_finished()))
            .unwrap_or(false)
    }

    /// Install a runner unless one is already running.
    pub(crate) fn start_runner(&self, spawn: impl FnOnce() -> Result<Runner>) -> Result<()> {
        let mut slot = self
            .runner
            .lock()
            .map_err(|_| KinectError::invalid_state("runner lock poisoned"))?;
        if slot.as_ref().is_some_and(Runner::is_finished) {
            if let Some(runner) = slot.take() {
                log::warn!("Event thread exited unexpectedly, replacing it");
                runner.stop(Duration::ZERO);
            }
        }
        if slot.is_some() {
            return Err(KinectError::invalid_state("event thread already running"));
        }
        *slot = Some(spawn()?);
        Ok(())
    }

    pub(crate) fn take_runner(&self) -> Option<Runner> {
        self.runner.lock().ok().and_then(|mut r| r.take())
    }
}

/// Poll every device with a running stream, feed the packets to the stream
/// state machines and invoke callbacks for the frames that became ready.
///
/// A timeout with no data is a normal return. Poll errors are logged and the
/// iteration carries on with the next device.
pub(crate) fn process_once(ctx: &Arc<ContextInner>, timeout: Duration) -> Result<()> {
    let _reentry = ReentryGuard::enter()?;
    let event_loop = ctx.event_loop();
    if event_loop.state() == LoopState::Stopped {
        return Err(KinectError::invalid_state("context is shut down"));
    }
    let _owner = event_loop.quiesce();
    // Shutdown may have won the race for the lock.
    if event_loop.state() == LoopState::Stopped {
        return Err(KinectError::invalid_state("context is shut down"));
    }
    event_loop.set_state(LoopState::Polling);

    let devices: Vec<(Device, _)> = ctx
        .devices()
        .into_iter()
        .filter_map(|dev| {
            let active = dev.shared.active_streams();
            (!active.is_empty()).then_some((dev, active))
        })
        .collect();

    if devices.is_empty() {
        std::thread::sleep(timeout);
    } else {
        let per_device = timeout / devices.len() as u32;
        for (dev, active) in &devices {
            let packets = match dev.shared.poll(*active, per_device) {
                Ok(packets) => packets,
                Err(e) => {
                    log::warn!("Device {}: poll failed: {}", dev.info().index, e);
                    continue;
                }
            };
            if packets.is_empty() {
                continue;
            }
            let ready = dev.shared.ingest(&packets);
            for kind in StreamKind::ALL {
                if !ready.contains(kind.as_set()) {
                    continue;
                }
                // Only the newest frame is handed out when several completed.
                if let Some(frame) = dev.shared.latest_frame(kind) {
                    dev.shared.dispatch(dev, kind, &frame);
                }
            }
        }
    }

    // Leave Stopped in place if shutdown was requested mid-iteration.
    let _ = event_loop.state.compare_exchange(
        LoopState::Polling as u8,
        LoopState::Idle as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    Ok(())
}

/// Drive `process_once` on the calling thread until `body` breaks.
pub(crate) fn run_loop<F>(ctx: &Arc<ContextInner>, timeout: Duration, mut body: F) -> Result<()>
where
    F: FnMut() -> LoopControl,
{
    loop {
        process_once(ctx, timeout)?;
        if body() == LoopControl::Break {
            return Ok(());
        }
    }
}

/// Background thread running `process_once` continuously.
pub(crate) struct Runner {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Runner {
    pub(crate) fn spawn(ctx: Arc<ContextInner>, timeout: Duration) -> Result<Runner> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("kinect-events".into())
            .spawn(move || {
                log::info!("Event thread started");
                loop {
                    if stop_rx.try_recv().is_ok() {
                        break;
                    }
                    match process_once(&ctx, timeout) {
                        Ok(()) => {}
                        Err(KinectError::InvalidState(_))
                            if ctx.event_loop().state() == LoopState::Stopped =>
                        {
                            break
                        }
                        Err(e) => {
                            log::warn!("Event loop iteration failed: {}", e);
                        }
                    }
                }
                let _ = done_tx.send(());
                log::info!("Event thread exited");
            })
            .map_err(|e| KinectError::Init(format!("spawn event thread: {}", e)))?;
        Ok(Runner {
            stop_tx,
            done_rx,
            handle: Some(handle),
        })
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the thread and wait for it to finish its current iteration.
    pub(crate) fn stop(mut self, grace: Duration) {
        let _ = self.stop_tx.try_send(());
        let deadline = Instant::now() + grace;
        match self.done_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Event thread slow to stop, waiting");
            }
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Event thread panicked");
            }
        }
    }
}
