//! Pixel detector backend.
//!
//! Drives one detector shared by all sessions:
//!
//! ```text
//! IS_CONNECTED                  OK is_connected 0|1
//! INFO                          OK info <width> <height> <data_type>
//! CONFIG                        OK config
//! ACQUIRE count time            blocks until done: OK acquire
//! ACQUIRE_NOWAIT count time     returns at once: UNKNOWN acquire_nowait
//! IS_RUNNING                    OK is_running 0|1
//! STATUS                        OK status idle|running|done, or ERROR:<code> status
//! ABORT                         OK abort
//! LAST_FRAME                    OK last_frame int16 <n>, then n little-endian i16
//! KILL                          OK kill, then the server shuts down
//! ```
//!
//! Only one acquisition runs at a time. A second `ACQUIRE` or
//! `ACQUIRE_NOWAIT` while one is running is rejected with `ERROR:104 busy`;
//! clients poll `IS_RUNNING` or `STATUS` and may `ABORT`.

use crate::command::{
    Payload, Response, ERR_BUSY, ERR_ILLEGAL_ARGUMENTS, ERR_INTERNAL, ERR_NO_DATA,
};
use crate::dispatcher::{arg, CommandTable, Dispatcher};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Detector errors, each with a numeric code for the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device not connected")]
    NotConnected,
    #[error("acquisition aborted")]
    Aborted,
    #[error("acquisition already running")]
    Busy,
    #[error("exposure out of range")]
    ExposureOutOfRange,
    #[error("device error {0}")]
    Code(i32),
}

impl DeviceError {
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::NotConnected => 1,
            DeviceError::Aborted => 2,
            DeviceError::Busy => ERR_BUSY,
            DeviceError::ExposureOutOfRange => ERR_ILLEGAL_ARGUMENTS,
            DeviceError::Code(code) => *code,
        }
    }
}

/// Sensor geometry and pixel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorInfo {
    pub width: usize,
    pub height: usize,
    pub data_type: &'static str,
}

/// Acquisition modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperationMode {
    #[default]
    Counting,
    /// Event counting with integrated time-over-threshold.
    EventItot,
}

/// A detector device.
///
/// `acquire` blocks until the acquisition completes or is aborted; every
/// other method returns promptly and may be called while it runs.
pub trait Detector: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    fn info(&self) -> DetectorInfo;
    fn operation_mode(&self) -> OperationMode;
    fn set_operation_mode(&self, mode: OperationMode) -> Result<(), DeviceError>;
    /// Take `count` frames of `time` seconds each.
    fn acquire(&self, count: u32, time: Duration) -> Result<(), DeviceError>;
    fn is_running(&self) -> bool;
    fn abort(&self) -> Result<(), DeviceError>;
    fn last_frame(&self) -> Option<Arc<Vec<i16>>>;
    /// Disconnect the device.
    fn close(&self);
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    running: bool,
    abort_requested: bool,
    mode: OperationMode,
    acquisitions: u32,
    last_frame: Option<Arc<Vec<i16>>>,
}

/// In-process detector that sleeps for the exposure and produces a
/// deterministic frame.
pub struct SimulatedDetector {
    width: usize,
    height: usize,
    state: Mutex<SimState>,
    wake: Condvar,
}

impl SimulatedDetector {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            state: Mutex::new(SimState {
                connected: true,
                running: false,
                abort_requested: false,
                mode: OperationMode::default(),
                acquisitions: 0,
                last_frame: None,
            }),
            wake: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn frame(&self, count: u32, seq: u32) -> Vec<i16> {
        (0..self.width * self.height)
            .map(|i| {
                let (x, y) = (i % self.width, i / self.width);
                ((x + y + seq as usize) % 64) as i16 * count.min(512) as i16
            })
            .collect()
    }
}

impl Default for SimulatedDetector {
    /// A 256x256 sensor.
    fn default() -> Self {
        Self::new(256, 256)
    }
}

impl Detector for SimulatedDetector {
    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn info(&self) -> DetectorInfo {
        DetectorInfo {
            width: self.width,
            height: self.height,
            data_type: "int16",
        }
    }

    fn operation_mode(&self) -> OperationMode {
        self.state().mode
    }

    fn set_operation_mode(&self, mode: OperationMode) -> Result<(), DeviceError> {
        let mut state = self.state();
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        if state.running {
            return Err(DeviceError::Busy);
        }
        state.mode = mode;
        Ok(())
    }

    fn acquire(&self, count: u32, time: Duration) -> Result<(), DeviceError> {
        let deadline = time
            .checked_mul(count)
            .and_then(|exposure| Instant::now().checked_add(exposure))
            .ok_or(DeviceError::ExposureOutOfRange)?;

        let mut state = self.state();
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        if state.running {
            return Err(DeviceError::Busy);
        }
        state.running = true;
        state.abort_requested = false;

        loop {
            if state.abort_requested || !state.connected {
                state.running = false;
                return Err(DeviceError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        state.acquisitions = state.acquisitions.wrapping_add(1);
        let frame = self.frame(count, state.acquisitions);
        state.last_frame = Some(Arc::new(frame));
        state.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state().running
    }

    fn abort(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        if state.running {
            state.abort_requested = true;
            self.wake.notify_all();
        }
        Ok(())
    }

    fn last_frame(&self) -> Option<Arc<Vec<i16>>> {
        self.state().last_frame.clone()
    }

    fn close(&self) {
        let mut state = self.state();
        state.connected = false;
        self.wake.notify_all();
    }
}

/// Bookkeeping for the one acquisition allowed at a time.
#[derive(Default)]
struct Acquisition {
    /// A blocking `ACQUIRE` is in progress.
    blocking: bool,
    /// A fire-and-forget acquisition started by `ACQUIRE_NOWAIT`.
    background: Option<JoinHandle<Result<(), DeviceError>>>,
    /// Outcome of the most recent finished acquisition.
    last: Option<Result<(), DeviceError>>,
}

impl Acquisition {
    /// Collect the background result if its thread has finished.
    fn reap(&mut self) {
        if self.background.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = self.background.take() {
                self.last = Some(join_acquisition(handle));
            }
        }
    }

    fn is_active(&self) -> bool {
        self.blocking || self.background.is_some()
    }
}

/// Clears the blocking flag when an `ACQUIRE` ends, including by unwinding.
struct BlockingAcquisition<'a> {
    acquisition: &'a Mutex<Acquisition>,
}

impl Drop for BlockingAcquisition<'_> {
    fn drop(&mut self) {
        self.acquisition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocking = false;
    }
}

fn join_acquisition(handle: JoinHandle<Result<(), DeviceError>>) -> Result<(), DeviceError> {
    handle.join().unwrap_or_else(|_| {
        warn!("Acquisition thread panicked");
        Err(DeviceError::Code(ERR_INTERNAL))
    })
}

/// Detector server
pub struct DetectorServer {
    detector: Arc<dyn Detector>,
    acquisition: Mutex<Acquisition>,
    commands: CommandTable<DetectorServer>,
}

impl DetectorServer {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        let commands = CommandTable::new()
            .register("IS_CONNECTED", Self::is_connected)
            .register("INFO", Self::info)
            .register("CONFIG", Self::config)
            .register("ACQUIRE", Self::acquire)
            .register("ACQUIRE_NOWAIT", Self::acquire_nowait)
            .register("IS_RUNNING", Self::is_running)
            .register("STATUS", Self::status)
            .register("ABORT", Self::abort)
            .register("LAST_FRAME", Self::last_frame)
            .register("KILL", Self::kill);

        // The device starts in event + iToT mode.
        if let Err(e) = detector.set_operation_mode(OperationMode::EventItot) {
            warn!(error = %e, "Failed to set initial operation mode");
        }

        let info = detector.info();
        info!(
            width = info.width,
            height = info.height,
            connected = detector.is_connected(),
            commands = ?commands.names(),
            "Detector ready"
        );

        Self {
            detector,
            acquisition: Mutex::new(Acquisition::default()),
            commands,
        }
    }

    fn acquisition(&self) -> MutexGuard<'_, Acquisition> {
        self.acquisition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the acquisition slot, or report busy.
    fn begin(&self) -> Result<MutexGuard<'_, Acquisition>, Response> {
        let mut acquisition = self.acquisition();
        acquisition.reap();
        if acquisition.is_active() || self.detector.is_running() {
            return Err(Response::busy());
        }
        Ok(acquisition)
    }

    fn is_connected(&self, _args: &[String]) -> Response {
        Response::ok(format!("is_connected {}", u8::from(self.detector.is_connected())))
    }

    fn info(&self, _args: &[String]) -> Response {
        let info = self.detector.info();
        Response::ok(format!(
            "info {} {} {}",
            info.width, info.height, info.data_type
        ))
    }

    fn config(&self, _args: &[String]) -> Response {
        match self.detector.set_operation_mode(OperationMode::EventItot) {
            Ok(()) => {
                debug!(mode = ?self.detector.operation_mode(), "Operation mode set");
                Response::ok("config")
            }
            Err(e) => Response::error(e.code(), "config"),
        }
    }

    fn acquire(&self, args: &[String]) -> Response {
        let Some((count, time)) = acquisition_args(args) else {
            return Response::illegal_arguments("acquire");
        };

        let mut acquisition = match self.begin() {
            Ok(acquisition) => acquisition,
            Err(busy) => return busy,
        };
        acquisition.blocking = true;
        drop(acquisition);
        let _blocking = BlockingAcquisition {
            acquisition: &self.acquisition,
        };

        debug!(count, time = ?time, "Acquisition started");
        let result = self.detector.acquire(count, time);
        self.acquisition().last = Some(result.clone());

        match result {
            Ok(()) => Response::ok("acquire"),
            Err(e) => Response::error(e.code(), "acquire"),
        }
    }

    fn acquire_nowait(&self, args: &[String]) -> Response {
        let Some((count, time)) = acquisition_args(args) else {
            return Response::illegal_arguments("acquire_nowait");
        };

        let mut acquisition = match self.begin() {
            Ok(acquisition) => acquisition,
            Err(busy) => return busy,
        };

        let detector = Arc::clone(&self.detector);
        let spawned = std::thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || detector.acquire(count, time));

        match spawned {
            Ok(handle) => {
                acquisition.background = Some(handle);
                debug!(count, time = ?time, "Background acquisition started");
                Response::pending("acquire_nowait")
            }
            Err(e) => {
                warn!(error = %e, "Failed to start acquisition thread");
                Response::error(ERR_INTERNAL, "acquire_nowait")
            }
        }
    }

    fn is_running(&self, _args: &[String]) -> Response {
        let mut acquisition = self.acquisition();
        acquisition.reap();
        let running = acquisition.is_active() || self.detector.is_running();
        Response::ok(format!("is_running {}", u8::from(running)))
    }

    fn status(&self, _args: &[String]) -> Response {
        let mut acquisition = self.acquisition();
        acquisition.reap();
        if acquisition.is_active() {
            return Response::ok("status running");
        }
        match &acquisition.last {
            None => Response::ok("status idle"),
            Some(Ok(())) => Response::ok("status done"),
            Some(Err(e)) => Response::error(e.code(), "status"),
        }
    }

    fn abort(&self, _args: &[String]) -> Response {
        match self.detector.abort() {
            Ok(()) => Response::ok("abort"),
            Err(e) => Response::error(e.code(), "abort"),
        }
    }

    fn last_frame(&self, _args: &[String]) -> Response {
        match self.detector.last_frame() {
            Some(frame) => Response::ok(format!("last_frame int16 {}", frame.len()))
                .with_payload(Payload::Int16((*frame).clone())),
            None => Response::error(ERR_NO_DATA, "no_last_frame"),
        }
    }

    fn kill(&self, _args: &[String]) -> Response {
        info!("Kill requested");
        self.shutdown_device();
        Response::ok("kill").then_shutdown()
    }

    /// Abort any acquisition, disconnect, and wait for the background thread.
    fn shutdown_device(&self) {
        let _ = self.detector.abort();
        // Closing also stops an acquisition that had not started running yet.
        self.detector.close();
        let background = self.acquisition().background.take();
        if let Some(handle) = background {
            let result = join_acquisition(handle);
            self.acquisition().last = Some(result);
        }
    }
}

/// Parse `count time`: a positive frame count and a non-negative
/// exposure in seconds.
fn acquisition_args(args: &[String]) -> Option<(u32, Duration)> {
    if args.len() != 2 {
        return None;
    }
    let count = arg::<u32>(args, 0).filter(|&c| c > 0)?;
    let seconds = arg::<f64>(args, 1)?;
    let time = Duration::try_from_secs_f64(seconds).ok()?;
    Some((count, time))
}

impl Dispatcher for DetectorServer {
    fn process(&self, name: &str, args: &[String]) -> Response {
        self.commands.dispatch(self, name, args)
    }

    fn close(&self) {
        if self.detector.is_connected() {
            self.shutdown_device();
            info!("Detector disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn server() -> (DetectorServer, Arc<SimulatedDetector>) {
        let detector = Arc::new(SimulatedDetector::new(4, 2));
        (DetectorServer::new(detector.clone()), detector)
    }

    fn send(server: &DetectorServer, line: &str) -> Response {
        let mut tokens = line.split_whitespace();
        let name = tokens.next().unwrap().to_ascii_uppercase();
        let args: Vec<String> = tokens.map(str::to_string).collect();
        server.process(&name, &args)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_simple_queries() {
        let (server, detector) = server();
        assert_eq!(send(&server, "is_connected").line(), "OK is_connected 1");
        assert_eq!(send(&server, "INFO").line(), "OK info 4 2 int16");
        assert_eq!(detector.operation_mode(), OperationMode::EventItot);
        assert_eq!(send(&server, "CONFIG").line(), "OK config");
        assert_eq!(send(&server, "IS_RUNNING").line(), "OK is_running 0");
        assert_eq!(send(&server, "STATUS").line(), "OK status idle");
    }

    #[test]
    fn test_last_frame_before_acquisition() {
        let (server, _) = server();
        assert_eq!(send(&server, "LAST_FRAME").line(), "ERROR:103 no_last_frame");
    }

    #[test]
    fn test_blocking_acquire_then_last_frame() {
        let (server, _) = server();
        assert_eq!(send(&server, "ACQUIRE 2 0.01").line(), "OK acquire");
        assert_eq!(send(&server, "STATUS").line(), "OK status done");

        let resp = send(&server, "LAST_FRAME");
        assert_eq!(resp.line(), "OK last_frame int16 8");
        let Some(Payload::Int16(values)) = resp.payload else {
            panic!("missing payload");
        };
        assert_eq!(values.len(), 8);

        // Two bytes per element follow the text line.
        let encoded = send(&server, "LAST_FRAME").encode();
        assert_eq!(encoded.len(), "OK last_frame int16 8\n".len() + 16);
    }

    #[test]
    fn test_acquire_illegal_arguments() {
        let (server, _) = server();
        for line in ["ACQUIRE", "ACQUIRE 1", "ACQUIRE 0 1", "ACQUIRE x 1", "ACQUIRE 1 -1", "ACQUIRE 1 inf"] {
            assert_eq!(
                send(&server, line).line(),
                "ERROR:102 acquire illegal_arguments",
                "{line}"
            );
        }
        assert_eq!(
            send(&server, "ACQUIRE_NOWAIT 1").line(),
            "ERROR:102 acquire_nowait illegal_arguments"
        );
    }

    #[test]
    fn test_exposure_out_of_range_leaves_detector_idle() {
        let (server, _) = server();
        assert_eq!(send(&server, "ACQUIRE 1 1e19").line(), "ERROR:102 acquire");
        assert_eq!(send(&server, "IS_RUNNING").line(), "OK is_running 0");
        assert_eq!(send(&server, "STATUS").line(), "ERROR:102 status");
        assert_eq!(send(&server, "ACQUIRE 1 0.01").line(), "OK acquire");
    }

    /// Panics inside `acquire`; everything else goes to a simulated device.
    struct Faulty(SimulatedDetector);

    impl Detector for Faulty {
        fn is_connected(&self) -> bool {
            self.0.is_connected()
        }
        fn info(&self) -> DetectorInfo {
            self.0.info()
        }
        fn operation_mode(&self) -> OperationMode {
            self.0.operation_mode()
        }
        fn set_operation_mode(&self, mode: OperationMode) -> Result<(), DeviceError> {
            self.0.set_operation_mode(mode)
        }
        fn acquire(&self, _count: u32, _time: Duration) -> Result<(), DeviceError> {
            panic!("driver fault");
        }
        fn is_running(&self) -> bool {
            self.0.is_running()
        }
        fn abort(&self) -> Result<(), DeviceError> {
            self.0.abort()
        }
        fn last_frame(&self) -> Option<Arc<Vec<i16>>> {
            self.0.last_frame()
        }
        fn close(&self) {
            self.0.close()
        }
    }

    #[test]
    fn test_panicking_acquire_releases_slot() {
        let server = DetectorServer::new(Arc::new(Faulty(SimulatedDetector::new(4, 2))));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            send(&server, "ACQUIRE 1 0.01")
        }));
        assert!(result.is_err());

        assert_eq!(send(&server, "IS_RUNNING").line(), "OK is_running 0");
        assert_eq!(send(&server, "STATUS").line(), "OK status idle");
    }

    #[test]
    fn test_nowait_busy_and_abort() {
        let (server, detector) = server();
        assert_eq!(send(&server, "ACQUIRE_NOWAIT 1 30").line(), "UNKNOWN acquire_nowait");
        wait_until(|| detector.is_running());

        assert_eq!(send(&server, "IS_RUNNING").line(), "OK is_running 1");
        assert_eq!(send(&server, "STATUS").line(), "OK status running");
        assert_eq!(send(&server, "ACQUIRE 1 0.01").line(), "ERROR:104 busy");
        assert_eq!(send(&server, "ACQUIRE_NOWAIT 1 0.01").line(), "ERROR:104 busy");

        assert_eq!(send(&server, "ABORT").line(), "OK abort");
        wait_until(|| send(&server, "IS_RUNNING").line() == "OK is_running 0");
        assert_eq!(send(&server, "STATUS").line(), "ERROR:2 status");
        assert_eq!(send(&server, "LAST_FRAME").line(), "ERROR:103 no_last_frame");
    }

    #[test]
    fn test_nowait_completes() {
        let (server, _) = server();
        assert_eq!(send(&server, "ACQUIRE_NOWAIT 1 0.01").line(), "UNKNOWN acquire_nowait");
        wait_until(|| send(&server, "STATUS").line() == "OK status done");
        assert!(send(&server, "LAST_FRAME").is_ok());
    }

    #[test]
    fn test_blocking_acquire_aborted_from_another_thread() {
        let (server, detector) = server();
        let server = Arc::new(server);

        let worker = {
            let server = Arc::clone(&server);
            thread::spawn(move || send(&server, "ACQUIRE 1 30").line())
        };
        wait_until(|| detector.is_running());
        assert_eq!(send(&server, "ACQUIRE_NOWAIT 1 1").line(), "ERROR:104 busy");
        assert_eq!(send(&server, "ABORT").line(), "OK abort");

        assert_eq!(worker.join().unwrap(), "ERROR:2 acquire");
    }

    #[test]
    fn test_kill_disconnects_and_requests_shutdown() {
        let (server, _) = server();
        send(&server, "ACQUIRE_NOWAIT 1 30");

        let resp = send(&server, "KILL");
        assert_eq!(resp.line(), "OK kill");
        assert_eq!(resp.after, crate::command::After::Shutdown);

        assert_eq!(send(&server, "IS_CONNECTED").line(), "OK is_connected 0");
        assert_eq!(send(&server, "ACQUIRE 1 0.01").line(), "ERROR:1 acquire");
        assert_eq!(send(&server, "ABORT").line(), "ERROR:1 abort");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (server, detector) = server();
        server.close();
        assert!(!detector.is_connected());
        server.close();
    }

    #[test]
    fn test_unknown_command() {
        let (server, _) = server();
        assert_eq!(send(&server, "expose").line(), "ERROR:101 EXPOSE unknown_command");
    }
}
