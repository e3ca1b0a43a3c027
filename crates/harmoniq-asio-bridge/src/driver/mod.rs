//! Driver side of the bridge: the control surface a host calls into and the
//! callback thread that services the collector.

mod callback;
mod thread;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use self::callback::{HostCallbacks, MessageSelector};

use crate::channels::ChannelStore;
use crate::config::BridgeConfig;
use crate::convert::OverflowPolicy;
use crate::error::{BridgeError, Result};
use crate::layout::{Direction, StreamParams};
use crate::sem::Semaphore;
use crate::session::DriverSession;
use crate::time::{time_info_flags, AsioSamples, AsioTime, AsioTimeStamp, DriverClock};

pub const DRIVER_NAME: &str = "Harmoniq ASIO";
pub const DRIVER_VERSION: i32 = 2;

const NO_ERROR: &str = "No Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Attached, no buffers registered.
    Init,
    /// Buffers and callbacks registered.
    Configured,
    /// The host callback runs once per cycle.
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Int32Lsb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel: usize,
    pub direction: Direction,
    pub is_active: bool,
    pub group: i32,
    pub sample_type: SampleType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSource {
    pub index: i32,
    pub associated_channel: i32,
    pub associated_group: i32,
    pub is_current: bool,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSize {
    pub min: u32,
    pub max: u32,
    pub preferred: u32,
    pub granularity: i32,
}

/// One channel the host wants buffers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub direction: Direction,
    pub channel: i64,
}

impl BufferRequest {
    pub fn input(channel: i64) -> Self {
        Self {
            direction: Direction::Input,
            channel,
        }
    }

    pub fn output(channel: i64) -> Self {
        Self {
            direction: Direction::Output,
            channel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureSelector {
    EnableTimeCodeRead,
    DisableTimeCodeRead,
    SetInputMonitor,
    CanInputMonitor,
    CanTimeInfo,
    CanTimeCode,
    CanTransport,
    CanReportOverload,
    Other(i64),
}

/// Driver-process settings that do not come from the control block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverOptions {
    pub overflow: OverflowPolicy,
    /// Upper bound on how long shutdown waits for the callback thread.
    pub poll_interval: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for DriverOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            overflow: config.overflow,
            poll_interval: config.poll_interval(),
        }
    }
}

/// State shared between the control surface and the callback thread.
pub(crate) struct DriverShared {
    pub(crate) terminate: AtomicBool,
    pub(crate) sample_position: AtomicU64,
    pub(crate) system_time_ns: AtomicU64,
    pub(crate) clock: DriverClock,
    pub(crate) engine: Mutex<DriverEngine>,
}

pub(crate) struct DriverEngine {
    pub(crate) store: ChannelStore,
    pub(crate) callbacks: Option<Box<dyn HostCallbacks>>,
    pub(crate) time: AsioTime,
    pub(crate) time_info_mode: bool,
    pub(crate) time_code_read: bool,
    pub(crate) state: DriverState,
    pub(crate) overflow: OverflowPolicy,
}

impl DriverEngine {
    fn dispose(&mut self) {
        self.store.deactivate_all();
        self.callbacks = None;
        self.time_info_mode = false;
        self.state = DriverState::Init;
    }
}

/// A driver instance attached to a running bridge server.
///
/// Dropping the driver has the same effect as [`AsioDriver::shutdown`].
pub struct AsioDriver {
    params: StreamParams,
    shared: Arc<DriverShared>,
    thread: Option<JoinHandle<()>>,
    last_error: String,
}

impl AsioDriver {
    /// Attaches to the session named by `config`. Fails without side effects
    /// when the server has not created it.
    #[cfg(unix)]
    pub fn init(config: &BridgeConfig) -> Result<Self> {
        let session = DriverSession::open(config)?;
        Self::attach(session, DriverOptions::from(config))
    }

    /// Starts the callback thread on an already opened session.
    pub fn attach<S>(session: DriverSession<S>, options: DriverOptions) -> Result<Self>
    where
        S: Semaphore + 'static,
    {
        let params = session.params();
        let shared = Arc::new(DriverShared {
            terminate: AtomicBool::new(false),
            sample_position: AtomicU64::new(0),
            system_time_ns: AtomicU64::new(0),
            clock: DriverClock::new(),
            engine: Mutex::new(DriverEngine {
                store: ChannelStore::new(
                    params.inputs as usize,
                    params.outputs as usize,
                    params.frames(),
                ),
                callbacks: None,
                time: AsioTime::new(f64::from(params.sample_rate)),
                time_info_mode: false,
                time_code_read: false,
                state: DriverState::Init,
                overflow: options.overflow,
            }),
        });

        let worker_shared = Arc::clone(&shared);
        let poll = options.poll_interval;
        let handle = std::thread::Builder::new()
            .name("harmoniq-asio-callback".into())
            .spawn(move || thread::run(session, worker_shared, poll))
            .map_err(BridgeError::ThreadSpawn)?;

        info!(
            inputs = params.inputs,
            outputs = params.outputs,
            frames = params.buffer_frames,
            rate = params.sample_rate,
            "driver attached"
        );

        Ok(Self {
            params,
            shared,
            thread: Some(handle),
            last_error: NO_ERROR.to_string(),
        })
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = err.to_string();
        }
        result
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn driver_version(&self) -> i32 {
        DRIVER_VERSION
    }

    /// Description of the most recent failed call.
    pub fn error_message(&self) -> &str {
        &self.last_error
    }

    pub fn state(&self) -> DriverState {
        self.shared.engine.lock().state
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// `(inputs, outputs)`.
    pub fn channels(&self) -> (u32, u32) {
        (self.params.inputs, self.params.outputs)
    }

    /// `(input, output)` latency in frames.
    pub fn latencies(&self) -> (u32, u32) {
        let frames = self.params.buffer_frames;
        (frames, frames * 2)
    }

    pub fn buffer_size(&self) -> BufferSize {
        let frames = self.params.buffer_frames;
        BufferSize {
            min: frames,
            max: frames,
            preferred: frames,
            granularity: 0,
        }
    }

    fn session_rate(&self) -> f64 {
        f64::from(self.params.sample_rate)
    }

    pub fn can_sample_rate(&self, sample_rate: f64) -> Result<()> {
        if sample_rate == self.session_rate() {
            Ok(())
        } else {
            Err(BridgeError::NoClock(sample_rate))
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.session_rate()
    }

    /// Only the session's own rate is accepted.
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<()> {
        let result = self.can_sample_rate(sample_rate);
        self.record(result)
    }

    pub fn clock_sources(&self) -> Vec<ClockSource> {
        vec![ClockSource {
            index: 0,
            associated_channel: -1,
            associated_group: -1,
            is_current: true,
            name: "Internal".to_string(),
        }]
    }

    pub fn set_clock_source(&mut self, index: i32) -> Result<()> {
        let result = if index == 0 {
            self.shared
                .engine
                .lock()
                .time
                .raise(time_info_flags::CLOCK_SOURCE_CHANGED);
            Ok(())
        } else {
            Err(BridgeError::NotPresent("clock source"))
        };
        self.record(result)
    }

    /// Sample position of the current cycle and the time it was taken, in
    /// nanoseconds since the driver attached. Safe to call from callbacks.
    pub fn sample_position(&self) -> (AsioSamples, AsioTimeStamp) {
        (
            AsioSamples::from_u64(self.shared.sample_position.load(Ordering::Acquire)),
            AsioTimeStamp::from_u64(self.shared.system_time_ns.load(Ordering::Acquire)),
        )
    }

    pub fn channel_info(&self, direction: Direction, channel: i64) -> Result<ChannelInfo> {
        let engine = self.shared.engine.lock();
        let index = usize::try_from(channel)
            .map_err(|_| BridgeError::invalid(format!("{direction} channel {channel}")))?;
        let is_active = engine
            .store
            .is_active(direction, index)
            .ok_or_else(|| BridgeError::invalid(format!("{direction} channel {channel}")))?;
        let name = match direction {
            Direction::Input => format!("Input {index}"),
            Direction::Output => format!("Output {index}"),
        };
        Ok(ChannelInfo {
            channel: index,
            direction,
            is_active,
            group: 0,
            sample_type: SampleType::Int32Lsb,
            name,
        })
    }

    /// Registers channels and callbacks. An invalid request leaves the driver
    /// in [`DriverState::Init`] with nothing registered. While
    /// [`DriverState::Started`] the call is refused and the running
    /// registration is kept.
    pub fn create_buffers(
        &mut self,
        requests: &[BufferRequest],
        buffer_size: u32,
        callbacks: Option<Box<dyn HostCallbacks>>,
    ) -> Result<()> {
        let frames = self.params.buffer_frames;
        let sample_rate = self.session_rate();
        let result = {
            let mut engine = self.shared.engine.lock();
            if engine.state == DriverState::Started {
                Err(BridgeError::invalid("buffers cannot change while started"))
            } else {
                let result = register(
                    &mut engine,
                    requests,
                    buffer_size,
                    frames,
                    callbacks,
                    sample_rate,
                );
                if result.is_err() {
                    engine.dispose();
                }
                result
            }
        };
        match &result {
            Ok(()) => debug!(channels = requests.len(), "buffers created"),
            Err(err) => warn!(%err, "create_buffers rejected"),
        }
        self.record(result)
    }

    pub fn dispose_buffers(&mut self) -> Result<()> {
        self.shared.engine.lock().dispose();
        debug!("buffers disposed");
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        let result = {
            let mut engine = self.shared.engine.lock();
            if engine.callbacks.is_none() {
                Err(BridgeError::NotPresent("host callbacks"))
            } else {
                self.shared.sample_position.store(0, Ordering::Release);
                self.shared.system_time_ns.store(0, Ordering::Release);
                engine.state = DriverState::Started;
                Ok(())
            }
        };
        if result.is_ok() {
            info!("driver started");
        }
        self.record(result)
    }

    pub fn stop(&mut self) -> Result<()> {
        let mut engine = self.shared.engine.lock();
        if engine.state == DriverState::Started {
            engine.state = DriverState::Configured;
            info!("driver stopped");
        }
        Ok(())
    }

    pub fn control_panel(&self) -> Result<()> {
        Ok(())
    }

    pub fn future(&mut self, selector: FutureSelector) -> Result<()> {
        let result = match selector {
            FutureSelector::EnableTimeCodeRead => {
                self.shared.engine.lock().time_code_read = true;
                Ok(())
            }
            FutureSelector::DisableTimeCodeRead => {
                self.shared.engine.lock().time_code_read = false;
                Ok(())
            }
            FutureSelector::SetInputMonitor
            | FutureSelector::CanInputMonitor
            | FutureSelector::CanTimeInfo
            | FutureSelector::CanTimeCode => Ok(()),
            FutureSelector::CanTransport
            | FutureSelector::CanReportOverload
            | FutureSelector::Other(_) => Err(BridgeError::NotPresent("future selector")),
        };
        self.record(result)
    }

    /// Outputs are always handed over at the end of the callback.
    pub fn output_ready(&self) -> Result<()> {
        Err(BridgeError::NotPresent("output ready"))
    }

    /// Stops the callback thread. The thread unlinks the shared names on its
    /// way out, so the server's next cycles are silent.
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.shared.terminate.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!("callback thread panicked");
        }
        info!("driver shut down");
    }
}

impl Drop for AsioDriver {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn register(
    engine: &mut DriverEngine,
    requests: &[BufferRequest],
    buffer_size: u32,
    frames: u32,
    callbacks: Option<Box<dyn HostCallbacks>>,
    sample_rate: f64,
) -> Result<()> {
    let Some(mut callbacks) = callbacks else {
        return Err(BridgeError::invalid("host callbacks missing"));
    };
    if buffer_size != frames {
        return Err(BridgeError::invalid(format!(
            "buffer size {buffer_size} (session uses {frames})"
        )));
    }
    engine.store.deactivate_all();
    for request in requests {
        engine.store.activate(request.direction, request.channel)?;
    }

    engine.time_info_mode = callbacks.message(MessageSelector::SupportsTimeInfo, 0) != 0;
    engine.time = AsioTime::new(sample_rate);
    engine.callbacks = Some(callbacks);
    engine.state = DriverState::Configured;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::HostBuffers;
    use crate::session::loopback;
    use pretty_assertions::assert_eq;

    struct Silent;

    impl HostCallbacks for Silent {
        fn buffer_switch(&mut self, _buffers: &mut HostBuffers<'_>, _direct: bool) {}
    }

    fn driver(dir: &std::path::Path) -> AsioDriver {
        let config = BridgeConfig {
            shm_dir: dir.to_path_buf(),
            poll_interval_ms: 5,
            ..BridgeConfig::default()
        };
        let (_collector, session) = loopback(&config, StreamParams::new(2, 2, 64, 44_100)).unwrap();
        AsioDriver::attach(session, DriverOptions::from(&config)).unwrap()
    }

    #[test]
    fn reports_fixed_session_shape() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        assert_eq!(driver.channels(), (2, 2));
        assert_eq!(driver.latencies(), (64, 128));
        assert_eq!(
            driver.buffer_size(),
            BufferSize {
                min: 64,
                max: 64,
                preferred: 64,
                granularity: 0
            }
        );
        assert!(driver.can_sample_rate(44_100.0).is_ok());
        assert!(matches!(
            driver.can_sample_rate(48_000.0),
            Err(BridgeError::NoClock(_))
        ));
        assert_eq!(driver.clock_sources().len(), 1);
        assert_eq!(driver.error_message(), NO_ERROR);
        driver.shutdown();
    }

    #[test]
    fn start_requires_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        assert!(matches!(driver.start(), Err(BridgeError::NotPresent(_))));
        assert_eq!(driver.state(), DriverState::Init);
        assert!(driver.error_message().contains("host callbacks"));
        assert!(driver.stop().is_ok());
    }

    #[test]
    fn failed_create_buffers_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());

        let requests = [BufferRequest::input(0), BufferRequest::output(7)];
        let err = driver
            .create_buffers(&requests, 64, Some(Box::new(Silent)))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParameter(_)));
        assert_eq!(driver.state(), DriverState::Init);
        assert!(!driver.channel_info(Direction::Input, 0).unwrap().is_active);
        assert!(driver.start().is_err());

        assert!(driver
            .create_buffers(&[BufferRequest::input(0)], 32, Some(Box::new(Silent)))
            .is_err());
        assert!(driver.create_buffers(&[BufferRequest::input(0)], 64, None).is_err());

        driver
            .create_buffers(&[BufferRequest::input(0)], 64, Some(Box::new(Silent)))
            .unwrap();
        assert_eq!(driver.state(), DriverState::Configured);
        let info = driver.channel_info(Direction::Input, 0).unwrap();
        assert_eq!(info.name, "Input 0");
        assert!(info.is_active);
        assert_eq!(info.sample_type, SampleType::Int32Lsb);
    }

    #[test]
    fn state_machine_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        driver
            .create_buffers(&[BufferRequest::output(1)], 64, Some(Box::new(Silent)))
            .unwrap();
        driver.start().unwrap();
        assert_eq!(driver.state(), DriverState::Started);
        driver.stop().unwrap();
        assert_eq!(driver.state(), DriverState::Configured);
        driver.start().unwrap();
        driver.dispose_buffers().unwrap();
        assert_eq!(driver.state(), DriverState::Init);
        assert!(!driver.channel_info(Direction::Output, 1).unwrap().is_active);
    }

    #[test]
    fn create_buffers_while_started_keeps_running_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        driver
            .create_buffers(&[BufferRequest::input(1)], 64, Some(Box::new(Silent)))
            .unwrap();
        driver.start().unwrap();

        let err = driver
            .create_buffers(&[BufferRequest::output(0)], 64, Some(Box::new(Silent)))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParameter(_)));
        assert_eq!(driver.state(), DriverState::Started);
        assert!(driver.channel_info(Direction::Input, 1).unwrap().is_active);
        assert!(!driver.channel_info(Direction::Output, 0).unwrap().is_active);
        assert!(driver.error_message().contains("while started"));

        driver.stop().unwrap();
        driver.shutdown();
    }

    #[test]
    fn future_and_clock_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        assert!(driver.future(FutureSelector::EnableTimeCodeRead).is_ok());
        assert!(driver.future(FutureSelector::CanTimeInfo).is_ok());
        assert!(driver.future(FutureSelector::Other(99)).is_err());
        assert!(driver.output_ready().is_err());
        assert!(driver.set_clock_source(0).is_ok());
        assert!(driver.set_clock_source(1).is_err());
        assert!(driver.channel_info(Direction::Output, 2).is_err());
        assert!(driver.channel_info(Direction::Output, -1).is_err());
    }
}
