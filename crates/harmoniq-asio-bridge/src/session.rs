//! Creation, opening and removal of the shared objects of one bridge.
//!
//! The server creates everything; the driver only ever opens. Whoever tears
//! the session down unlinks the names, and unlinking twice is harmless.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::collector::CollectorBridge;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handshake::{DriverHandshake, ServerHandshake};
use crate::layout::StreamParams;
use crate::sem::{LocalSemaphore, Semaphore};
use crate::shm::{ControlSegment, SampleSegment, SharedSegment};

#[cfg(unix)]
use crate::sem::NamedSemaphore;

/// Names of the four shared objects derived from a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub control: PathBuf,
    pub samples: PathBuf,
    pub ready: String,
    pub consumed: String,
}

impl SessionPaths {
    pub fn new(shm_dir: &Path, prefix: &str) -> Self {
        Self {
            control: shm_dir.join(format!("{prefix}-info")),
            samples: shm_dir.join(format!("{prefix}-buffers")),
            ready: format!("/{prefix}-ready"),
            consumed: format!("/{prefix}-consumed"),
        }
    }

    fn unlink_segments(&self) {
        for path in [&self.control, &self.samples] {
            if let Err(err) = SharedSegment::unlink(path) {
                warn!(?err, path = %path.display(), "failed to unlink segment");
            }
        }
    }

    #[cfg(unix)]
    fn unlink_semaphores(&self) {
        for name in [&self.ready, &self.consumed] {
            if let Err(err) = NamedSemaphore::unlink(name) {
                warn!(?err, name, "failed to unlink semaphore");
            }
        }
    }

    #[cfg(not(unix))]
    fn unlink_semaphores(&self) {}

    /// Removes every name. Mappings and handles already open stay valid.
    pub fn unlink_all(&self) {
        self.unlink_segments();
        self.unlink_semaphores();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Serving,
    ShuttingDown,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServerState::Starting => "starting",
            ServerState::Serving => "serving",
            ServerState::ShuttingDown => "shutting down",
        };
        f.write_str(label)
    }
}

/// Owner of the server's shared objects.
#[derive(Debug)]
pub struct ServerSession {
    paths: SessionPaths,
    params: StreamParams,
    state: ServerState,
}

impl ServerSession {
    /// Creates fresh shared objects, replacing stale ones with the same
    /// names, and returns the collector that drives them.
    #[cfg(unix)]
    pub fn create(
        config: &BridgeConfig,
        params: StreamParams,
    ) -> Result<(Self, CollectorBridge<NamedSemaphore>)> {
        config.validate()?;
        params.validate()?;
        let paths = config.paths();

        let semaphore = |name: &str| {
            NamedSemaphore::create(name).map_err(|source| BridgeError::SemaphoreUnavailable {
                name: name.to_string(),
                source,
            })
        };
        let ready = semaphore(&paths.ready)?;
        let consumed = match semaphore(&paths.consumed) {
            Ok(sem) => sem,
            Err(err) => {
                paths.unlink_semaphores();
                return Err(err);
            }
        };

        let segments = ControlSegment::create(&paths.control, &params).and_then(|control| {
            SampleSegment::create(&paths.samples, params).map(|samples| (control, samples))
        });
        let (control, samples) = match segments {
            Ok(segments) => segments,
            Err(err) => {
                paths.unlink_all();
                return Err(err);
            }
        };

        info!(
            control = %paths.control.display(),
            samples = %paths.samples.display(),
            inputs = params.inputs,
            outputs = params.outputs,
            frames = params.buffer_frames,
            rate = params.sample_rate,
            "bridge session created"
        );

        let handshake = ServerHandshake::new(ready, consumed, config.handshake_timeout());
        let collector = CollectorBridge::new(control, samples, handshake);
        Ok((
            Self {
                paths,
                params,
                state: ServerState::Starting,
            },
            collector,
        ))
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Marks the audio server client as active.
    pub fn activate(&mut self) {
        if self.state == ServerState::Starting {
            self.state = ServerState::Serving;
            debug!("bridge session serving");
        }
    }

    pub fn begin_shutdown(&mut self) {
        self.state = ServerState::ShuttingDown;
    }

    /// Unlinks every shared name.
    pub fn close(mut self) {
        self.begin_shutdown();
        self.paths.unlink_all();
        info!("bridge session closed");
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if self.state != ServerState::ShuttingDown {
            self.paths.unlink_all();
        }
    }
}

/// The driver's handles onto a session created by the server.
#[derive(Debug)]
pub struct DriverSession<S> {
    control: ControlSegment,
    samples: SampleSegment,
    handshake: DriverHandshake<S>,
    paths: SessionPaths,
    named_semaphores: bool,
}

#[cfg(unix)]
impl DriverSession<NamedSemaphore> {
    /// Opens the server's objects, in order control segment, sample segment,
    /// semaphores. Never creates anything.
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let paths = config.paths();

        let control = ControlSegment::open(&paths.control)?;
        let params = control.block().stream_params();
        params.validate()?;
        let samples = SampleSegment::open(&paths.samples, params)?;

        let semaphore = |name: &str| {
            NamedSemaphore::open(name).map_err(|source| BridgeError::SemaphoreUnavailable {
                name: name.to_string(),
                source,
            })
        };
        let ready = semaphore(&paths.ready)?;
        let consumed = semaphore(&paths.consumed)?;

        debug!(
            inputs = params.inputs,
            outputs = params.outputs,
            frames = params.buffer_frames,
            rate = params.sample_rate,
            "attached to bridge session"
        );

        Ok(Self {
            control,
            samples,
            handshake: DriverHandshake::new(ready, consumed),
            paths,
            named_semaphores: true,
        })
    }
}

impl<S: Semaphore> DriverSession<S> {
    pub fn params(&self) -> StreamParams {
        *self.samples.params()
    }

    pub fn control(&self) -> &ControlSegment {
        &self.control
    }

    pub fn samples(&self) -> &SampleSegment {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut SampleSegment {
        &mut self.samples
    }

    pub fn handshake(&self) -> &DriverHandshake<S> {
        &self.handshake
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Removes the shared names from the driver side.
    pub fn unlink(&self) {
        self.paths.unlink_segments();
        if self.named_semaphores {
            self.paths.unlink_semaphores();
        }
    }
}

/// Both ends of a session inside one process, joined by in-memory
/// semaphores. The segments are still real files under `config.shm_dir`.
pub fn loopback(
    config: &BridgeConfig,
    params: StreamParams,
) -> Result<(
    CollectorBridge<Arc<LocalSemaphore>>,
    DriverSession<Arc<LocalSemaphore>>,
)> {
    loopback_with(
        config,
        params,
        Arc::new(LocalSemaphore::new(0)),
        Arc::new(LocalSemaphore::new(0)),
    )
}

/// [`loopback`] over caller-supplied semaphore handles. Both sides receive a
/// clone of each handle.
pub fn loopback_with<S: Semaphore + Clone>(
    config: &BridgeConfig,
    params: StreamParams,
    ready: S,
    consumed: S,
) -> Result<(CollectorBridge<S>, DriverSession<S>)> {
    config.validate()?;
    params.validate()?;
    let paths = config.paths();

    let server_control = ControlSegment::create(&paths.control, &params)?;
    let server_samples = SampleSegment::create(&paths.samples, params)?;
    let control = ControlSegment::open(&paths.control)?;
    let samples = SampleSegment::open(&paths.samples, params)?;

    let collector = CollectorBridge::new(
        server_control,
        server_samples,
        ServerHandshake::new(ready.clone(), consumed.clone(), config.handshake_timeout()),
    );
    let driver = DriverSession {
        control,
        samples,
        handshake: DriverHandshake::new(ready, consumed),
        paths,
        named_semaphores: false,
    };
    Ok((collector, driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(dir: &Path, prefix: &str) -> BridgeConfig {
        BridgeConfig {
            name_prefix: prefix.to_string(),
            shm_dir: dir.to_path_buf(),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn names_follow_prefix() {
        let paths = SessionPaths::new(Path::new("/dev/shm"), "harmoniq-bridge");
        assert_eq!(paths.control, PathBuf::from("/dev/shm/harmoniq-bridge-info"));
        assert_eq!(paths.samples, PathBuf::from("/dev/shm/harmoniq-bridge-buffers"));
        assert_eq!(paths.ready, "/harmoniq-bridge-ready");
        assert_eq!(paths.consumed, "/harmoniq-bridge-consumed");
    }

    #[test]
    fn loopback_shares_control_block() {
        let dir = tempfile::tempdir().unwrap();
        let params = StreamParams::new(2, 2, 64, 44_100);
        let (collector, driver) = loopback(&config(dir.path(), "loop"), params).unwrap();
        assert_eq!(driver.params(), params);
        driver.control().block().set_running(true);
        assert!(collector.control().block().is_running());

        driver.unlink();
        assert!(!driver.paths().control.exists());
        assert!(!driver.paths().samples.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn server_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("harmoniq-session-test-{}", std::process::id());
        let config = config(dir.path(), &prefix);
        let params = StreamParams::new(8, 8, 256, 48_000);

        let (mut session, _collector) = ServerSession::create(&config, params).unwrap();
        assert_eq!(session.state(), ServerState::Starting);
        session.activate();
        assert_eq!(session.state(), ServerState::Serving);
        assert_eq!(
            std::fs::metadata(&session.paths().samples).unwrap().len(),
            16_384
        );

        let driver = DriverSession::open(&config).unwrap();
        assert_eq!(driver.params(), params);

        let paths = session.paths().clone();
        session.close();
        assert!(!paths.control.exists());
        assert!(NamedSemaphore::open(&paths.ready).is_err());
        // The driver's mapping outlives the names.
        assert!(!driver.control().block().is_running());
    }
}
