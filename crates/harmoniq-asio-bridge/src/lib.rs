//! Shared-memory audio bridge between an audio-server client process and an
//! ASIO-style driver loaded by a host application.
//!
//! The server process owns a [`session::ServerSession`] and calls
//! [`collector::CollectorBridge::process`] from its realtime callback. The
//! host process creates an [`driver::AsioDriver`], which attaches to the
//! session and runs the host's callbacks on its own realtime thread. One
//! period of audio crosses the boundary per cycle.

pub mod channels;
pub mod collector;
pub mod config;
pub mod convert;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod layout;
pub mod rt;
pub mod sem;
pub mod session;
pub mod shm;
pub mod time;

pub use channels::HostBuffers;
pub use collector::{CollectorBridge, CycleIo, CycleOutcome, PlanarCycle, Transport};
pub use config::BridgeConfig;
pub use convert::OverflowPolicy;
pub use driver::{
    AsioDriver, BufferRequest, DriverOptions, DriverState, FutureSelector, HostCallbacks,
    MessageSelector,
};
pub use error::{BridgeError, ErrorKind, Result};
pub use layout::{Direction, StreamParams};
pub use session::{DriverSession, ServerSession, ServerState, SessionPaths};
