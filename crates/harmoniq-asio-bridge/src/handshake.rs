//! Two-semaphore rendezvous between the collector and the driver.
//!
//! One cycle: the collector posts `ready` and waits on `consumed`; the driver
//! waits on `ready`, owns the sample segment, then posts `consumed`. Each
//! semaphore holds at most one token at any time.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::sem::Semaphore;

/// How often a blocked collector rechecks that the driver is still attached.
const ATTACH_CHECK: Duration = Duration::from_millis(1);

/// How one [`ServerHandshake::exchange`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// The driver took the cycle and handed the segment back.
    Completed,
    /// The driver detached before taking the cycle; the token was reclaimed.
    Detached,
}

/// Collector half of the handshake.
#[derive(Debug)]
pub struct ServerHandshake<S> {
    ready: S,
    consumed: S,
    timeout: Option<Duration>,
    /// The driver took a `ready` token after we gave up waiting; its
    /// `consumed` reply has not been absorbed yet.
    pending_consumed: bool,
}

impl<S: Semaphore> ServerHandshake<S> {
    pub fn new(ready: S, consumed: S, timeout: Option<Duration>) -> Self {
        Self {
            ready,
            consumed,
            timeout,
            pending_consumed: false,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True while a late `consumed` token from an abandoned cycle is outstanding.
    pub fn is_resyncing(&self) -> bool {
        self.pending_consumed
    }

    /// Takes the segment back from an abandoned cycle, if one is outstanding.
    ///
    /// Until this returns `Ok` the driver may still own the whole sample
    /// segment, so the caller must not write the input section.
    pub fn resync(&mut self) -> Result<()> {
        if !self.pending_consumed {
            return Ok(());
        }
        if !self.consumed.try_wait().map_err(BridgeError::Semaphore)? {
            return Err(BridgeError::PeerUnresponsive(
                self.timeout.unwrap_or_default(),
            ));
        }
        debug!("late handshake reply absorbed; resynchronised");
        self.pending_consumed = false;
        Ok(())
    }

    /// Hands the sample segment to the driver and waits for it to come back.
    ///
    /// The caller must have called [`resync`](Self::resync) and then finished
    /// writing the input section. On [`Exchange::Completed`] the output
    /// section holds the driver's reply. `attached` is polled while waiting;
    /// once it reports false and the `ready` token is still unclaimed, the
    /// token is taken back and the cycle ends as [`Exchange::Detached`].
    pub fn exchange(&mut self, attached: impl Fn() -> bool) -> Result<Exchange> {
        self.resync()?;
        self.ready.post().map_err(BridgeError::Semaphore)?;

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    left.min(ATTACH_CHECK)
                }
                None => ATTACH_CHECK,
            };
            if self
                .consumed
                .wait_timeout(slice)
                .map_err(BridgeError::Semaphore)?
            {
                return Ok(Exchange::Completed);
            }
            if !attached() && self.ready.try_wait().map_err(BridgeError::Semaphore)? {
                debug!("driver detached before taking the cycle");
                return Ok(Exchange::Detached);
            }
        }

        let timeout = self.timeout.unwrap_or_default();

        // Take our token back if the driver never picked it up; otherwise its
        // reply is still coming and must be absorbed before the next post.
        if !self.ready.try_wait().map_err(BridgeError::Semaphore)? {
            self.pending_consumed = true;
        }
        warn!(?timeout, "driver did not answer the handshake");
        Err(BridgeError::PeerUnresponsive(timeout))
    }
}

/// Driver half of the handshake.
#[derive(Debug)]
pub struct DriverHandshake<S> {
    ready: S,
    consumed: S,
}

impl<S: Semaphore> DriverHandshake<S> {
    pub fn new(ready: S, consumed: S) -> Self {
        Self { ready, consumed }
    }

    /// Waits up to `poll` for the collector. Returns `true` when a cycle has
    /// been handed over and the caller now owns the sample segment.
    pub fn wait_ready(&self, poll: Duration) -> Result<bool> {
        self.ready
            .wait_timeout(poll)
            .map_err(BridgeError::Semaphore)
    }

    /// Returns the sample segment to the collector.
    pub fn post_consumed(&self) -> Result<()> {
        self.consumed.post().map_err(BridgeError::Semaphore)
    }
}
