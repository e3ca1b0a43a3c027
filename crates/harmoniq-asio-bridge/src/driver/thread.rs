use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, trace};

use super::{DriverEngine, DriverShared, DriverState};
use crate::layout::Direction;
use crate::rt;
use crate::sem::Semaphore;
use crate::session::DriverSession;
use crate::shm::SampleSegment;

/// Body of the `harmoniq-asio-callback` thread.
///
/// This thread is the only place the shared names are unlinked on the
/// driver side.
pub(super) fn run<S: Semaphore>(
    mut session: DriverSession<S>,
    shared: Arc<DriverShared>,
    poll: Duration,
) {
    rt::prepare_callback_thread(session.control().block().priority());

    loop {
        session.control().block().set_running(true);
        let woke = match session.handshake().wait_ready(poll) {
            Ok(woke) => woke,
            Err(err) => {
                error!(?err, "waiting for the collector failed; stopping callback thread");
                shared.terminate.store(true, Ordering::Release);
                false
            }
        };

        if shared.terminate.load(Ordering::Acquire) {
            session.control().block().set_running(false);
            session.unlink();
            if woke {
                if let Err(err) = session.handshake().post_consumed() {
                    error!(?err, "failed to release the final cycle");
                }
            }
            info!("callback thread exiting");
            return;
        }

        if !woke {
            continue;
        }

        let (frame, rolling) = {
            let block = session.control().block();
            (block.frame(), block.transport_rolling())
        };
        let now = shared.clock.now_ns();
        shared.system_time_ns.store(now, Ordering::Release);
        shared.sample_position.store(frame, Ordering::Release);

        shared
            .engine
            .lock()
            .run_cycle(session.samples_mut(), frame, now, rolling);

        if let Err(err) = session.handshake().post_consumed() {
            error!(?err, "failed to hand the cycle back to the collector");
        }
    }
}

impl DriverEngine {
    /// Everything between the driver receiving `ready` and posting
    /// `consumed`. The output section is always rewritten.
    pub(crate) fn run_cycle(
        &mut self,
        samples: &mut SampleSegment,
        position: u64,
        now_ns: u64,
        rolling: bool,
    ) {
        self.time.update(position, now_ns, rolling, self.time_code_read);
        samples.zero_section(Direction::Output);
        if self.state != DriverState::Started {
            return;
        }

        self.store.load_inputs(samples, self.overflow);
        if let Some(callbacks) = self.callbacks.as_mut() {
            let mut buffers = self.store.host_buffers();
            if self.time_info_mode {
                callbacks.buffer_switch_time_info(&self.time, &mut buffers, true);
                self.time.clear_one_shot();
            } else {
                callbacks.buffer_switch(&mut buffers, true);
            }
        }
        self.store.store_outputs(samples);
        self.store.flip();
        trace!(position, toggle = self.store.toggle(), "driver cycle");
    }
}
