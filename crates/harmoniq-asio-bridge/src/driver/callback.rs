use crate::channels::HostBuffers;
use crate::time::AsioTime;

/// Selectors the driver may pass to [`HostCallbacks::message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSelector {
    SelectorSupported,
    EngineVersion,
    ResetRequest,
    BufferSizeChange,
    ResyncRequest,
    LatenciesChanged,
    SupportsTimeInfo,
    SupportsTimeCode,
}

/// Callbacks registered by the host in `create_buffers`.
///
/// Every method runs on the driver's callback thread while the driver's
/// internal lock is held. Calling back into `stop` or `dispose_buffers` from
/// here deadlocks; `sample_position` is safe.
pub trait HostCallbacks: Send {
    /// Process one period. `buffers.index()` is the half the host owns.
    fn buffer_switch(&mut self, buffers: &mut HostBuffers<'_>, direct_process: bool);

    /// Time-info variant, used when the host answered `SupportsTimeInfo`.
    fn buffer_switch_time_info(
        &mut self,
        time: &AsioTime,
        buffers: &mut HostBuffers<'_>,
        direct_process: bool,
    ) {
        let _ = time;
        self.buffer_switch(buffers, direct_process);
    }

    /// Capability and notification channel. Returns 0 for "not supported".
    fn message(&mut self, _selector: MessageSelector, _value: i64) -> i64 {
        0
    }
}
