//! Realtime scheduling helpers for the collector and callback threads.

use std::io;

/// Scheduling priority of the calling thread, or 0 when it is not realtime.
#[cfg(unix)]
pub fn current_thread_priority() -> u32 {
    let mut policy = 0;
    let mut param = libc::sched_param { sched_priority: 0 };
    let result =
        unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) };
    if result != 0 || (policy != libc::SCHED_FIFO && policy != libc::SCHED_RR) {
        return 0;
    }
    u32::try_from(param.sched_priority).unwrap_or(0)
}

#[cfg(not(unix))]
pub fn current_thread_priority() -> u32 {
    0
}

/// Priority the driver's callback thread should run at: one step below the
/// server thread feeding it.
pub fn driver_priority(server_priority: u32) -> Option<i32> {
    let priority = i32::try_from(server_priority).ok()?.checked_sub(1)?;
    (priority > 0).then_some(priority)
}

/// Moves the calling thread to `SCHED_FIFO` at `priority`.
#[cfg(unix)]
pub fn promote_current_thread(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let result =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if result != 0 {
        return Err(io::Error::from_raw_os_error(result));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn promote_current_thread(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "realtime scheduling is not available on this platform",
    ))
}

/// Locks current and future pages. Missing privileges are not an error.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> io::Result<()> {
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EPERM) && err.raw_os_error() != Some(libc::ENOMEM) {
            return Err(err);
        }
        tracing::debug!(?err, "mlockall not permitted; continuing unlocked");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> io::Result<()> {
    Ok(())
}

/// Sets FTZ and DAZ for the calling thread.
pub fn enable_denormal_kill_once() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        let mut csr = _mm_getcsr();
        csr |= 1 << 6; // DAZ
        csr |= 1 << 15; // FTZ
        _mm_setcsr(csr);
    }
    #[cfg(target_arch = "x86")]
    unsafe {
        use std::arch::x86::{_mm_getcsr, _mm_setcsr};
        let mut csr = _mm_getcsr();
        csr |= 1 << 6; // DAZ
        csr |= 1 << 15; // FTZ
        _mm_setcsr(csr);
    }
}

/// Applies the realtime setup for a callback thread whose feeding server
/// thread runs at `server_priority`. Failures are logged and ignored.
pub fn prepare_callback_thread(server_priority: u32) {
    enable_denormal_kill_once();
    match driver_priority(server_priority) {
        Some(priority) => {
            if let Err(err) = promote_current_thread(priority) {
                tracing::warn!(?err, priority, "failed to elevate callback thread");
            } else {
                tracing::debug!(priority, "callback thread running SCHED_FIFO");
            }
        }
        None => tracing::debug!(server_priority, "server is not realtime; keeping default policy"),
    }
}
