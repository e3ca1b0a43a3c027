//! Counting semaphores used by the handshake.
//!
//! [`NamedSemaphore`] wraps a POSIX named semaphore shared between processes.
//! [`LocalSemaphore`] is the in-process equivalent used for loopback sessions
//! and tests.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub trait Semaphore: Send + Sync {
    fn post(&self) -> io::Result<()>;

    /// Blocks until a token is available.
    fn wait(&self) -> io::Result<()>;

    /// Blocks for at most `timeout`. Returns `false` on timeout.
    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool>;

    /// Takes a token if one is available without blocking.
    fn try_wait(&self) -> io::Result<bool>;
}

impl<T: Semaphore + ?Sized> Semaphore for Arc<T> {
    fn post(&self) -> io::Result<()> {
        (**self).post()
    }

    fn wait(&self) -> io::Result<()> {
        (**self).wait()
    }

    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_timeout(timeout)
    }

    fn try_wait(&self) -> io::Result<bool> {
        (**self).try_wait()
    }
}

#[derive(Debug, Default)]
pub struct LocalSemaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl LocalSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Number of tokens currently available.
    pub fn available(&self) -> u32 {
        *self.count.lock()
    }
}

impl Semaphore for LocalSemaphore {
    fn post(&self) -> io::Result<()> {
        let mut count = self.count.lock();
        *count = count
            .checked_add(1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "semaphore overflow"))?;
        self.cond.notify_one();
        Ok(())
    }

    fn wait(&self) -> io::Result<()> {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
        Ok(())
    }

    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }

    fn try_wait(&self) -> io::Result<bool> {
        let mut count = self.count.lock();
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }
}

#[cfg(unix)]
pub use self::named::NamedSemaphore;

#[cfg(unix)]
mod named {
    use std::ffi::CString;
    use std::io;
    use std::time::Duration;

    use super::Semaphore;

    /// POSIX named semaphore (`sem_open`).
    #[derive(Debug)]
    pub struct NamedSemaphore {
        name: String,
        sem: *mut libc::sem_t,
    }

    // sem_t operations are thread safe by definition.
    unsafe impl Send for NamedSemaphore {}
    unsafe impl Sync for NamedSemaphore {}

    fn c_name(name: &str) -> io::Result<CString> {
        CString::new(name).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "semaphore name contains NUL")
        })
    }

    impl NamedSemaphore {
        /// Creates a fresh semaphore with a count of zero, replacing any stale
        /// object left under the same name.
        pub fn create(name: &str) -> io::Result<Self> {
            let c = c_name(name)?;
            unsafe {
                libc::sem_unlink(c.as_ptr());
            }
            let sem = unsafe {
                libc::sem_open(
                    c.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o666 as libc::c_uint,
                    0 as libc::c_uint,
                )
            };
            Self::from_raw(name, sem)
        }

        /// Opens an existing semaphore. Fails with `NotFound` if the server has
        /// not created it.
        pub fn open(name: &str) -> io::Result<Self> {
            let c = c_name(name)?;
            let sem = unsafe { libc::sem_open(c.as_ptr(), libc::O_RDWR) };
            Self::from_raw(name, sem)
        }

        fn from_raw(name: &str, sem: *mut libc::sem_t) -> io::Result<Self> {
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                name: name.to_string(),
                sem,
            })
        }

        /// Removes the name. Open handles keep working until closed.
        pub fn unlink(name: &str) -> io::Result<()> {
            let c = c_name(name)?;
            if unsafe { libc::sem_unlink(c.as_ptr()) } != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn name(&self) -> &str {
            &self.name
        }
    }

    impl Drop for NamedSemaphore {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem);
            }
        }
    }

    fn interrupted(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::EINTR)
    }

    impl Semaphore for NamedSemaphore {
        fn post(&self) -> io::Result<()> {
            if unsafe { libc::sem_post(self.sem) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn wait(&self) -> io::Result<()> {
            loop {
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                if !interrupted(&err) {
                    return Err(err);
                }
            }
        }

        #[cfg(target_os = "linux")]
        fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
            let mut now = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let total_nsec = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
            let deadline = libc::timespec {
                tv_sec: now.tv_sec
                    + timeout.as_secs() as libc::time_t
                    + (total_nsec / 1_000_000_000) as libc::time_t,
                tv_nsec: (total_nsec % 1_000_000_000) as _,
            };
            loop {
                if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(err),
                }
            }
        }

        // No sem_timedwait outside Linux; poll instead.
        #[cfg(not(target_os = "linux"))]
        fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
            let deadline = std::time::Instant::now() + timeout;
            loop {
                if self.try_wait()? {
                    return Ok(true);
                }
                if std::time::Instant::now() >= deadline {
                    return Ok(false);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        }

        fn try_wait(&self) -> io::Result<bool> {
            loop {
                if unsafe { libc::sem_trywait(self.sem) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn local_tokens_are_counted() {
        let sem = LocalSemaphore::new(0);
        assert!(!sem.try_wait().unwrap());
        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.available(), 2);
        assert!(sem.try_wait().unwrap());
        sem.wait().unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn local_wait_times_out() {
        let sem = LocalSemaphore::new(0);
        let started = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(20)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn local_post_wakes_waiter() {
        let sem = Arc::new(LocalSemaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(10));
        sem.post().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn named_semaphore_round_trip() {
        let name = format!("/harmoniq-bridge-test-{}", std::process::id());
        let created = NamedSemaphore::create(&name).unwrap();
        let opened = NamedSemaphore::open(&name).unwrap();
        assert!(!opened.try_wait().unwrap());
        created.post().unwrap();
        assert!(opened.wait_timeout(Duration::from_millis(100)).unwrap());
        assert!(!opened.wait_timeout(Duration::from_millis(5)).unwrap());
        NamedSemaphore::unlink(&name).unwrap();
        NamedSemaphore::unlink(&name).unwrap();
        assert!(NamedSemaphore::open(&name).is_err());
    }
}
