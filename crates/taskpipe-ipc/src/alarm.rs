use std::time::Duration;

use crate::error::{IpcError, Result};

/// Periodic fire-and-wait timer backed by a timerfd.
///
/// `start` arms the first shot and the repeat interval; `wait` blocks until
/// the next fire and reports how many intervals elapsed since the last
/// wait (more than one when the waiter fell behind). No internal state
/// machine beyond armed/disarmed.
#[derive(Debug)]
pub struct Alarm {
    fd: libc::c_int,
}

impl Alarm {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, 0) };
        if fd == -1 {
            return Err(IpcError::last_os("timerfd_create"));
        }
        Ok(Alarm { fd })
    }

    /// Arm the timer: first fire after `initial`, then every `interval`.
    /// A zero `initial` means "start on the first interval".
    pub fn start(&self, initial: Duration, interval: Duration) -> Result<()> {
        if initial.is_zero() && interval.is_zero() {
            return Err(IpcError::os(
                "timerfd_settime",
                "zero initial delay and zero interval",
                libc::EINVAL,
            ));
        }
        let first = if initial.is_zero() { interval } else { initial };
        let spec = libc::itimerspec {
            it_value: to_timespec(first),
            it_interval: to_timespec(interval),
        };
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if rc == -1 {
            return Err(IpcError::last_os("timerfd_settime"));
        }
        Ok(())
    }

    /// Block until the next fire. Returns the number of expirations since
    /// the previous wait.
    pub fn wait(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n == 8 {
                return Ok(u64::from_ne_bytes(buf));
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::os(
                "timerfd read",
                err.to_string(),
                err.raw_os_error().unwrap_or(0),
            ));
        }
    }

    /// Disarm the timer. A later `start` re-arms it.
    pub fn stop(&self) -> Result<()> {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if rc == -1 {
            return Err(IpcError::last_os("timerfd_settime"));
        }
        Ok(())
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}
