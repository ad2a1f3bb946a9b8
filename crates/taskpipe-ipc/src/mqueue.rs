use std::ffi::CString;
use std::time::Duration;

use crate::error::{IpcError, Result};
use crate::Ownership;

/// Named POSIX message queue with create-or-attach resolution.
///
/// The constructor first attempts exclusive creation under `name`; if the
/// name already exists it attaches instead and reads the owner's attributes
/// back from the queue (the caller's requested capacity and message size are
/// advisory in that case). Blocking and non-blocking operations coerce the
/// queue's mode before touching the transport; the mode lives on the OS
/// object, so the toggle is visible to, and racy against, other handles on
/// the same name. Single-handle-per-role use (one sender, one receiver) is
/// the intended pattern.
#[derive(Debug)]
pub struct MsgQueue {
    name: CString,
    mqd: libc::mqd_t,
    capacity: usize,
    max_msg_size: usize,
    blocking: bool,
    ownership: Ownership,
    send_priority: u32,
    received_priority: u32,
}

impl MsgQueue {
    /// Create the queue under `name`, or attach to it if it already exists.
    ///
    /// Names are normalized to the leading-slash form the OS requires.
    /// Requested attributes are handed to the OS unmodified; an invalid
    /// capacity or message size fails construction rather than being
    /// silently adjusted.
    pub fn open_or_create(name: &str, capacity: usize, max_msg_size: usize) -> Result<Self> {
        let name = normalized_name(name)?;

        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = capacity as libc::c_long;
        attr.mq_msgsize = max_msg_size as libc::c_long;

        let mqd = unsafe {
            libc::mq_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666 as libc::c_int,
                &attr as *const libc::mq_attr,
            )
        };

        let (mqd, ownership) = if mqd != -1 {
            (mqd, Ownership::Owner)
        } else {
            let create_err = std::io::Error::last_os_error();
            if create_err.raw_os_error() != Some(libc::EEXIST) {
                return Err(IpcError::os(
                    "mq_open",
                    create_err.to_string(),
                    create_err.raw_os_error().unwrap_or(0),
                ));
            }
            let mqd = unsafe { libc::mq_open(name.as_ptr(), libc::O_RDWR) };
            if mqd == -1 {
                return Err(IpcError::last_os("mq_open"));
            }
            (mqd, Ownership::Attached)
        };

        let mut queue = MsgQueue {
            name,
            mqd,
            capacity,
            max_msg_size,
            blocking: true,
            ownership,
            send_priority: current_thread_priority(),
            received_priority: 0,
        };

        // An attached handle takes whatever the owner configured.
        if ownership == Ownership::Attached {
            let attr = match queue.read_attr() {
                Ok(attr) => attr,
                Err(err) => {
                    queue.close();
                    return Err(err);
                }
            };
            queue.capacity = attr.mq_maxmsg as usize;
            queue.max_msg_size = attr.mq_msgsize as usize;
            queue.blocking = attr.mq_flags & libc::O_NONBLOCK as libc::c_long == 0;
        }

        Ok(queue)
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Priority attached to outgoing messages, inherited from the creating
    /// thread's scheduling priority.
    pub fn send_priority(&self) -> u32 {
        self.send_priority
    }

    /// Priority of the most recently received message.
    pub fn received_priority(&self) -> u32 {
        self.received_priority
    }

    /// Messages currently queued.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_attr()?.mq_curmsgs as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Switch the queue between blocking and non-blocking transfer. The flag
    /// lives on the OS object and affects every handle on this name.
    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        if self.blocking == blocking {
            return Ok(());
        }
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_flags = if blocking {
            0
        } else {
            libc::O_NONBLOCK as libc::c_long
        };
        let rc = unsafe { libc::mq_setattr(self.mqd, &attr, std::ptr::null_mut()) };
        if rc == -1 {
            return Err(IpcError::last_os("mq_setattr"));
        }
        self.blocking = blocking;
        Ok(())
    }

    /// Blocking send. Coerces the queue to blocking mode first, then blocks
    /// until a slot frees up.
    pub fn send(&mut self, msg: &[u8]) -> Result<()> {
        self.check_send_len(msg.len())?;
        self.set_blocking(true)?;
        let rc = unsafe {
            libc::mq_send(
                self.mqd,
                msg.as_ptr() as *const libc::c_char,
                msg.len(),
                self.send_priority,
            )
        };
        if rc == -1 {
            return Err(IpcError::last_os("mq_send"));
        }
        Ok(())
    }

    /// Non-blocking send. Coerces the queue to non-blocking mode first;
    /// a full queue reports `WouldBlock`.
    pub fn try_send(&mut self, msg: &[u8]) -> Result<()> {
        self.check_send_len(msg.len())?;
        self.set_blocking(false)?;
        let rc = unsafe {
            libc::mq_send(
                self.mqd,
                msg.as_ptr() as *const libc::c_char,
                msg.len(),
                self.send_priority,
            )
        };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Err(IpcError::WouldBlock { op: "mq_send" });
            }
            return Err(os_err("mq_send", err));
        }
        Ok(())
    }

    /// Send with an upper bound on how long to wait for a free slot.
    /// Returns `Timeout` only after the queue stayed full for the whole
    /// duration.
    pub fn send_timeout(&mut self, msg: &[u8], timeout: Duration) -> Result<()> {
        self.check_send_len(msg.len())?;
        self.set_blocking(true)?;
        let deadline = realtime_deadline(timeout)?;
        let rc = unsafe {
            libc::mq_timedsend(
                self.mqd,
                msg.as_ptr() as *const libc::c_char,
                msg.len(),
                self.send_priority,
                &deadline,
            )
        };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                return Err(IpcError::Timeout { op: "mq_timedsend" });
            }
            return Err(os_err("mq_timedsend", err));
        }
        Ok(())
    }

    /// Blocking receive into `buf`. Fails fast with `BufferTooSmall`, without
    /// consuming anything, if `buf` is shorter than the queue's message size.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_recv_len(buf.len())?;
        self.set_blocking(true)?;
        self.recv_raw(buf, "mq_receive", None)
    }

    /// Non-blocking receive; an empty queue reports `WouldBlock`.
    pub fn try_recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_recv_len(buf.len())?;
        self.set_blocking(false)?;
        self.recv_raw(buf, "mq_receive", None)
    }

    /// Receive with an upper bound on how long to wait for a message.
    pub fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.check_recv_len(buf.len())?;
        self.set_blocking(true)?;
        let deadline = realtime_deadline(timeout)?;
        self.recv_raw(buf, "mq_timedreceive", Some(deadline))
    }

    fn recv_raw(
        &mut self,
        buf: &mut [u8],
        op: &'static str,
        deadline: Option<libc::timespec>,
    ) -> Result<usize> {
        let mut prio: libc::c_uint = 0;
        let n = match deadline {
            Some(deadline) => unsafe {
                libc::mq_timedreceive(
                    self.mqd,
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                    &mut prio,
                    &deadline,
                )
            },
            None => unsafe {
                libc::mq_receive(
                    self.mqd,
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                    &mut prio,
                )
            },
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => IpcError::Timeout { op },
                Some(libc::EAGAIN) => IpcError::WouldBlock { op },
                _ => os_err(op, err),
            });
        }
        self.received_priority = prio;
        Ok(n as usize)
    }

    fn check_send_len(&self, len: usize) -> Result<()> {
        if len > self.max_msg_size {
            return Err(IpcError::MessageTooLarge {
                len,
                max: self.max_msg_size,
            });
        }
        Ok(())
    }

    fn check_recv_len(&self, len: usize) -> Result<()> {
        if len < self.max_msg_size {
            return Err(IpcError::BufferTooSmall {
                required: self.max_msg_size,
                provided: len,
            });
        }
        Ok(())
    }

    fn read_attr(&self) -> Result<libc::mq_attr> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::mq_getattr(self.mqd, &mut attr) };
        if rc == -1 {
            return Err(IpcError::last_os("mq_getattr"));
        }
        Ok(attr)
    }

    /// Detach this handle from the queue without removing the name.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.mqd != -1 {
            unsafe { libc::mq_close(self.mqd) };
            self.mqd = -1;
        }
    }

    /// Close and remove the queue from the OS namespace. Owner-only; an
    /// already-removed name is not an error.
    pub fn unlink(&mut self) -> Result<()> {
        if self.ownership != Ownership::Owner {
            return Err(IpcError::PermissionDenied { op: "mq_unlink" });
        }
        self.close();
        let rc = unsafe { libc::mq_unlink(self.name.as_ptr()) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(os_err("mq_unlink", err));
            }
        }
        self.ownership = Ownership::Attached;
        Ok(())
    }
}

impl Drop for MsgQueue {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owner {
            let _ = self.unlink();
        } else {
            self.close();
        }
    }
}

fn os_err(op: &'static str, err: std::io::Error) -> IpcError {
    IpcError::os(op, err.to_string(), err.raw_os_error().unwrap_or(0))
}

fn normalized_name(name: &str) -> Result<CString> {
    let slashed = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(slashed).map_err(|_| IpcError::os("mq_open", "name contains NUL", libc::EINVAL))
}

/// Scheduling priority of the calling thread, used as the default message
/// priority for sends. SCHED_OTHER threads report 0.
fn current_thread_priority() -> u32 {
    let mut policy: libc::c_int = 0;
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) };
    if rc != 0 {
        return 0;
    }
    param.sched_priority.max(0) as u32
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as mq_timedsend
/// expects.
fn realtime_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    if rc == -1 {
        return Err(IpcError::last_os("clock_gettime"));
    }
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}
