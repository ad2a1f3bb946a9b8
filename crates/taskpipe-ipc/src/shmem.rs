use std::ffi::CString;

use crate::error::{IpcError, Result};
use crate::Ownership;

/// Named shared-memory mapping with create-or-attach resolution.
///
/// The first handle to win exclusive creation truncates the backing object
/// to `size`, maps it, and owns final removal from the namespace. Later
/// handles attach and map with their caller's `size`; the true size is an
/// out-of-band contract between the cooperating processes, not something
/// this layer can verify. Construction is the only path to a valid
/// instance: on any failure after a successful create, the half-built
/// object is torn down before the error is reported.
#[derive(Debug)]
pub struct ShmRegion {
    name: CString,
    size: usize,
    addr: *mut libc::c_void,
    ownership: Ownership,
}

// The region holds raw bytes only; all access to the mapping goes through
// raw pointers that callers synchronize themselves.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a region of `size` bytes under `name`, or attach to an
    /// existing one.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        let name = normalized_name(name)?;
        if size == 0 {
            return Err(IpcError::os("shm_open", "zero-size region", libc::EINVAL));
        }

        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666 as libc::mode_t,
            )
        };

        if fd != -1 {
            return Self::finish_create(name, size, fd);
        }

        let create_err = std::io::Error::last_os_error();
        if create_err.raw_os_error() != Some(libc::EEXIST) {
            return Err(IpcError::os(
                "shm_open",
                create_err.to_string(),
                create_err.raw_os_error().unwrap_or(0),
            ));
        }

        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o666 as libc::mode_t) };
        if fd == -1 {
            return Err(IpcError::last_os("shm_open"));
        }
        let addr = map_and_close(fd, size)?;
        Ok(ShmRegion {
            name,
            size,
            addr,
            ownership: Ownership::Attached,
        })
    }

    /// Owner path: the object exists but is empty; size it, map it, drop the
    /// fd. Any failure removes the name again so no dangling object leaks.
    fn finish_create(name: CString, size: usize, fd: libc::c_int) -> Result<Self> {
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc == -1 {
            let err = IpcError::last_os("ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(name.as_ptr());
            }
            return Err(err);
        }

        match map_and_close(fd, size) {
            Ok(addr) => Ok(ShmRegion {
                name,
                size,
                addr,
                ownership: Ownership::Owner,
            }),
            Err(err) => {
                unsafe { libc::shm_unlink(name.as_ptr()) };
                Err(err)
            }
        }
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Base address of the live mapping. Valid until `unmap` or drop; the
    /// caller synchronizes all reads and writes through it.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Unmap the region from this process. Safe to call more than once; the
    /// named object stays in the namespace.
    pub fn unmap(&mut self) {
        if !self.addr.is_null() {
            unsafe { libc::munmap(self.addr, self.size) };
            self.addr = std::ptr::null_mut();
        }
    }

    /// Unmap and remove the name from the OS namespace. Owner-only; an
    /// already-removed name is not an error. The unmap step is not retried
    /// if only the unlink fails.
    pub fn unlink(&mut self) -> Result<()> {
        if self.ownership != Ownership::Owner {
            return Err(IpcError::PermissionDenied { op: "shm_unlink" });
        }
        self.unmap();
        let rc = unsafe { libc::shm_unlink(self.name.as_ptr()) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(IpcError::os(
                    "shm_unlink",
                    err.to_string(),
                    err.raw_os_error().unwrap_or(0),
                ));
            }
        }
        self.ownership = Ownership::Attached;
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owner {
            let _ = self.unlink();
        } else {
            self.unmap();
        }
    }
}

/// mmap the object and close the fd; the mapping outlives the descriptor.
fn map_and_close(fd: libc::c_int, size: usize) -> Result<*mut libc::c_void> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        let err = IpcError::last_os("mmap");
        unsafe { libc::close(fd) };
        return Err(err);
    }
    unsafe { libc::close(fd) };
    Ok(addr)
}

fn normalized_name(name: &str) -> Result<CString> {
    let slashed = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(slashed).map_err(|_| IpcError::os("shm_open", "name contains NUL", libc::EINVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn unique_name(prefix: &str) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("/{prefix}_{}_{n}", std::process::id())
    }

    #[test]
    fn first_call_owns_second_attaches() {
        let name = unique_name("tp_shm_own");
        let owner = ShmRegion::open_or_create(&name, 64).expect("create");
        assert_eq!(owner.ownership(), Ownership::Owner);
        assert_eq!(owner.len(), 64);

        let attached = ShmRegion::open_or_create(&name, 64).expect("attach");
        assert_eq!(attached.ownership(), Ownership::Attached);
    }

    #[test]
    fn writes_through_one_mapping_are_visible_through_the_other() {
        let name = unique_name("tp_shm_vis");
        let owner = ShmRegion::open_or_create(&name, 16).expect("create");
        let attached = ShmRegion::open_or_create(&name, 16).expect("attach");

        unsafe {
            std::ptr::write_volatile(owner.as_ptr().cast::<u32>(), 0xC0FFEE);
        }
        let seen = unsafe { std::ptr::read_volatile(attached.as_ptr().cast::<u32>()) };
        assert_eq!(seen, 0xC0FFEE);
    }

    #[test]
    fn attached_handle_may_not_unlink() {
        let name = unique_name("tp_shm_perm");
        let _owner = ShmRegion::open_or_create(&name, 32).expect("create");
        let mut attached = ShmRegion::open_or_create(&name, 32).expect("attach");
        let err = attached.unlink().expect_err("attached unlink");
        assert_eq!(err, IpcError::PermissionDenied { op: "shm_unlink" });
    }

    #[test]
    fn unmap_is_idempotent() {
        let name = unique_name("tp_shm_unmap");
        let mut region = ShmRegion::open_or_create(&name, 32).expect("create");
        region.unmap();
        region.unmap();
        region.unlink().expect("unlink after unmap");
    }

    #[test]
    fn owner_drop_removes_the_name() {
        let name = unique_name("tp_shm_drop");
        {
            let _region = ShmRegion::open_or_create(&name, 32).expect("create");
        }
        let again = ShmRegion::open_or_create(&name, 32).expect("recreate");
        assert_eq!(again.ownership(), Ownership::Owner);
    }

    #[test]
    fn zero_size_fails_construction() {
        let name = unique_name("tp_shm_zero");
        let err = ShmRegion::open_or_create(&name, 0).expect_err("zero size");
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
