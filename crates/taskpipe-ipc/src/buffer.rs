use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{IpcError, Result};
use crate::shmem::ShmRegion;
use crate::task::CancelToken;
use crate::Ownership;

/// How long a blocked push/pop sleeps between cancel-token checks. Blocking
/// buffer waits are cancellation points; the tick bounds how late a raised
/// token is noticed.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// The mutex/condition-variable pair guarding one bounded buffer.
///
/// Constructed once and passed by `Arc` to every task that touches the
/// buffer; pushers and poppers wait on the same condition variable, so a
/// single `notify_one` can wake the wrong kind of waiter; the predicate
/// re-check loops in push/pop absorb that.
#[derive(Debug, Default)]
pub struct BufferSync {
    mutex: Mutex<()>,
    cv: Condvar,
}

impl BufferSync {
    pub fn new() -> Arc<Self> {
        Arc::new(BufferSync::default())
    }
}

/// Fixed-capacity LIFO buffer living inside a named shared-memory region.
///
/// In-region layout: an occupancy counter in the header, then `capacity`
/// slots of `T`. The counter is read and written only while the injected
/// mutex is held. Last pushed is first popped: the handoff is a stack, and
/// tests pin that discipline.
pub struct BoundedStack<T: Copy + Send + 'static> {
    region: ShmRegion,
    capacity: usize,
    sync: Arc<BufferSync>,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send + 'static> BoundedStack<T> {
    /// Bytes of backing region a stack of `capacity` items needs.
    pub fn region_size(capacity: usize) -> usize {
        header_size::<T>() + capacity * std::mem::size_of::<T>()
    }

    /// Create or attach the backing region under `name`. The creator zeroes
    /// the occupancy counter; attachers trust it.
    pub fn open_or_create(name: &str, capacity: usize, sync: Arc<BufferSync>) -> Result<Self> {
        let region = ShmRegion::open_or_create(name, Self::region_size(capacity))?;
        let stack = BoundedStack {
            region,
            capacity,
            sync,
            _marker: PhantomData,
        };
        if stack.region.ownership() == Ownership::Owner {
            let _guard = stack.lock();
            unsafe { std::ptr::write_volatile(stack.count_ptr(), 0) };
        }
        Ok(stack)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    /// Current occupancy, read under the guarding mutex.
    pub fn len(&self) -> usize {
        let _guard = self.lock();
        unsafe { std::ptr::read_volatile(self.count_ptr()) as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until a slot is free, then push. A raised `cancel` token turns
    /// the wait into `Cancelled`.
    pub fn push(&self, item: T, cancel: &CancelToken) -> Result<()> {
        let mut guard = self.lock();
        loop {
            let count = unsafe { std::ptr::read_volatile(self.count_ptr()) } as usize;
            if count < self.capacity {
                unsafe {
                    std::ptr::write_volatile(self.slot_ptr(count), item);
                    std::ptr::write_volatile(self.count_ptr(), (count + 1) as u64);
                }
                self.sync.cv.notify_one();
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(IpcError::Cancelled { op: "push" });
            }
            guard = self.wait_tick(guard);
        }
    }

    /// Block until an item is available, then pop the most recently pushed
    /// one.
    pub fn pop(&self, cancel: &CancelToken) -> Result<T> {
        let mut guard = self.lock();
        loop {
            let count = unsafe { std::ptr::read_volatile(self.count_ptr()) } as usize;
            if count > 0 {
                let item = unsafe {
                    std::ptr::write_volatile(self.count_ptr(), (count - 1) as u64);
                    std::ptr::read_volatile(self.slot_ptr(count - 1))
                };
                self.sync.cv.notify_one();
                return Ok(item);
            }
            if cancel.is_cancelled() {
                return Err(IpcError::Cancelled { op: "pop" });
            }
            guard = self.wait_tick(guard);
        }
    }

    /// Push without blocking; a full buffer reports `WouldBlock`.
    pub fn try_push(&self, item: T) -> Result<()> {
        let _guard = self.lock();
        let count = unsafe { std::ptr::read_volatile(self.count_ptr()) } as usize;
        if count == self.capacity {
            return Err(IpcError::WouldBlock { op: "push" });
        }
        unsafe {
            std::ptr::write_volatile(self.slot_ptr(count), item);
            std::ptr::write_volatile(self.count_ptr(), (count + 1) as u64);
        }
        self.sync.cv.notify_one();
        Ok(())
    }

    /// Pop without blocking; an empty buffer reports `WouldBlock`.
    pub fn try_pop(&self) -> Result<T> {
        let _guard = self.lock();
        let count = unsafe { std::ptr::read_volatile(self.count_ptr()) } as usize;
        if count == 0 {
            return Err(IpcError::WouldBlock { op: "pop" });
        }
        let item = unsafe {
            std::ptr::write_volatile(self.count_ptr(), (count - 1) as u64);
            std::ptr::read_volatile(self.slot_ptr(count - 1))
        };
        self.sync.cv.notify_one();
        Ok(item)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.sync
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_tick<'a>(&'a self, guard: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        let (guard, _timed_out) = self
            .sync
            .cv
            .wait_timeout(guard, CANCEL_POLL)
            .unwrap_or_else(PoisonError::into_inner);
        guard
    }

    fn count_ptr(&self) -> *mut u64 {
        self.region.as_ptr() as *mut u64
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        unsafe { self.region.as_ptr().add(header_size::<T>()).cast::<T>().add(index) }
    }
}

/// Slots start after the counter, at an offset aligned for `T`.
fn header_size<T>() -> usize {
    std::mem::align_of::<T>().max(std::mem::size_of::<u64>())
}
