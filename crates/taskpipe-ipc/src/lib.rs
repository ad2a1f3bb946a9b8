//! Coordination primitives for a small real-time pipeline: named POSIX
//! message queues, named shared-memory regions, a mutex/condvar bounded
//! buffer layered over shared memory, supervised worker threads with a
//! deterministic start/stop handshake, and a periodic alarm.
//!
//! Named resources live in the OS namespace and may be created by one
//! process and attached by another; every wrapper resolves the
//! create-or-attach race internally and tracks which handle owns final
//! destruction.

mod alarm;
mod buffer;
mod error;
mod mqueue;
mod shmem;
mod task;

pub use alarm::Alarm;
pub use buffer::{BoundedStack, BufferSync};
pub use error::{IpcError, Result};
pub use mqueue::MsgQueue;
pub use shmem::ShmRegion;
pub use task::{CancelToken, ManagedTask, SchedPolicy, TaskBody, TaskConfig, TaskState};

/// Which handle is responsible for removing a named OS resource.
///
/// The first create-or-attach call under a name wins exclusive creation and
/// becomes the `Owner`; every later call attaches. Only the owner may unlink
/// the name, and the owner's `Drop` does so automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owner,
    Attached,
}
