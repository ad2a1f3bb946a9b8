/// Uniform failure value for every primitive in this crate.
///
/// OS-call failures carry the operation name, a context string and the raw
/// errno; conditions a caller is expected to branch on (timeout, would-block,
/// short buffer, ownership and lifecycle misuse) get their own variants so
/// they are never mistaken for generic transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    Os {
        op: &'static str,
        context: String,
        code: i32,
    },
    /// Ownership violation: destroy requested on a handle that only attached.
    PermissionDenied { op: &'static str },
    /// A timed operation ran out its whole timeout.
    Timeout { op: &'static str },
    /// A non-blocking operation found the queue full (send) or empty (receive).
    WouldBlock { op: &'static str },
    /// Receive buffer shorter than the queue's message size. The queued item
    /// is not consumed; retry with `required` bytes or more.
    BufferTooSmall { required: usize, provided: usize },
    /// Send payload longer than the queue's configured message size.
    MessageTooLarge { len: usize, max: usize },
    AlreadyRunning,
    NotRunning,
    UnsupportedMode,
    /// A blocking wait was abandoned because the task's cancel token rose.
    Cancelled { op: &'static str },
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    pub fn os(op: &'static str, context: impl Into<String>, code: i32) -> Self {
        IpcError::Os {
            op,
            context: context.into(),
            code,
        }
    }

    /// Capture the calling thread's current errno, deriving the context
    /// string from the OS error text.
    pub fn last_os(op: &'static str) -> Self {
        let err = std::io::Error::last_os_error();
        IpcError::Os {
            op,
            context: err.to_string(),
            code: err.raw_os_error().unwrap_or(0),
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IpcError::Os { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for conditions a caller should retry or back off from rather
    /// than treat as failure of the primitive itself.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IpcError::Timeout { .. }
                | IpcError::WouldBlock { .. }
                | IpcError::BufferTooSmall { .. }
                | IpcError::Cancelled { .. }
        )
    }
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::Os { op, context, code } => {
                write!(f, "{op} failed: {context} (errno {code})")
            }
            IpcError::PermissionDenied { op } => {
                write!(f, "{op}: not the owner of this resource")
            }
            IpcError::Timeout { op } => write!(f, "{op} timed out"),
            IpcError::WouldBlock { op } => write!(f, "{op} would block"),
            IpcError::BufferTooSmall { required, provided } => {
                write!(
                    f,
                    "receive buffer too small: need {required} bytes, got {provided}"
                )
            }
            IpcError::MessageTooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds queue limit {max}")
            }
            IpcError::AlreadyRunning => write!(f, "task is already running"),
            IpcError::NotRunning => write!(f, "task is not running"),
            IpcError::UnsupportedMode => write!(f, "unsupported blocking mode"),
            IpcError::Cancelled { op } => write!(f, "{op} cancelled"),
        }
    }
}

impl std::error::Error for IpcError {}
