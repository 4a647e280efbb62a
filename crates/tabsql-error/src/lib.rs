use thiserror::Error;

/// Primary error type for tabsql operations.
///
/// Every failure that can cross a component boundary is a variant here, so
/// the VFS layer can translate any outcome into the engine's fixed result
/// vocabulary via [`TabsqlError::result_code`]. Variants are grouped by the
/// error taxonomy: busy (retryable), I/O faults (surfaced verbatim),
/// protocol faults (programming errors), and not-found.
#[derive(Error, Debug)]
pub enum TabsqlError {
    // === Busy ===
    /// A lock or leadership resource is currently held elsewhere.
    #[error("database is busy")]
    Busy,

    // === File / open errors ===
    /// Cannot open the named file (missing without CREATE, bad name, ...).
    #[error("unable to open database file: '{name}'")]
    CannotOpen { name: String },

    /// Operation on a file that does not exist.
    #[error("no such file: '{name}'")]
    NotFound { name: String },

    /// A file name exceeded the maximum path length or contained a NUL.
    #[error("invalid file name: '{name}'")]
    InvalidName { name: String },

    /// The open flags did not carry exactly one file-kind bit.
    #[error("open flags must select exactly one file kind (flags {flags:#x})")]
    BadOpenFlags { flags: u32 },

    // === I/O faults ===
    /// Host I/O error (bridge construction, real-file backends).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing key-value store failure; retryable by the caller.
    #[error("backing store I/O error: {detail}")]
    BackendIo { detail: String },

    /// I/O error while reading a block.
    #[error("disk I/O error reading '{name}' block {block}")]
    IoRead { name: String, block: u32 },

    /// I/O error while writing a block.
    #[error("disk I/O error writing '{name}' block {block}")]
    IoWrite { name: String, block: u32 },

    /// Fewer bytes than requested were available.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Stored file metadata failed to decode.
    #[error("corrupt metadata record for '{name}'")]
    CorruptMetadata { name: String },

    // === Lock errors ===
    /// A lock-state transition outside the legal adjacency graph was
    /// requested. This is a caller bug, not a busy condition.
    #[error("illegal lock transition {from} -> {to}")]
    LockProtocol { from: &'static str, to: &'static str },

    /// The underlying lock primitive failed for a reason other than
    /// contention.
    #[error("file locking failed: {detail}")]
    LockFailed { detail: String },

    // === Broker errors ===
    /// No provider port could be obtained within the bounded retry window.
    #[error("could not find a provider to communicate with")]
    NoProvider,

    /// The shared service was closed while calls were outstanding.
    #[error("shared service closed")]
    ServiceClosed,

    /// The provider answered a call with an error.
    #[error("remote call failed: {detail}")]
    RemoteCall { detail: String },

    // === Misc ===
    /// Unrecognized file-control opcode; callers treat this as "feature not
    /// present", not as a failure.
    #[error("unknown file control op {op}")]
    UnknownFileControl { op: u32 },

    /// Attempt to write through a read-only handle.
    #[error("attempt to write a readonly database")]
    ReadOnly,

    /// Operation is not supported by the current backend or configuration.
    #[error("unsupported operation")]
    Unsupported,

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Engine result codes, numerically compatible with the SQLite vocabulary
/// the host shim expects. Extended I/O sub-codes are included so short
/// reads and lock failures are distinguishable from generic I/O faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Database file is locked.
    Busy = 5,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Disk I/O error.
    IoErr = 10,
    /// Not found (file-control and lookup misses).
    NotFound = 12,
    /// Unable to open database file.
    CantOpen = 14,
    /// Locking protocol error.
    Protocol = 15,
    /// Library used incorrectly.
    Misuse = 21,
    /// I/O error during read.
    IoErrRead = 266,
    /// I/O error: short read.
    IoErrShortRead = 522,
    /// I/O error during write.
    IoErrWrite = 778,
    /// I/O error while taking a lock.
    IoErrLock = 3850,
}

impl ResultCode {
    /// The primary (low-byte) code for an extended code.
    #[must_use]
    pub const fn primary(self) -> Self {
        match self {
            Self::IoErrRead | Self::IoErrShortRead | Self::IoErrWrite | Self::IoErrLock => {
                Self::IoErr
            }
            other => other,
        }
    }
}

impl TabsqlError {
    /// Map this error to the engine result code.
    #[must_use]
    pub const fn result_code(&self) -> ResultCode {
        match self {
            Self::Busy => ResultCode::Busy,
            Self::CannotOpen { .. } | Self::InvalidName { .. } => ResultCode::CantOpen,
            Self::NotFound { .. } | Self::UnknownFileControl { .. } => ResultCode::NotFound,
            Self::BadOpenFlags { .. } => ResultCode::Misuse,
            Self::Io(_) | Self::BackendIo { .. } | Self::CorruptMetadata { .. } => {
                ResultCode::IoErr
            }
            Self::IoRead { .. } => ResultCode::IoErrRead,
            Self::IoWrite { .. } => ResultCode::IoErrWrite,
            Self::ShortRead { .. } => ResultCode::IoErrShortRead,
            Self::LockProtocol { .. } => ResultCode::Misuse,
            Self::LockFailed { .. } => ResultCode::IoErrLock,
            Self::NoProvider | Self::ServiceClosed => ResultCode::Error,
            Self::RemoteCall { .. } => ResultCode::Error,
            Self::ReadOnly => ResultCode::ReadOnly,
            Self::Unsupported => ResultCode::Error,
            Self::Internal(_) => ResultCode::Internal,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::BackendIo { .. })
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a backing-store I/O error.
    pub fn backend(detail: impl Into<String>) -> Self {
        Self::BackendIo {
            detail: detail.into(),
        }
    }

    /// Create a lock failure.
    pub fn lock_failed(detail: impl Into<String>) -> Self {
        Self::LockFailed {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `TabsqlError`.
pub type Result<T> = std::result::Result<T, TabsqlError>;
