use tabsql_error::Result;
use tabsql_types::flags::{AccessFlags, DeviceCharacteristics, OpenFlags, SyncFlags};
use tabsql_types::{LockLevel, limits};

/// A virtual filesystem implementation.
///
/// This trait is the single contract the SQL engine depends on instead of
/// native OS file calls. File names live in a flat namespace; there are no
/// directories, links, or permissions.
///
/// Every method is synchronous from the caller's point of view — the engine
/// is compiled as cooperative, blocking code. Implementations that are
/// internally asynchronous bridge the mismatch themselves (see
/// `SyncBridge`).
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g., "block", "memory").
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// `name` is `None` for temporary files that should be auto-named.
    /// `flags` describes what kind of file (main DB, journal, WAL, etc.)
    /// and how to open it (create, read-write, exclusive, etc.).
    ///
    /// Returns the opened file and the flags that were actually used (the
    /// VFS adds `READWRITE` when `CREATE` is specified).
    fn open(&self, name: Option<&str>, flags: OpenFlags) -> Result<(Self::File, OpenFlags)>;

    /// Delete a file.
    ///
    /// If `sync_dir` is true, the removal should be durable before this
    /// returns. Tolerates a file that does not exist.
    fn delete(&self, name: &str, sync_dir: bool) -> Result<()>;

    /// Check file access.
    ///
    /// Returns true if the file at `name` satisfies the access check
    /// described by `flags` (exists / readable+writable / readable).
    fn access(&self, name: &str, flags: AccessFlags) -> Result<bool>;

    /// Maximum length of a file name in bytes.
    fn max_pathname(&self) -> usize {
        limits::MAX_PATHNAME
    }
}

/// File-control operations: the extensibility escape hatch of the VFS
/// contract. Unrecognized ops surface as a not-found result so optional
/// features degrade cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControlOp {
    /// Hint that the file will grow to roughly this many bytes.
    SizeHint(u64),
    /// Commit buffered metadata at a transaction boundary.
    Sync,
    /// Any opcode this VFS does not recognize.
    Other(u32),
}

/// A file handle opened by a [`Vfs`].
pub trait VfsFile: Send + Sync {
    /// Close the file.
    ///
    /// Best-effort cleanup: the engine calls close during error unwinding,
    /// so implementations log underlying failures instead of propagating
    /// them. After this call the handle should not be used.
    fn close(&mut self) -> Result<()>;

    /// Read `buf.len()` bytes starting at byte offset `offset`.
    ///
    /// Returns the number of bytes actually read. If fewer bytes are read
    /// than requested (short read), the remaining bytes in `buf` are
    /// zeroed; the count lets the engine distinguish an empty database from
    /// a corrupt one.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` starting at byte offset `offset`, extending the file if
    /// needed.
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Sync the file contents to stable storage.
    ///
    /// This is a durability boundary: when it returns ok, everything
    /// written before the call must survive a context teardown.
    fn sync(&mut self, flags: SyncFlags) -> Result<()>;

    /// Return the current file size in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Acquire a file lock at the given level.
    fn lock(&mut self, level: LockLevel) -> Result<()>;

    /// Release the file lock down to the given level.
    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    /// Check if any connection, this one included, holds a RESERVED or
    /// higher lock on this file.
    fn check_reserved_lock(&self) -> Result<bool>;

    /// File-control escape hatch. The default recognizes nothing.
    fn file_control(&mut self, op: FileControlOp) -> Result<()> {
        let raw = match op {
            FileControlOp::SizeHint(_) => 5,
            FileControlOp::Sync => 21,
            FileControlOp::Other(raw) => raw,
        };
        Err(tabsql_error::TabsqlError::UnknownFileControl { op: raw })
    }

    /// Return the sector size for this file.
    ///
    /// The minimum write granularity of the underlying storage.
    fn sector_size(&self) -> u32 {
        512
    }

    /// Return device characteristics flags.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }
}
