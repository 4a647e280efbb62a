//! Flag bitsets for the VFS contract.
//!
//! Numeric values match the engine's `SQLITE_OPEN_*`, `SQLITE_ACCESS_*`,
//! `SQLITE_SYNC_*` and `SQLITE_IOCAP_*` constants so a host shim can pass
//! them through unchanged.

use bitflags::bitflags;

bitflags! {
    /// Flags passed to `Vfs::open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY       = 0x0000_0001;
        const READWRITE      = 0x0000_0002;
        const CREATE         = 0x0000_0004;
        const DELETEONCLOSE  = 0x0000_0008;
        const EXCLUSIVE      = 0x0000_0010;
        const MAIN_DB        = 0x0000_0100;
        const TEMP_DB        = 0x0000_0200;
        const TRANSIENT_DB   = 0x0000_0400;
        const MAIN_JOURNAL   = 0x0000_0800;
        const TEMP_JOURNAL   = 0x0000_1000;
        const SUBJOURNAL     = 0x0000_2000;
        const SUPER_JOURNAL  = 0x0000_4000;
        const WAL            = 0x0008_0000;
    }
}

bitflags! {
    /// Access check modes for `Vfs::access`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const EXISTS    = 0;
        const READWRITE = 1;
        const READ      = 2;
    }
}

bitflags! {
    /// Sync modes for `VfsFile::sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x0000_0002;
        const FULL     = 0x0000_0003;
        const DATAONLY = 0x0000_0010;
    }
}

bitflags! {
    /// Device capability flags returned by
    /// `VfsFile::device_characteristics`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const SAFE_APPEND            = 0x0000_0200;
        const SEQUENTIAL             = 0x0000_0400;
        const UNDELETABLE_WHEN_OPEN  = 0x0000_0800;
        const BATCH_ATOMIC           = 0x0000_4000;
    }
}
