//! Block-store-backed VFS.
//!
//! Composes the block store (bytes) and the lock coordinator (the five-level
//! protocol) behind the [`Vfs`]/[`VfsFile`] contract. This is the layer that
//! turns component outcomes into the engine's result vocabulary and the only
//! layer that blocks a caller (through [`SyncBridge`]).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::warn;

use tabsql_error::{Result, TabsqlError};
use tabsql_locks::{FileLocks, LockManager, LockOptions};
use tabsql_store::{BlockStore, Durability, KvBackend, StoreOptions};
use tabsql_types::flags::{AccessFlags, DeviceCharacteristics, OpenFlags, SyncFlags};
use tabsql_types::{FileKind, LockLevel};

use crate::bridge::SyncBridge;
use crate::traits::{FileControlOp, Vfs, VfsFile};

/// Which lock strategy newly opened files use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStrategyKind {
    /// Single-owner exclusive (Strategy A) — for backends that only support
    /// one live handle.
    Exclusive,
    /// Multi-reader, single-writer (Strategy B).
    #[default]
    Shared,
}

/// Construction options for a [`BlockVfs`].
#[derive(Debug, Clone, Default)]
pub struct VfsOptions {
    /// Lock strategy for every file of this VFS.
    pub strategy: LockStrategyKind,
    /// Per-file lock acquisition tuning.
    pub lock: LockOptions,
    /// Block store tuning.
    pub store: StoreOptions,
}

/// A VFS storing files as cached blocks over an async key-value backend.
pub struct BlockVfs {
    store: Arc<BlockStore>,
    locks: LockManager,
    bridge: SyncBridge,
    opts: VfsOptions,
    next_temp_id: AtomicU64,
}

impl BlockVfs {
    /// Build a VFS over `backend`, coordinating locks through `locks`.
    ///
    /// Contexts that must see each other's locks share the `LockManager`;
    /// contexts that must see each other's data share the backend.
    pub fn new(
        backend: Arc<dyn KvBackend>,
        locks: LockManager,
        opts: VfsOptions,
    ) -> Result<Self> {
        let bridge = SyncBridge::new()?;
        let store = Arc::new(BlockStore::new(backend, opts.store.clone()));
        Ok(Self {
            store,
            locks,
            bridge,
            opts,
            next_temp_id: AtomicU64::new(0),
        })
    }

    /// The underlying block store (for administrative operations).
    #[must_use]
    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Administrative recovery: clear a lock marker left by a crashed
    /// context (see `BlockStore::force_clear_orphaned_lock`).
    pub fn force_clear_orphaned_lock(&self, name: &str) -> Result<()> {
        self.bridge.run(self.store.force_clear_orphaned_lock(name))
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.max_pathname() || name.contains('\0') {
            return Err(TabsqlError::InvalidName {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    fn file_locks(&self, name: &str) -> FileLocks {
        match self.opts.strategy {
            LockStrategyKind::Exclusive => {
                FileLocks::exclusive(self.locks.clone(), name, &self.opts.lock)
            }
            LockStrategyKind::Shared => {
                FileLocks::shared(self.locks.clone(), name, &self.opts.lock)
            }
        }
    }
}

impl Vfs for BlockVfs {
    type File = BlockFile;

    fn name(&self) -> &'static str {
        "block"
    }

    fn open(&self, name: Option<&str>, flags: OpenFlags) -> Result<(Self::File, OpenFlags)> {
        let is_temp = name.is_none();
        let resolved = match name {
            Some(n) => n.to_owned(),
            None => {
                let id = self.next_temp_id.fetch_add(1, Ordering::Relaxed);
                format!("__temp_{id}__")
            }
        };
        self.validate_name(&resolved)?;

        let kind = FileKind::from_flags(flags).ok_or(TabsqlError::BadOpenFlags {
            flags: flags.bits(),
        })?;

        let create = is_temp || flags.contains(OpenFlags::CREATE);
        self.bridge
            .run(self.store.open(&resolved, kind, create))
            .map_err(|err| match err {
                TabsqlError::NotFound { name } => TabsqlError::CannotOpen { name },
                other => other,
            })?;

        let mut out_flags = flags;
        if create {
            out_flags |= OpenFlags::READWRITE;
        }

        let file = BlockFile {
            name: resolved.clone(),
            flags: out_flags,
            kind,
            store: Arc::clone(&self.store),
            locks: self.file_locks(&resolved),
            bridge: self.bridge.clone(),
            delete_on_close: is_temp || flags.contains(OpenFlags::DELETEONCLOSE),
            last_flush: Mutex::new(None),
        };

        Ok((file, out_flags))
    }

    fn delete(&self, name: &str, _sync_dir: bool) -> Result<()> {
        // The backing batch is durable on commit, so there is no separate
        // directory sync step.
        self.bridge.run(self.store.delete(name))
    }

    fn access(&self, name: &str, flags: AccessFlags) -> Result<bool> {
        // The flat namespace has no permission model: readable and writable
        // reduce to existence.
        let _ = flags;
        self.bridge.run(self.store.exists(name))
    }
}

impl std::fmt::Debug for BlockVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockVfs")
            .field("strategy", &self.opts.strategy)
            .finish_non_exhaustive()
    }
}

/// An open file handle on a [`BlockVfs`].
pub struct BlockFile {
    name: String,
    flags: OpenFlags,
    kind: FileKind,
    store: Arc<BlockStore>,
    locks: FileLocks,
    bridge: SyncBridge,
    delete_on_close: bool,
    last_flush: Mutex<Option<Instant>>,
}

impl BlockFile {
    /// File name in the flat namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classified file kind.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Current lock level of this handle.
    #[must_use]
    pub fn lock_level(&self) -> LockLevel {
        self.locks.level()
    }

    /// The effective open flags.
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn writable(&self) -> bool {
        self.flags.contains(OpenFlags::READWRITE) || !self.flags.contains(OpenFlags::READONLY)
    }

    fn flush_now(&self) -> Result<()> {
        self.bridge.run(self.store.flush(&self.name))?;
        *self.last_flush.lock().expect("flush stamp poisoned") = Some(Instant::now());
        Ok(())
    }
}

impl VfsFile for BlockFile {
    fn close(&mut self) -> Result<()> {
        // Best-effort: the engine closes files during error unwinding, and
        // a throw here would mask the original failure.
        if let Err(err) = self.flush_now() {
            warn!(file = %self.name, error = %err, "flush during close failed");
        }

        let level = self.locks.level();
        if level != LockLevel::None {
            let result = self.bridge.run(async {
                self.locks.unlock(LockLevel::None).await?;
                if level >= LockLevel::Reserved {
                    self.store
                        .persist_lock_marker(&self.name, LockLevel::None)
                        .await?;
                }
                Ok::<(), TabsqlError>(())
            });
            if let Err(err) = result {
                warn!(file = %self.name, error = %err, "unlock during close failed");
            }
        }

        if self.delete_on_close {
            if let Err(err) = self.bridge.run(self.store.delete(&self.name)) {
                warn!(file = %self.name, error = %err, "delete-on-close failed");
            }
        } else {
            self.store.close_file(&self.name);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = self
            .bridge
            .run(self.store.read_range(&self.name, buf, offset))?;
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if !self.writable() {
            return Err(TabsqlError::ReadOnly);
        }
        self.bridge
            .run(self.store.write_range(&self.name, offset, buf))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if !self.writable() {
            return Err(TabsqlError::ReadOnly);
        }
        self.bridge.run(self.store.truncate(&self.name, size))
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        if self.store.options().durability == Durability::Relaxed {
            let stamp = self.last_flush.lock().expect("flush stamp poisoned");
            if let Some(at) = *stamp {
                if at.elapsed() < self.store.options().relaxed_sync_interval {
                    return Ok(());
                }
            }
        }
        self.flush_now()
    }

    fn file_size(&self) -> Result<u64> {
        self.bridge.run(self.store.file_size(&self.name))
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        let before = self.locks.level();
        self.bridge.run(async {
            self.locks.lock(level).await?;
            let now = self.locks.level();
            if before == LockLevel::None && now >= LockLevel::Shared {
                // Another context may have grown or rewritten the file since
                // this handle last held a lock.
                self.store.refresh_metadata(&self.name).await?;
            }
            if now >= LockLevel::Reserved {
                self.store.persist_lock_marker(&self.name, now).await?;
            }
            Ok(())
        })
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        let before = self.locks.level();
        self.bridge.run(async {
            self.locks.unlock(level).await?;
            if before >= LockLevel::Reserved && self.locks.level() < LockLevel::Reserved {
                self.store
                    .persist_lock_marker(&self.name, LockLevel::None)
                    .await?;
            }
            Ok(())
        })
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        self.bridge.run(async {
            if self.locks.is_somewhere_reserved().await? {
                return Ok(true);
            }
            // An orphaned marker from a crashed context counts as reserved
            // until an administrator clears it.
            let marker = self.store.read_lock_marker(&self.name).await?;
            Ok(marker >= LockLevel::Reserved)
        })
    }

    fn file_control(&mut self, op: FileControlOp) -> Result<()> {
        match op {
            FileControlOp::Sync => self.flush_now(),
            // Block allocation is lazy; the hint costs nothing to accept.
            FileControlOp::SizeHint(_) => Ok(()),
            FileControlOp::Other(raw) => Err(TabsqlError::UnknownFileControl { op: raw }),
        }
    }

    fn sector_size(&self) -> u32 {
        512
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::BATCH_ATOMIC
            | DeviceCharacteristics::SAFE_APPEND
            | DeviceCharacteristics::SEQUENTIAL
            | DeviceCharacteristics::UNDELETABLE_WHEN_OPEN
    }
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("level", &self.locks.level())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsql_error::ResultCode;
    use tabsql_store::MemoryBackend;
    use tabsql_types::limits;

    fn make_vfs(backend: MemoryBackend) -> BlockVfs {
        BlockVfs::new(Arc::new(backend), LockManager::new(), VfsOptions::default()).unwrap()
    }

    fn open_flags_create() -> OpenFlags {
        OpenFlags::MAIN_DB | OpenFlags::CREATE | OpenFlags::READWRITE
    }

    #[test]
    fn create_write_close_reopen_read() {
        let backend = MemoryBackend::new();
        let vfs = make_vfs(backend.clone());

        let (mut file, _) = vfs.open(Some("rw.db"), open_flags_create()).unwrap();
        file.write(b"hello block vfs", 0).unwrap();
        assert_eq!(file.file_size().unwrap(), 15);
        file.sync(SyncFlags::FULL).unwrap();
        file.close().unwrap();

        // A second VFS over the same backend simulates a fresh context.
        let vfs2 = make_vfs(backend);
        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        let (mut file, _) = vfs2.open(Some("rw.db"), flags).unwrap();
        let mut buf = [0u8; 15];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 15);
        assert_eq!(&buf, b"hello block vfs");
        file.close().unwrap();
    }

    #[test]
    fn read_past_end_zero_fills() {
        let vfs = make_vfs(MemoryBackend::new());
        let (mut file, _) = vfs.open(Some("short.db"), open_flags_create()).unwrap();
        file.write(b"hi", 0).unwrap();

        let mut buf = [0xFFu8; 10];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");
        assert!(buf[2..].iter().all(|&b| b == 0), "short read must zero-fill");
    }

    #[test]
    fn read_from_empty_file() {
        let vfs = make_vfs(MemoryBackend::new());
        let (mut file, _) = vfs.open(Some("empty.db"), open_flags_create()).unwrap();

        let mut buf = [0xFFu8; 4];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_extends_file() {
        let vfs = make_vfs(MemoryBackend::new());
        let (mut file, _) = vfs.open(Some("grow.db"), open_flags_create()).unwrap();

        file.write(b"world", 10).unwrap();
        assert_eq!(file.file_size().unwrap(), 15);

        let mut buf = [0xFFu8; 15];
        file.read(&mut buf, 0).unwrap();
        assert!(buf[..10].iter().all(|&b| b == 0));
        assert_eq!(&buf[10..], b"world");
    }

    #[test]
    fn truncate_shrinks() {
        let vfs = make_vfs(MemoryBackend::new());
        let (mut file, _) = vfs.open(Some("trunc.db"), open_flags_create()).unwrap();
        file.write(b"hello world", 0).unwrap();

        file.truncate(5).unwrap();
        assert_eq!(file.file_size().unwrap(), 5);

        let mut buf = [0u8; 5];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn open_nonexistent_without_create_fails() {
        let vfs = make_vfs(MemoryBackend::new());
        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        let err = vfs.open(Some("nope.db"), flags).unwrap_err();
        assert!(matches!(err, TabsqlError::CannotOpen { .. }));
        assert_eq!(err.result_code(), ResultCode::CantOpen);
    }

    #[test]
    fn open_requires_exactly_one_kind() {
        let vfs = make_vfs(MemoryBackend::new());

        let err = vfs
            .open(Some("x.db"), OpenFlags::CREATE | OpenFlags::READWRITE)
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::Misuse);

        let err = vfs
            .open(
                Some("x.db"),
                OpenFlags::MAIN_DB | OpenFlags::TEMP_DB | OpenFlags::CREATE,
            )
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::Misuse);
    }

    #[test]
    fn open_rejects_bad_names() {
        let vfs = make_vfs(MemoryBackend::new());
        let err = vfs
            .open(Some("bad\0name"), open_flags_create())
            .unwrap_err();
        assert!(matches!(err, TabsqlError::InvalidName { .. }));

        let long = "x".repeat(limits::MAX_PATHNAME + 1);
        let err = vfs.open(Some(&long), open_flags_create()).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::CantOpen);
    }

    #[test]
    fn delete_and_access() {
        let vfs = make_vfs(MemoryBackend::new());
        let (mut file, _) = vfs.open(Some("gone.db"), open_flags_create()).unwrap();
        file.write(b"data", 0).unwrap();
        file.sync(SyncFlags::NORMAL).unwrap();
        file.close().unwrap();

        assert!(vfs.access("gone.db", AccessFlags::EXISTS).unwrap());
        vfs.delete("gone.db", false).unwrap();
        assert!(!vfs.access("gone.db", AccessFlags::EXISTS).unwrap());

        // Recreate: empty file of size 0.
        let (file, _) = vfs.open(Some("gone.db"), open_flags_create()).unwrap();
        assert_eq!(file.file_size().unwrap(), 0);
    }

    #[test]
    fn delete_on_close() {
        let vfs = make_vfs(MemoryBackend::new());
        let flags = open_flags_create() | OpenFlags::DELETEONCLOSE;
        let (mut file, _) = vfs.open(Some("temp.db"), flags).unwrap();
        file.write(b"temp data", 0).unwrap();
        file.sync(SyncFlags::NORMAL).unwrap();
        assert!(vfs.access("temp.db", AccessFlags::EXISTS).unwrap());

        file.close().unwrap();
        assert!(!vfs.access("temp.db", AccessFlags::EXISTS).unwrap());
    }

    #[test]
    fn temp_files_are_auto_named() {
        let vfs = make_vfs(MemoryBackend::new());
        let flags = OpenFlags::TEMP_DB | OpenFlags::CREATE | OpenFlags::READWRITE;

        let (mut f1, _) = vfs.open(None, flags).unwrap();
        let (mut f2, _) = vfs.open(None, flags).unwrap();
        assert_ne!(f1.name(), f2.name());

        f1.write(b"one", 0).unwrap();
        f2.write(b"two", 0).unwrap();

        let mut buf = [0u8; 3];
        f1.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"one");
        f2.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"two");
    }

    #[test]
    fn create_implies_readwrite_in_out_flags() {
        let vfs = make_vfs(MemoryBackend::new());
        let flags = OpenFlags::MAIN_DB | OpenFlags::CREATE;
        let (_, out_flags) = vfs.open(Some("c.db"), flags).unwrap();
        assert!(out_flags.contains(OpenFlags::READWRITE));
    }

    #[test]
    fn readonly_handle_rejects_writes() {
        let backend = MemoryBackend::new();
        let vfs = make_vfs(backend.clone());
        let (mut file, _) = vfs.open(Some("ro.db"), open_flags_create()).unwrap();
        file.write(b"seed", 0).unwrap();
        file.sync(SyncFlags::NORMAL).unwrap();
        file.close().unwrap();

        let vfs2 = make_vfs(backend);
        let flags = OpenFlags::MAIN_DB | OpenFlags::READONLY;
        let (mut file, _) = vfs2.open(Some("ro.db"), flags).unwrap();
        let err = file.write(b"nope", 0).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ReadOnly);
        let err = file.truncate(0).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ReadOnly);
    }

    #[test]
    fn lock_escalation_and_reserved_probe() {
        let vfs = make_vfs(MemoryBackend::new());
        let (mut file, _) = vfs.open(Some("lock.db"), open_flags_create()).unwrap();
        file.write(b"lock test", 0).unwrap();
        file.sync(SyncFlags::NORMAL).unwrap();

        assert!(!file.check_reserved_lock().unwrap());

        file.lock(LockLevel::Shared).unwrap();
        assert_eq!(file.lock_level(), LockLevel::Shared);
        assert!(!file.check_reserved_lock().unwrap());

        file.lock(LockLevel::Reserved).unwrap();
        // Reserved is visible, self included.
        assert!(file.check_reserved_lock().unwrap());

        file.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(file.lock_level(), LockLevel::Exclusive);

        file.unlock(LockLevel::Shared).unwrap();
        assert_eq!(file.lock_level(), LockLevel::Shared);
        assert!(!file.check_reserved_lock().unwrap());

        file.unlock(LockLevel::None).unwrap();
        file.close().unwrap();
    }

    #[test]
    fn orphaned_marker_reports_reserved_until_cleared() {
        let backend = MemoryBackend::new();
        let vfs = make_vfs(backend.clone());
        let (mut file, _) = vfs.open(Some("orphan.db"), open_flags_create()).unwrap();
        file.write(b"x", 0).unwrap();
        file.lock(LockLevel::Shared).unwrap();
        file.lock(LockLevel::Reserved).unwrap();
        // Simulate a crash: the handle is dropped without unlocking, but the
        // persisted marker survives in the backend.
        drop(file);

        let vfs2 = make_vfs(backend);
        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        let (file2, _) = vfs2.open(Some("orphan.db"), flags).unwrap();
        assert!(
            file2.check_reserved_lock().unwrap(),
            "orphaned marker must read as reserved"
        );

        vfs2.force_clear_orphaned_lock("orphan.db").unwrap();
        assert!(!file2.check_reserved_lock().unwrap());
    }

    #[test]
    fn file_control_dispatch() {
        let vfs = make_vfs(MemoryBackend::new());
        let (mut file, _) = vfs.open(Some("fc.db"), open_flags_create()).unwrap();

        file.file_control(FileControlOp::SizeHint(1 << 20)).unwrap();
        file.file_control(FileControlOp::Sync).unwrap();

        let err = file.file_control(FileControlOp::Other(99)).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::NotFound);
    }

    #[test]
    fn device_characteristics_and_sector_size() {
        let vfs = make_vfs(MemoryBackend::new());
        let (file, _) = vfs.open(Some("dev.db"), open_flags_create()).unwrap();
        assert_eq!(file.sector_size(), 512);
        let caps = file.device_characteristics();
        assert!(caps.contains(DeviceCharacteristics::BATCH_ATOMIC));
        assert!(caps.contains(DeviceCharacteristics::SAFE_APPEND));
        assert!(caps.contains(DeviceCharacteristics::SEQUENTIAL));
        assert!(caps.contains(DeviceCharacteristics::UNDELETABLE_WHEN_OPEN));
    }

    #[test]
    fn sync_persists_across_contexts() {
        let backend = MemoryBackend::new();
        let vfs = make_vfs(backend.clone());
        let (mut file, _) = vfs.open(Some("sync.db"), open_flags_create()).unwrap();
        file.write(&vec![0xCD; 8192], 0).unwrap();
        file.sync(SyncFlags::FULL).unwrap();

        // Unsynced tail write stays local to this context.
        file.write(b"!!", 8192).unwrap();

        let vfs2 = make_vfs(backend);
        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        let (mut other, _) = vfs2.open(Some("sync.db"), flags).unwrap();
        assert_eq!(other.file_size().unwrap(), 8192);
        let mut buf = vec![0u8; 8192];
        let n = other.read(&mut buf, 0).unwrap();
        assert_eq!(n, 8192);
        assert!(buf.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn refresh_on_shared_sees_other_context_growth() {
        let backend = MemoryBackend::new();
        let writer_vfs = make_vfs(backend.clone());
        let reader_vfs = make_vfs(backend);

        let (mut writer, _) = writer_vfs.open(Some("s.db"), open_flags_create()).unwrap();
        writer.write(&vec![1u8; 4096], 0).unwrap();
        writer.sync(SyncFlags::FULL).unwrap();

        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        let (mut reader, _) = reader_vfs.open(Some("s.db"), flags).unwrap();
        assert_eq!(reader.file_size().unwrap(), 4096);

        writer.write(&vec![2u8; 4096], 4096).unwrap();
        writer.sync(SyncFlags::FULL).unwrap();

        // A fresh SHARED acquisition refreshes the reader's view.
        reader.lock(LockLevel::Shared).unwrap();
        assert_eq!(reader.file_size().unwrap(), 8192);
        reader.unlock(LockLevel::None).unwrap();
    }
}
