//! Write-buffering block store over an asynchronous key-value backend.
//!
//! Each named file is an addressable byte sequence stored as fixed-size
//! blocks plus one metadata record. Writes land in an in-memory cache and
//! only reach the backend on [`BlockStore::flush`], which commits the whole
//! dirty set as a single atomic batch. Reads assemble bytes across blocks,
//! serving dirty cache-resident blocks in preference to backend state.
//!
//! The cache is owned by the single execution context that owns this store;
//! cross-context access goes through the connection broker, never through
//! shared memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use tabsql_error::{Result, TabsqlError};
use tabsql_types::{BlockSize, FileKind, LockLevel, limits};

use crate::backend::{KvBackend, block_key, file_prefix, lock_key, meta_key};
use crate::meta::FileMetadata;

/// Durability mode for sync requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Flush on every sync.
    #[default]
    Default,
    /// Flush on every sync (reserved for backends that distinguish a
    /// stronger barrier).
    Strict,
    /// A sync arriving within the configured interval of the previous flush
    /// may be elided.
    Relaxed,
}

/// When obsolete resident blocks are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurgePolicy {
    /// Purge automatically after a flush leaves the cache over budget.
    #[default]
    Deferred,
    /// Only purge when [`BlockStore::purge`] is called explicitly.
    Manual,
}

/// Tuning knobs for a [`BlockStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Block size used for newly created files.
    pub block_size: BlockSize,
    /// Resident-cache budget per file, in bytes.
    pub cache_budget: usize,
    /// Automatic purge policy.
    pub purge: PurgePolicy,
    /// Durability mode (consumed by the VFS sync path).
    pub durability: Durability,
    /// Elision window for [`Durability::Relaxed`].
    pub relaxed_sync_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: BlockSize::DEFAULT,
            cache_budget: limits::DEFAULT_CACHE_BUDGET,
            purge: PurgePolicy::Deferred,
            durability: Durability::Default,
            relaxed_sync_interval: Duration::from_millis(3000),
        }
    }
}

/// A cached block of file data.
#[derive(Debug, Default)]
struct CachedBlock {
    /// Block payload; may be shorter than the block size (trailing zeros are
    /// implicit).
    data: Vec<u8>,
    /// Whether the block has writes not yet committed to the backend.
    dirty: bool,
    /// Generation of the last write. A flush only clears `dirty` if the
    /// generation is unchanged when the batch commits, so writes racing a
    /// flush stay dirty.
    dirty_gen: u64,
    /// LRU stamp.
    last_used: u64,
}

/// Resident state for one open file.
#[derive(Debug)]
struct FileState {
    meta: FileMetadata,
    meta_dirty: bool,
    meta_gen: u64,
    blocks: HashMap<u32, CachedBlock>,
    /// Monotonic counter feeding LRU stamps.
    tick: u64,
    /// Monotonic counter feeding dirty generations.
    write_gen: u64,
}

impl FileState {
    fn new(meta: FileMetadata) -> Self {
        Self {
            meta,
            meta_dirty: false,
            meta_gen: 0,
            blocks: HashMap::new(),
            tick: 0,
            write_gen: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn resident_bytes(&self) -> usize {
        self.blocks.values().map(|b| b.data.len()).sum()
    }
}

/// Chunked, cached byte storage for named files.
pub struct BlockStore {
    backend: Arc<dyn KvBackend>,
    files: Mutex<HashMap<String, FileState>>,
    opts: StoreOptions,
}

impl BlockStore {
    /// Create a block store over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, opts: StoreOptions) -> Self {
        Self {
            backend,
            files: Mutex::new(HashMap::new()),
            opts,
        }
    }

    /// The options this store was built with.
    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    fn lock_files(&self) -> MutexGuard<'_, HashMap<String, FileState>> {
        self.files.lock().expect("block store lock poisoned")
    }

    fn with_state<T>(&self, name: &str, f: impl FnOnce(&mut FileState) -> T) -> Result<T> {
        let mut files = self.lock_files();
        let state = files.get_mut(name).ok_or_else(|| TabsqlError::NotFound {
            name: name.to_owned(),
        })?;
        Ok(f(state))
    }

    // --- Lifecycle ---

    /// Load a file's metadata, creating it when `create` is set.
    ///
    /// Returns `NotFound` for a missing file without `create`.
    pub async fn open(&self, name: &str, kind: FileKind, create: bool) -> Result<FileMetadata> {
        if let Some(state) = self.lock_files().get(name) {
            return Ok(state.meta.clone());
        }

        let meta = match self.backend.get(&meta_key(name)).await? {
            Some(bytes) => FileMetadata::from_bytes(name, &bytes)?,
            None if create => {
                let meta = FileMetadata::new(name, self.opts.block_size, kind);
                self.backend
                    .put_batch(vec![(meta_key(name), meta.to_bytes())], vec![])
                    .await?;
                meta
            }
            None => {
                return Err(TabsqlError::NotFound {
                    name: name.to_owned(),
                });
            }
        };

        self.lock_files()
            .entry(name.to_owned())
            .or_insert_with(|| FileState::new(meta.clone()));
        Ok(meta)
    }

    /// Drop a file's resident state without touching the backend.
    ///
    /// Dirty blocks that were never flushed are lost; that is the documented
    /// contract for context teardown.
    pub fn close_file(&self, name: &str) {
        self.lock_files().remove(name);
    }

    /// Whether a file exists in the backend.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        if self.lock_files().contains_key(name) {
            return Ok(true);
        }
        self.backend.contains(&meta_key(name)).await
    }

    /// Current size of a file in bytes.
    pub async fn file_size(&self, name: &str) -> Result<u64> {
        if let Some(state) = self.lock_files().get(name) {
            return Ok(state.meta.size);
        }
        match self.backend.get(&meta_key(name)).await? {
            Some(bytes) => Ok(FileMetadata::from_bytes(name, &bytes)?.size),
            None => Err(TabsqlError::NotFound {
                name: name.to_owned(),
            }),
        }
    }

    /// Re-read metadata from the backend, discarding clean cached blocks.
    ///
    /// Called when a handle re-enters SHARED: another context may have grown
    /// or rewritten the file since this context last looked, so resident
    /// clean blocks cannot be trusted either.
    pub async fn refresh_metadata(&self, name: &str) -> Result<()> {
        let Some(bytes) = self.backend.get(&meta_key(name)).await? else {
            return Err(TabsqlError::NotFound {
                name: name.to_owned(),
            });
        };
        let meta = FileMetadata::from_bytes(name, &bytes)?;

        self.with_state(name, |state| {
            state.meta = meta;
            state.blocks.retain(|_, block| block.dirty);
        })
    }

    /// Bytes of block data resident in the cache for `name` (0 if the file
    /// is not open).
    #[must_use]
    pub fn resident_bytes(&self, name: &str) -> usize {
        self.lock_files()
            .get(name)
            .map_or(0, FileState::resident_bytes)
    }

    /// Number of blocks resident in the cache for `name`.
    #[must_use]
    pub fn resident_blocks(&self, name: &str) -> usize {
        self.lock_files().get(name).map_or(0, |s| s.blocks.len())
    }

    // --- Reads / writes ---

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes actually available; reading past
    /// end-of-file is a short read, not an error. The caller decides whether
    /// a short read is acceptable and is responsible for zero-filling the
    /// remainder.
    pub async fn read_range(&self, name: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (bs, size) = self.with_state(name, |s| (s.meta.block_size.get(), s.meta.size))?;
        if offset >= size {
            return Ok(0);
        }
        let want = usize::try_from((size - offset).min(buf.len() as u64))
            .expect("read length bounded by buf.len()");

        let first = block_index(offset, bs);
        let last = block_index(offset + want as u64 - 1, bs);
        self.populate_blocks(name, first, last).await?;

        self.with_state(name, |state| {
            let mut copied = 0_usize;
            while copied < want {
                let pos = offset + copied as u64;
                let idx = block_index(pos, bs);
                let within = usize::try_from(pos % u64::from(bs)).expect("within < block size");
                let n = (want - copied).min(bs as usize - within);
                let dest = &mut buf[copied..copied + n];

                let tick = state.next_tick();
                if let Some(block) = state.blocks.get_mut(&idx) {
                    block.last_used = tick;
                    let avail = block.data.len().saturating_sub(within).min(n);
                    dest[..avail].copy_from_slice(&block.data[within..within + avail]);
                    dest[avail..].fill(0);
                } else {
                    // A hole: block never written. Reads as zeros.
                    dest.fill(0);
                }
                copied += n;
            }
            want
        })
    }

    /// Write `data` starting at `offset`, extending the file if needed.
    ///
    /// Purely in-memory: nothing reaches the backend until [`Self::flush`].
    /// Partial overwrites of blocks with prior committed data fetch the old
    /// payload first (read-modify-write).
    pub async fn write_range(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let (bs, old_size) = self.with_state(name, |s| (s.meta.block_size.get(), s.meta.size))?;
        let end = offset + data.len() as u64;
        let first = block_index(offset, bs);
        let last = block_index(end - 1, bs);

        // Boundary blocks that are only partially overwritten need their
        // committed payload in the cache first (read-modify-write).
        for idx in [first, last] {
            let block_start = u64::from(idx) * u64::from(bs);
            let block_end = block_start + u64::from(bs);
            let partial = offset > block_start || end < block_end;
            if partial && block_start < old_size {
                self.populate_blocks(name, idx, idx).await?;
            }
        }

        self.with_state(name, |state| {
            let mut written = 0_usize;
            while written < data.len() {
                let pos = offset + written as u64;
                let idx = block_index(pos, bs);
                let within = usize::try_from(pos % u64::from(bs)).expect("within < block size");
                let n = (data.len() - written).min(bs as usize - within);

                let tick = state.tick + 1;
                state.tick = tick;
                state.write_gen += 1;
                let generation = state.write_gen;

                let block = state.blocks.entry(idx).or_default();
                if block.data.len() < within + n {
                    block.data.resize(within + n, 0);
                }
                block.data[within..within + n].copy_from_slice(&data[written..written + n]);
                block.dirty = true;
                block.dirty_gen = generation;
                block.last_used = tick;

                written += n;
            }

            if end > state.meta.size {
                state.meta.size = end;
                state.meta_dirty = true;
                state.meta_gen += 1;
            }
        })
    }

    // --- Flush / purge ---

    /// Durably commit all dirty blocks and metadata of `name` as one atomic
    /// batch, then run the deferred purge pass if the cache is over budget.
    ///
    /// Writes that arrive after the flush snapshot is taken are not included
    /// and remain dirty. Backend failure leaves every block dirty and is
    /// surfaced verbatim as a retryable I/O error.
    pub async fn flush(&self, name: &str) -> Result<()> {
        self.flush_impl(name).await?;
        if self.opts.purge == PurgePolicy::Deferred
            && self.resident_bytes(name) > self.opts.cache_budget
        {
            self.purge_impl(name, self.opts.cache_budget).await?;
        }
        Ok(())
    }

    async fn flush_impl(&self, name: &str) -> Result<()> {
        let (puts, block_snapshot, meta_snapshot) = self.with_state(name, |state| {
            let mut puts = Vec::new();
            let mut snapshot = Vec::new();
            if state.meta_dirty {
                puts.push((meta_key(name), state.meta.to_bytes()));
            }
            for (idx, block) in &state.blocks {
                if block.dirty {
                    puts.push((block_key(name, *idx), block.data.clone()));
                    snapshot.push((*idx, block.dirty_gen));
                }
            }
            (puts, snapshot, (state.meta_dirty, state.meta_gen))
        })?;

        if puts.is_empty() {
            return Ok(());
        }
        let committed = puts.len();

        self.backend.put_batch(puts, vec![]).await?;

        self.with_state(name, |state| {
            for (idx, generation) in block_snapshot {
                if let Some(block) = state.blocks.get_mut(&idx) {
                    if block.dirty_gen == generation {
                        block.dirty = false;
                    }
                }
            }
            if meta_snapshot.0 && state.meta_gen == meta_snapshot.1 {
                state.meta_dirty = false;
            }
        })?;

        debug!(file = %name, records = committed, "flushed dirty set");
        Ok(())
    }

    /// Shrink the resident cache for `name` to at most `target_bytes`.
    ///
    /// Clean blocks are evicted first, least-recently-used first; dirty
    /// blocks are only evicted after a flush makes them clean.
    pub async fn purge(&self, name: &str, target_bytes: usize) -> Result<()> {
        self.purge_impl(name, target_bytes).await
    }

    async fn purge_impl(&self, name: &str, target_bytes: usize) -> Result<()> {
        let mut evicted = 0_usize;

        // Two rounds at most: evict clean, flush, evict again.
        for round in 0..2 {
            let over = self.with_state(name, |state| {
                while state.resident_bytes() > target_bytes {
                    let victim = state
                        .blocks
                        .iter()
                        .filter(|(_, b)| !b.dirty)
                        .min_by_key(|(_, b)| b.last_used)
                        .map(|(idx, _)| *idx);
                    match victim {
                        Some(idx) => {
                            state.blocks.remove(&idx);
                            evicted += 1;
                        }
                        None => return true,
                    }
                }
                false
            })?;

            if !over {
                break;
            }
            if round == 0 {
                self.flush_impl(name).await?;
            }
        }

        debug!(file = %name, evicted, target_bytes, "purged block cache");
        Ok(())
    }

    // --- Truncate / delete ---

    /// Truncate `name` to `new_size` bytes, dropping blocks beyond the new
    /// size from cache and backend in one atomic batch.
    pub async fn truncate(&self, name: &str, new_size: u64) -> Result<()> {
        let (bs, old_size) = self.with_state(name, |s| (s.meta.block_size.get(), s.meta.size))?;
        if new_size >= old_size {
            return Ok(());
        }

        let old_last = block_index(old_size - 1, bs);
        let first_doomed = if new_size == 0 {
            0
        } else {
            block_index(new_size - 1, bs) + 1
        };
        let deletes: Vec<String> = (first_doomed..=old_last)
            .map(|idx| block_key(name, idx))
            .collect();

        // The final kept block may need its tail trimmed so a later regrow
        // reads zeros in the gap.
        let trim = new_size % u64::from(bs) != 0;
        if trim {
            let last_kept = block_index(new_size - 1, bs);
            self.populate_blocks(name, last_kept, last_kept).await?;
        }

        let (puts, trimmed, meta_gen) = self.with_state(name, |state| {
            state.blocks.retain(|idx, _| *idx < first_doomed);

            let mut puts = Vec::new();
            let mut trimmed = None;
            if trim {
                let last_kept = block_index(new_size - 1, bs);
                let keep = usize::try_from(new_size - u64::from(last_kept) * u64::from(bs))
                    .expect("tail length < block size");
                if let Some(block) = state.blocks.get_mut(&last_kept) {
                    if block.data.len() > keep {
                        block.data.truncate(keep);
                    }
                    state.write_gen += 1;
                    block.dirty = true;
                    block.dirty_gen = state.write_gen;
                    puts.push((block_key(name, last_kept), block.data.clone()));
                    trimmed = Some((last_kept, block.dirty_gen));
                }
            }

            state.meta.size = new_size;
            state.meta_gen += 1;
            state.meta_dirty = true;
            puts.push((meta_key(name), state.meta.to_bytes()));
            (puts, trimmed, state.meta_gen)
        })?;

        self.backend.put_batch(puts, deletes).await?;

        self.with_state(name, |state| {
            if state.meta_gen == meta_gen {
                state.meta_dirty = false;
            }
            if let Some((idx, generation)) = trimmed {
                if let Some(block) = state.blocks.get_mut(&idx) {
                    if block.dirty_gen == generation {
                        block.dirty = false;
                    }
                }
            }
        })
    }

    /// Remove `name` entirely: metadata, lock marker, and every block.
    /// Tolerates a file that does not exist.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.lock_files().remove(name);
        self.backend.delete_prefix(&file_prefix(name)).await
    }

    // --- Persisted lock marker ---

    /// Record (or clear, for levels below RESERVED) the persisted lock
    /// marker for `name`.
    ///
    /// The marker survives context crashes, which is exactly why
    /// [`Self::force_clear_orphaned_lock`] exists.
    pub async fn persist_lock_marker(&self, name: &str, level: LockLevel) -> Result<()> {
        if level >= LockLevel::Reserved {
            self.backend
                .put_batch(vec![(lock_key(name), vec![level as u8])], vec![])
                .await
        } else {
            self.backend
                .put_batch(vec![], vec![lock_key(name)])
                .await
        }
    }

    /// Read the persisted lock marker for `name`.
    pub async fn read_lock_marker(&self, name: &str) -> Result<LockLevel> {
        match self.backend.get(&lock_key(name)).await? {
            Some(bytes) => Ok(bytes
                .first()
                .copied()
                .and_then(LockLevel::from_u8)
                .unwrap_or(LockLevel::None)),
            None => Ok(LockLevel::None),
        }
    }

    /// Administrative recovery: remove a stale lock marker left behind by a
    /// crashed context. Best effort; never touches block data.
    pub async fn force_clear_orphaned_lock(&self, name: &str) -> Result<()> {
        warn!(file = %name, "force-clearing orphaned lock marker");
        self.backend
            .put_batch(vec![], vec![lock_key(name)])
            .await
    }

    // --- Internal ---

    /// Ensure blocks `first..=last` that exist in the backend are resident.
    async fn populate_blocks(&self, name: &str, first: u32, last: u32) -> Result<()> {
        let missing: Vec<u32> = self.with_state(name, |state| {
            (first..=last)
                .filter(|idx| !state.blocks.contains_key(idx))
                .collect()
        })?;
        if missing.is_empty() {
            return Ok(());
        }

        let mut fetched = Vec::with_capacity(missing.len());
        for idx in missing {
            let data = self.backend.get(&block_key(name, idx)).await?;
            fetched.push((idx, data));
        }

        self.with_state(name, |state| {
            for (idx, data) in fetched {
                let Some(data) = data else { continue };
                let tick = state.next_tick();
                // A write may have raced the fetch; never clobber it.
                state.blocks.entry(idx).or_insert(CachedBlock {
                    data,
                    dirty: false,
                    dirty_gen: 0,
                    last_used: tick,
                });
            }
        })
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let files = self.lock_files();
        f.debug_struct("BlockStore")
            .field("files", &files.len())
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

/// Index of the block containing byte `offset`.
#[inline]
fn block_index(offset: u64, block_size: u32) -> u32 {
    u32::try_from(offset / u64::from(block_size)).expect("block index fits in u32")
}
