//! Public API facade for tabsql.
//!
//! tabsql lets a synchronous embedded SQL engine run inside sandboxed,
//! single-threaded-per-context, multi-tab hosts: a block store emulates
//! random-access files over an async key-value backend, a lock coordinator
//! implements the engine's five-level locking over named advisory locks, a
//! VFS ties the two together behind the engine's blocking contract, and a
//! connection broker elects the one context that owns the live connection
//! and relays everyone else's calls to it.

pub use tabsql_broker::{
    AttachState, BrokerMessage, Hub, RpcRequest, RpcResponse, ServiceHandler, SharedService,
};
pub use tabsql_error::{Result, ResultCode, TabsqlError};
pub use tabsql_locks::{
    FileLocks, LockManager, LockMode, LockOptions, LockStrategy, RetryPolicy,
};
pub use tabsql_store::{
    BlockStore, Durability, FileMetadata, KvBackend, MemoryBackend, PurgePolicy, StoreOptions,
};
pub use tabsql_types::flags::{AccessFlags, DeviceCharacteristics, OpenFlags, SyncFlags};
pub use tabsql_types::{BlockSize, FileKind, LockLevel};
pub use tabsql_vfs::{
    BlockFile, BlockVfs, FileControlOp, LockStrategyKind, SyncBridge, Vfs, VfsFile, VfsOptions,
};
