pub mod block_vfs;
pub mod bridge;
pub mod traits;

pub use block_vfs::{BlockFile, BlockVfs, LockStrategyKind, VfsOptions};
pub use bridge::SyncBridge;
pub use traits::{FileControlOp, Vfs, VfsFile};
