//! Compile-time limits for the storage layer.

/// Maximum length of a file name in bytes.
pub const MAX_PATHNAME: usize = 512;

/// Minimum block size in bytes.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Maximum block size in bytes.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Default resident-cache budget per file, in bytes (2048 default-sized
/// blocks).
pub const DEFAULT_CACHE_BUDGET: usize = 8 * 1024 * 1024;
