//! File metadata records.

use tabsql_error::{Result, TabsqlError};
use tabsql_types::{BlockSize, FileKind};

/// Layout version written into every metadata record.
const META_VERSION: u8 = 1;

/// Encoded size of a metadata record in bytes.
const META_SIZE: usize = 14;

/// Per-file metadata, persisted under the file's metadata key.
///
/// Created on first open-for-create, updated on truncate and size growth,
/// destroyed on delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// File name in the flat namespace.
    pub name: String,
    /// Total file size in bytes.
    pub size: u64,
    /// Block size the file was created with.
    pub block_size: BlockSize,
    /// File type classification.
    pub kind: FileKind,
}

impl FileMetadata {
    /// Metadata for a freshly created, empty file.
    #[must_use]
    pub fn new(name: impl Into<String>, block_size: BlockSize, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            size: 0,
            block_size,
            kind,
        }
    }

    /// Encode as a fixed-layout big-endian record.
    ///
    /// Layout: `version u8 | kind u8 | block_size u32 | size u64`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_SIZE);
        buf.push(META_VERSION);
        buf.push(self.kind.as_u8());
        buf.extend_from_slice(&self.block_size.get().to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Decode a stored metadata record.
    pub fn from_bytes(name: &str, buf: &[u8]) -> Result<Self> {
        let corrupt = || TabsqlError::CorruptMetadata {
            name: name.to_owned(),
        };

        if buf.len() != META_SIZE || buf[0] != META_VERSION {
            return Err(corrupt());
        }
        let kind = FileKind::from_u8(buf[1]).ok_or_else(corrupt)?;
        let raw_bs = u32::from_be_bytes(buf[2..6].try_into().expect("fixed u32 field"));
        let block_size = BlockSize::new(raw_bs).ok_or_else(corrupt)?;
        let size = u64::from_be_bytes(buf[6..14].try_into().expect("fixed u64 field"));

        Ok(Self {
            name: name.to_owned(),
            size,
            block_size,
            kind,
        })
    }
}
