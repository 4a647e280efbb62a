pub mod flags;
pub mod limits;

pub use flags::{AccessFlags, DeviceCharacteristics, OpenFlags, SyncFlags};

use std::fmt;

/// Lock level for database file locking (the engine's five-state lock).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared lock (reading).
    Shared = 1,
    /// Reserved lock (intending to write).
    Reserved = 2,
    /// Pending lock (transient, mid upgrade to exclusive).
    Pending = 3,
    /// Exclusive lock (writing).
    Exclusive = 4,
}

impl LockLevel {
    /// Short static name, used in protocol-fault diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Shared => "Shared",
            Self::Reserved => "Reserved",
            Self::Pending => "Pending",
            Self::Exclusive => "Exclusive",
        }
    }

    /// Decode a stored lock level byte.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Shared),
            2 => Some(Self::Reserved),
            3 => Some(Self::Pending),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Block size in bytes for a stored file.
///
/// Must be a power of two between 512 and 65536 (inclusive); 4096 is the
/// default, matching the engine's default page size so one block holds one
/// page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Minimum block size: 512 bytes.
    pub const MIN: Self = Self(limits::MIN_BLOCK_SIZE);

    /// Default block size: 4096 bytes.
    pub const DEFAULT: Self = Self(limits::DEFAULT_BLOCK_SIZE);

    /// Maximum block size: 65536 bytes.
    pub const MAX: Self = Self(limits::MAX_BLOCK_SIZE);

    /// Create a new block size, validating that it is a power of two in
    /// the range \[512, 65536\].
    #[must_use]
    pub const fn new(size: u32) -> Option<Self> {
        if size < limits::MIN_BLOCK_SIZE || size > limits::MAX_BLOCK_SIZE || !size.is_power_of_two()
        {
            None
        } else {
            Some(Self(size))
        }
    }

    /// Get the raw block size in bytes.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Block size as a usize, for buffer math.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// File type classification, derived from the open flags.
///
/// Exactly one kind applies to every open file; the kind decides cache and
/// retention policy (temp and transient files are delete-on-close
/// candidates, journals are short-lived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// The main database file.
    MainDb,
    /// Rollback journal for the main database.
    MainJournal,
    /// A temporary database.
    TempDb,
    /// Journal for a temporary database.
    TempJournal,
    /// A transient (statement-scoped) database.
    TransientDb,
    /// Statement sub-journal.
    SubJournal,
    /// Super-journal for multi-database commits.
    SuperJournal,
    /// Write-ahead log.
    Wal,
}

impl FileKind {
    /// All kind bits, for masking out of a flag set.
    const KIND_MASK: OpenFlags = OpenFlags::MAIN_DB
        .union(OpenFlags::MAIN_JOURNAL)
        .union(OpenFlags::TEMP_DB)
        .union(OpenFlags::TEMP_JOURNAL)
        .union(OpenFlags::TRANSIENT_DB)
        .union(OpenFlags::SUBJOURNAL)
        .union(OpenFlags::SUPER_JOURNAL)
        .union(OpenFlags::WAL);

    /// Classify a flag set. Returns `None` unless exactly one kind bit is
    /// present.
    #[must_use]
    pub fn from_flags(flags: OpenFlags) -> Option<Self> {
        let kind_bits = flags & Self::KIND_MASK;
        if kind_bits.bits().count_ones() != 1 {
            return None;
        }
        let kinds = [
            (OpenFlags::MAIN_DB, Self::MainDb),
            (OpenFlags::MAIN_JOURNAL, Self::MainJournal),
            (OpenFlags::TEMP_DB, Self::TempDb),
            (OpenFlags::TEMP_JOURNAL, Self::TempJournal),
            (OpenFlags::TRANSIENT_DB, Self::TransientDb),
            (OpenFlags::SUBJOURNAL, Self::SubJournal),
            (OpenFlags::SUPER_JOURNAL, Self::SuperJournal),
            (OpenFlags::WAL, Self::Wal),
        ];
        kinds
            .into_iter()
            .find(|(bit, _)| kind_bits == *bit)
            .map(|(_, kind)| kind)
    }

    /// Encode as a single byte for the metadata record.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::MainDb => 0,
            Self::MainJournal => 1,
            Self::TempDb => 2,
            Self::TempJournal => 3,
            Self::TransientDb => 4,
            Self::SubJournal => 5,
            Self::SuperJournal => 6,
            Self::Wal => 7,
        }
    }

    /// Decode a metadata kind byte.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::MainDb),
            1 => Some(Self::MainJournal),
            2 => Some(Self::TempDb),
            3 => Some(Self::TempJournal),
            4 => Some(Self::TransientDb),
            5 => Some(Self::SubJournal),
            6 => Some(Self::SuperJournal),
            7 => Some(Self::Wal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn lock_level_roundtrip() {
        for level in [
            LockLevel::None,
            LockLevel::Shared,
            LockLevel::Reserved,
            LockLevel::Pending,
            LockLevel::Exclusive,
        ] {
            assert_eq!(LockLevel::from_u8(level as u8), Some(level));
        }
        assert_eq!(LockLevel::from_u8(9), None);
    }

    #[test]
    fn block_size_validation() {
        assert_eq!(BlockSize::new(4096), Some(BlockSize::DEFAULT));
        assert_eq!(BlockSize::new(512).map(BlockSize::get), Some(512));
        assert_eq!(BlockSize::new(65536).map(BlockSize::get), Some(65536));
        assert_eq!(BlockSize::new(0), None);
        assert_eq!(BlockSize::new(256), None);
        assert_eq!(BlockSize::new(3000), None);
        assert_eq!(BlockSize::new(131_072), None);
    }

    #[test]
    fn file_kind_from_flags() {
        let flags = OpenFlags::MAIN_DB | OpenFlags::CREATE | OpenFlags::READWRITE;
        assert_eq!(FileKind::from_flags(flags), Some(FileKind::MainDb));

        let flags = OpenFlags::MAIN_JOURNAL | OpenFlags::CREATE;
        assert_eq!(FileKind::from_flags(flags), Some(FileKind::MainJournal));

        let flags = OpenFlags::WAL | OpenFlags::READWRITE;
        assert_eq!(FileKind::from_flags(flags), Some(FileKind::Wal));
    }

    #[test]
    fn file_kind_requires_exactly_one_bit() {
        // No kind bit at all.
        assert_eq!(FileKind::from_flags(OpenFlags::READWRITE), None);
        // Two kind bits.
        let flags = OpenFlags::MAIN_DB | OpenFlags::TEMP_DB;
        assert_eq!(FileKind::from_flags(flags), None);
    }

    #[test]
    fn file_kind_byte_roundtrip() {
        for kind in [
            FileKind::MainDb,
            FileKind::MainJournal,
            FileKind::TempDb,
            FileKind::TempJournal,
            FileKind::TransientDb,
            FileKind::SubJournal,
            FileKind::SuperJournal,
            FileKind::Wal,
        ] {
            assert_eq!(FileKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(FileKind::from_u8(8), None);
    }
}
