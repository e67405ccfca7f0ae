use thiserror::Error;

/// 64-bit block id within the underlying file. The top two bytes may carry
/// a sub-block tag (see `address`); the low 48 bits are the untagged id.
pub type Bid = u64;

/// Sentinel for "no block": all ones.
pub const BLK_NOT_FOUND: Bid = u64::MAX;

static_assertions::assert_eq_size!(Bid, u64);

pub const SECTOR_SIZE: usize = 512;

/// Footer byte stamped on freshly allocated index blocks so a block that was
/// allocated but never flushed is not read back as arbitrary garbage.
pub const BLK_MARKER_BNODE: u8 = 0xff;
pub const BLK_MARKER_SIZE: usize = 1;

/// Smallest sub-block class size. Classes double up to five times
/// (128, 256, 512, 1024, 2048 for a 4 KiB node).
pub const MIN_SUBBLOCK_SIZE: u32 = 128;
pub const MAX_SUBBLOCK_CLASSES: usize = 5;

/// Read-cache entries older than this many flush barriers are evicted.
pub const BLOCK_AGE_LIMIT: u8 = 1;

pub const HBTRIE_MAX_KEYLEN: usize = 3840;

/// Reserved space when deciding whether a skipped prefix still fits in a
/// single sub-tree's metadata section.
pub const HBTRIE_HEADROOM: u32 = 256;

#[derive(Debug, Error)]
pub enum TrieError {
    /// Expected miss.
    #[error("key not found")]
    NotFound,
    /// Generic non-fatal failure (remove of an absent key, exhausted
    /// iterator, metadata that cannot fit a node).
    #[error("operation failed")]
    Fail,
    #[error("block read failed")]
    ReadFailed(#[source] std::io::Error),
    #[error("block write failed")]
    WriteFailed(#[source] std::io::Error),
    /// The chunk codec saw a remainder byte of zero.
    #[error("malformed chunk-aligned key")]
    MalformedKey,
    /// A node header disagrees with the trie configuration, or a stored
    /// document key does not reform.
    #[error("index is corrupted")]
    IndexCorrupted,
    /// The legacy node encoding (`ksize == (chunksize << 4) | valuelen`).
    #[error("index version not supported")]
    IndexVersionUnsupported,
}

impl TrieError {
    pub(crate) fn read_failed(msg: &str) -> TrieError {
        TrieError::ReadFailed(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
    }

    pub(crate) fn write_failed(msg: &str) -> TrieError {
        TrieError::WriteFailed(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, TrieError>;
