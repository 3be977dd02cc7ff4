#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Logical page number within a paged file.
///
/// Page numbers are signed on disk so that list sentinels fit in the same
/// field: `-1` terminates free lists and `-2` marks a used page.
/// Examples:
/// - `let meta: PageNum = 0;`
/// - `let first_data: PageNum = 1;`
pub type PageNum = i32;

/// Sentinel page number meaning "no page" / end of a page list.
pub const NO_PAGE: PageNum = -1;

/// Handle for an entry in the open-file table.
/// Examples:
/// - `let fd = FileId(0);`
/// - `let fd = FileId(19); // last slot of the default table`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub usize);

/// Identifier of a record within a heap file: the page it lives on and its
/// slot in that page's directory.
/// Examples:
/// - `let rid = Rid { page: 1, slot: 0 };`
/// - `let rid = Rid { page: 42, slot: 17 };`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page: PageNum,
    pub slot: i16,
}

/// Canonical error type shared by every storage layer.
///
/// Lower-layer errors propagate through `?` unchanged; there is no
/// per-layer re-wrapping. End-of-iteration is not an error (those APIs
/// return `Option`).
#[derive(Error, Debug)]
pub enum Error {
    #[error("no free buffer frame")]
    NoBuf,
    #[error("page already fixed in the buffer")]
    PageFixed,
    #[error("page not in the buffer")]
    PageNotInBuf,
    #[error("page already unfixed")]
    PageUnfixed,
    #[error("page already in the buffer")]
    PageInBuf,
    #[error("incomplete read of file header")]
    HdrRead,
    #[error("incomplete write of file header")]
    HdrWrite,
    #[error("incomplete read of page")]
    IncompleteRead,
    #[error("incomplete write of page")]
    IncompleteWrite,
    #[error("invalid page number")]
    InvalidPage,
    #[error("file already open")]
    FileOpen,
    #[error("open file table is full")]
    FtabFull,
    #[error("invalid file descriptor")]
    Fd,
    #[error("page already free")]
    PageFree,
    #[error("hash table entry not found")]
    HashNotFound,
    #[error("page already in hash table")]
    HashPageExist,
    #[error("invalid attribute type")]
    InvalidAttrType,
    #[error("invalid attribute length")]
    InvalidAttrLength,
    #[error("invalid attribute value")]
    InvalidValue,
    #[error("entry not found")]
    NotFound,
    #[error("invalid scan descriptor")]
    InvalidScanDesc,
    #[error("scan table is full")]
    ScanTabFull,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Buffer-pool eviction policy. Both scan the used list for the first
/// unpinned frame; they differ only in the end they start from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Eviction {
    /// Evict the least recently used unpinned frame (list tail).
    Lru,
    /// Evict the most recently used unpinned frame (list head).
    Mru,
}

/// Runtime configuration for the storage engine.
///
/// # Example
/// ```
/// use common::{Config, Eviction};
///
/// let config = Config::builder()
///     .page_size(8192)
///     .max_bufs(64)
///     .eviction(Eviction::Mru)
///     .build();
/// assert_eq!(config.ftab_size, 20);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Byte payload of a page as seen by the layers above the page file.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Hard cap on the number of buffer-pool frames.
    #[builder(default = 40)]
    pub max_bufs: usize,
    /// Number of slots in the open-file table.
    #[builder(default = 20)]
    pub ftab_size: usize,
    /// Number of cursors an index scan table holds.
    #[builder(default = 20)]
    pub max_scans: usize,
    /// Bucket count of the frame hash table.
    #[builder(default = 20)]
    pub hash_buckets: usize,
    /// Largest indexable attribute length in bytes.
    #[builder(default = 256)]
    pub max_attr_len: usize,
    /// Which end of the used list eviction scans from.
    #[builder(default = Eviction::Lru)]
    pub eviction: Eviction,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_bufs: 40,
            ftab_size: 20,
            max_scans: 20,
            hash_buckets: 20,
            max_attr_len: 256,
            eviction: Eviction::Lru,
        }
    }
}
