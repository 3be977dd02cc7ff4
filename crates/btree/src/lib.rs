//! B+-tree secondary index over the paged-file layer.
//!
//! An index file `<relation>.<index_no>` maps fixed-length attribute
//! values to record identifiers. Duplicates of a key share one key record
//! in a leaf, chaining their RIDs through the leaf's chain-node region.
//! Page 0 is always the root: root splits copy the old root aside and
//! write the new root back into page 0, so the root never moves.
//!
//! Scans run over the leaf chain through a bounded cursor table and
//! support equality, range and inequality operators; a key-sorted stream
//! can be bulk-loaded bottom-up.
//!
//! # Example
//!
//! ```no_run
//! use btree::{BTreeIndex, KeyType, ScanOp};
//! use common::Config;
//! use pagefile::PagedFiles;
//! use std::path::Path;
//!
//! let pf = PagedFiles::new(Config::default());
//! BTreeIndex::create(&pf, Path::new("/tmp/emp"), 0, KeyType::Int, 4).unwrap();
//! let mut index = BTreeIndex::open(&pf, Path::new("/tmp/emp"), 0, KeyType::Int, 4).unwrap();
//! index.insert_entry(&7i32.to_le_bytes(), 42).unwrap();
//! let sd = index.open_scan(ScanOp::Equal, Some(&7i32.to_le_bytes())).unwrap();
//! assert_eq!(index.find_next(sd).unwrap(), Some(42));
//! index.close_scan(sd).unwrap();
//! index.close().unwrap();
//! ```

mod bulk;
mod leaf;
mod node;
mod scan;

#[cfg(test)]
mod tests;

pub use scan::ScanOp;

use common::{Error, FileId, PageNum, Result};
use pagefile::{PageGuard, PagedFiles};
use scan::ScanState;
use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};

const ROOT_PAGE: PageNum = 0;

/// Type of the indexed attribute. `Int` and `Float` are 4-byte
/// little-endian scalars; `Bytes` is a fixed-length byte string compared
/// bytewise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Int,
    Float,
    Bytes,
}

impl KeyType {
    pub fn tag(self) -> u8 {
        match self {
            KeyType::Int => b'i',
            KeyType::Float => b'f',
            KeyType::Bytes => b'c',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'i' => Ok(KeyType::Int),
            b'f' => Ok(KeyType::Float),
            b'c' => Ok(KeyType::Bytes),
            _ => Err(Error::InvalidAttrType),
        }
    }

    pub(crate) fn compare(self, probe: &[u8], stored: &[u8]) -> Ordering {
        match self {
            KeyType::Int => {
                let probe = i32::from_le_bytes(probe[..4].try_into().unwrap());
                let stored = i32::from_le_bytes(stored[..4].try_into().unwrap());
                probe.cmp(&stored)
            }
            KeyType::Float => {
                let probe = f32::from_le_bytes(probe[..4].try_into().unwrap());
                let stored = f32::from_le_bytes(stored[..4].try_into().unwrap());
                probe.partial_cmp(&stored).unwrap_or(Ordering::Equal)
            }
            KeyType::Bytes => probe.cmp(stored),
        }
    }
}

/// A B+-tree index bound to an open paged file.
pub struct BTreeIndex {
    pf: PagedFiles,
    fd: FileId,
    key_type: KeyType,
    attr_len: usize,
    page_size: usize,
    scans: Vec<ScanState>,
}

/// `<relation>.<index_no>`
fn index_path(relation: &Path, index_no: u32) -> PathBuf {
    let mut name = relation.as_os_str().to_os_string();
    name.push(format!(".{index_no}"));
    PathBuf::from(name)
}

fn max_keys_for(page_size: usize, attr_len: usize) -> u16 {
    let raw = (page_size - node::INT_HDR_BYTES - 4) / (4 + attr_len);
    (raw & !1) as u16
}

fn check_attr(pf: &PagedFiles, key_type: KeyType, attr_len: usize) -> Result<()> {
    let cfg = pf.config();
    if attr_len == 0 || attr_len > 255 || attr_len > cfg.max_attr_len {
        return Err(Error::InvalidAttrLength);
    }
    if key_type != KeyType::Bytes && attr_len != 4 {
        return Err(Error::InvalidAttrLength);
    }
    Ok(())
}

impl BTreeIndex {
    /// Create an index file whose single page is an empty root leaf.
    pub fn create(
        pf: &PagedFiles,
        relation: &Path,
        index_no: u32,
        key_type: KeyType,
        attr_len: usize,
    ) -> Result<()> {
        check_attr(pf, key_type, attr_len)?;
        let page_size = pf.page_size();
        assert!(page_size <= u16::MAX as usize, "chain offsets are 16-bit");
        let path = index_path(relation, index_no);
        pf.create_file(&path)?;
        let fd = pf.open_file(&path)?;
        let result = (|| {
            let (pn, guard) = pf.alloc_page(fd)?;
            debug_assert_eq!(pn, ROOT_PAGE);
            leaf::write_header(
                &mut guard.bytes_mut(),
                &leaf::LeafHeader::empty(
                    attr_len as u16,
                    max_keys_for(page_size, attr_len),
                    page_size,
                ),
            )?;
            guard.release(true)
        })();
        let closed = pf.close_file(fd);
        result.and(closed)
    }

    /// Open an index, validating the supplied attribute length against the
    /// stored root header.
    pub fn open(
        pf: &PagedFiles,
        relation: &Path,
        index_no: u32,
        key_type: KeyType,
        attr_len: usize,
    ) -> Result<Self> {
        check_attr(pf, key_type, attr_len)?;
        let fd = pf.open_file(&index_path(relation, index_no))?;
        let stored: Result<u16> = (|| {
            let guard = pf.get_this_page(fd, ROOT_PAGE)?;
            let bytes = guard.bytes();
            let stored = if bytes[0] == leaf::LEAF_TAG {
                leaf::read_header(&bytes)?.attr_length
            } else {
                node::read_header(&bytes)?.attr_length
            };
            drop(bytes);
            guard.release(false)?;
            Ok(stored)
        })();
        let stored = match stored {
            Ok(v) => v,
            Err(e) => {
                let _ = pf.close_file(fd);
                return Err(e);
            }
        };
        if stored as usize != attr_len {
            let _ = pf.close_file(fd);
            return Err(Error::InvalidAttrLength);
        }
        let max_scans = pf.config().max_scans;
        Ok(Self {
            pf: pf.clone(),
            fd,
            key_type,
            attr_len,
            page_size: pf.page_size(),
            scans: (0..max_scans).map(|_| ScanState::free()).collect(),
        })
    }

    pub fn close(self) -> Result<()> {
        self.pf.close_file(self.fd)
    }

    /// Remove the index file. It must not be open.
    pub fn destroy(pf: &PagedFiles, relation: &Path, index_no: u32) -> Result<()> {
        pf.destroy_file(&index_path(relation, index_no))
    }

    /// Build a fresh index from a key-sorted `(key, rec_id)` stream in one
    /// bottom-up pass. Equivalent to creating the index and inserting
    /// every pair.
    pub fn bulk_load(
        pf: &PagedFiles,
        relation: &Path,
        index_no: u32,
        key_type: KeyType,
        attr_len: usize,
        pairs: impl IntoIterator<Item = (Vec<u8>, i32)>,
    ) -> Result<()> {
        Self::create(pf, relation, index_no, key_type, attr_len)?;
        bulk::build(
            pf,
            &index_path(relation, index_no),
            key_type,
            attr_len,
            pairs,
        )
    }

    /// Insert a `(value, rec_id)` pair, splitting up the tree as needed.
    ///
    /// Fails with `InvalidValue` when the value's RID chain has already
    /// grown to a full leaf: a chain cannot span leaves, so splitting
    /// would free nothing for it. The tree is left unchanged.
    pub fn insert_entry(&mut self, value: &[u8], rec_id: i32) -> Result<()> {
        self.check_value(value)?;
        let (pn, pos, guard, mut path) = self.locate_leaf(value)?;
        let (pos, found) = match pos {
            Ok(p) => (p, true),
            Err(p) => (p, false),
        };
        let inserted = leaf::insert(
            &mut guard.bytes_mut(),
            value,
            rec_id,
            pos,
            found,
            self.page_size,
        )?;
        if inserted {
            return guard.release(true);
        }
        let propagate = self.split_leaf(pn, &guard, pos, found, value, rec_id)?;
        guard.release(true)?;
        if let Some((sep, new_pn)) = propagate {
            self.add_to_parent(&mut path, sep, new_pn)?;
        }
        Ok(())
    }

    /// Remove `rec_id` from the chain of `value`; the key disappears from
    /// its leaf when the chain empties. Internal nodes are not rebalanced.
    pub fn delete_entry(&mut self, value: &[u8], rec_id: i32) -> Result<()> {
        self.check_value(value)?;
        let (_pn, pos, guard, _path) = self.locate_leaf(value)?;
        let Ok(pos) = pos else {
            guard.release(false)?;
            return Err(Error::NotFound);
        };
        let present = {
            let bytes = guard.bytes();
            let hdr = leaf::read_header(&bytes)?;
            leaf::chain_contains(&bytes, &hdr, pos, rec_id)
        };
        if !present {
            guard.release(false)?;
            return Err(Error::NotFound);
        }
        leaf::remove_rid(&mut guard.bytes_mut(), pos, rec_id)?;
        guard.release(true)
    }

    /// Render the tree level by level, for debugging and tests.
    pub fn dump(&self, w: &mut impl Write) -> Result<()> {
        let mut queue = std::collections::VecDeque::from([(ROOT_PAGE, 0usize)]);
        while let Some((pn, depth)) = queue.pop_front() {
            let guard = self.pf.get_this_page(self.fd, pn)?;
            {
                let bytes = guard.bytes();
                let pad = "  ".repeat(depth);
                if bytes[0] == leaf::LEAF_TAG {
                    let hdr = leaf::read_header(&bytes)?;
                    write!(w, "{pad}leaf p{pn} ->{}:", hdr.next_leaf).map_err(Error::from)?;
                    for i in 0..hdr.num_keys as usize {
                        let rids = leaf::chain_rids(&bytes, &hdr, i).len();
                        write!(
                            w,
                            " {}x{rids}",
                            self.fmt_key(leaf::key_at(&bytes, i, self.attr_len))
                        )
                        .map_err(Error::from)?;
                    }
                    writeln!(w).map_err(Error::from)?;
                } else {
                    let hdr = node::read_header(&bytes)?;
                    write!(w, "{pad}node p{pn}: p{}", node::child_at(&bytes, 0, self.attr_len))
                        .map_err(Error::from)?;
                    queue.push_back((node::child_at(&bytes, 0, self.attr_len), depth + 1));
                    for i in 0..hdr.num_keys as usize {
                        let child = node::child_at(&bytes, i + 1, self.attr_len);
                        write!(
                            w,
                            " <{} p{child}",
                            self.fmt_key(node::key_at(&bytes, i, self.attr_len))
                        )
                        .map_err(Error::from)?;
                        queue.push_back((child, depth + 1));
                    }
                    writeln!(w).map_err(Error::from)?;
                }
            }
            guard.release(false)?;
        }
        Ok(())
    }

    fn fmt_key(&self, key: &[u8]) -> String {
        match self.key_type {
            KeyType::Int => i32::from_le_bytes(key[..4].try_into().unwrap()).to_string(),
            KeyType::Float => f32::from_le_bytes(key[..4].try_into().unwrap()).to_string(),
            KeyType::Bytes => key.escape_ascii().to_string(),
        }
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.attr_len {
            return Err(Error::InvalidValue);
        }
        Ok(())
    }

    /// Descend from the root to the leaf covering `value`, recording the
    /// `(page, child index)` path for split propagation. The leaf comes
    /// back pinned with the binary-search outcome.
    #[allow(clippy::type_complexity)]
    fn locate_leaf(
        &self,
        value: &[u8],
    ) -> Result<(
        PageNum,
        std::result::Result<usize, usize>,
        PageGuard,
        Vec<(PageNum, usize)>,
    )> {
        let mut pn = ROOT_PAGE;
        let mut guard = self.pf.get_this_page(self.fd, pn)?;
        let mut path = Vec::new();
        loop {
            let is_leaf = guard.bytes()[0] == leaf::LEAF_TAG;
            if is_leaf {
                let attr_ok = {
                    let bytes = guard.bytes();
                    leaf::read_header(&bytes)?.attr_length as usize == self.attr_len
                };
                if !attr_ok {
                    guard.release(false)?;
                    return Err(Error::InvalidAttrLength);
                }
                let pos = {
                    let bytes = guard.bytes();
                    let hdr = leaf::read_header(&bytes)?;
                    leaf::search(&bytes, &hdr, self.key_type, value)
                };
                return Ok((pn, pos, guard, path));
            }
            let attr_ok = {
                let bytes = guard.bytes();
                node::read_header(&bytes)?.attr_length as usize == self.attr_len
            };
            if !attr_ok {
                guard.release(false)?;
                return Err(Error::InvalidAttrLength);
            }
            let (idx, child) = {
                let bytes = guard.bytes();
                let hdr = node::read_header(&bytes)?;
                let idx = node::search(&bytes, &hdr, self.key_type, value);
                (idx, node::child_at(&bytes, idx, self.attr_len))
            };
            path.push((pn, idx));
            guard.release(false)?;
            pn = child;
            guard = self.pf.get_this_page(self.fd, pn)?;
        }
    }

    /// Split a full leaf around the pending insert. Returns the separator
    /// and new right page for the parent, or `None` when the leaf was the
    /// root (the new root is already in place on page 0).
    fn split_leaf(
        &self,
        pn: PageNum,
        guard: &PageGuard,
        pos: usize,
        found: bool,
        value: &[u8],
        rec_id: i32,
    ) -> Result<Option<(Vec<u8>, PageNum)>> {
        let hdr = leaf::read_header(&guard.bytes())?;
        let n = hdr.num_keys as usize;
        let half = n / 2;

        let mut left = vec![0u8; self.page_size];
        leaf::compact(&guard.bytes(), &mut left, &hdr, 0, half, self.page_size)?;
        let (right_pn, right_guard) = self.pf.alloc_page(self.fd)?;
        {
            let mut right = right_guard.bytes_mut();
            right.fill(0);
            leaf::compact(&guard.bytes(), &mut right, &hdr, half, n, self.page_size)?;
        }
        log::debug!("split leaf p{pn}: {half}+{} keys, right p{right_pn}", n - half);

        let placed = if pos < half {
            leaf::insert(&mut left, value, rec_id, pos, found, self.page_size)?
        } else {
            leaf::insert(
                &mut right_guard.bytes_mut(),
                value,
                rec_id,
                pos - half,
                found,
                self.page_size,
            )?
        };
        if !placed {
            // One key's chain has grown to a full leaf, so splitting frees
            // nothing for it. A chain cannot span leaves; reject the entry
            // before the original page is touched.
            right_guard.release(false)?;
            self.pf.dispose_page(self.fd, right_pn)?;
            return Err(Error::InvalidValue);
        }

        {
            let mut left_hdr = leaf::read_header(&left)?;
            left_hdr.next_leaf = right_pn;
            leaf::write_header(&mut left, &left_hdr)?;
        }
        guard.bytes_mut().copy_from_slice(&left);

        let sep = leaf::key_at(&right_guard.bytes(), 0, self.attr_len).to_vec();

        if pn == ROOT_PAGE {
            let (left_pn, copy_guard) = self.pf.alloc_page(self.fd)?;
            copy_guard.bytes_mut().copy_from_slice(&guard.bytes());
            copy_guard.release(true)?;
            node::fill_root(
                &mut guard.bytes_mut(),
                left_pn,
                right_pn,
                &sep,
                self.attr_len,
                hdr.max_keys,
            )?;
            right_guard.release(true)?;
            Ok(None)
        } else {
            right_guard.release(true)?;
            Ok(Some((sep, right_pn)))
        }
    }

    /// Route a `(separator, new child)` pair up the recorded path,
    /// splitting internal nodes as they fill. A root split writes the new
    /// root back into page 0.
    fn add_to_parent(
        &self,
        path: &mut Vec<(PageNum, usize)>,
        mut sep: Vec<u8>,
        mut child: PageNum,
    ) -> Result<()> {
        loop {
            let (parent_pn, child_idx) = path.pop().expect("split propagation stays below the root");
            let guard = self.pf.get_this_page(self.fd, parent_pn)?;
            let hdr = node::read_header(&guard.bytes())?;

            if hdr.num_keys < hdr.max_keys {
                let mut bytes = guard.bytes_mut();
                let mut hdr = hdr;
                node::insert_entry(&mut bytes, &mut hdr, child_idx, &sep, child);
                node::write_header(&mut bytes, &hdr)?;
                drop(bytes);
                return guard.release(true);
            }

            let (new_pn, new_guard) = self.pf.alloc_page(self.fd)?;
            let (left, median) = {
                let src = guard.bytes();
                let mut right = new_guard.bytes_mut();
                right.fill(0);
                node::split(
                    &src,
                    &hdr,
                    child_idx,
                    &sep,
                    child,
                    &mut right,
                    self.attr_len,
                    self.page_size,
                )?
            };
            log::debug!("split internal p{parent_pn}, right p{new_pn}");

            if parent_pn == ROOT_PAGE {
                let (copy_pn, copy_guard) = self.pf.alloc_page(self.fd)?;
                copy_guard.bytes_mut().copy_from_slice(&left);
                copy_guard.release(true)?;
                node::fill_root(
                    &mut guard.bytes_mut(),
                    copy_pn,
                    new_pn,
                    &median,
                    self.attr_len,
                    hdr.max_keys,
                )?;
                guard.release(true)?;
                return new_guard.release(true);
            }

            guard.bytes_mut().copy_from_slice(&left);
            guard.release(true)?;
            new_guard.release(true)?;
            sep = median;
            child = new_pn;
        }
    }

    /// Leftmost leaf, found by walking first-child pointers from the root.
    fn leftmost_leaf(&self) -> Result<PageNum> {
        let mut pn = ROOT_PAGE;
        loop {
            let guard = self.pf.get_this_page(self.fd, pn)?;
            let next = {
                let bytes = guard.bytes();
                if bytes[0] == leaf::LEAF_TAG {
                    None
                } else {
                    Some(node::child_at(&bytes, 0, self.attr_len))
                }
            };
            guard.release(false)?;
            match next {
                None => return Ok(pn),
                Some(child) => pn = child,
            }
        }
    }
}
