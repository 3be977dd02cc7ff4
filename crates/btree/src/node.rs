//! Internal-node layout and in-page operations.
//!
//! An internal page holds its header, a first child page number, then
//! `num_keys` entries `(key_bytes, child)` in ascending key order. Child
//! `i` sits at `INT_HDR_BYTES + i * (attr_len + 4)`; key `i` directly
//! after child `i`.

use crate::KeyType;
use bincode::config::{self, Config as BincodeConfig};
use bincode::serde::{decode_from_slice, encode_into_slice};
use common::{Error, PageNum, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub(crate) const INT_HDR_BYTES: usize = 7;
pub(crate) const INT_TAG: u8 = b'i';

fn codec() -> impl BincodeConfig {
    config::legacy()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IntHeader {
    pub page_type: u8,
    pub num_keys: u16,
    pub max_keys: u16,
    pub attr_length: u16,
}

pub(crate) fn read_header(page: &[u8]) -> Result<IntHeader> {
    let (hdr, read) =
        decode_from_slice(&page[..INT_HDR_BYTES], codec()).map_err(|_| Error::HdrRead)?;
    debug_assert_eq!(read, INT_HDR_BYTES);
    Ok(hdr)
}

pub(crate) fn write_header(page: &mut [u8], hdr: &IntHeader) -> Result<()> {
    let written =
        encode_into_slice(hdr, &mut page[..INT_HDR_BYTES], codec()).map_err(|_| Error::HdrWrite)?;
    debug_assert_eq!(written, INT_HDR_BYTES);
    Ok(())
}

fn entry_size(attr_len: usize) -> usize {
    attr_len + 4
}

pub(crate) fn child_at(page: &[u8], idx: usize, attr_len: usize) -> PageNum {
    let off = INT_HDR_BYTES + idx * entry_size(attr_len);
    PageNum::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
}

fn set_child_at(page: &mut [u8], idx: usize, attr_len: usize, child: PageNum) {
    let off = INT_HDR_BYTES + idx * entry_size(attr_len);
    page[off..off + 4].copy_from_slice(&child.to_le_bytes());
}

pub(crate) fn key_at(page: &[u8], idx: usize, attr_len: usize) -> &[u8] {
    let off = INT_HDR_BYTES + 4 + idx * entry_size(attr_len);
    &page[off..off + attr_len]
}

fn set_key_at(page: &mut [u8], idx: usize, attr_len: usize, key: &[u8]) {
    let off = INT_HDR_BYTES + 4 + idx * entry_size(attr_len);
    page[off..off + attr_len].copy_from_slice(key);
}

/// Child index to descend into: right of the largest key `<=` probe,
/// child 0 when the probe is below every key.
pub(crate) fn search(page: &[u8], hdr: &IntHeader, key_type: KeyType, probe: &[u8]) -> usize {
    let attr = hdr.attr_length as usize;
    let mut lo = 0usize;
    let mut hi = hdr.num_keys as usize;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if key_type.compare(probe, key_at(page, mid, attr)) == Ordering::Less {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

/// Insert `(key, child)` so that `child` becomes the subtree right of
/// `key`, at the position recorded for the split child (`child_idx`).
/// The caller checks capacity and writes the header back.
pub(crate) fn insert_entry(
    page: &mut [u8],
    hdr: &mut IntHeader,
    child_idx: usize,
    key: &[u8],
    child: PageNum,
) {
    let attr = hdr.attr_length as usize;
    let es = entry_size(attr);
    let start = INT_HDR_BYTES + 4 + child_idx * es;
    let end = INT_HDR_BYTES + 4 + hdr.num_keys as usize * es;
    page.copy_within(start..end, start + es);
    set_key_at(page, child_idx, attr, key);
    set_child_at(page, child_idx + 1, attr, child);
    hdr.num_keys += 1;
}

/// Write a complete internal node: `children.len()` must be
/// `keys.len() + 1`.
pub(crate) fn write_node(
    page: &mut [u8],
    attr_len: usize,
    max_keys: u16,
    keys: &[&[u8]],
    children: &[PageNum],
) -> Result<()> {
    debug_assert_eq!(children.len(), keys.len() + 1);
    write_header(
        page,
        &IntHeader {
            page_type: INT_TAG,
            num_keys: keys.len() as u16,
            max_keys,
            attr_length: attr_len as u16,
        },
    )?;
    set_child_at(page, 0, attr_len, children[0]);
    for (i, key) in keys.iter().enumerate() {
        set_key_at(page, i, attr_len, key);
        set_child_at(page, i + 1, attr_len, children[i + 1]);
    }
    Ok(())
}

/// A brand-new root after a root split: one key, two children.
pub(crate) fn fill_root(
    page: &mut [u8],
    left: PageNum,
    right: PageNum,
    key: &[u8],
    attr_len: usize,
    max_keys: u16,
) -> Result<()> {
    write_node(page, attr_len, max_keys, &[key], &[left, right])
}

/// Split a full node around a pending `(sep, new_child)` entry: the
/// combined sequence is dealt into two `max_keys / 2`-key nodes and the
/// median key is returned for promotion. The median's right child becomes
/// the right node's first child. Returns the rebuilt left page and the
/// promoted key; the right node is written into `right`.
pub(crate) fn split(
    src: &[u8],
    hdr: &IntHeader,
    child_idx: usize,
    sep: &[u8],
    new_child: PageNum,
    right: &mut [u8],
    attr_len: usize,
    page_size: usize,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let m = hdr.num_keys as usize;
    let mut keys: Vec<Vec<u8>> = (0..m).map(|i| key_at(src, i, attr_len).to_vec()).collect();
    let mut children: Vec<PageNum> = (0..=m).map(|i| child_at(src, i, attr_len)).collect();
    keys.insert(child_idx, sep.to_vec());
    children.insert(child_idx + 1, new_child);

    let half = hdr.max_keys as usize / 2;
    let median = keys[half].clone();

    let mut left = vec![0u8; page_size];
    let left_keys: Vec<&[u8]> = keys[..half].iter().map(|k| k.as_slice()).collect();
    write_node(&mut left, attr_len, hdr.max_keys, &left_keys, &children[..=half])?;

    let right_keys: Vec<&[u8]> = keys[half + 1..].iter().map(|k| k.as_slice()).collect();
    write_node(right, attr_len, hdr.max_keys, &right_keys, &children[half + 1..])?;

    Ok((left, median))
}
