//! Leaf-page layout and in-page operations.
//!
//! A leaf holds its header, then key records `(key_bytes, chain_head)`
//! growing up, and RID-chain nodes `(rec_id: i32, next: u16)` growing down
//! from the page end. `rec_id_ptr` is the lowest allocated chain-node
//! offset, `key_ptr` the end of the key region; the gap between them is
//! the page's free space. Offset 0 is the header, so chain offset 0 acts
//! as the nil sentinel for both chain links and the node free list.

use crate::KeyType;
use bincode::config::{self, Config as BincodeConfig};
use bincode::serde::{decode_from_slice, encode_into_slice};
use common::{Error, PageNum, Result, NO_PAGE};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub(crate) const LEAF_HDR_BYTES: usize = 19;
pub(crate) const CHAIN_NODE_BYTES: usize = 6;
pub(crate) const LEAF_TAG: u8 = b'l';

/// End-of-chain / empty-free-list sentinel.
pub(crate) const NIL: u16 = 0;

fn codec() -> impl BincodeConfig {
    config::legacy()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeafHeader {
    pub page_type: u8,
    pub next_leaf: PageNum,
    pub rec_id_ptr: u16,
    pub key_ptr: u16,
    pub free_list_ptr: u16,
    pub num_in_free_list: u16,
    pub attr_length: u16,
    pub num_keys: u16,
    pub max_keys: u16,
}

impl LeafHeader {
    pub(crate) fn empty(attr_length: u16, max_keys: u16, page_size: usize) -> Self {
        Self {
            page_type: LEAF_TAG,
            next_leaf: NO_PAGE,
            rec_id_ptr: page_size as u16,
            key_ptr: LEAF_HDR_BYTES as u16,
            free_list_ptr: NIL,
            num_in_free_list: 0,
            attr_length,
            num_keys: 0,
            max_keys,
        }
    }

    /// Bytes of one key record: the key plus its chain-head field.
    pub(crate) fn rec_size(&self) -> usize {
        self.attr_length as usize + 2
    }

    /// Free bytes between the key region and the chain-node region.
    pub(crate) fn gap(&self) -> usize {
        (self.rec_id_ptr - self.key_ptr) as usize
    }
}

pub(crate) fn read_header(page: &[u8]) -> Result<LeafHeader> {
    let (hdr, read) =
        decode_from_slice(&page[..LEAF_HDR_BYTES], codec()).map_err(|_| Error::HdrRead)?;
    debug_assert_eq!(read, LEAF_HDR_BYTES);
    Ok(hdr)
}

pub(crate) fn write_header(page: &mut [u8], hdr: &LeafHeader) -> Result<()> {
    let written = encode_into_slice(hdr, &mut page[..LEAF_HDR_BYTES], codec())
        .map_err(|_| Error::HdrWrite)?;
    debug_assert_eq!(written, LEAF_HDR_BYTES);
    Ok(())
}

fn key_off(idx: usize, attr_len: usize) -> usize {
    LEAF_HDR_BYTES + idx * (attr_len + 2)
}

pub(crate) fn key_at(page: &[u8], idx: usize, attr_len: usize) -> &[u8] {
    let off = key_off(idx, attr_len);
    &page[off..off + attr_len]
}

pub(crate) fn chain_head(page: &[u8], idx: usize, attr_len: usize) -> u16 {
    let off = key_off(idx, attr_len) + attr_len;
    u16::from_le_bytes([page[off], page[off + 1]])
}

fn set_chain_head(page: &mut [u8], idx: usize, attr_len: usize, head: u16) {
    let off = key_off(idx, attr_len) + attr_len;
    page[off..off + 2].copy_from_slice(&head.to_le_bytes());
}

/// `(rec_id, next)` of the chain node at `off`.
pub(crate) fn chain_node(page: &[u8], off: u16) -> (i32, u16) {
    let off = off as usize;
    let rec_id = i32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]]);
    let next = u16::from_le_bytes([page[off + 4], page[off + 5]]);
    (rec_id, next)
}

fn write_chain_node(page: &mut [u8], off: u16, rec_id: i32, next: u16) {
    let off = off as usize;
    page[off..off + 4].copy_from_slice(&rec_id.to_le_bytes());
    page[off + 4..off + 6].copy_from_slice(&next.to_le_bytes());
}

fn set_chain_next(page: &mut [u8], off: u16, next: u16) {
    let off = off as usize + 4;
    page[off..off + 2].copy_from_slice(&next.to_le_bytes());
}

/// Binary search over the leaf's keys: `Ok(idx)` on a hit, `Err(idx)` with
/// the insertion position otherwise.
pub(crate) fn search(
    page: &[u8],
    hdr: &LeafHeader,
    key_type: KeyType,
    probe: &[u8],
) -> std::result::Result<usize, usize> {
    let attr = hdr.attr_length as usize;
    let mut lo = 0usize;
    let mut hi = hdr.num_keys as usize;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match key_type.compare(probe, key_at(page, mid, attr)) {
            Ordering::Less => hi = mid,
            Ordering::Greater => lo = mid + 1,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

/// Insert `(value, rec_id)` at `pos`, chaining onto an existing key when
/// `found`. Returns `Ok(false)` when the page has no room even after an
/// in-page compaction; the caller must split.
pub(crate) fn insert(
    page: &mut [u8],
    value: &[u8],
    rec_id: i32,
    pos: usize,
    found: bool,
    page_size: usize,
) -> Result<bool> {
    let mut hdr = read_header(page)?;
    let rs = hdr.rec_size();
    if found {
        if hdr.free_list_ptr == NIL && hdr.gap() < CHAIN_NODE_BYTES {
            return Ok(false);
        }
        insert_rid(page, &mut hdr, pos, rec_id);
        write_header(page, &hdr)?;
        return Ok(true);
    }

    let need = rs + CHAIN_NODE_BYTES;
    if hdr.free_list_ptr == NIL {
        if hdr.gap() < need {
            return Ok(false);
        }
        insert_key(page, &mut hdr, pos, value, rec_id);
    } else if hdr.gap() > rs {
        // The chain node comes off the free list; only the key record
        // needs fresh space.
        insert_key(page, &mut hdr, pos, value, rec_id);
    } else if hdr.num_in_free_list as usize * CHAIN_NODE_BYTES + hdr.gap() > need {
        // Enough slack exists in freed chain nodes: rebuild the page and
        // retry.
        let mut rebuilt = vec![0u8; page.len()];
        compact(page, &mut rebuilt, &hdr, 0, hdr.num_keys as usize, page_size)?;
        page.copy_from_slice(&rebuilt);
        hdr = read_header(page)?;
        insert_key(page, &mut hdr, pos, value, rec_id);
    } else {
        return Ok(false);
    }
    write_header(page, &hdr)?;
    Ok(true)
}

/// Prepend `rec_id` to the chain of the key at `pos`, reusing a freed
/// chain node when one exists.
fn insert_rid(page: &mut [u8], hdr: &mut LeafHeader, pos: usize, rec_id: i32) {
    let attr = hdr.attr_length as usize;
    let node = if hdr.free_list_ptr == NIL {
        hdr.rec_id_ptr -= CHAIN_NODE_BYTES as u16;
        hdr.rec_id_ptr
    } else {
        let off = hdr.free_list_ptr;
        hdr.num_in_free_list -= 1;
        hdr.free_list_ptr = chain_node(page, off).1;
        off
    };
    let old_head = chain_head(page, pos, attr);
    set_chain_head(page, pos, attr, node);
    write_chain_node(page, node, rec_id, old_head);
}

fn insert_key(page: &mut [u8], hdr: &mut LeafHeader, pos: usize, value: &[u8], rec_id: i32) {
    let attr = hdr.attr_length as usize;
    let rs = attr + 2;
    let start = key_off(pos, attr);
    let end = key_off(hdr.num_keys as usize, attr);
    page.copy_within(start..end, start + rs);
    hdr.key_ptr += rs as u16;
    page[start..start + attr].copy_from_slice(value);
    set_chain_head(page, pos, attr, NIL);
    insert_rid(page, hdr, pos, rec_id);
    hdr.num_keys += 1;
}

/// Does the chain of the key at `pos` contain `rec_id`?
pub(crate) fn chain_contains(page: &[u8], hdr: &LeafHeader, pos: usize, rec_id: i32) -> bool {
    let attr = hdr.attr_length as usize;
    let mut cur = chain_head(page, pos, attr);
    while cur != NIL {
        let (rid, next) = chain_node(page, cur);
        if rid == rec_id {
            return true;
        }
        cur = next;
    }
    false
}

/// Unlink `rec_id` from the chain of the key at `pos` and push the node
/// onto the page free list. When the chain empties, the key record is
/// removed (later keys shift left). `NotFound` if the chain has no such
/// RID; the page is untouched in that case.
pub(crate) fn remove_rid(page: &mut [u8], pos: usize, rec_id: i32) -> Result<()> {
    let mut hdr = read_header(page)?;
    let attr = hdr.attr_length as usize;

    enum Prev {
        Head,
        Node(u16),
    }
    let mut prev = Prev::Head;
    let mut cur = chain_head(page, pos, attr);
    while cur != NIL {
        let (rid, next) = chain_node(page, cur);
        if rid != rec_id {
            prev = Prev::Node(cur);
            cur = next;
            continue;
        }
        match prev {
            Prev::Head => set_chain_head(page, pos, attr, next),
            Prev::Node(p) => set_chain_next(page, p, next),
        }
        set_chain_next(page, cur, hdr.free_list_ptr);
        hdr.free_list_ptr = cur;
        hdr.num_in_free_list += 1;
        if chain_head(page, pos, attr) == NIL {
            let rs = attr + 2;
            let start = key_off(pos, attr);
            let end = key_off(hdr.num_keys as usize, attr);
            page.copy_within(start + rs..end, start);
            hdr.num_keys -= 1;
            hdr.key_ptr -= rs as u16;
        }
        return write_header(page, &hdr);
    }
    Err(Error::NotFound)
}

/// RIDs of the key at `pos`, in chain order.
pub(crate) fn chain_rids(page: &[u8], hdr: &LeafHeader, pos: usize) -> Vec<i32> {
    let attr = hdr.attr_length as usize;
    let mut out = Vec::new();
    let mut cur = chain_head(page, pos, attr);
    while cur != NIL {
        let (rid, next) = chain_node(page, cur);
        out.push(rid);
        cur = next;
    }
    out
}

/// Rebuild keys `[lo, hi)` of `src` into `dst` with a densely packed
/// chain region and an empty free list. Chain order is preserved. `dst`
/// must be a zeroed page-sized buffer (or a page being overwritten
/// wholesale).
pub(crate) fn compact(
    src: &[u8],
    dst: &mut [u8],
    hdr: &LeafHeader,
    lo: usize,
    hi: usize,
    page_size: usize,
) -> Result<()> {
    let attr = hdr.attr_length as usize;
    let rs = attr + 2;
    let mut rec_id_ptr = page_size as u16;
    for (dst_idx, src_idx) in (lo..hi).enumerate() {
        let from = key_off(src_idx, attr);
        let to = key_off(dst_idx, attr);
        dst[to..to + attr].copy_from_slice(&src[from..from + attr]);
        let rids = chain_rids(src, hdr, src_idx);
        let mut head = NIL;
        for rid in rids.into_iter().rev() {
            rec_id_ptr -= CHAIN_NODE_BYTES as u16;
            write_chain_node(dst, rec_id_ptr, rid, head);
            head = rec_id_ptr;
        }
        set_chain_head(dst, dst_idx, attr, head);
    }
    write_header(
        dst,
        &LeafHeader {
            page_type: LEAF_TAG,
            next_leaf: hdr.next_leaf,
            rec_id_ptr,
            key_ptr: (LEAF_HDR_BYTES + (hi - lo) * rs) as u16,
            free_list_ptr: NIL,
            num_in_free_list: 0,
            attr_length: hdr.attr_length,
            num_keys: (hi - lo) as u16,
            max_keys: hdr.max_keys,
        },
    )
}
