//! One-pass bottom-up construction of an index from a key-sorted stream.
//!
//! Leaves fill sequentially from page 1, leaving page 0 reserved for the
//! root, with duplicate keys grouped so a key's whole RID chain lands on
//! one leaf. Internal levels are then built from `(first key, page)`
//! summaries, up to `max_keys + 1` children per node, and the final
//! single node is copied into page 0.

use crate::{leaf, max_keys_for, node, KeyType, ROOT_PAGE};
use common::{Error, FileId, PageNum, Result};
use pagefile::{PageGuard, PagedFiles};
use std::cmp::Ordering;
use std::path::Path;

pub(crate) fn build(
    pf: &PagedFiles,
    path: &Path,
    key_type: KeyType,
    attr_len: usize,
    pairs: impl IntoIterator<Item = (Vec<u8>, i32)>,
) -> Result<()> {
    let fd = pf.open_file(path)?;
    let result = build_levels(pf, fd, key_type, attr_len, pairs);
    let closed = pf.close_file(fd);
    result.and(closed)
}

struct LeafFill<'a> {
    pf: &'a PagedFiles,
    fd: FileId,
    attr_len: usize,
    max_keys: u16,
    page_size: usize,
    cur: Option<(PageNum, PageGuard)>,
    /// `(first key, page)` of every finished leaf, in order.
    level: Vec<(Vec<u8>, PageNum)>,
}

impl LeafFill<'_> {
    /// Append one key group (a key and all its RIDs) to the current leaf,
    /// rolling to a fresh leaf when the group does not fit.
    fn push_group(&mut self, key: &[u8], rids: &[i32]) -> Result<()> {
        let needed = self.attr_len + 2 + leaf::CHAIN_NODE_BYTES * rids.len();
        let need_roll = match &self.cur {
            Some((_, guard)) => leaf::read_header(&guard.bytes())?.gap() < needed,
            None => true,
        };
        if need_roll {
            self.roll(key)?;
        }
        let (_, guard) = self.cur.as_ref().expect("roll leaves a current leaf");
        let mut bytes = guard.bytes_mut();
        let hdr = leaf::read_header(&bytes)?;
        if hdr.gap() < needed {
            // The group outgrows even an empty leaf; a RID chain cannot
            // span pages.
            return Err(Error::InvalidValue);
        }
        let pos = hdr.num_keys as usize;
        let mut placed = leaf::insert(&mut bytes, key, rids[0], pos, false, self.page_size)?;
        for &rid in &rids[1..] {
            placed &= leaf::insert(&mut bytes, key, rid, pos, true, self.page_size)?;
        }
        debug_assert!(placed, "gap was checked for the whole group");
        Ok(())
    }

    /// Finish the current leaf and start a new one holding `first_key`.
    fn roll(&mut self, first_key: &[u8]) -> Result<()> {
        let (new_pn, new_guard) = self.pf.alloc_page(self.fd)?;
        {
            let mut bytes = new_guard.bytes_mut();
            bytes.fill(0);
            leaf::write_header(
                &mut bytes,
                &leaf::LeafHeader::empty(self.attr_len as u16, self.max_keys, self.page_size),
            )?;
        }
        if let Some((_, guard)) = self.cur.take() {
            {
                let mut bytes = guard.bytes_mut();
                let mut hdr = leaf::read_header(&bytes)?;
                hdr.next_leaf = new_pn;
                leaf::write_header(&mut bytes, &hdr)?;
            }
            guard.release(true)?;
        }
        self.level.push((first_key.to_vec(), new_pn));
        self.cur = Some((new_pn, new_guard));
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<(Vec<u8>, PageNum)>> {
        if let Some((_, guard)) = self.cur.take() {
            guard.release(true)?;
        }
        Ok(self.level)
    }
}

fn build_levels(
    pf: &PagedFiles,
    fd: FileId,
    key_type: KeyType,
    attr_len: usize,
    pairs: impl IntoIterator<Item = (Vec<u8>, i32)>,
) -> Result<()> {
    let page_size = pf.page_size();
    let max_keys = max_keys_for(page_size, attr_len);
    let mut fill = LeafFill {
        pf,
        fd,
        attr_len,
        max_keys,
        page_size,
        cur: None,
        level: Vec::new(),
    };

    // Group consecutive equal keys so each chain stays on one leaf.
    let mut group: Option<(Vec<u8>, Vec<i32>)> = None;
    for (key, rec_id) in pairs {
        if key.len() != attr_len {
            return Err(Error::InvalidValue);
        }
        match &mut group {
            Some((cur_key, rids)) => match key_type.compare(&key, cur_key) {
                Ordering::Equal => rids.push(rec_id),
                Ordering::Greater => {
                    let k = std::mem::take(cur_key);
                    let r = std::mem::take(rids);
                    fill.push_group(&k, &r)?;
                    group = Some((key, vec![rec_id]));
                }
                Ordering::Less => return Err(Error::InvalidValue),
            },
            None => group = Some((key, vec![rec_id])),
        }
    }
    if let Some((key, rids)) = group.take() {
        fill.push_group(&key, &rids)?;
    }
    let mut level = fill.finish()?;
    if level.is_empty() {
        // Empty stream: the empty root leaf from create() stands.
        return Ok(());
    }
    log::debug!("bulk load: {} leaves", level.len());

    while level.len() > 1 {
        let mut parents = Vec::new();
        for chunk in level.chunks(max_keys as usize + 1) {
            let (pn, guard) = pf.alloc_page(fd)?;
            {
                let mut bytes = guard.bytes_mut();
                bytes.fill(0);
                let keys: Vec<&[u8]> = chunk[1..].iter().map(|(k, _)| k.as_slice()).collect();
                let children: Vec<PageNum> = chunk.iter().map(|&(_, p)| p).collect();
                node::write_node(&mut bytes, attr_len, max_keys, &keys, &children)?;
            }
            guard.release(true)?;
            parents.push((chunk[0].0.clone(), pn));
        }
        level = parents;
    }

    // The single remaining node becomes the root on page 0.
    let (_, top_pn) = level.pop().expect("level has one node");
    let top = pf.get_this_page(fd, top_pn)?;
    let root = pf.get_this_page(fd, ROOT_PAGE)?;
    root.bytes_mut().copy_from_slice(&top.bytes());
    top.release(false)?;
    root.release(true)?;
    pf.dispose_page(fd, top_pn)
}
