//! Index scans: a bounded cursor table over the leaf chain.
//!
//! A cursor remembers its physical position (leaf page + key index +
//! chain-node offset), the key value it is about to emit, and a logical
//! index that counts key advances without being affected by in-page key
//! shifts. Before emitting, a non-fresh cursor re-verifies that the key
//! under it still equals the remembered value; if a delete shifted the
//! keys left, the cursor resyncs by stepping the physical index back.
//! Equality and upper-bounded scans end against positions recorded at
//! open time, compared in logical terms so the endpoint survives shifts.

use crate::{leaf, BTreeIndex};
use common::{Error, PageNum, Result, NO_PAGE};
use std::cmp::Ordering;

/// Comparison operator of an index scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOp {
    All,
    Equal,
    LessThan,
    GreaterThan,
    LessThanEqual,
    GreaterThanEqual,
    NotEqual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScanStatus {
    Free,
    First,
    Busy,
    Last,
    Over,
}

#[derive(Clone, Debug)]
pub(crate) struct ScanState {
    pub op: ScanOp,
    pub status: ScanStatus,
    /// Hit position for `Equal` (stop when left) and `NotEqual` (skip).
    pub anchor_page: PageNum,
    pub anchor_idx: usize,
    pub next_page: PageNum,
    pub next_idx: usize,
    /// Position in logical terms, immune to key shifts from deletes.
    pub logical_idx: usize,
    pub next_value: Vec<u8>,
    pub next_rid_off: u16,
    /// Inclusive endpoint for `LessThan`/`LessThanEqual`; `None` index
    /// means "everything before `last_page`".
    pub last_page: PageNum,
    pub last_idx: Option<usize>,
}

impl ScanState {
    pub(crate) fn free() -> Self {
        Self {
            op: ScanOp::All,
            status: ScanStatus::Free,
            anchor_page: NO_PAGE,
            anchor_idx: 0,
            next_page: NO_PAGE,
            next_idx: 0,
            logical_idx: 0,
            next_value: Vec::new(),
            next_rid_off: leaf::NIL,
            last_page: NO_PAGE,
            last_idx: None,
        }
    }

    fn fresh(op: ScanOp, page: PageNum, idx: usize) -> Self {
        Self {
            op,
            status: ScanStatus::First,
            next_page: page,
            next_idx: idx,
            logical_idx: idx,
            ..Self::free()
        }
    }
}

impl BTreeIndex {
    /// Open a scan. `value = None` scans every entry regardless of `op`.
    /// Returns a descriptor for [`BTreeIndex::find_next`].
    pub fn open_scan(&mut self, op: ScanOp, value: Option<&[u8]>) -> Result<usize> {
        let sd = self
            .scans
            .iter()
            .position(|s| s.status == ScanStatus::Free)
            .ok_or(Error::ScanTabFull)?;
        let state = self.position_scan(op, value)?;
        self.scans[sd] = state;
        Ok(sd)
    }

    fn position_scan(&self, op: ScanOp, value: Option<&[u8]>) -> Result<ScanState> {
        let Some(value) = value else {
            return Ok(ScanState::fresh(ScanOp::All, self.leftmost_leaf()?, 0));
        };
        if op == ScanOp::All {
            return Ok(ScanState::fresh(ScanOp::All, self.leftmost_leaf()?, 0));
        }
        self.check_value(value)?;

        let (pn, outcome, guard, _path) = self.locate_leaf(value)?;
        let hdr = leaf::read_header(&guard.bytes())?;
        let (pos, found) = match outcome {
            Ok(p) => (p, true),
            Err(p) => (p, false),
        };

        // Normalize a past-the-end position onto the next leaf.
        let (hit_page, hit_idx) = if pos >= hdr.num_keys as usize && hdr.next_leaf != NO_PAGE {
            (hdr.next_leaf, 0)
        } else if pos >= hdr.num_keys as usize {
            (NO_PAGE, pos)
        } else {
            (pn, pos)
        };
        let next_leaf = hdr.next_leaf;
        let num_keys = hdr.num_keys as usize;
        guard.release(false)?;

        let st = match op {
            ScanOp::All => unreachable!("handled above"),
            ScanOp::Equal => {
                if !found {
                    let mut st = ScanState::free();
                    st.op = op;
                    st.status = ScanStatus::Over;
                    st
                } else {
                    let mut st = ScanState::fresh(op, hit_page, hit_idx);
                    st.anchor_page = hit_page;
                    st.anchor_idx = hit_idx;
                    st
                }
            }
            ScanOp::LessThan | ScanOp::LessThanEqual => {
                let mut st = ScanState::fresh(op, self.leftmost_leaf()?, 0);
                st.last_page = hit_page;
                st.last_idx = if op == ScanOp::LessThanEqual && found {
                    Some(hit_idx)
                } else if hit_idx == 0 {
                    None
                } else {
                    Some(hit_idx - 1)
                };
                st
            }
            ScanOp::GreaterThan => {
                if found {
                    if pos + 1 < num_keys {
                        ScanState::fresh(op, pn, pos + 1)
                    } else if next_leaf != NO_PAGE {
                        ScanState::fresh(op, next_leaf, 0)
                    } else {
                        let mut st = ScanState::free();
                        st.op = op;
                        st.status = ScanStatus::Over;
                        st
                    }
                } else {
                    ScanState::fresh(op, hit_page, hit_idx)
                }
            }
            ScanOp::GreaterThanEqual => ScanState::fresh(op, hit_page, hit_idx),
            ScanOp::NotEqual => {
                let mut st = ScanState::fresh(op, self.leftmost_leaf()?, 0);
                if found {
                    st.anchor_page = hit_page;
                    st.anchor_idx = hit_idx;
                }
                st
            }
        };
        Ok(st)
    }

    /// Next record identifier of the scan, or `None` at its end.
    pub fn find_next(&mut self, sd: usize) -> Result<Option<i32>> {
        if sd >= self.scans.len() || self.scans[sd].status == ScanStatus::Free {
            return Err(Error::InvalidScanDesc);
        }
        let mut st = self.scans[sd].clone();
        let result = self.advance(&mut st);
        self.scans[sd] = st;
        result
    }

    /// Release the cursor slot.
    pub fn close_scan(&mut self, sd: usize) -> Result<()> {
        if sd >= self.scans.len() {
            return Err(Error::InvalidScanDesc);
        }
        self.scans[sd] = ScanState::free();
        Ok(())
    }

    fn advance(&self, st: &mut ScanState) -> Result<Option<i32>> {
        use ScanStatus::*;
        let attr = self.attr_len;

        if st.status == Over {
            return Ok(None);
        }

        let (rec_id, mut guard, hdr) = 'position: loop {
            if st.next_page == NO_PAGE {
                st.status = Over;
                return Ok(None);
            }
            let mut guard = self.pf.get_this_page(self.fd, st.next_page)?;
            let mut hdr = leaf::read_header(&guard.bytes())?;

            // Keys deleted down to nothing leave empty leaves in the
            // chain; step over them.
            while hdr.num_keys == 0 {
                if hdr.next_leaf == NO_PAGE {
                    guard.release(false)?;
                    st.status = Over;
                    return Ok(None);
                }
                let next = hdr.next_leaf;
                guard.release(false)?;
                guard = self.pf.get_this_page(self.fd, next)?;
                hdr = leaf::read_header(&guard.bytes())?;
                st.next_page = next;
                st.next_idx = 0;
                st.logical_idx = 0;
                st.status = First;
            }

            // An upper bound of "nothing before the hit" ends the scan as
            // soon as the cursor reaches the hit page. Pages are compared
            // by identity: chain order is not page-number order.
            if matches!(st.op, ScanOp::LessThan | ScanOp::LessThanEqual)
                && st.last_idx.is_none()
                && st.last_page == st.next_page
            {
                guard.release(false)?;
                st.status = Over;
                return Ok(None);
            }

            // NotEqual steps over its anchor key, re-seeding the cursor so
            // the stale-key resync below cannot bounce back onto it.
            if st.op == ScanOp::NotEqual
                && st.anchor_page == st.next_page
                && st.anchor_idx == st.logical_idx
            {
                if st.next_idx + 1 < hdr.num_keys as usize {
                    st.next_idx += 1;
                    st.logical_idx += 1;
                    st.status = First;
                } else if hdr.next_leaf == NO_PAGE {
                    guard.release(false)?;
                    st.status = Over;
                    return Ok(None);
                } else {
                    st.next_page = hdr.next_leaf;
                    st.next_idx = 0;
                    st.logical_idx = 0;
                    st.status = First;
                    guard.release(false)?;
                    continue 'position;
                }
            }

            let rec_id;
            {
                let bytes = guard.bytes();
                if st.status == First {
                    st.status = Busy;
                    st.next_rid_off = leaf::chain_head(&bytes, st.next_idx, attr);
                    st.next_value = leaf::key_at(&bytes, st.next_idx, attr).to_vec();
                } else if st.next_idx > 0
                    && self
                        .key_type
                        .compare(&st.next_value, leaf::key_at(&bytes, st.next_idx, attr))
                        != Ordering::Equal
                {
                    // A delete shifted the keys left under us.
                    st.next_idx -= 1;
                    st.next_rid_off = leaf::chain_head(&bytes, st.next_idx, attr);
                }
                let (r, next_off) = leaf::chain_node(&bytes, st.next_rid_off);
                st.next_rid_off = next_off;
                rec_id = r;
            }
            break 'position (rec_id, guard, hdr);
        };

        // Chain exhausted: advance to the next key, then the next leaf.
        if st.next_rid_off == leaf::NIL {
            if st.next_idx + 1 < hdr.num_keys as usize {
                st.next_idx += 1;
                st.logical_idx += 1;
                let bytes = guard.bytes();
                st.next_rid_off = leaf::chain_head(&bytes, st.next_idx, attr);
                st.next_value = leaf::key_at(&bytes, st.next_idx, attr).to_vec();
            } else if hdr.next_leaf == NO_PAGE {
                st.status = Over;
            } else {
                let next = hdr.next_leaf;
                guard.release(false)?;
                guard = self.pf.get_this_page(self.fd, next)?;
                let next_hdr = leaf::read_header(&guard.bytes())?;
                st.next_page = next;
                st.next_idx = 0;
                st.logical_idx = 0;
                if next_hdr.num_keys > 0 {
                    let bytes = guard.bytes();
                    st.next_rid_off = leaf::chain_head(&bytes, 0, attr);
                    st.next_value = leaf::key_at(&bytes, 0, attr).to_vec();
                } else {
                    // Empty leaf; the skip loop resumes here next call.
                    st.next_rid_off = leaf::NIL;
                    st.status = First;
                }
            }
        }

        if st.status != Over {
            match st.op {
                ScanOp::Equal => {
                    if st.anchor_page != st.next_page || st.anchor_idx != st.logical_idx {
                        st.status = Over;
                    }
                }
                ScanOp::LessThan | ScanOp::LessThanEqual => {
                    if st.last_page == st.next_page && st.last_idx == Some(st.logical_idx) {
                        st.status = Last;
                    } else if st.last_page == st.next_page
                        && st.last_idx.map_or(true, |li| li < st.logical_idx)
                    {
                        st.status = Over;
                    } else if st.status == Last {
                        st.status = Over;
                    }
                }
                _ => {}
            }
        }

        guard.release(false)?;
        Ok(Some(rec_id))
    }
}
