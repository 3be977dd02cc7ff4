//! Heap-file layer: variable-length records on slotted pages.
//!
//! Page 0 of a heap file is the meta page holding the head of the
//! free-space list and the first data page; every other page is a slotted
//! data page. Records are addressed by [`Rid`] (page, slot). Deletes
//! tombstone the slot; an update that outgrows its slot tombstones and
//! re-inserts, so the record moves and the caller gets the new RID.
//!
//! The free-space list links data pages that can still take a record.
//! After any mutation the touched page's membership is reconciled against
//! its effective free space.
//!
//! # Example
//!
//! ```no_run
//! use common::Config;
//! use heapfile::HeapFile;
//! use pagefile::PagedFiles;
//! use std::path::Path;
//!
//! let pf = PagedFiles::new(Config::default());
//! HeapFile::create(&pf, Path::new("/tmp/data.hf")).unwrap();
//! let hf = HeapFile::open(&pf, Path::new("/tmp/data.hf")).unwrap();
//! let rid = hf.insert(b"hello").unwrap();
//! let mut buf = [0u8; 16];
//! let n = hf.get(rid, &mut buf).unwrap();
//! assert_eq!(&buf[..n], b"hello");
//! hf.close().unwrap();
//! ```

mod page;


use common::{Error, FileId, PageNum, Result, Rid};
use page::{
    effective_free, init_data_page, read_header, read_meta, read_slot, write_header, write_meta,
    write_slot, Meta, Slot, FREE_LIST_END, NOT_LISTED, SLOT_BYTES, TOMBSTONE,
};
use pagefile::PagedFiles;
use std::path::Path;

const META_PAGE: PageNum = 0;

/// A heap file bound to an open paged file.
pub struct HeapFile {
    pf: PagedFiles,
    fd: FileId,
    page_size: usize,
}

impl HeapFile {
    /// Create a heap file: page 0 becomes the meta page, page 1 the first
    /// data page and head of the free-space list.
    pub fn create(pf: &PagedFiles, path: &Path) -> Result<()> {
        let page_size = pf.page_size();
        assert!(
            page_size <= i16::MAX as usize,
            "heap page offsets are 16-bit"
        );
        pf.create_file(path)?;
        let fd = pf.open_file(path)?;
        let result = Self::init_file(pf, fd, page_size);
        let closed = pf.close_file(fd);
        result.and(closed)
    }

    fn init_file(pf: &PagedFiles, fd: FileId, page_size: usize) -> Result<()> {
        let (meta_pn, meta) = pf.alloc_page(fd)?;
        debug_assert_eq!(meta_pn, META_PAGE);
        let (data_pn, data) = pf.alloc_page(fd)?;
        init_data_page(&mut data.bytes_mut(), page_size)?;
        {
            let mut bytes = data.bytes_mut();
            let mut hdr = read_header(&bytes)?;
            hdr.next_free_page = FREE_LIST_END;
            write_header(&mut bytes, &hdr)?;
        }
        write_meta(
            &mut meta.bytes_mut(),
            &Meta {
                first_free_page: data_pn,
                first_data_page: data_pn,
                reserved: [0; 6],
            },
        )?;
        data.release(true)?;
        meta.release(true)
    }

    pub fn open(pf: &PagedFiles, path: &Path) -> Result<Self> {
        let fd = pf.open_file(path)?;
        Ok(Self {
            pf: pf.clone(),
            fd,
            page_size: pf.page_size(),
        })
    }

    pub fn close(self) -> Result<()> {
        self.pf.close_file(self.fd)
    }

    /// Remove the host file. It must not be open.
    pub fn destroy(pf: &PagedFiles, path: &Path) -> Result<()> {
        pf.destroy_file(path)
    }

    /// Insert a record, returning its RID. Placement prefers pages on the
    /// free-space list; a new data page is allocated and listed when none
    /// fits.
    pub fn insert(&self, record: &[u8]) -> Result<Rid> {
        let len = record.len();
        let target = self.find_target_page(len)?;
        let guard = self.pf.get_this_page(self.fd, target)?;
        let slot_idx;
        {
            let mut bytes = guard.bytes_mut();
            let mut hdr = read_header(&bytes)?;
            if (effective_free(&hdr) as i64) < len as i64 {
                drop(bytes);
                guard.release(false)?;
                return Err(Error::NoBuf);
            }
            let offset = hdr.free_start;
            bytes[offset as usize..offset as usize + len].copy_from_slice(record);
            slot_idx = hdr.slot_count;
            write_slot(
                &mut bytes,
                self.page_size,
                slot_idx,
                &Slot {
                    offset,
                    length: len as i16,
                },
            )?;
            hdr.slot_count += 1;
            hdr.free_start += len as i16;
            hdr.free_end -= SLOT_BYTES as i16;
            write_header(&mut bytes, &hdr)?;
        }
        guard.release(true)?;
        self.free_list_update(target)?;
        log::trace!("inserted {len}-byte record at ({target}, {slot_idx})");
        Ok(Rid {
            page: target,
            slot: slot_idx,
        })
    }

    /// Copy the record into `buf`, returning the stored length. Fails with
    /// `NoBuf` when `buf` is shorter than the record.
    pub fn get(&self, rid: Rid, buf: &mut [u8]) -> Result<usize> {
        let guard = self.data_page(rid)?;
        let result = {
            let bytes = guard.bytes();
            let slot = self.live_slot(&bytes, rid)?;
            let len = slot.length as usize;
            if buf.len() < len {
                Err(Error::NoBuf)
            } else {
                buf[..len].copy_from_slice(&bytes[slot.offset as usize..slot.offset as usize + len]);
                Ok(len)
            }
        };
        guard.release(false)?;
        result
    }

    /// Overwrite the record in place when the new image fits its slot;
    /// otherwise tombstone it and re-insert, returning the new RID.
    pub fn update(&self, rid: Rid, record: &[u8]) -> Result<Rid> {
        let guard = self.data_page(rid)?;
        let fits = {
            let bytes = guard.bytes();
            let slot = self.live_slot(&bytes, rid)?;
            record.len() <= slot.length as usize
        };
        if fits {
            {
                let mut bytes = guard.bytes_mut();
                let slot = self.live_slot(&bytes, rid)?;
                bytes[slot.offset as usize..slot.offset as usize + record.len()]
                    .copy_from_slice(record);
                write_slot(
                    &mut bytes,
                    self.page_size,
                    rid.slot,
                    &Slot {
                        offset: slot.offset,
                        length: record.len() as i16,
                    },
                )?;
            }
            guard.release(true)?;
            self.free_list_update(rid.page)?;
            return Ok(rid);
        }
        // Grows: relocate.
        {
            let mut bytes = guard.bytes_mut();
            let slot = self.live_slot(&bytes, rid)?;
            write_slot(
                &mut bytes,
                self.page_size,
                rid.slot,
                &Slot {
                    offset: slot.offset,
                    length: TOMBSTONE,
                },
            )?;
        }
        guard.release(true)?;
        self.free_list_update(rid.page)?;
        self.insert(record)
    }

    /// Tombstone the record. Deleting an already-deleted slot is a no-op.
    pub fn delete(&self, rid: Rid) -> Result<()> {
        let guard = self.data_page(rid)?;
        let already = {
            let bytes = guard.bytes();
            self.checked_slot(&bytes, rid)?.is_tombstone()
        };
        if already {
            return guard.release(false);
        }
        {
            let mut bytes = guard.bytes_mut();
            let slot = self.checked_slot(&bytes, rid)?;
            write_slot(
                &mut bytes,
                self.page_size,
                rid.slot,
                &Slot {
                    offset: slot.offset,
                    length: TOMBSTONE,
                },
            )?;
        }
        guard.release(true)?;
        self.free_list_update(rid.page)
    }

    /// Sequential scan over all live records in page order.
    pub fn scan(&self) -> Result<HeapScan<'_>> {
        let meta_guard = self.pf.get_this_page(self.fd, META_PAGE)?;
        let first = read_meta(&meta_guard.bytes())?.first_data_page;
        meta_guard.release(false)?;
        Ok(HeapScan {
            hf: self,
            page: first,
            slot: -1,
            done: first == common::NO_PAGE,
        })
    }

    fn data_page(&self, rid: Rid) -> Result<pagefile::PageGuard> {
        if rid.page == META_PAGE {
            return Err(Error::InvalidPage);
        }
        self.pf.get_this_page(self.fd, rid.page)
    }

    /// Slot of `rid`, bounds-checked.
    fn checked_slot(&self, bytes: &[u8], rid: Rid) -> Result<Slot> {
        let hdr = read_header(bytes)?;
        if rid.slot < 0 || rid.slot >= hdr.slot_count {
            return Err(Error::InvalidPage);
        }
        read_slot(bytes, self.page_size, rid.slot)
    }

    /// Slot of `rid`, additionally rejecting tombstones with `PageFree`.
    fn live_slot(&self, bytes: &[u8], rid: Rid) -> Result<Slot> {
        let slot = self.checked_slot(bytes, rid)?;
        if slot.is_tombstone() {
            return Err(Error::PageFree);
        }
        Ok(slot)
    }

    /// A page with room for `len` more bytes, preferring the free-space
    /// list and allocating a fresh listed page when nothing fits.
    fn find_target_page(&self, len: usize) -> Result<PageNum> {
        let meta_guard = self.pf.get_this_page(self.fd, META_PAGE)?;
        let meta = read_meta(&meta_guard.bytes())?;

        let mut p = meta.first_free_page;
        while p != FREE_LIST_END {
            let guard = self.pf.get_this_page(self.fd, p)?;
            let hdr = read_header(&guard.bytes())?;
            if effective_free(&hdr) as i64 >= len as i64 {
                guard.release(false)?;
                meta_guard.release(false)?;
                return Ok(p);
            }
            let next = hdr.next_free_page;
            guard.release(false)?;
            p = next;
        }

        // Nothing listed fits: allocate a new data page at the list head.
        let (new_pn, guard) = self.pf.alloc_page(self.fd)?;
        init_data_page(&mut guard.bytes_mut(), self.page_size)?;
        {
            let mut bytes = guard.bytes_mut();
            let mut hdr = read_header(&bytes)?;
            hdr.next_free_page = meta.first_free_page;
            write_header(&mut bytes, &hdr)?;
        }
        guard.release(true)?;
        {
            let mut bytes = meta_guard.bytes_mut();
            let mut meta = read_meta(&bytes)?;
            meta.first_free_page = new_pn;
            write_meta(&mut bytes, &meta)?;
        }
        meta_guard.release(true)?;
        log::debug!("allocated data page {new_pn}");
        Ok(new_pn)
    }

    /// Reconcile a page's free-space-list membership with its effective
    /// free space.
    fn free_list_update(&self, p: PageNum) -> Result<()> {
        let guard = self.pf.get_this_page(self.fd, p)?;
        let hdr = read_header(&guard.bytes())?;
        let eff = effective_free(&hdr);
        let listed = hdr.next_free_page != NOT_LISTED;
        guard.release(false)?;

        if eff > 0 && !listed {
            self.free_list_add(p)
        } else if eff <= 0 && listed {
            self.free_list_remove(p)
        } else {
            Ok(())
        }
    }

    fn free_list_add(&self, p: PageNum) -> Result<()> {
        let meta_guard = self.pf.get_this_page(self.fd, META_PAGE)?;
        let guard = self.pf.get_this_page(self.fd, p)?;
        let mut meta = read_meta(&meta_guard.bytes())?;
        {
            let mut bytes = guard.bytes_mut();
            let mut hdr = read_header(&bytes)?;
            if hdr.next_free_page != NOT_LISTED {
                // Raced onto the list already; nothing to do.
                drop(bytes);
                guard.release(false)?;
                return meta_guard.release(false);
            }
            hdr.next_free_page = meta.first_free_page;
            write_header(&mut bytes, &hdr)?;
        }
        guard.release(true)?;
        meta.first_free_page = p;
        write_meta(&mut meta_guard.bytes_mut(), &meta)?;
        meta_guard.release(true)
    }

    /// Unlink `p` from the free-space list. Walks with at most two data
    /// pages pinned at a time (previous + current).
    fn free_list_remove(&self, p: PageNum) -> Result<()> {
        let meta_guard = self.pf.get_this_page(self.fd, META_PAGE)?;
        let meta = read_meta(&meta_guard.bytes())?;

        if meta.first_free_page == p {
            let guard = self.pf.get_this_page(self.fd, p)?;
            let next;
            {
                let mut bytes = guard.bytes_mut();
                let mut hdr = read_header(&bytes)?;
                next = hdr.next_free_page;
                hdr.next_free_page = NOT_LISTED;
                write_header(&mut bytes, &hdr)?;
            }
            guard.release(true)?;
            let mut meta = meta;
            meta.first_free_page = next;
            write_meta(&mut meta_guard.bytes_mut(), &meta)?;
            return meta_guard.release(true);
        }

        let mut prev = meta.first_free_page;
        meta_guard.release(false)?;
        while prev != FREE_LIST_END {
            let prev_guard = self.pf.get_this_page(self.fd, prev)?;
            let next = read_header(&prev_guard.bytes())?.next_free_page;
            if next == p {
                let guard = self.pf.get_this_page(self.fd, p)?;
                let after;
                {
                    let mut bytes = guard.bytes_mut();
                    let mut hdr = read_header(&bytes)?;
                    after = hdr.next_free_page;
                    hdr.next_free_page = NOT_LISTED;
                    write_header(&mut bytes, &hdr)?;
                }
                guard.release(true)?;
                {
                    let mut bytes = prev_guard.bytes_mut();
                    let mut hdr = read_header(&bytes)?;
                    hdr.next_free_page = after;
                    write_header(&mut bytes, &hdr)?;
                }
                return prev_guard.release(true);
            }
            prev_guard.release(false)?;
            prev = next;
        }
        // Not on the list after all.
        Ok(())
    }
}

/// Cursor over the live records of a heap file.
pub struct HeapScan<'a> {
    hf: &'a HeapFile,
    page: PageNum,
    slot: i16,
    done: bool,
}

impl HeapScan<'_> {
    /// Next live record and its RID, or `None` past the end.
    pub fn next(&mut self) -> Result<Option<(Rid, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let guard = self.hf.pf.get_this_page(self.hf.fd, self.page)?;
            let found = {
                let bytes = guard.bytes();
                let hdr = read_header(&bytes)?;
                let mut hit = None;
                for i in (self.slot + 1)..hdr.slot_count {
                    let slot = read_slot(&bytes, self.hf.page_size, i)?;
                    if !slot.is_tombstone() {
                        let start = slot.offset as usize;
                        let record = bytes[start..start + slot.length as usize].to_vec();
                        hit = Some((i, record));
                        break;
                    }
                }
                hit
            };
            guard.release(false)?;
            if let Some((i, record)) = found {
                self.slot = i;
                return Ok(Some((
                    Rid {
                        page: self.page,
                        slot: i,
                    },
                    record,
                )));
            }
            match self.hf.pf.get_next_page(self.hf.fd, self.page)? {
                Some((pn, guard)) => {
                    guard.release(false)?;
                    self.page = pn;
                    self.slot = -1;
                }
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }

    pub fn close(mut self) {
        self.done = true;
    }
}
