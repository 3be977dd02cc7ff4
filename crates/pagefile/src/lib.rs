//! Paged-file layer: fixed-size pages in host files behind a bounded
//! buffer pool.
//!
//! A host file starts with an 8-byte header `{first_free, num_pages}`;
//! each page follows as a 4-byte `next_free` prefix plus `page_size`
//! payload bytes. `next_free` is `-2` for a used page, otherwise the next
//! entry of the file's free-page list (`-1` ends the list).
//!
//! The pool keeps frames in an arena linked into a recency-ordered used
//! list plus a free-frame list, with a bucketed hash finding the frame of
//! a `(file, page)` pair. Pages are pinned at most once; all fixing
//! operations hand out a [`PageGuard`] that unfixes on drop.
//!
//! # Example
//!
//! ```no_run
//! use common::Config;
//! use pagefile::PagedFiles;
//! use std::path::Path;
//!
//! let pf = PagedFiles::new(Config::default());
//! pf.create_file(Path::new("/tmp/data.pf")).unwrap();
//! let fd = pf.open_file(Path::new("/tmp/data.pf")).unwrap();
//! let (pn, page) = pf.alloc_page(fd).unwrap();
//! page.bytes_mut()[0] = 42;
//! page.release(true).unwrap();
//! pf.close_file(fd).unwrap();
//! ```

mod buf;
mod guard;
mod hash;


pub use guard::PageGuard;

use bincode::config::{self, Config as BincodeConfig};
use bincode::serde::{decode_from_slice, encode_into_slice};
use buf::Pool;
use common::{Config, Error, FileId, PageNum, Result, NO_PAGE};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// `next_free` value marking a page as used.
pub(crate) const PAGE_USED: PageNum = -2;

const HEADER_BYTES: usize = 8;
const PAGE_PREFIX_BYTES: usize = 4;

fn codec() -> impl BincodeConfig {
    config::legacy()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileHeader {
    first_free: PageNum,
    num_pages: i32,
}

struct OpenFile {
    path: PathBuf,
    file: File,
    hdr: FileHeader,
    hdr_changed: bool,
}

struct Inner {
    cfg: Config,
    ftab: Vec<Option<OpenFile>>,
    pool: Pool,
}

/// The paged-file engine: open-file table plus buffer pool.
///
/// Cheap to clone; clones share the same pool and file table. All state is
/// instance state, so creating two engines gives two independent pools.
#[derive(Clone)]
pub struct PagedFiles {
    inner: Rc<RefCell<Inner>>,
}

impl Default for PagedFiles {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl PagedFiles {
    /// # Panics
    ///
    /// Panics if `max_bufs`, `ftab_size` or `hash_buckets` is 0.
    pub fn new(cfg: Config) -> Self {
        assert!(cfg.max_bufs > 0, "max_bufs must be > 0");
        assert!(cfg.ftab_size > 0, "ftab_size must be > 0");
        assert!(cfg.hash_buckets > 0, "hash_buckets must be > 0");
        let pool = Pool::new(&cfg);
        let ftab = (0..cfg.ftab_size).map(|_| None).collect();
        Self {
            inner: Rc::new(RefCell::new(Inner { cfg, ftab, pool })),
        }
    }

    pub fn config(&self) -> Config {
        self.inner.borrow().cfg.clone()
    }

    pub fn page_size(&self) -> usize {
        self.inner.borrow().cfg.page_size
    }

    /// Create a new paged file with an empty page region.
    ///
    /// Fails if the file already exists.
    pub fn create_file(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let hdr = FileHeader {
            first_free: NO_PAGE,
            num_pages: 0,
        };
        let result = encode_header(&hdr)
            .and_then(|buf| file.write_all(&buf).map_err(Error::from))
            .and_then(|_| file.sync_all().map_err(Error::from));
        if let Err(e) = result {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a paged file. The file must not be open.
    pub fn destroy_file(&self, path: &Path) -> Result<()> {
        let inner = self.inner.borrow();
        if inner.ftab.iter().flatten().any(|of| of.path == path) {
            return Err(Error::FileOpen);
        }
        drop(inner);
        fs::remove_file(path)?;
        Ok(())
    }

    /// Open a paged file, returning its slot in the open-file table.
    pub fn open_file(&self, path: &Path) -> Result<FileId> {
        let mut inner = self.inner.borrow_mut();
        if inner.ftab.iter().flatten().any(|of| of.path == path) {
            return Err(Error::FileOpen);
        }
        let slot = inner
            .ftab
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::FtabFull)?;
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; HEADER_BYTES];
        file.read_exact(&mut buf).map_err(short_read_hdr)?;
        let hdr = decode_header(&buf)?;
        log::debug!("opened {} as fd {slot}", path.display());
        inner.ftab[slot] = Some(OpenFile {
            path: path.to_path_buf(),
            file,
            hdr,
            hdr_changed: false,
        });
        Ok(FileId(slot))
    }

    /// Flush the file's frames, write the header back if it changed, and
    /// close the host file. Fails with `PageFixed` while any page of the
    /// file is still pinned.
    pub fn close_file(&self, fd: FileId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.file(fd)?;
        inner.release_file(fd)?;
        let of = inner.ftab[fd.0].as_mut().expect("fd validated above");
        if of.hdr_changed {
            let buf = encode_header(&of.hdr)?;
            of.file.seek(SeekFrom::Start(0))?;
            of.file.write_all(&buf)?;
            of.hdr_changed = false;
        }
        of.file.sync_all()?;
        inner.ftab[fd.0] = None;
        Ok(())
    }

    /// Allocate a page: reuse the head of the file's free-page list, or
    /// append a fresh page. Returned pinned and dirty, marked used.
    /// Recycled pages keep their previous contents; appended pages are
    /// zeroed.
    pub fn alloc_page(&self, fd: FileId) -> Result<(PageNum, PageGuard)> {
        let mut inner = self.inner.borrow_mut();
        let first_free = inner.file(fd)?.hdr.first_free;
        let (pn, idx) = if first_free != NO_PAGE {
            let pn = first_free;
            let idx = inner.fetch_frame(fd, pn)?;
            let next = inner.pool.frames[idx].next_free;
            let of = inner.file_mut(fd)?;
            of.hdr.first_free = next;
            of.hdr_changed = true;
            (pn, idx)
        } else {
            let pn = inner.file(fd)?.hdr.num_pages;
            let idx = inner.alloc_frame(fd, pn)?;
            let of = inner.file_mut(fd)?;
            of.hdr.num_pages += 1;
            of.hdr_changed = true;
            (pn, idx)
        };
        let frame = &mut inner.pool.frames[idx];
        frame.next_free = PAGE_USED;
        frame.dirty = true;
        let data = Rc::clone(&frame.data);
        drop(inner);
        log::trace!("allocated page {pn} of fd {}", fd.0);
        Ok((pn, PageGuard::new(self.clone(), fd, pn, data)))
    }

    /// Put a used page onto the file's free-page list.
    pub fn dispose_page(&self, fd: FileId, pn: PageNum) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_page(fd, pn)?;
        let idx = inner.fetch_frame(fd, pn)?;
        if inner.pool.frames[idx].next_free != PAGE_USED {
            inner.unfix(fd, pn, false)?;
            return Err(Error::PageFree);
        }
        let first_free = inner.file(fd)?.hdr.first_free;
        inner.pool.frames[idx].next_free = first_free;
        let of = inner.file_mut(fd)?;
        of.hdr.first_free = pn;
        of.hdr_changed = true;
        inner.unfix(fd, pn, true)
    }

    /// Pin a specific used page.
    ///
    /// Fails with `InvalidPage` for out-of-range or free pages and with
    /// `PageFixed` (handing back no guard) if the page is already
    /// pinned; pins do not nest.
    pub fn get_this_page(&self, fd: FileId, pn: PageNum) -> Result<PageGuard> {
        let mut inner = self.inner.borrow_mut();
        inner.check_page(fd, pn)?;
        let idx = inner.fetch_frame(fd, pn)?;
        if inner.pool.frames[idx].next_free != PAGE_USED {
            inner.unfix(fd, pn, false)?;
            return Err(Error::InvalidPage);
        }
        let data = Rc::clone(&inner.pool.frames[idx].data);
        drop(inner);
        Ok(PageGuard::new(self.clone(), fd, pn, data))
    }

    /// First used page of the file, or `None` for an empty file.
    pub fn get_first_page(&self, fd: FileId) -> Result<Option<(PageNum, PageGuard)>> {
        self.get_next_page(fd, -1)
    }

    /// Next used page after `pn` in numeric order, skipping free pages.
    /// `None` past the last used page.
    pub fn get_next_page(&self, fd: FileId, pn: PageNum) -> Result<Option<(PageNum, PageGuard)>> {
        let mut inner = self.inner.borrow_mut();
        let num_pages = inner.file(fd)?.hdr.num_pages;
        if pn < -1 || pn >= num_pages {
            return Err(Error::InvalidPage);
        }
        for next in (pn + 1)..num_pages {
            let idx = inner.fetch_frame(fd, next)?;
            if inner.pool.frames[idx].next_free == PAGE_USED {
                let data = Rc::clone(&inner.pool.frames[idx].data);
                drop(inner);
                return Ok(Some((next, PageGuard::new(self.clone(), fd, next, data))));
            }
            inner.unfix(fd, next, false)?;
        }
        Ok(None)
    }

    /// Unpin a page, optionally marking it dirty. The counterpart of every
    /// successful fix; [`PageGuard`] calls this on drop.
    pub fn unfix_page(&self, fd: FileId, pn: PageNum, dirty: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_page(fd, pn)?;
        inner.unfix(fd, pn, dirty)
    }
}

impl Inner {
    fn file(&self, fd: FileId) -> Result<&OpenFile> {
        self.ftab
            .get(fd.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::Fd)
    }

    fn file_mut(&mut self, fd: FileId) -> Result<&mut OpenFile> {
        self.ftab
            .get_mut(fd.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(Error::Fd)
    }

    fn check_page(&self, fd: FileId, pn: PageNum) -> Result<()> {
        let num_pages = self.file(fd)?.hdr.num_pages;
        if pn < 0 || pn >= num_pages {
            return Err(Error::InvalidPage);
        }
        Ok(())
    }

    /// Pin the frame for `(fd, pn)`, reading the page in on a miss.
    fn fetch_frame(&mut self, fd: FileId, pn: PageNum) -> Result<usize> {
        if let Some(idx) = self.pool.find(fd, pn) {
            if self.pool.frames[idx].pinned {
                return Err(Error::PageFixed);
            }
            self.pool.frames[idx].pinned = true;
            return Ok(idx);
        }
        let idx = self.acquire_frame()?;
        if let Err(e) = self.read_frame(fd, pn, idx) {
            self.pool.unlink(idx);
            self.pool.push_free(idx);
            return Err(e);
        }
        if let Err(e) = self.pool.map.insert(fd, pn, idx) {
            self.pool.unlink(idx);
            self.pool.push_free(idx);
            return Err(e);
        }
        let frame = &mut self.pool.frames[idx];
        frame.key = Some((fd, pn));
        frame.pinned = true;
        frame.dirty = false;
        Ok(idx)
    }

    /// Bind a frame for a page that has no on-disk image yet.
    fn alloc_frame(&mut self, fd: FileId, pn: PageNum) -> Result<usize> {
        if self.pool.find(fd, pn).is_some() {
            return Err(Error::PageInBuf);
        }
        let idx = self.acquire_frame()?;
        if let Err(e) = self.pool.map.insert(fd, pn, idx) {
            self.pool.unlink(idx);
            self.pool.push_free(idx);
            return Err(e);
        }
        let frame = &mut self.pool.frames[idx];
        frame.key = Some((fd, pn));
        frame.pinned = true;
        frame.dirty = false;
        frame.data.borrow_mut().fill(0);
        Ok(idx)
    }

    /// A frame ready for rebinding: free list, then pool growth, then
    /// eviction of the first unpinned frame (written back if dirty).
    fn acquire_frame(&mut self) -> Result<usize> {
        if let Some(idx) = self.pool.pop_free() {
            self.pool.link_head(idx);
            return Ok(idx);
        }
        if let Some(idx) = self.pool.grow() {
            self.pool.link_head(idx);
            return Ok(idx);
        }
        let idx = self.pool.victim().ok_or(Error::NoBuf)?;
        let (vfd, vpn) = self.pool.frames[idx].key.expect("used frame is bound");
        if self.pool.frames[idx].dirty {
            self.flush_frame(idx)?;
        }
        self.pool.map.remove(vfd, vpn)?;
        self.pool.unlink(idx);
        self.pool.frames[idx].reset();
        self.pool.link_head(idx);
        log::debug!("evicted page {vpn} of fd {}", vfd.0);
        Ok(idx)
    }

    fn read_frame(&mut self, fd: FileId, pn: PageNum, idx: usize) -> Result<()> {
        let page_size = self.cfg.page_size;
        let data = Rc::clone(&self.pool.frames[idx].data);
        let of = self.file_mut(fd)?;
        of.file
            .seek(SeekFrom::Start(page_offset(page_size, pn)))?;
        let mut prefix = [0u8; PAGE_PREFIX_BYTES];
        of.file.read_exact(&mut prefix).map_err(short_read)?;
        of.file
            .read_exact(&mut data.borrow_mut()[..])
            .map_err(short_read)?;
        self.pool.frames[idx].next_free = PageNum::from_le_bytes(prefix);
        Ok(())
    }

    fn flush_frame(&mut self, idx: usize) -> Result<()> {
        let (fd, pn) = self.pool.frames[idx].key.expect("flushed frame is bound");
        let next_free = self.pool.frames[idx].next_free;
        let data = Rc::clone(&self.pool.frames[idx].data);
        let page_size = self.cfg.page_size;
        let of = self.file_mut(fd)?;
        of.file
            .seek(SeekFrom::Start(page_offset(page_size, pn)))?;
        of.file.write_all(&next_free.to_le_bytes())?;
        of.file.write_all(&data.borrow())?;
        self.pool.frames[idx].dirty = false;
        Ok(())
    }

    fn unfix(&mut self, fd: FileId, pn: PageNum, dirty: bool) -> Result<()> {
        let idx = self.pool.find(fd, pn).ok_or(Error::PageNotInBuf)?;
        let frame = &mut self.pool.frames[idx];
        if !frame.pinned {
            return Err(Error::PageUnfixed);
        }
        if dirty {
            frame.dirty = true;
        }
        frame.pinned = false;
        self.pool.touch(idx);
        Ok(())
    }

    /// Write back and unbind every frame of `fd`. Refuses while any of
    /// them is pinned.
    fn release_file(&mut self, fd: FileId) -> Result<()> {
        for idx in 0..self.pool.frames.len() {
            if let Some((f, _)) = self.pool.frames[idx].key {
                if f == fd && self.pool.frames[idx].pinned {
                    return Err(Error::PageFixed);
                }
            }
        }
        for idx in 0..self.pool.frames.len() {
            let Some((f, pn)) = self.pool.frames[idx].key else {
                continue;
            };
            if f != fd {
                continue;
            }
            if self.pool.frames[idx].dirty {
                self.flush_frame(idx)?;
            }
            self.pool.map.remove(fd, pn)?;
            self.pool.unlink(idx);
            self.pool.push_free(idx);
        }
        Ok(())
    }
}

fn page_offset(page_size: usize, pn: PageNum) -> u64 {
    HEADER_BYTES as u64 + pn as u64 * (PAGE_PREFIX_BYTES + page_size) as u64
}

fn encode_header(hdr: &FileHeader) -> Result<[u8; HEADER_BYTES]> {
    let mut buf = [0u8; HEADER_BYTES];
    let written = encode_into_slice(hdr, &mut buf, codec()).map_err(|_| Error::HdrWrite)?;
    debug_assert_eq!(written, HEADER_BYTES);
    Ok(buf)
}

fn decode_header(buf: &[u8]) -> Result<FileHeader> {
    let (hdr, read) = decode_from_slice(buf, codec()).map_err(|_| Error::HdrRead)?;
    debug_assert_eq!(read, HEADER_BYTES);
    Ok(hdr)
}

fn short_read(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::IncompleteRead
    } else {
        e.into()
    }
}

fn short_read_hdr(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::HdrRead
    } else {
        e.into()
    }
}
