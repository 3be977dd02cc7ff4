use crate::buf::PageData;
use crate::PagedFiles;
use common::{FileId, PageNum, Result};
use std::cell::{Cell, Ref, RefMut};

/// Scoped pin on a buffered page.
///
/// A guard is handed out by every fixing operation of [`PagedFiles`]. While
/// it lives, the page cannot be evicted. Dropping the guard unfixes the
/// page with the dirty flag accumulated through [`PageGuard::bytes_mut`] /
/// [`PageGuard::mark_dirty`]; [`PageGuard::release`] does the same but
/// surfaces the unfix error. Error paths in the layers above therefore
/// cannot leak pins.
pub struct PageGuard {
    pf: PagedFiles,
    fd: FileId,
    page: PageNum,
    data: PageData,
    dirty: Cell<bool>,
    released: Cell<bool>,
}

impl PageGuard {
    pub(crate) fn new(pf: PagedFiles, fd: FileId, page: PageNum, data: PageData) -> Self {
        Self {
            pf,
            fd,
            page,
            data,
            dirty: Cell::new(false),
            released: Cell::new(false),
        }
    }

    pub fn page_num(&self) -> PageNum {
        self.page
    }

    /// Read-only view of the page bytes.
    ///
    /// The borrow must end before the next call into [`PagedFiles`].
    pub fn bytes(&self) -> Ref<'_, [u8]> {
        Ref::map(self.data.borrow(), |b| &b[..])
    }

    /// Mutable view of the page bytes; marks the guard dirty.
    pub fn bytes_mut(&self) -> RefMut<'_, [u8]> {
        self.dirty.set(true);
        RefMut::map(self.data.borrow_mut(), |b| &mut b[..])
    }

    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    /// Unfix now, forcing the dirty flag if `dirty` is set, and surface the
    /// error instead of swallowing it in `Drop`.
    pub fn release(self, dirty: bool) -> Result<()> {
        self.released.set(true);
        self.pf
            .unfix_page(self.fd, self.page, dirty || self.dirty.get())
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if !self.released.get() {
            if let Err(e) = self.pf.unfix_page(self.fd, self.page, self.dirty.get()) {
                log::warn!(
                    "unfix of page {} in file {} failed on drop: {e}",
                    self.page,
                    self.fd.0
                );
            }
        }
    }
}
