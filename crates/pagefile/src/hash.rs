//! Bucketed hash table locating the buffer frame that holds a given
//! `(file, page)` pair. Entries live in per-bucket vectors; the bucket of a
//! pair is `(fd + page) % buckets`.

use common::{Error, FileId, PageNum, Result};

struct Entry {
    fd: FileId,
    page: PageNum,
    frame: usize,
}

pub(crate) struct FrameMap {
    buckets: Vec<Vec<Entry>>,
}

impl FrameMap {
    pub(crate) fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
        }
    }

    fn bucket(&self, fd: FileId, page: PageNum) -> usize {
        (fd.0 + page as usize) % self.buckets.len()
    }

    /// Frame index holding `(fd, page)`, if resident.
    pub(crate) fn find(&self, fd: FileId, page: PageNum) -> Option<usize> {
        self.buckets[self.bucket(fd, page)]
            .iter()
            .find(|e| e.fd == fd && e.page == page)
            .map(|e| e.frame)
    }

    pub(crate) fn insert(&mut self, fd: FileId, page: PageNum, frame: usize) -> Result<()> {
        if self.find(fd, page).is_some() {
            return Err(Error::HashPageExist);
        }
        let bucket = self.bucket(fd, page);
        self.buckets[bucket].push(Entry { fd, page, frame });
        Ok(())
    }

    pub(crate) fn remove(&mut self, fd: FileId, page: PageNum) -> Result<()> {
        let bucket = self.bucket(fd, page);
        let chain = &mut self.buckets[bucket];
        let pos = chain
            .iter()
            .position(|e| e.fd == fd && e.page == page)
            .ok_or(Error::HashNotFound)?;
        chain.swap_remove(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let mut map = FrameMap::new(4);
        map.insert(FileId(0), 7, 3).unwrap();
        assert_eq!(map.find(FileId(0), 7), Some(3));
        assert_eq!(map.find(FileId(1), 7), None);
        map.remove(FileId(0), 7).unwrap();
        assert_eq!(map.find(FileId(0), 7), None);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut map = FrameMap::new(4);
        map.insert(FileId(0), 1, 0).unwrap();
        assert!(matches!(
            map.insert(FileId(0), 1, 5),
            Err(Error::HashPageExist)
        ));
    }

    #[test]
    fn remove_missing_rejected() {
        let mut map = FrameMap::new(4);
        assert!(matches!(
            map.remove(FileId(0), 9),
            Err(Error::HashNotFound)
        ));
    }

    #[test]
    fn colliding_pairs_coexist() {
        // (fd 0, page 5) and (fd 1, page 4) share bucket 1 of 4.
        let mut map = FrameMap::new(4);
        map.insert(FileId(0), 5, 0).unwrap();
        map.insert(FileId(1), 4, 1).unwrap();
        assert_eq!(map.find(FileId(0), 5), Some(0));
        assert_eq!(map.find(FileId(1), 4), Some(1));
    }
}
