//! Slotted-page layout for heap data pages, plus the meta page on page 0.
//!
//! A data page carries its header at offset 0, record bytes growing up
//! from `free_start`, and the slot directory growing down from the end of
//! the page (slot `i` at `page_size - (i + 1) * 4`). `free_end` is the low
//! edge of the directory, so the free region is `[free_start, free_end)`.

use bincode::config::{self, Config as BincodeConfig};
use bincode::serde::{decode_from_slice, encode_into_slice};
use common::{Error, PageNum, Result};
use serde::{Deserialize, Serialize};

pub(crate) const META_BYTES: usize = 32;
pub(crate) const PAGE_HDR_BYTES: usize = 10;
pub(crate) const SLOT_BYTES: usize = 4;

/// Slot length marking a deleted record.
pub(crate) const TOMBSTONE: i16 = -1;

/// `next_free_page` value of a data page that is not on the free-space
/// list. The list itself terminates with 0; page 0 is the meta page and
/// can never be a data page, which keeps "unlisted" and "end of list"
/// distinguishable for the tail entry.
pub(crate) const NOT_LISTED: PageNum = -1;
pub(crate) const FREE_LIST_END: PageNum = 0;

fn codec() -> impl BincodeConfig {
    config::legacy()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Meta {
    pub first_free_page: PageNum,
    pub first_data_page: PageNum,
    pub reserved: [i32; 6],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PageHeader {
    pub next_free_page: PageNum,
    pub slot_count: i16,
    pub free_start: i16,
    pub free_end: i16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct Slot {
    pub offset: i16,
    pub length: i16,
}

impl Slot {
    pub(crate) fn is_tombstone(&self) -> bool {
        self.length == TOMBSTONE
    }
}

pub(crate) fn read_meta(page: &[u8]) -> Result<Meta> {
    let (meta, read) =
        decode_from_slice(&page[..META_BYTES], codec()).map_err(|_| Error::HdrRead)?;
    debug_assert_eq!(read, META_BYTES);
    Ok(meta)
}

pub(crate) fn write_meta(page: &mut [u8], meta: &Meta) -> Result<()> {
    let written =
        encode_into_slice(meta, &mut page[..META_BYTES], codec()).map_err(|_| Error::HdrWrite)?;
    debug_assert_eq!(written, META_BYTES);
    Ok(())
}

pub(crate) fn read_header(page: &[u8]) -> Result<PageHeader> {
    let (hdr, read) =
        decode_from_slice(&page[..PAGE_HDR_BYTES], codec()).map_err(|_| Error::HdrRead)?;
    debug_assert_eq!(read, PAGE_HDR_BYTES);
    Ok(hdr)
}

pub(crate) fn write_header(page: &mut [u8], hdr: &PageHeader) -> Result<()> {
    let written = encode_into_slice(hdr, &mut page[..PAGE_HDR_BYTES], codec())
        .map_err(|_| Error::HdrWrite)?;
    debug_assert_eq!(written, PAGE_HDR_BYTES);
    Ok(())
}

fn slot_pos(page_size: usize, idx: i16) -> usize {
    page_size - (idx as usize + 1) * SLOT_BYTES
}

pub(crate) fn read_slot(page: &[u8], page_size: usize, idx: i16) -> Result<Slot> {
    let start = slot_pos(page_size, idx);
    let (slot, read) =
        decode_from_slice(&page[start..start + SLOT_BYTES], codec()).map_err(|_| Error::HdrRead)?;
    debug_assert_eq!(read, SLOT_BYTES);
    Ok(slot)
}

pub(crate) fn write_slot(page: &mut [u8], page_size: usize, idx: i16, slot: &Slot) -> Result<()> {
    let start = slot_pos(page_size, idx);
    let written = encode_into_slice(slot, &mut page[start..start + SLOT_BYTES], codec())
        .map_err(|_| Error::HdrWrite)?;
    debug_assert_eq!(written, SLOT_BYTES);
    Ok(())
}

/// Header of a freshly allocated data page, unlisted with an empty body.
pub(crate) fn init_data_page(page: &mut [u8], page_size: usize) -> Result<()> {
    write_header(
        page,
        &PageHeader {
            next_free_page: NOT_LISTED,
            slot_count: 0,
            free_start: PAGE_HDR_BYTES as i16,
            free_end: page_size as i16,
        },
    )
}

/// Bytes still insertable as one record, accounting for the slot entry the
/// insert would append.
pub(crate) fn effective_free(hdr: &PageHeader) -> i32 {
    hdr.free_end as i32 - hdr.free_start as i32 - SLOT_BYTES as i32
}
