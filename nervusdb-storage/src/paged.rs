//! Append-only page files, one per index order, addressed through the
//! manifest catalog. Pages are never overwritten in place; superseded
//! pages become orphans and are reclaimed by GC rewriting the file.

use crate::manifest::PageEntry;
use crate::page::{self, PageData};
use crate::{Error, Result};
use nervusdb_api::IndexOrder;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

#[derive(Debug)]
struct OrderFile {
    file: File,
    len: u64,
}

#[derive(Debug)]
pub struct PagedIndex {
    dir: PathBuf,
    files: [OrderFile; 6],
}

pub fn file_name(order: IndexOrder) -> String {
    format!("{}.idxpage", order.name())
}

impl PagedIndex {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut files = Vec::with_capacity(6);
        for order in IndexOrder::ALL {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.join(file_name(order)))?;
            let len = file.metadata()?.len();
            files.push(OrderFile { file, len });
        }
        let files: [OrderFile; 6] = files
            .try_into()
            .map_err(|_| Error::Internal("order file array"))?;
        Ok(Self { dir, files })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot(&self, order: IndexOrder) -> &OrderFile {
        &self.files[order_slot(order)]
    }

    pub fn file_len(&self, order: IndexOrder) -> u64 {
        self.slot(order).len
    }

    /// Appends encoded page bytes, returning their `(offset, length)`.
    /// Durability is the caller's: `sync` before publishing a manifest.
    pub fn append_page(&mut self, order: IndexOrder, bytes: &[u8]) -> Result<(u64, u32)> {
        let slot = &mut self.files[order_slot(order)];
        let offset = slot.len;
        write_all_at(&slot.file, offset, bytes)?;
        slot.len += bytes.len() as u64;
        Ok((offset, bytes.len() as u32))
    }

    pub fn sync_all(&mut self) -> Result<()> {
        for slot in &self.files {
            slot.file.sync_data()?;
        }
        Ok(())
    }

    pub fn read_page_bytes(&self, order: IndexOrder, offset: u64, length: u32) -> Result<Vec<u8>> {
        let slot = self.slot(order);
        let end = offset
            .checked_add(u64::from(length))
            .ok_or(Error::StorageCorrupted("page range overflow"))?;
        if end > slot.len {
            return Err(Error::StorageCorrupted("page out of file bounds"));
        }
        let mut buf = vec![0u8; length as usize];
        read_exact_at(&slot.file, offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads and verifies one catalog entry. The manifest CRC covers the
    /// whole on-disk page byte range.
    pub fn read_entry(&self, order: IndexOrder, entry: &PageEntry) -> Result<PageData> {
        let bytes = self.read_page_bytes(order, entry.offset, entry.length)?;
        if page::page_crc(&bytes) != entry.crc32 {
            return Err(Error::PageCrcMismatch {
                order,
                page_id: entry.page_id,
            });
        }
        let data = page::decode_page(&bytes)?;
        if data.primary != entry.primary_value {
            return Err(Error::PageCrcMismatch {
                order,
                page_id: entry.page_id,
            });
        }
        Ok(data)
    }

    /// Rewrites one order's file keeping only `live` pages, in catalog
    /// order. Returns the relocated entries and the byte sizes before and
    /// after. The temp-then-rename dance keeps a crash recoverable: either
    /// the old file or the fully-written new one survives.
    pub fn rewrite_order(
        &mut self,
        order: IndexOrder,
        live: &[PageEntry],
    ) -> Result<(Vec<PageEntry>, u64, u64)> {
        let old_len = self.file_len(order);
        let tmp_path = self.dir.join(format!("{}.tmp", file_name(order)));
        let tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut relocated = Vec::with_capacity(live.len());
        let mut cursor = 0u64;
        for entry in live {
            let bytes = self.read_page_bytes(order, entry.offset, entry.length)?;
            write_all_at(&tmp, cursor, &bytes)?;
            let mut moved = *entry;
            moved.offset = cursor;
            cursor += bytes.len() as u64;
            relocated.push(moved);
        }
        tmp.sync_data()?;
        drop(tmp);

        std::fs::rename(&tmp_path, self.dir.join(file_name(order)))?;
        crate::manifest::sync_dir(&self.dir)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dir.join(file_name(order)))?;
        let len = file.metadata()?.len();
        self.files[order_slot(order)] = OrderFile { file, len };
        debug!(order = %order, old_len, new_len = len, "order file rewritten");
        Ok((relocated, old_len, cursor))
    }
}

const fn order_slot(order: IndexOrder) -> usize {
    match order {
        IndexOrder::Spo => 0,
        IndexOrder::Sop => 1,
        IndexOrder::Pos => 2,
        IndexOrder::Pso => 3,
        IndexOrder::Osp => 4,
        IndexOrder::Ops => 5,
    }
}

fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = read_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at returned 0 bytes",
            ));
        }
        offset = offset.saturating_add(n as u64);
        buf = &mut buf[n..];
    }
    Ok(())
}

fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = write_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_at returned 0 bytes",
            ));
        }
        offset = offset.saturating_add(n as u64);
        buf = &buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.seek_write(buf, offset)
}
