//! `no_std` twin of `simplefs-core::fs`. Same layout, same predicates, same
//! asymmetric name matching -- only the storage (no heap, fixed buffers) and
//! the absence of an image backend differ, since there is only ever one
//! chip here and it is never resized or renumbered.

use crate::flash::{FlashDevice, BLOCK_SIZE, PAGE_SIZE};

pub const ENTRY_SIZE: usize = 32;
pub const NAME_SIZE: usize = 26;
pub const FREE_BLOCK: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsStatus {
    FileEntryNotFound,
    BlockIsNotValid,
    InvalidData,
    Flash(crate::flash::FlashStatus),
}

impl From<crate::flash::FlashStatus> for FsStatus {
    fn from(e: crate::flash::FlashStatus) -> Self {
        FsStatus::Flash(e)
    }
}

pub type FsResult<T> = Result<T, FsStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub block: u16,
    pub start: u16,
    pub size: u16,
    pub name: [u8; NAME_SIZE],
}

impl FileEntry {
    pub fn is_free(&self) -> bool {
        self.block == FREE_BLOCK
    }

    pub fn name_len(&self) -> usize {
        self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE)
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut name = [0u8; NAME_SIZE];
        name.copy_from_slice(&buf[6..6 + NAME_SIZE]);
        FileEntry {
            block: u16::from_le_bytes([buf[0], buf[1]]),
            start: u16::from_le_bytes([buf[2], buf[3]]),
            size: u16::from_le_bytes([buf[4], buf[5]]),
            name,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..2].copy_from_slice(&self.block.to_le_bytes());
        out[2..4].copy_from_slice(&self.start.to_le_bytes());
        out[4..6].copy_from_slice(&self.size.to_le_bytes());
        out[6..6 + NAME_SIZE].copy_from_slice(&self.name);
        out
    }
}

fn name_begins_with(entry: &FileEntry, prefix: &[u8]) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if prefix.len() > NAME_SIZE {
        return false;
    }
    entry.name[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn name_exact_match(entry: &FileEntry, query: &[u8]) -> bool {
    let n = entry.name_len();
    if query.len() < n {
        return false;
    }
    entry.name[..n].eq_ignore_ascii_case(&query[..n])
}

fn pad_name(name: &[u8]) -> FsResult<[u8; NAME_SIZE]> {
    if name.len() > NAME_SIZE {
        return Err(FsStatus::InvalidData);
    }
    let mut out = [0u8; NAME_SIZE];
    out[..name.len()].copy_from_slice(name);
    Ok(out)
}

const DEFAULT_TIMEOUT_MS: u64 = 5000;

pub struct SimpleFs<D: FlashDevice> {
    device: D,
    blocks: u16,
    cursor: Option<u32>,
}

impl<D: FlashDevice> SimpleFs<D> {
    pub fn new(device: D) -> Self {
        let blocks = device.block_count();
        SimpleFs { device, blocks, cursor: None }
    }

    fn find_block(&mut self, from: u16, pred: impl Fn(&FileEntry) -> bool) -> FsResult<u16> {
        let mut header = [0u8; ENTRY_SIZE];
        for block in from..self.blocks {
            self.device.read_page(block as u32 * BLOCK_SIZE, &mut header)?;
            let entry = FileEntry::from_bytes(&header);
            if pred(&entry) {
                return Ok(block);
            }
        }
        Err(FsStatus::FileEntryNotFound)
    }

    pub fn list(&mut self, cursor: u16, prefix: &[u8]) -> FsResult<(u16, FileEntry)> {
        let block = self.find_block(cursor, |e| !e.is_free() && name_begins_with(e, prefix))?;
        let mut header = [0u8; ENTRY_SIZE];
        self.device.read_page(block as u32 * BLOCK_SIZE, &mut header)?;
        Ok((block, FileEntry::from_bytes(&header)))
    }

    pub fn create_entry(
        &mut self,
        from_block: u16,
        name: &[u8],
        start: u16,
        stop: u16,
    ) -> FsResult<(u16, u16, [u8; PAGE_SIZE])> {
        if start > stop {
            return Err(FsStatus::InvalidData);
        }
        let block = self.find_block(from_block, |e| e.is_free())?;
        let entry = FileEntry { block, start, size: stop - start, name: pad_name(name)? };
        let mut page = [0xFFu8; PAGE_SIZE];
        page[..ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        self.cursor = Some(block as u32 * BLOCK_SIZE);
        Ok((block, ENTRY_SIZE as u16 + entry.size, page))
    }

    pub fn write_file(&mut self, page: &[u8; PAGE_SIZE]) -> FsResult<()> {
        let addr = self.cursor.ok_or(FsStatus::InvalidData)?;
        self.device.write_page(addr, page)?;
        self.device.wait_until_free(DEFAULT_TIMEOUT_MS)?;
        self.cursor = Some(addr + PAGE_SIZE as u32);
        Ok(())
    }

    pub fn read_by_name(&mut self, name: &[u8]) -> FsResult<(u16, [u8; PAGE_SIZE])> {
        let block = self.find_block(0, |e| !e.is_free() && name_exact_match(e, name))?;
        self.read_leading_page(block)
    }

    pub fn read_by_block(&mut self, block: u16) -> FsResult<(u16, [u8; PAGE_SIZE])> {
        if block >= self.blocks {
            return Err(FsStatus::BlockIsNotValid);
        }
        let mut header = [0u8; ENTRY_SIZE];
        self.device.read_page(block as u32 * BLOCK_SIZE, &mut header)?;
        if FileEntry::from_bytes(&header).block != block {
            return Err(FsStatus::BlockIsNotValid);
        }
        self.read_leading_page(block)
    }

    fn read_leading_page(&mut self, block: u16) -> FsResult<(u16, [u8; PAGE_SIZE])> {
        let addr = block as u32 * BLOCK_SIZE;
        let mut page = [0u8; PAGE_SIZE];
        self.device.read_page(addr, &mut page)?;
        let size = ENTRY_SIZE as u16 + FileEntry::from_bytes(&page[..ENTRY_SIZE]).size;
        self.cursor = Some(addr);
        Ok((size, page))
    }

    pub fn read_next_page(&mut self) -> FsResult<[u8; PAGE_SIZE]> {
        let addr = self.cursor.ok_or(FsStatus::InvalidData)? + PAGE_SIZE as u32;
        let mut page = [0u8; PAGE_SIZE];
        self.device.read_page(addr, &mut page)?;
        self.cursor = Some(addr);
        Ok(page)
    }

    pub fn delete_by_name(&mut self, name: &[u8]) -> FsResult<()> {
        let block = self.find_block(0, |e| !e.is_free() && name_exact_match(e, name))?;
        self.device.erase_block_32(block as u32 * BLOCK_SIZE, true)?;
        Ok(())
    }

    pub fn delete_by_block(&mut self, block: u16) -> FsResult<()> {
        let mut header = [0u8; ENTRY_SIZE];
        self.device.read_page(block as u32 * BLOCK_SIZE, &mut header)?;
        if FileEntry::from_bytes(&header).block != block {
            return Err(FsStatus::BlockIsNotValid);
        }
        self.device.erase_block_32(block as u32 * BLOCK_SIZE, true)?;
        Ok(())
    }
}
