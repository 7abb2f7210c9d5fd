//! SimpleFS: the flat, header-per-block file layout that lives on top of a
//! [`FlashDevice`].
//!
//! There is no directory tree and no free list. A file is one contiguous run
//! of 32 KiB blocks whose first page starts with a [`FileEntry`] header;
//! everything that isn't a header is free. Grounded on `simplefs.c`, carried
//! over block for block except for the one thing its own comments complain
//! about: the page cursor used to live in a file-level `static`, shared by
//! every caller. Here it is a field of [`SimpleFs`] instead, so two open
//! filesystems (or two tests) never fight over it.

use crate::flash::{FlashDevice, ImageFile, BLOCK_SIZE, PAGE_SIZE};
use thiserror::Error;

/// Size of a [`FileEntry`] once packed: 2 + 2 + 2 + 26 bytes.
pub const ENTRY_SIZE: usize = 32;
/// Maximum length of a stored file name.
pub const NAME_SIZE: usize = 26;
/// Sentinel block value marking a header slot as unused.
pub const FREE_BLOCK: u16 = 0xFFFF;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsStatus {
    #[error("no matching file entry was found")]
    FileEntryNotFound,
    #[error("the block does not hold a valid file entry")]
    BlockIsNotValid,
    #[error("the supplied file entry or parameters are invalid")]
    InvalidData,
    #[error(transparent)]
    Flash(#[from] crate::flash::FlashStatus),
}

pub type FsResult<T> = Result<T, FsStatus>;

/// A 32-byte directory entry occupying the first bytes of a file's leading
/// page. Block, start and size are little-endian on the wire; `name` is
/// zero-padded and, when it fills all 26 bytes, not NUL-terminated at all.
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

    /// Length of the stored name up to its first NUL, or the full 26 bytes
    /// if there isn't one.
    pub fn name_len(&self) -> usize {
        self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE)
    }

    /// The name as text, trimmed at its first NUL.
    pub fn name_str(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len()]).unwrap_or("")
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

/// Case-insensitive prefix test used by listing. Matches the original
/// `nameBeginsWith`: an empty prefix matches everything, and comparison runs
/// for `prefix.len()` bytes, so a prefix longer than the entry's own name can
/// never match (the entry's zero padding breaks the comparison).
fn name_begins_with(entry: &FileEntry, prefix: &[u8]) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if prefix.len() > NAME_SIZE {
        return false;
    }
    entry.name[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Case-insensitive exact-match test used by read/delete-by-name. Matches
/// the original `nameExactMatch`: the comparison runs for
/// `entry.name_len()` bytes, not `query.len()` bytes, so a query that is
/// merely a prefix of a longer stored name never matches, while a query
/// with trailing characters beyond the stored name's length still can. This
/// asymmetry is inherited rather than designed; it falls directly out of
/// `strncasecmp(entry->name, query, strlen(entry->name))`.
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

/// A SimpleFS filesystem mounted on a [`FlashDevice`] `D`.
///
/// Where the C implementation kept `current_page_address` as a translation
/// unit global shared by `SimpleFS_writeFile` and `SimpleFS_readFileNextPage`
/// alike (and relied on callers never interleaving a read session with a
/// write session), the cursor here is owned by the instance. Two
/// `SimpleFs` values, even over the same device, never see each other's
/// cursor.
pub struct SimpleFs<D: FlashDevice> {
    device: D,
    blocks: u16,
    cursor: Option<u32>,
}

impl<D: FlashDevice> SimpleFs<D> {
    pub fn new(device: D) -> Self {
        let blocks = device.block_count();
        SimpleFs {
            device,
            blocks,
            cursor: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    fn find_block(&mut self, from: u16, pred: impl Fn(&FileEntry) -> bool) -> FsResult<u16> {
        let mut header = [0u8; ENTRY_SIZE];
        for block in from..self.blocks {
            self.device
                .read_page(block as u32 * BLOCK_SIZE, &mut header)?;
            let entry = FileEntry::from_bytes(&header);
            if pred(&entry) {
                return Ok(block);
            }
        }
        Err(FsStatus::FileEntryNotFound)
    }

    /// Find the next file whose name matches `prefix`, scanning from
    /// `cursor` onward. Returns the matching block and its entry; callers
    /// wanting the next match call again with `cursor + 1`.
    pub fn list(&mut self, cursor: u16, prefix: Option<&[u8]>) -> FsResult<(u16, FileEntry)> {
        let block = self.find_block(cursor, |e| {
            !e.is_free() && name_begins_with(e, prefix.unwrap_or(b""))
        })?;
        let mut header = [0u8; ENTRY_SIZE];
        self.device.read_page(block as u32 * BLOCK_SIZE, &mut header)?;
        Ok((block, FileEntry::from_bytes(&header)))
    }

    /// Claim the first free block at or after `from_block` and stage a
    /// header for it in the internal page buffer, ready for
    /// [`write_file`](SimpleFs::write_file) to start programming pages.
    /// Nothing is written to the device yet.
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
        let entry = FileEntry {
            block,
            start,
            size: stop - start,
            name: pad_name(name)?,
        };
        // Trailing bytes default to the erased value, matching what an
        // untouched flash page reads back as.
        let mut page = [0xFFu8; PAGE_SIZE];
        page[..ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        self.cursor = Some(block as u32 * BLOCK_SIZE);
        Ok((block, ENTRY_SIZE as u16 + entry.size, page))
    }

    /// Program `page` at the current write cursor and advance it by one
    /// page. Must follow a [`create_entry`](SimpleFs::create_entry) call (or
    /// a prior `write_file` call); the first call writes the header page.
    pub fn write_file(&mut self, page: &[u8; PAGE_SIZE]) -> FsResult<()> {
        let addr = self.cursor.ok_or(FsStatus::InvalidData)?;
        self.device.write_page(addr, page)?;
        self.device.wait_until_free(DEFAULT_TIMEOUT_MS)?;
        self.cursor = Some(addr + PAGE_SIZE as u32);
        Ok(())
    }

    /// Locate a file by name and read its leading page. Returns the file's
    /// total size in bytes, header included.
    pub fn read_by_name(&mut self, name: &[u8]) -> FsResult<(u16, [u8; PAGE_SIZE])> {
        let block = self.find_block(0, |e| !e.is_free() && name_exact_match(e, name))?;
        self.read_leading_page(block)
    }

    /// Read a file's leading page given its block number directly, rejecting
    /// blocks whose stored header disagrees about its own block number.
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

    /// Read the page following the last one read or written.
    pub fn read_next_page(&mut self) -> FsResult<[u8; PAGE_SIZE]> {
        let addr = self.cursor.ok_or(FsStatus::InvalidData)? + PAGE_SIZE as u32;
        let mut page = [0u8; PAGE_SIZE];
        self.device.read_page(addr, &mut page)?;
        self.cursor = Some(addr);
        Ok(page)
    }

    /// Erase the block holding the named file.
    pub fn delete_by_name(&mut self, name: &[u8]) -> FsResult<()> {
        let block = self.find_block(0, |e| !e.is_free() && name_exact_match(e, name))?;
        self.device.erase_block_32(block as u32 * BLOCK_SIZE, true)?;
        Ok(())
    }

    /// Erase a block by number, refusing to do so unless the block's own
    /// header agrees it holds that block number.
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

/// Default page-program wait, matching `W25Q64FV_DEFAULT_TIMEOUT`.
const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Operations that only make sense against a file standing in for the whole
/// chip: you can resize or renumber an image, but not a soldered-down part.
impl SimpleFs<ImageFile> {
    /// Resize and zero-fill the backing image to hold exactly `blocks`
    /// blocks, then remount on the new size. Equivalent to running `fdutil`'s
    /// `i` command.
    pub fn init(&mut self, blocks: u16) -> FsResult<()> {
        self.device.resize_erased(blocks)?;
        self.blocks = blocks;
        self.cursor = None;
        Ok(())
    }

    /// Rewrite every block's leading index so the image can be relocated to
    /// a different base block. Equivalent to `fdutil`'s `m` command.
    pub fn reindex(&mut self, first_block: u16) -> FsResult<()> {
        self.device.reindex(first_block)?;
        Ok(())
    }
}
