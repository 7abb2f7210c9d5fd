//! Flash device abstraction.
//!
//! A [`FlashDevice`] is anything that can stand in for the 8 MiB NOR chip: the
//! real part over SPI, or a host-side image file used for testing and for the
//! `fdutil`-style command line tool. [`SimpleFs`](crate::fs::SimpleFs) is
//! written against the trait only and does not know which one it has.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

/// Bytes moved per program/read operation.
pub const PAGE_SIZE: usize = 256;
/// Erase granularity. The only unit `SimpleFs` ever erases.
pub const BLOCK_SIZE: u32 = 32 * 1024;
/// Block count on the real chip (8 MiB / 32 KiB).
pub const CHIP_BLOCKS: u16 = 256;

/// Mirrors the original firmware's `W25Q64FV_status_t`. `Ok` is folded into
/// `Result::Ok(())` rather than carried as a variant.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    #[error("flash did not respond to the command sequence")]
    CommunicationFail,
    #[error("flash reported busy when an idle device was required")]
    Busy,
    #[error("timed out waiting for the flash to clear its busy flag")]
    Timeout,
    #[error("the requested operation is not valid for this device")]
    NotValid,
}

/// SPI opcodes for the W25Q64-family part. Reused verbatim from the chip's
/// datasheet; only the subset `SerialChip` actually issues is kept.
pub mod opcodes {
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const READ_STATUS_1: u8 = 0x05;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const BLOCK_ERASE_32K: u8 = 0x52;
    pub const CHIP_ERASE: u8 = 0xC7;
    pub const READ_DATA: u8 = 0x03;
    pub const ENABLE_RESET: u8 = 0x66;
    pub const RESET_DEVICE: u8 = 0x99;
}

/// Contract every backend must satisfy. `SimpleFs` never erases or programs
/// anything outside of this trait, so swapping backends never changes its
/// behavior.
///
/// Timing and bus framing (asserting CS, clocking an opcode, polling the
/// status register) are entirely the implementor's concern; `SimpleFs` only
/// ever sees success or one of the four [`FlashStatus`] outcomes.
pub trait FlashDevice {
    /// Number of erasable 32 KiB blocks this device presents.
    fn block_count(&self) -> u16;

    /// Read `buf.len()` bytes starting at `addr`. `buf` may be shorter than a
    /// full page; callers use this to read just a file header.
    fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashStatus>;

    /// Program one full page. Does not wait for the chip to leave busy
    /// afterwards -- callers that issue several writes in a row call
    /// [`wait_until_free`](FlashDevice::wait_until_free) themselves so they
    /// only pay for one poll per page, not one inside this call plus one
    /// outside it.
    fn write_page(&mut self, addr: u32, page: &[u8; PAGE_SIZE]) -> Result<(), FlashStatus>;

    /// Erase the 32 KiB block containing `addr`. `hold` requests that the
    /// call not return until the erase completes (real chip); image backends
    /// are instantaneous and ignore it.
    fn erase_block_32(&mut self, addr: u32, hold: bool) -> Result<(), FlashStatus>;

    /// Erase the entire device.
    fn erase_chip(&mut self, hold: bool) -> Result<(), FlashStatus>;

    /// True if the device is mid-program or mid-erase.
    fn busy(&mut self) -> bool;

    /// Poll [`busy`](FlashDevice::busy) until it clears or `timeout_ms`
    /// elapses.
    fn wait_until_free(&mut self, timeout_ms: u64) -> Result<(), FlashStatus>;
}

/// Host-side backend: an ordinary file standing in for the chip's 8 MiB
/// address space. Grounded on the original `w25q64fv.c` image-file routines;
/// there is no SPI bus here so every operation that would wait on a busy flag
/// completes immediately.
pub struct ImageFile {
    file: File,
    blocks: u16,
}

impl ImageFile {
    /// Open an existing image, or create an empty one, without touching its
    /// size. Mirrors `W25Q64FV_begin`: the block count is derived from
    /// whatever is already on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FlashStatus> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|_| FlashStatus::CommunicationFail)?;
        let len = file.metadata().map_err(|_| FlashStatus::CommunicationFail)?.len();
        let blocks = (len / BLOCK_SIZE as u64) as u16;
        Ok(ImageFile { file, blocks })
    }

    /// Resize the backing file to exactly `blocks * BLOCK_SIZE`, filling
    /// every byte with `0xFF` as an erased chip would read. Grounded on
    /// `W25Q64FV_init`: existing files are extended or truncated in place,
    /// never deleted and recreated.
    pub fn resize_erased(&mut self, blocks: u16) -> Result<(), FlashStatus> {
        let target_len = blocks as u64 * BLOCK_SIZE as u64;
        let current_len = self
            .file
            .metadata()
            .map_err(|_| FlashStatus::CommunicationFail)?
            .len();
        if target_len > current_len {
            self.file
                .seek(SeekFrom::End(0))
                .map_err(|_| FlashStatus::CommunicationFail)?;
            let fill = vec![0xFFu8; BLOCK_SIZE as usize];
            let mut remaining = target_len - current_len;
            while remaining > 0 {
                let chunk = remaining.min(fill.len() as u64) as usize;
                self.file
                    .write_all(&fill[..chunk])
                    .map_err(|_| FlashStatus::CommunicationFail)?;
                remaining -= chunk as u64;
            }
        } else {
            self.file
                .set_len(0)
                .map_err(|_| FlashStatus::CommunicationFail)?;
            self.file
                .seek(SeekFrom::Start(0))
                .map_err(|_| FlashStatus::CommunicationFail)?;
            let fill = vec![0xFFu8; BLOCK_SIZE as usize];
            let mut remaining = target_len;
            while remaining > 0 {
                let chunk = remaining.min(fill.len() as u64) as usize;
                self.file
                    .write_all(&fill[..chunk])
                    .map_err(|_| FlashStatus::CommunicationFail)?;
                remaining -= chunk as u64;
            }
        }
        self.blocks = blocks;
        Ok(())
    }

    /// Rewrite the leading two bytes of every block to a new sequential
    /// block index, starting at `first_block`. Grounded on `handle_move`:
    /// this is a raw file patch, not a `FlashDevice::write_page` call, since
    /// on real NOR media you cannot set bits back to `1` without erasing, and
    /// this operation only ever makes sense against a prepared image.
    pub fn reindex(&mut self, first_block: u16) -> Result<(), FlashStatus> {
        for k in 0..self.blocks {
            let addr = k as u64 * BLOCK_SIZE as u64;
            let index = first_block.wrapping_add(k);
            self.file
                .seek(SeekFrom::Start(addr))
                .map_err(|_| FlashStatus::CommunicationFail)?;
            self.file
                .write_all(&index.to_le_bytes())
                .map_err(|_| FlashStatus::CommunicationFail)?;
        }
        Ok(())
    }
}

impl FlashDevice for ImageFile {
    fn block_count(&self) -> u16 {
        self.blocks
    }

    fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashStatus> {
        self.file
            .seek(SeekFrom::Start(addr as u64))
            .map_err(|_| FlashStatus::CommunicationFail)?;
        self.file
            .read_exact(buf)
            .map_err(|_| FlashStatus::CommunicationFail)
    }

    fn write_page(&mut self, addr: u32, page: &[u8; PAGE_SIZE]) -> Result<(), FlashStatus> {
        self.file
            .seek(SeekFrom::Start(addr as u64))
            .map_err(|_| FlashStatus::CommunicationFail)?;
        self.file
            .write_all(page)
            .map_err(|_| FlashStatus::CommunicationFail)
    }

    fn erase_block_32(&mut self, addr: u32, _hold: bool) -> Result<(), FlashStatus> {
        if addr % BLOCK_SIZE != 0 {
            return Err(FlashStatus::NotValid);
        }
        self.file
            .seek(SeekFrom::Start(addr as u64))
            .map_err(|_| FlashStatus::CommunicationFail)?;
        self.file
            .write_all(&[0xFFu8; BLOCK_SIZE as usize])
            .map_err(|_| FlashStatus::CommunicationFail)
    }

    fn erase_chip(&mut self, _hold: bool) -> Result<(), FlashStatus> {
        let blocks = self.blocks;
        self.resize_erased(blocks)
    }

    fn busy(&mut self) -> bool {
        false
    }

    fn wait_until_free(&mut self, _timeout_ms: u64) -> Result<(), FlashStatus> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn open_creates_missing_file_with_zero_blocks() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_owned();
        drop(tmp);
        let image = ImageFile::open(&path).unwrap();
        assert_eq!(image.block_count(), 0);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn resize_erased_fills_0xff_and_sets_block_count() {
        let tmp = NamedTempFile::new().unwrap();
        let mut image = ImageFile::open(tmp.path()).unwrap();
        image.resize_erased(2).unwrap();
        assert_eq!(image.block_count(), 2);
        let mut buf = [0u8; PAGE_SIZE];
        image.read_page(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
        image.read_page(BLOCK_SIZE, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        let mut image = ImageFile::open(tmp.path()).unwrap();
        image.resize_erased(1).unwrap();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        image.write_page(0, &page).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        image.read_page(0, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn erase_block_32_requires_block_aligned_address() {
        let tmp = NamedTempFile::new().unwrap();
        let mut image = ImageFile::open(tmp.path()).unwrap();
        image.resize_erased(1).unwrap();
        assert_eq!(image.erase_block_32(1, true), Err(FlashStatus::NotValid));
    }

    #[test]
    fn reindex_touches_only_leading_two_bytes_per_block() {
        let tmp = NamedTempFile::new().unwrap();
        let mut image = ImageFile::open(tmp.path()).unwrap();
        image.resize_erased(2).unwrap();
        let mut payload = [0u8; PAGE_SIZE];
        payload[10] = 0x42;
        image.write_page(0, &payload).unwrap();
        image.write_page(BLOCK_SIZE, &payload).unwrap();

        image.reindex(5).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        image.read_page(0, &mut out).unwrap();
        assert_eq!(&out[0..2], &5u16.to_le_bytes());
        assert_eq!(out[10], 0x42);
        image.read_page(BLOCK_SIZE, &mut out).unwrap();
        assert_eq!(&out[0..2], &6u16.to_le_bytes());
        assert_eq!(out[10], 0x42);
    }
}
