//! Real-chip [`FlashDevice`]: a W25Q64FV over the STM32's hardware SPI
//! peripheral.
//!
//! This mirrors `simplefs-core`'s `flash` module (same trait shape, same
//! status taxonomy) rather than importing it: `simplefs-core` links against
//! `std` for its image-file backend, which this `#![no_std]` binary cannot
//! pull in. Grounded on `firmware/stm32f1/src/spi_nor.rs`'s
//! `SpiNorController`, generalized from a bag of SPI commands into the same
//! six-method contract the host-side tool drives its image file through.

use embassy_stm32::gpio::Output;
use embassy_stm32::mode::Blocking;
use embassy_stm32::spi::Spi;
use embassy_time::{Duration, Instant};

pub const PAGE_SIZE: usize = 256;
pub const BLOCK_SIZE: u32 = 32 * 1024;
pub const CHIP_BLOCKS: u16 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    CommunicationFail,
    Busy,
    Timeout,
    NotValid,
}

mod opcodes {
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const READ_STATUS_1: u8 = 0x05;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const BLOCK_ERASE_32K: u8 = 0x52;
    pub const CHIP_ERASE: u8 = 0xC7;
    pub const READ_DATA: u8 = 0x03;
    pub const READ_JEDEC_ID: u8 = 0x9F;
    pub const ENABLE_RESET: u8 = 0x66;
    pub const RESET_DEVICE: u8 = 0x99;
}

const STATUS1_BUSY: u8 = 0x01;

pub trait FlashDevice {
    fn block_count(&self) -> u16;
    fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashStatus>;
    fn write_page(&mut self, addr: u32, page: &[u8; PAGE_SIZE]) -> Result<(), FlashStatus>;
    fn erase_block_32(&mut self, addr: u32, hold: bool) -> Result<(), FlashStatus>;
    fn erase_chip(&mut self, hold: bool) -> Result<(), FlashStatus>;
    fn busy(&mut self) -> bool;
    fn wait_until_free(&mut self, timeout_ms: u64) -> Result<(), FlashStatus>;
}

pub struct SerialChip<'d, SPI: embassy_stm32::spi::Instance> {
    spi: Spi<'d, SPI, Blocking>,
    cs: Output<'d>,
}

impl<'d, SPI: embassy_stm32::spi::Instance> SerialChip<'d, SPI> {
    /// Binds to the chip and verifies it is actually there: reads back the
    /// JEDEC ID (manufacturer byte must be non-zero -- an unconnected or
    /// dead part reads back all `0xFF` or all `0x00`) and issues the
    /// reset sequence, mirroring `W25Q64FV_begin`'s presence check plus
    /// `W25Q64FV_init`'s reset-on-open.
    pub fn open(spi: Spi<'d, SPI, Blocking>, cs: Output<'d>) -> Result<Self, FlashStatus> {
        let mut chip = SerialChip { spi, cs };
        let id = chip.read_jedec_id()?;
        if id[0] == 0x00 {
            return Err(FlashStatus::CommunicationFail);
        }
        chip.reset();
        Ok(chip)
    }

    fn read_jedec_id(&mut self) -> Result<[u8; 3], FlashStatus> {
        let mut id = [0u8; 3];
        self.cs_low();
        let cmd_result = self.spi.blocking_write(&[opcodes::READ_JEDEC_ID]);
        let read_result = self.spi.blocking_read(&mut id);
        self.cs_high();
        cmd_result.and(read_result).map_err(|_| FlashStatus::CommunicationFail)?;
        Ok(id)
    }

    fn reset(&mut self) {
        self.cs_low();
        let _ = self.spi.blocking_write(&[opcodes::ENABLE_RESET]);
        self.cs_high();
        self.cs_low();
        let _ = self.spi.blocking_write(&[opcodes::RESET_DEVICE]);
        self.cs_high();
    }

    fn cs_low(&mut self) {
        self.cs.set_low();
    }

    fn cs_high(&mut self) {
        self.cs.set_high();
    }

    fn addr_bytes(addr: u32) -> [u8; 3] {
        [((addr >> 16) & 0xFF) as u8, ((addr >> 8) & 0xFF) as u8, (addr & 0xFF) as u8]
    }

    fn write_enable(&mut self) {
        self.cs_low();
        let _ = self.spi.blocking_write(&[opcodes::WRITE_ENABLE]);
        self.cs_high();
    }

    fn status1(&mut self) -> u8 {
        let mut status = [0u8; 1];
        self.cs_low();
        let _ = self.spi.blocking_write(&[opcodes::READ_STATUS_1]);
        let _ = self.spi.blocking_read(&mut status);
        self.cs_high();
        status[0]
    }
}

impl<'d, SPI: embassy_stm32::spi::Instance> FlashDevice for SerialChip<'d, SPI> {
    fn block_count(&self) -> u16 {
        CHIP_BLOCKS
    }

    fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashStatus> {
        let a = Self::addr_bytes(addr);
        self.cs_low();
        let cmd = [opcodes::READ_DATA, a[0], a[1], a[2]];
        if self.spi.blocking_write(&cmd).is_err() {
            self.cs_high();
            return Err(FlashStatus::CommunicationFail);
        }
        let result = self.spi.blocking_read(buf);
        self.cs_high();
        result.map_err(|_| FlashStatus::CommunicationFail)
    }

    fn write_page(&mut self, addr: u32, page: &[u8; PAGE_SIZE]) -> Result<(), FlashStatus> {
        if self.busy() {
            return Err(FlashStatus::Busy);
        }
        self.write_enable();
        let a = Self::addr_bytes(addr);
        self.cs_low();
        let cmd = [opcodes::PAGE_PROGRAM, a[0], a[1], a[2]];
        let result = self.spi.blocking_write(&cmd).and_then(|_| self.spi.blocking_write(page));
        self.cs_high();
        result.map_err(|_| FlashStatus::CommunicationFail)
    }

    fn erase_block_32(&mut self, addr: u32, hold: bool) -> Result<(), FlashStatus> {
        if addr % BLOCK_SIZE != 0 {
            return Err(FlashStatus::NotValid);
        }
        self.write_enable();
        let a = Self::addr_bytes(addr);
        self.cs_low();
        let result = self.spi.blocking_write(&[opcodes::BLOCK_ERASE_32K, a[0], a[1], a[2]]);
        self.cs_high();
        result.map_err(|_| FlashStatus::CommunicationFail)?;
        if hold {
            self.wait_until_free(DEFAULT_ERASE_TIMEOUT_MS)
        } else {
            Ok(())
        }
    }

    fn erase_chip(&mut self, hold: bool) -> Result<(), FlashStatus> {
        self.write_enable();
        self.cs_low();
        let result = self.spi.blocking_write(&[opcodes::CHIP_ERASE]);
        self.cs_high();
        result.map_err(|_| FlashStatus::CommunicationFail)?;
        if hold {
            self.wait_until_free(CHIP_ERASE_TIMEOUT_MS)
        } else {
            Ok(())
        }
    }

    fn busy(&mut self) -> bool {
        self.status1() & STATUS1_BUSY != 0
    }

    fn wait_until_free(&mut self, timeout_ms: u64) -> Result<(), FlashStatus> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while self.busy() {
            if Instant::now() > deadline {
                return Err(FlashStatus::Timeout);
            }
        }
        Ok(())
    }
}

/// Matches `W25Q64FV_DEFAULT_TIMEOUT`.
const DEFAULT_ERASE_TIMEOUT_MS: u64 = 5000;
/// Matches `W25Q64FV_CHIP_ERASE_TIMEOUT`.
const CHIP_ERASE_TIMEOUT_MS: u64 = 100_000;
