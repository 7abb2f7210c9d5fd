//! Flash disk controller firmware: the nibble host link in front of a
//! W25Q64-family NOR chip over SPI.
//!
//! Grounded on `rc6502_fd.c`'s pin assignment (`PINC` host-to-MCU byte,
//! `PORTA` MCU-to-host byte, `PD2`/INT0 strobe, `PD6`/CLEWRITE- ack pulse)
//! and on an `embassy_stm32::init` + `defmt` shape borrowed from another
//! STM32F1 target in this workspace's history, generalized from a USB
//! CDC-ACM command loop to an EXTI-driven parallel bus. `embassy_stm32`'s
//! `ExtiInput::wait_for_falling_edge` replaces the original's
//! `ISR(INT0_vect)`: there is exactly one task touching the host link, so
//! the byte-strobe edge is awaited rather than latched by a hardware
//! interrupt racing a separate main loop -- the two pieces the AVR
//! original had to keep consistent by hand collapse into one `async fn`
//! with no shared mutable state to guard.

#![no_std]
#![no_main]

use embassy_executor::Spawner;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Input, Level, Output, Pull, Speed};
use embassy_stm32::spi::{Config as SpiConfig, Spi};
use embassy_time::{Duration, Timer};
use defmt::*;
use {defmt_rtt as _, panic_probe as _};

mod flash;
mod fs;
mod protocol;

use flash::SerialChip;
use fs::SimpleFs;
use protocol::HostLink;

/// `MCU_IN`: host-to-controller byte, read in parallel off eight GPIO
/// input pins. PC0..PC7 on a Blue Pill board, matching the original's
/// whole-port `PINC` read.
struct HostBus {
    pins: [Input<'static>; 8],
}

impl HostBus {
    fn read(&self) -> u8 {
        let mut byte = 0u8;
        for (i, pin) in self.pins.iter().enumerate() {
            if pin.is_high() {
                byte |= 1 << i;
            }
        }
        byte
    }
}

/// `MCU_OUT`: controller-to-host byte, driven onto eight GPIO output pins.
/// PA0..PA7, matching the original's whole-port `PORTA` write.
struct ControllerBus {
    pins: [Output<'static>; 8],
}

impl ControllerBus {
    fn write(&mut self, byte: u8) {
        for (i, pin) in self.pins.iter_mut().enumerate() {
            if byte & (1 << i) != 0 {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_stm32::init(Default::default());
    info!("flash disk controller starting");

    let spi_config = SpiConfig::default();
    let spi = Spi::new_blocking(p.SPI1, p.PA5, p.PA7, p.PA6, spi_config);
    let cs = Output::new(p.PA4, Level::High, Speed::VeryHigh);
    let chip = match SerialChip::open(spi, cs) {
        Ok(chip) => chip,
        Err(_) => {
            error!("flash chip did not respond to JEDEC ID read");
            loop {
                Timer::after(Duration::from_secs(1)).await;
            }
        }
    };
    let fs = SimpleFs::new(chip);
    let mut link = HostLink::new(fs);

    let host_bus = HostBus {
        pins: [
            Input::new(p.PC0, Pull::None),
            Input::new(p.PC1, Pull::None),
            Input::new(p.PC2, Pull::None),
            Input::new(p.PC3, Pull::None),
            Input::new(p.PC4, Pull::None),
            Input::new(p.PC5, Pull::None),
            Input::new(p.PC6, Pull::None),
            Input::new(p.PC7, Pull::None),
        ],
    };
    let mut controller_bus = ControllerBus {
        pins: [
            Output::new(p.PA0, Level::Low, Speed::Medium),
            Output::new(p.PA1, Level::Low, Speed::Medium),
            Output::new(p.PA2, Level::Low, Speed::Medium),
            Output::new(p.PA3, Level::Low, Speed::Medium),
            Output::new(p.PB0, Level::Low, Speed::Medium),
            Output::new(p.PB1, Level::Low, Speed::Medium),
            Output::new(p.PB8, Level::Low, Speed::Medium),
            Output::new(p.PB9, Level::Low, Speed::Medium),
        ],
    };
    // PD6 / CLEWRITE-: pulsed low for >=1ms after every latched byte to
    // tell the host its byte was consumed and the response is ready.
    let mut clewrite = Output::new(p.PD6, Level::High, Speed::Medium);
    // PD2 / INT0: falling-edge strobe the host pulses for every byte it
    // places on `host_bus`.
    let mut strobe = ExtiInput::new(p.PD2, p.EXTI2, Pull::Up);

    controller_bus.write(0x00);

    loop {
        strobe.wait_for_falling_edge().await;
        let in_byte = host_bus.read();
        let out_byte = link.on_wire_byte(in_byte);
        controller_bus.write(out_byte);

        clewrite.set_low();
        Timer::after(Duration::from_millis(1)).await;
        clewrite.set_high();
    }
}
