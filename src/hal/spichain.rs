// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Linux spidev/sysfs-gpio transport for the accelerator chain.
//!
//! The chain hangs off one SPI master; two chip-select lines pick between
//! the broadcast (shared) latch and the shift-register (daisy) path, both
//! active low. Reset is a dedicated active-low line, the wired-OR ready
//! signal is sampled through a plain input pin.

use crate::error::{self, ErrorKind};
use crate::hal;

use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::{InputPin, OutputPin};

use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::Spidev;

/// Board wiring of the control lines (sysfs GPIO numbers)
const RESET_PIN: u64 = 960;
const SHARED_SELECT_PIN: u64 = 961;
const DAISY_SELECT_PIN: u64 = 962;
const READY_PIN: u64 = 963;

const SPI_DEVICE_PATH: &str = "/dev/spidev0.0";
const SPI_SPEED_HZ: u32 = 1_000_000;

/// Helper struct for altering output pins which implements OutputPin trait
struct PinOut(sysfs_gpio::Pin);

impl OutputPin for PinOut {
    type Error = sysfs_gpio::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(0)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(1)
    }
}

/// Helper struct for reading input pins which implements InputPin trait
struct PinIn(sysfs_gpio::Pin);

impl InputPin for PinIn {
    type Error = sysfs_gpio::Error;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value > 0)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value == 0)
    }
}

fn gpio_error(e: sysfs_gpio::Error) -> error::Error {
    ErrorKind::Bus(format!("GPIO error: {}", e)).into()
}

fn spi_error(e: std::io::Error) -> error::Error {
    ErrorKind::Bus(format!("SPI error: {}", e)).into()
}

fn export_pin_out(pin_num: u64) -> error::Result<PinOut> {
    let pin = sysfs_gpio::Pin::new(pin_num);
    pin.export().map_err(gpio_error)?;
    pin.set_direction(sysfs_gpio::Direction::Out)
        .map_err(gpio_error)?;
    Ok(PinOut(pin))
}

fn export_pin_in(pin_num: u64) -> error::Result<PinIn> {
    let pin = sysfs_gpio::Pin::new(pin_num);
    pin.export().map_err(gpio_error)?;
    pin.set_direction(sysfs_gpio::Direction::In)
        .map_err(gpio_error)?;
    Ok(PinIn(pin))
}

/// Accelerator bus backed by `/dev/spidev` and sysfs GPIO
pub struct SpiChainBus {
    spi: Spidev,
    reset: PinOut,
    shared_select: PinOut,
    daisy_select: PinOut,
    ready: PinIn,
}

impl SpiChainBus {
    /// Open the SPI master and export all control lines. The chain comes up
    /// held in reset with both selects inactive.
    pub fn open() -> error::Result<Self> {
        let mut spi = Spidev::open(SPI_DEVICE_PATH).map_err(spi_error)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(SPI_SPEED_HZ)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.0.configure(&options).map_err(spi_error)?;

        let mut bus = Self {
            spi,
            reset: export_pin_out(RESET_PIN)?,
            shared_select: export_pin_out(SHARED_SELECT_PIN)?,
            daisy_select: export_pin_out(DAISY_SELECT_PIN)?,
            ready: export_pin_in(READY_PIN)?,
        };

        bus.shared_select.set_high().map_err(gpio_error)?;
        bus.daisy_select.set_high().map_err(gpio_error)?;
        bus.reset.set_low().map_err(gpio_error)?;
        Ok(bus)
    }
}

impl hal::Bus for SpiChainBus {
    fn assert_reset(&mut self) -> error::Result<()> {
        self.reset.set_low().map_err(gpio_error)
    }

    fn deassert_reset(&mut self) -> error::Result<()> {
        self.reset.set_high().map_err(gpio_error)
    }

    fn select_shared(&mut self) -> error::Result<()> {
        self.shared_select.set_low().map_err(gpio_error)
    }

    fn deselect_shared(&mut self) -> error::Result<()> {
        self.shared_select.set_high().map_err(gpio_error)
    }

    fn write_shared(&mut self, data: &[u8]) -> error::Result<()> {
        self.spi.write(data).map_err(spi_error)
    }

    fn select_daisy(&mut self) -> error::Result<()> {
        self.daisy_select.set_low().map_err(gpio_error)
    }

    fn deselect_daisy(&mut self) -> error::Result<()> {
        self.daisy_select.set_high().map_err(gpio_error)
    }

    fn write_daisy(&mut self, data: &[u8]) -> error::Result<()> {
        self.spi.write(data).map_err(spi_error)
    }

    fn read_daisy(&mut self, len: usize) -> error::Result<Vec<u8>> {
        // full duplex transfer with an all-zero TX run clocks the chain out
        let mut buffer = vec![0u8; len];
        self.spi.transfer(&mut buffer).map_err(spi_error)?;
        Ok(buffer)
    }

    fn poll_ready(&mut self) -> error::Result<bool> {
        self.ready.is_high().map_err(gpio_error)
    }
}
