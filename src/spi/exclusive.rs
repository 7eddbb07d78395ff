use core::fmt::Debug;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use super::{Config, Operation, SpiBus, SpiDevice};

/// Errors of an [`ExclusiveDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError<SPI, CS> {
    /// The SPI peripheral reported an error.
    Spi(SPI),
    /// The chip select pin could not be driven.
    ChipSelect(CS),
}

/// [`SpiDevice`] adapter for an exclusively-owned `embedded-hal` SPI
/// peripheral and chip select pin.
///
/// Exclusive ownership means there is nothing to arbitrate: the open count
/// is plain bookkeeping and the lock never blocks. `configure` only honours
/// the fill byte, since `embedded-hal` 0.2 has no vocabulary for retuning
/// an already-constructed peripheral; pick the bus clock when creating the
/// SPI instance.
pub struct ExclusiveDevice<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: SPI,
    cs: CS,
    fill: u8,
    open_count: u32,
    lock_depth: u32,
}

impl<SPI, CS> ExclusiveDevice<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Wraps an SPI peripheral and its chip select pin.
    pub fn new(spi: SPI, cs: CS) -> ExclusiveDevice<SPI, CS> {
        ExclusiveDevice {
            spi,
            cs,
            fill: 0xFF,
            open_count: 0,
            lock_depth: 0,
        }
    }

    /// Consumes the adapter and hands back the peripheral and pin.
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI, CS> SpiBus for ExclusiveDevice<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    SPI::Error: Debug,
    CS::Error: Debug,
{
    type Error = BusError<SPI::Error, CS::Error>;

    fn configure(&mut self, config: &Config) -> Result<(), Self::Error> {
        self.fill = config.fill;
        Ok(())
    }

    fn execute(&mut self, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        for operation in operations.iter_mut() {
            for index in 0..operation.len() {
                let out = match operation.write_buffer() {
                    Some(write) => write[index],
                    None => self.fill,
                };
                let mut word = [out];
                match self.spi.transfer(&mut word) {
                    Ok(_) => {}
                    Err(e) => return Err(BusError::Spi(e)),
                }
                if let Some(read) = operation.read_buffer() {
                    read[index] = word[0];
                }
                operation.record_transferred(index + 1);
            }
        }
        Ok(())
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        self.cs.set_low().map_err(BusError::ChipSelect)
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.cs.set_high().map_err(BusError::ChipSelect)
    }
}

impl<SPI, CS> SpiDevice for ExclusiveDevice<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    SPI::Error: Debug,
    CS::Error: Debug,
{
    fn open(&mut self) -> Result<u32, Self::Error> {
        self.open_count += 1;
        Ok(self.open_count)
    }

    fn close(&mut self) -> Result<u32, Self::Error> {
        self.open_count = self.open_count.saturating_sub(1);
        Ok(self.open_count)
    }

    fn lock(&mut self) -> Result<(), Self::Error> {
        self.lock_depth += 1;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), Self::Error> {
        self.lock_depth = self.lock_depth.saturating_sub(1);
        Ok(())
    }
}
