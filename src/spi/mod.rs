//! spi-sdmmc - SPI transport interface.
//!
//! The card driver does not talk to an SPI peripheral directly; it consumes
//! the [`SpiDevice`] trait defined here. An implementation executes
//! transactions, drives the chip select line and arbitrates access to the
//! bus between the users of the device.

mod exclusive;
pub use exclusive::{BusError, ExclusiveDevice};

use core::fmt::Debug;

pub use embedded_hal::spi::{Mode, MODE_0};

/// SPI link parameters requested by the driver.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Clock polarity and phase.
    pub mode: Mode,
    /// Clock frequency, Hz.
    pub clock_hz: u32,
    /// Word size, bits.
    pub bits_per_word: u8,
    /// Send the least significant bit first.
    pub lsb_first: bool,
    /// Value clocked out for operations without a write buffer.
    pub fill: u8,
}

impl Config {
    /// Config used for SD/MMC cards: mode 0, 8-bit words, MSB first, `0xFF`
    /// fill.
    pub fn new(clock_hz: u32) -> Config {
        Config {
            mode: MODE_0,
            clock_hz,
            bits_per_word: 8,
            lsb_first: false,
            fill: 0xFF,
        }
    }
}

/// One leg of an SPI transaction.
///
/// A leg moves `len` bytes in both directions at once: bytes come from the
/// write buffer (or the configured fill value) and received bytes land in
/// the read buffer (or are discarded). Executors must record how many bytes
/// were actually moved with [`Operation::record_transferred`] even when the
/// transaction fails, so that callers can report partial transfers.
pub struct Operation<'a> {
    write: Option<&'a [u8]>,
    read: Option<&'a mut [u8]>,
    len: usize,
    bytes_transferred: usize,
}

impl<'a> Operation<'a> {
    /// A leg that sends `buffer` and discards the received bytes.
    pub fn write(buffer: &'a [u8]) -> Operation<'a> {
        Operation {
            len: buffer.len(),
            write: Some(buffer),
            read: None,
            bytes_transferred: 0,
        }
    }

    /// A leg that clocks out fill bytes and stores the received bytes in
    /// `buffer`.
    pub fn read(buffer: &'a mut [u8]) -> Operation<'a> {
        Operation {
            len: buffer.len(),
            write: None,
            read: Some(buffer),
            bytes_transferred: 0,
        }
    }

    /// A leg that clocks out `len` fill bytes and discards what comes back.
    pub fn skip(len: usize) -> Operation<'a> {
        Operation {
            len,
            write: None,
            read: None,
            bytes_transferred: 0,
        }
    }

    /// Number of bytes this leg transfers.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this leg transfers no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes to send, if any.
    pub fn write_buffer(&self) -> Option<&[u8]> {
        self.write
    }

    /// Buffer for received bytes, if any.
    pub fn read_buffer(&mut self) -> Option<&mut [u8]> {
        self.read.as_deref_mut()
    }

    /// Number of bytes the executor has moved so far.
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    /// Called by the executor to record transfer progress.
    pub fn record_transferred(&mut self, bytes: usize) {
        self.bytes_transferred = bytes;
    }
}

/// An SPI master with a dedicated chip select line for the card.
pub trait SpiBus {
    /// Error type of the underlying transport.
    type Error: Debug;

    /// Reconfigures the link parameters.
    fn configure(&mut self, config: &Config) -> Result<(), Self::Error>;

    /// Executes the legs of one transaction back to back.
    ///
    /// Implementations record the number of bytes moved in each leg, even
    /// when the transaction fails partway.
    fn execute(&mut self, operations: &mut [Operation<'_>]) -> Result<(), Self::Error>;

    /// Asserts the chip select line.
    fn select(&mut self) -> Result<(), Self::Error>;

    /// Deasserts the chip select line.
    fn deselect(&mut self) -> Result<(), Self::Error>;
}

/// A shared, lockable SPI device handle.
///
/// The same physical card may be opened by several users; implementations
/// keep an open count so that the driver can initialize the card on the
/// first open and deinitialize it on the last close. The lock is recursive
/// per calling thread, allowing a caller to make a multi-call sequence
/// atomic with respect to other bus users.
pub trait SpiDevice: SpiBus {
    /// Increments the open count. Returns the count after incrementing.
    fn open(&mut self) -> Result<u32, Self::Error>;

    /// Decrements the open count. Returns the count after decrementing.
    fn close(&mut self) -> Result<u32, Self::Error>;

    /// Takes the recursive device lock.
    fn lock(&mut self) -> Result<(), Self::Error>;

    /// Releases the recursive device lock.
    fn unlock(&mut self) -> Result<(), Self::Error>;
}

impl<T> SpiBus for &mut T
where
    T: SpiBus,
{
    type Error = T::Error;

    fn configure(&mut self, config: &Config) -> Result<(), Self::Error> {
        (*self).configure(config)
    }

    fn execute(&mut self, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        (*self).execute(operations)
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        (*self).select()
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        (*self).deselect()
    }
}

impl<T> SpiDevice for &mut T
where
    T: SpiDevice,
{
    fn open(&mut self) -> Result<u32, Self::Error> {
        (*self).open()
    }

    fn close(&mut self) -> Result<u32, Self::Error> {
        (*self).close()
    }

    fn lock(&mut self) -> Result<(), Self::Error> {
        (*self).lock()
    }

    fn unlock(&mut self) -> Result<(), Self::Error> {
        (*self).unlock()
    }
}
