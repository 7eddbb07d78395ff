//! spi-sdmmc - SDMMC Protocol
//!
//! Implements the SD/MMC protocol on some generic SPI transport.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod wire;
use wire::Session;

use crate::block_device::{BlockDevice, Partial};
use crate::sdmmc_proto::*;
use crate::spi::{Config, Operation, SpiDevice};
use crate::time::{Clock, Duration};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Clock rate used until the card is negotiated, Hz.
const INIT_CLOCK_HZ: u32 = 400_000;

/// Deadline for the op-condition negotiation loops.
const OP_COND_TIMEOUT: Duration = Duration::millis(1_000);

/// Deadline for reading the CSD data block. Fixed, because the card's
/// geometry-derived timeouts are not known yet at that point ("7.2.6 Read
/// CID/CSD Registers" of the Physical Layer Simplified Specification).
const CSD_READ_TIMEOUT: Duration = Duration::millis(100);

/// Busy deadline for the erase sequence.
const ERASE_TIMEOUT: Duration = Duration::millis(1_000);

/// Deadline for a single data block read.
const READ_TIMEOUT: Duration = Duration::millis(100);

/// Busy deadline per written block for cards up to 32 GiB.
const WRITE_TIMEOUT_SDHC: Duration = Duration::millis(250);

/// Busy deadline per written block for cards above 32 GiB.
const WRITE_TIMEOUT_SDXC: Duration = Duration::millis(500);

/// The possible errors `SpiSdMmcCard` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<E> {
    /// Operation attempted while the card is not negotiated.
    NotReady,
    /// Misaligned address or size.
    InvalidArgument,
    /// The requested range does not fit the card.
    OutOfRange,
    /// Unexpected token, status bit or response pattern from the card.
    Protocol,
    /// A bounded wait elapsed without the expected bus state.
    Timeout,
    /// The SPI transport failed; its error is carried unchanged.
    Transport(E),
    /// The card or this driver does not provide the requested value.
    Unsupported,
}

/// The card families this driver negotiates.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    /// Legacy MMC, initialized with CMD1.
    Mmc,
    /// SD version 1.
    SdV1,
    /// SD version 2, including SDHC and SDXC.
    SdV2,
}

/// Addressing mode and geometry learned during negotiation.
///
/// Reset to the zero state when the device is fully closed.
#[derive(Clone, Copy)]
struct CardState {
    card_type: Option<CardType>,
    block_addressing: bool,
    block_count: u64,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Default for CardState {
    fn default() -> CardState {
        CardState {
            card_type: None,
            block_addressing: false,
            block_count: 0,
            read_timeout: Duration::millis(0),
            write_timeout: Duration::millis(0),
        }
    }
}

impl CardState {
    fn size(&self) -> u64 {
        self.block_count * BLOCK_SIZE as u64
    }
}

/// A validated block transfer request.
struct IoSpan {
    first_block: u64,
    blocks: u64,
}

/// Driver for an SD or MMC card on a shared SPI bus.
///
/// The card is negotiated when the shared device transitions from closed to
/// open and deinitialized when the last user closes it. All I/O runs on the
/// calling thread; every wait is bounded by a deadline from the given
/// [`Clock`].
pub struct SpiSdMmcCard<D, C>
where
    D: SpiDevice,
    C: Clock,
{
    device: D,
    clock: C,
    clock_frequency: u32,
    state: CardState,
}

impl<D, C> SpiSdMmcCard<D, C>
where
    D: SpiDevice,
    C: Clock,
{
    /// Creates a driver over a shared SPI device.
    ///
    /// `clock_frequency` is the bus rate used once the card is negotiated;
    /// negotiation itself always runs at 400 kHz.
    pub fn new(device: D, clock: C, clock_frequency: u32) -> SpiSdMmcCard<D, C> {
        SpiSdMmcCard {
            device,
            clock,
            clock_frequency,
            state: CardState::default(),
        }
    }

    /// Consumes the driver and hands back the device and clock.
    pub fn release(self) -> (D, C) {
        (self.device, self.clock)
    }

    /// The negotiated card family, or `None` while the card is closed or
    /// negotiation failed.
    pub fn card_type(&self) -> Option<CardType> {
        self.state.card_type
    }

    /// Size of an erase block, bytes.
    pub fn erase_block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Size of a program block, bytes.
    pub fn program_block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Size of a read block, bytes.
    pub fn read_block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Value of erased bytes.
    ///
    /// Would require reading DATA_STAT_AFTER_ERASE from the SCR register,
    /// which this driver does not implement.
    pub fn erased_value(&self) -> Result<u8, Error<D::Error>> {
        Err(Error::Unsupported)
    }

    /// Discards a block range. The card has no trim operation in SPI mode,
    /// so this accepts the range and does nothing.
    pub fn trim(&mut self, _address: u64, _size: u64) -> Result<(), Error<D::Error>> {
        Ok(())
    }

    /// Runs the power-up handshake that determines card type, addressing
    /// mode and geometry.
    fn negotiate(&mut self) -> Result<CardState, Error<D::Error>> {
        let clock_frequency = self.clock_frequency;
        debug!("negotiating card type");

        self.device
            .configure(&Config::new(INIT_CLOCK_HZ))
            .map_err(Error::Transport)?;

        // Supply a minimum of 74 clock cycles with the card deselected.
        trace!("resetting card");
        let mut power_up = [Operation::skip((74 + 7) / 8)];
        self.device.execute(&mut power_up).map_err(Error::Transport)?;

        let mut state = CardState::default();
        let mut session = Session::new(&mut self.device, &mut self.clock)?;

        // Enter SPI mode. The card must answer with exactly the idle bit.
        let status = session.command(CMD0, 0)?;
        if !status.is_idle() {
            return Err(Error::Protocol);
        }

        // Interface condition: version 2 cards echo the check pattern.
        let (status, echoed) = session.command_r3(CMD8, CMD8_PATTERN)?;
        if status.is_idle() {
            if echoed != CMD8_PATTERN {
                // voltage range not supported
                return Err(Error::Protocol);
            }
            state.card_type = Some(CardType::SdV2);
        }

        // Wait for the card to finish its initialization, passing HCS only
        // when the interface condition marked it as version 2.
        let deadline = session.now() + OP_COND_TIMEOUT;
        loop {
            let argument = match state.card_type {
                Some(CardType::SdV2) => ACMD41_HCS,
                _ => 0,
            };
            let status = session.app_command(ACMD41, argument)?;
            if status.is_ready() {
                if state.card_type.is_none() {
                    state.card_type = Some(CardType::SdV1);
                }
                break;
            }
            if !status.is_idle() || session.now() >= deadline {
                if state.card_type == Some(CardType::SdV2) {
                    return Err(if !status.is_idle() {
                        Error::Protocol
                    } else {
                        Error::Timeout
                    });
                }
                // Pre-version-2 cards that never answer ACMD41 are probed
                // with the legacy command instead.
                break;
            }
            session.yield_now();
        }

        if state.card_type.is_none() {
            let deadline = session.now() + OP_COND_TIMEOUT;
            loop {
                let status = session.command(CMD1, 0)?;
                if status.is_ready() {
                    state.card_type = Some(CardType::Mmc);
                    break;
                }
                if !status.is_idle() {
                    return Err(Error::Protocol);
                }
                if session.now() >= deadline {
                    return Err(Error::Timeout);
                }
                session.yield_now();
            }
        }

        session.configure(&Config::new(clock_frequency))?;

        if state.card_type == Some(CardType::SdV2) {
            let (status, ocr) = session.command_r3(CMD58, 0)?;
            if !status.is_ready() {
                return Err(Error::Protocol);
            }
            state.block_addressing = ocr & OCR_CCS_MASK != 0;
        }

        if !state.block_addressing {
            let status = session.command(CMD16, BLOCK_SIZE as u32)?;
            if !status.is_ready() {
                return Err(Error::Protocol);
            }
        }

        let status = session.command(CMD9, 0)?;
        if !status.is_ready() {
            return Err(Error::Protocol);
        }
        let mut raw = [0u8; 16];
        session
            .read_data_block(&mut raw, CSD_READ_TIMEOUT)
            .map_err(|partial| partial.error)?;

        let csd = match Csd::decode(&raw) {
            Csd::V2(csd) => csd,
            Csd::Unsupported { structure } => {
                warn!("unsupported CSD structure: {}", structure);
                return Err(Error::Protocol);
            }
        };
        state.block_count = csd.block_count();

        // TODO: derive timeouts for byte-addressed SDSC cards from the CSD
        // timing fields instead of assuming the SDHC/SDXC fixed values.
        state.read_timeout = READ_TIMEOUT;
        state.write_timeout = if state.size() <= 32 * 1024 * 1024 * 1024 {
            WRITE_TIMEOUT_SDHC
        } else {
            WRITE_TIMEOUT_SDXC
        };

        debug!(
            "card type: {:?}, {} blocks, block addressing: {}",
            state.card_type, state.block_count, state.block_addressing
        );
        Ok(state)
    }

    /// Validates the address and size of a transfer.
    ///
    /// `Ok(None)` means the zero-sized no-op.
    fn span(&self, address: u64, size: u64) -> Result<Option<IoSpan>, Error<D::Error>> {
        if self.state.card_type.is_none() {
            return Err(Error::NotReady);
        }
        if size == 0 {
            return Ok(None);
        }

        let block_size = BLOCK_SIZE as u64;
        if address % block_size != 0 || size % block_size != 0 {
            return Err(Error::InvalidArgument);
        }

        let first_block = address / block_size;
        let blocks = size / block_size;
        if first_block + blocks > self.state.block_count {
            return Err(Error::OutOfRange);
        }

        Ok(Some(IoSpan { first_block, blocks }))
    }

    /// Translates a block index into a command address, depending on the
    /// negotiated addressing mode.
    fn command_address(&self, block: u64) -> u32 {
        if self.state.block_addressing {
            block as u32
        } else {
            (block * BLOCK_SIZE as u64) as u32
        }
    }
}

impl<D, C> BlockDevice for SpiSdMmcCard<D, C>
where
    D: SpiDevice,
    C: Clock,
{
    type Error = Error<D::Error>;

    /// Opens the device, negotiating the card if this is the first opener.
    ///
    /// A failed negotiation releases the reference again, so the device is
    /// left fully closed.
    fn open(&mut self) -> Result<(), Self::Error> {
        let count = self.device.open().map_err(Error::Transport)?;
        if count > 1 {
            return Ok(());
        }

        match self.negotiate() {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(error) => {
                let _ = self.close();
                Err(error)
            }
        }
    }

    /// Closes the device, deinitializing it when the last user is gone.
    fn close(&mut self) -> Result<(), Self::Error> {
        let count = self.device.close().map_err(Error::Transport)?;
        if count == 0 {
            self.state = CardState::default();
        }
        Ok(())
    }

    /// Reads one or more blocks starting at the given byte address.
    fn read(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), Partial<Self::Error>> {
        let span = match self.span(address, buffer.len() as u64)? {
            Some(span) => span,
            None => return Ok(()),
        };

        self.device
            .configure(&Config::new(self.clock_frequency))
            .map_err(|error| Partial::from(Error::Transport(error)))?;

        let read_timeout = self.state.read_timeout;
        let command = if span.blocks == 1 { CMD17 } else { CMD18 };
        let argument = self.command_address(span.first_block);

        let mut session =
            Session::new(&mut self.device, &mut self.clock).map_err(Partial::from)?;

        let status = session.command(command, argument).map_err(Partial::from)?;
        if !status.is_ready() {
            return Err(Partial::from(Error::Protocol));
        }

        let mut bytes_read = 0;
        for chunk in buffer.chunks_exact_mut(BLOCK_SIZE) {
            if let Err(partial) = session.read_data_block(chunk, read_timeout) {
                return Err(Partial::new(
                    partial.error,
                    bytes_read + partial.bytes_transferred,
                ));
            }
            bytes_read += BLOCK_SIZE;
        }

        if span.blocks != 1 {
            let status = session
                .command(CMD12, 0)
                .map_err(|error| Partial::new(error, bytes_read))?;
            session
                .wait_while_busy(read_timeout)
                .map_err(|error| Partial::new(error, bytes_read))?;
            if !status.is_ready() {
                return Err(Partial::new(Error::Protocol, bytes_read));
            }
        }

        Ok(())
    }

    /// Programs one or more blocks starting at the given byte address.
    fn program(&mut self, address: u64, buffer: &[u8]) -> Result<(), Partial<Self::Error>> {
        let span = match self.span(address, buffer.len() as u64)? {
            Some(span) => span,
            None => return Ok(()),
        };

        self.device
            .configure(&Config::new(self.clock_frequency))
            .map_err(|error| Partial::from(Error::Transport(error)))?;

        let write_timeout = self.state.write_timeout;
        let (command, token) = if span.blocks == 1 {
            (CMD24, DATA_START_BLOCK)
        } else {
            (CMD25, WRITE_MULTIPLE_TOKEN)
        };
        let argument = self.command_address(span.first_block);

        let mut session =
            Session::new(&mut self.device, &mut self.clock).map_err(Partial::from)?;

        let status = session.command(command, argument).map_err(Partial::from)?;
        if !status.is_ready() {
            return Err(Partial::from(Error::Protocol));
        }

        let mut bytes_written = 0;
        for chunk in buffer.chunks_exact(BLOCK_SIZE) {
            if let Err(partial) = session.write_data_block(token, chunk, write_timeout) {
                return Err(Partial::new(
                    partial.error,
                    bytes_written + partial.bytes_transferred,
                ));
            }
            bytes_written += BLOCK_SIZE;
        }

        if span.blocks != 1 {
            session
                .stop_multi_write(write_timeout)
                .map_err(|error| Partial::new(error, bytes_written))?;
        }

        Ok(())
    }

    /// Erases a range of blocks.
    fn erase(&mut self, address: u64, size: u64) -> Result<(), Self::Error> {
        let span = match self.span(address, size)? {
            Some(span) => span,
            None => return Ok(()),
        };

        self.device
            .configure(&Config::new(self.clock_frequency))
            .map_err(Error::Transport)?;

        let start = self.command_address(span.first_block);
        let end = self.command_address(span.first_block + span.blocks - 1);

        let mut session = Session::new(&mut self.device, &mut self.clock)?;

        let status = session.command(CMD32, start)?;
        if !status.is_ready() {
            return Err(Error::Protocol);
        }
        let status = session.command(CMD33, end)?;
        if !status.is_ready() {
            return Err(Error::Protocol);
        }

        let status = session.command(CMD38, 0)?;
        session.wait_while_busy(ERASE_TIMEOUT)?;
        if !status.is_ready() {
            return Err(Error::Protocol);
        }

        Ok(())
    }

    /// Locks the shared device for exclusive use by the current thread.
    fn lock(&mut self) -> Result<(), Self::Error> {
        self.device.lock().map_err(Error::Transport)
    }

    /// Releases the recursive device lock.
    fn unlock(&mut self) -> Result<(), Self::Error> {
        self.device.unlock().map_err(Error::Transport)
    }

    /// The card has no write cache, so there is nothing to flush.
    fn synchronize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn size(&self) -> u64 {
        self.state.size()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
