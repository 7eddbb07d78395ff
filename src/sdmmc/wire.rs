//! spi-sdmmc - Wire framing for the SD/MMC byte-serial protocol.
//!
//! A [`Session`] owns the chip select line for one multi-step command
//! sequence, so no other bus user can interleave between a command, its
//! response and the data blocks that follow.

use super::Error;
use crate::block_device::Partial;
use crate::sdmmc_proto::*;
use crate::spi::{Config, Operation, SpiBus};
use crate::time::{Clock, Duration, Instant};

#[cfg(feature = "log")]
use log::warn;

#[cfg(feature = "defmt-log")]
use defmt::warn;

/// A command sequence with the card selected.
///
/// Selects the card on construction. On every exit path - drop - one
/// trailing fill byte is clocked out and the chip select line is released,
/// which some cards need to let go of the data-out line.
pub struct Session<'a, B, C>
where
    B: SpiBus,
    C: Clock,
{
    bus: &'a mut B,
    clock: &'a mut C,
}

impl<'a, B, C> Drop for Session<'a, B, C>
where
    B: SpiBus,
    C: Clock,
{
    fn drop(&mut self) {
        let mut trailer = [Operation::skip(1)];
        let _ = self.bus.execute(&mut trailer);
        let _ = self.bus.deselect();
    }
}

impl<'a, B, C> Session<'a, B, C>
where
    B: SpiBus,
    C: Clock,
{
    /// Selects the card and opens a session.
    pub fn new(bus: &'a mut B, clock: &'a mut C) -> Result<Session<'a, B, C>, Error<B::Error>> {
        bus.select().map_err(Error::Transport)?;
        Ok(Session { bus, clock })
    }

    /// Reconfigures the SPI link without giving up the session.
    pub fn configure(&mut self, config: &Config) -> Result<(), Error<B::Error>> {
        self.bus.configure(config).map_err(Error::Transport)
    }

    /// Current instant of the session's clock.
    pub fn now(&mut self) -> Instant {
        self.clock.now()
    }

    /// Lets other threads run between polls.
    pub fn yield_now(&mut self) {
        self.clock.yield_now()
    }

    fn execute(&mut self, operations: &mut [Operation<'_>]) -> Result<(), Error<B::Error>> {
        self.bus.execute(operations).map_err(Error::Transport)
    }

    /// Sends a 6-byte command frame, plus one stuff byte where the command
    /// needs it.
    ///
    /// CMD0 and CMD8 carry their real, precomputed CRC7 - they are sent
    /// while the card may still verify CRCs. Every other command gets a
    /// dummy CRC, accepted because the bus runs in non-CRC mode after
    /// initialization.
    fn write_command(&mut self, command: u8, argument: u32) -> Result<(), Error<B::Error>> {
        let crc7 = match command {
            CMD0 => CMD0_CRC,
            CMD8 => CMD8_CRC,
            _ => 0,
        };
        let frame = [
            0x40 | command,
            (argument >> 24) as u8,
            (argument >> 16) as u8,
            (argument >> 8) as u8,
            argument as u8,
            crc7 << 1 | 1,
            0xFF, // stuff byte
        ];
        let length = if command == CMD12 {
            frame.len()
        } else {
            frame.len() - 1
        };
        let mut operations = [Operation::write(&frame[..length])];
        self.execute(&mut operations)
    }

    /// Reads a response of `buffer.len()` bytes.
    ///
    /// The card may put idle filler (`0xFF`) on the bus before the actual
    /// response; the first non-filler byte starts it. At most
    /// `buffer.len() + 8` bytes are clocked before giving up.
    fn read_response(&mut self, buffer: &mut [u8]) -> Result<(), Error<B::Error>> {
        let width = buffer.len();
        let max_bytes = width + 8;
        let mut bytes_read = 0;
        let mut valid = 0;
        while bytes_read < max_bytes {
            let read_size = width - valid;
            {
                let mut operations = [Operation::read(&mut buffer[valid..])];
                self.bus.execute(&mut operations).map_err(Error::Transport)?;
            }

            if valid == 0 {
                let filler = buffer.iter().take_while(|&&byte| byte == 0xFF).count();
                let got = width - filler;
                if got != 0 && filler != 0 {
                    buffer.copy_within(filler.., 0);
                }
                valid = got;
            } else {
                valid += read_size;
            }

            if valid == width {
                return Ok(());
            }
            bytes_read += read_size;
        }

        Err(Error::Timeout)
    }

    /// Reads an R1 response.
    fn read_r1(&mut self) -> Result<R1, Error<B::Error>> {
        let mut response = [0xFF];
        self.read_response(&mut response)?;
        Ok(R1::from_bits_truncate(response[0]))
    }

    /// Reads an R3/R7 response: R1 plus a 32-bit payload.
    fn read_r3(&mut self) -> Result<(R1, u32), Error<B::Error>> {
        let mut response = [0xFF; 5];
        self.read_response(&mut response)?;
        let payload = u32::from_be_bytes([response[1], response[2], response[3], response[4]]);
        Ok((R1::from_bits_truncate(response[0]), payload))
    }

    /// Sends a command and reads its R1 response.
    pub fn command(&mut self, command: u8, argument: u32) -> Result<R1, Error<B::Error>> {
        self.write_command(command, argument)?;
        self.read_r1()
    }

    /// Sends a command and reads its R3/R7 response.
    pub fn command_r3(&mut self, command: u8, argument: u32) -> Result<(R1, u32), Error<B::Error>> {
        self.write_command(command, argument)?;
        self.read_r3()
    }

    /// Sends an application command: CMD55 first, then the command itself.
    ///
    /// If CMD55 answers anything other than idle or ready the application
    /// command is not sent.
    pub fn app_command(&mut self, command: u8, argument: u32) -> Result<R1, Error<B::Error>> {
        let status = self.command(CMD55, 0)?;
        if !status.is_ready() && !status.is_idle() {
            return Err(Error::Protocol);
        }
        self.command(command, argument)
    }

    /// Polls single bytes while `keep_waiting` holds, bounded by `timeout`.
    ///
    /// Returns the first byte that ended the wait.
    pub fn wait_while<F>(&mut self, timeout: Duration, mut keep_waiting: F) -> Result<u8, Error<B::Error>>
    where
        F: FnMut(u8) -> bool,
    {
        let deadline = self.clock.now() + timeout;
        while self.clock.now() < deadline {
            let mut byte = [0xFF];
            {
                let mut operations = [Operation::read(&mut byte)];
                self.bus.execute(&mut operations).map_err(Error::Transport)?;
            }
            if !keep_waiting(byte[0]) {
                return Ok(byte[0]);
            }
            self.clock.yield_now();
        }

        Err(Error::Timeout)
    }

    /// Waits until the card stops holding the bus low after an internal
    /// programming or erase operation.
    pub fn wait_while_busy(&mut self, timeout: Duration) -> Result<(), Error<B::Error>> {
        self.wait_while(timeout, |byte| byte == 0x00).map(|_| ())
    }

    /// Reads one data block: start token, payload, two CRC bytes.
    ///
    /// The CRC bytes are clocked but not validated. The number of payload
    /// bytes moved is reported even when the transfer fails partway.
    pub fn read_data_block(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<(), Partial<Error<B::Error>>> {
        let token = self
            .wait_while(timeout, |byte| byte == 0xFF)
            .map_err(|error| Partial::new(error, 0))?;
        if token != DATA_START_BLOCK {
            warn!("unexpected control token: {:x}", token);
            return Err(Partial::new(Error::Protocol, 0));
        }

        let mut operations = [Operation::read(buffer), Operation::skip(2)];
        let result = self.bus.execute(&mut operations);
        let bytes = operations[0].bytes_transferred();
        result.map_err(|error| Partial::new(Error::Transport(error), bytes))
    }

    /// Writes one data block: lead-in byte, start token, payload, then a
    /// 3-byte footer whose last byte must carry the data-accepted pattern.
    ///
    /// The number of payload bytes moved is reported even when the transfer
    /// fails partway.
    pub fn write_data_block(
        &mut self,
        token: u8,
        buffer: &[u8],
        timeout: Duration,
    ) -> Result<(), Partial<Error<B::Error>>> {
        let header = [0xFF, token];
        let mut footer = [0u8; 3]; // crc + data response token
        let bytes;
        {
            let mut operations = [
                Operation::write(&header),
                Operation::write(buffer),
                Operation::read(&mut footer),
            ];
            let result = self.bus.execute(&mut operations);
            bytes = operations[1].bytes_transferred();
            result.map_err(|error| Partial::new(Error::Transport(error), bytes))?;
        }

        self.wait_while_busy(timeout)
            .map_err(|error| Partial::new(error, bytes))?;

        let response = footer[2];
        if response & DATA_RES_MASK != DATA_RES_ACCEPTED {
            warn!("data response token: {:x}", response);
            return Err(Partial::new(Error::Protocol, bytes));
        }

        Ok(())
    }

    /// Terminates a multi-block write: stop token, one fill byte, then a
    /// final busy wait.
    pub fn stop_multi_write(&mut self, timeout: Duration) -> Result<(), Error<B::Error>> {
        let stop = [STOP_TRAN_TOKEN, 0xFF];
        let mut operations = [Operation::write(&stop)];
        self.execute(&mut operations)?;
        self.wait_while_busy(timeout)
    }
}
