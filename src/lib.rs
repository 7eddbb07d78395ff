//! # spi-sdmmc
//!
//! > An SD/MMC block device driver over SPI for Embedded Rust
//!
//! This crate drives an SD or MMC card attached to a shared SPI bus and
//! exposes it as a byte-addressed [`BlockDevice`]. It negotiates the card
//! family (MMC, SD v1, SD v2 including SDHC/SDXC), learns the geometry from
//! the CSD register and then performs block reads, writes and erases using
//! the card's byte-serial protocol. It is written in pure-Rust, is
//! `#![no_std]` and does not use `alloc`.
//!
//! ## Using the crate
//!
//! You will need something that implements the [`SpiDevice`] trait, which
//! executes SPI transactions and drives the chip select line. For an
//! exclusively-owned `embedded-hal` SPI peripheral the provided
//! [`ExclusiveDevice`] adapter can be used. You also need a [`Clock`] that
//! provides a monotonic time base for the protocol deadlines.
//!
//! ```rust,ignore
//! let device = spi_sdmmc::ExclusiveDevice::new(spi, cs);
//! let mut card = spi_sdmmc::SpiSdMmcCard::new(device, clock, 25_000_000);
//! card.open()?;
//! let mut block = [0u8; 512];
//! card.read(0, &mut block)?;
//! card.close()?;
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the
//! `defmt-log` feature you can configure this crate to log messages over
//! defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************


pub mod block_device;
pub mod sdmmc;
pub mod sdmmc_proto;
pub mod spi;
pub mod time;

pub use crate::block_device::{BlockDevice, MemoryBlockDevice, Partial};
pub use crate::sdmmc::{CardType, Error as SdMmcError, SpiSdMmcCard};
pub use crate::sdmmc_proto::{Csd, CsdV2, R1};
pub use crate::spi::{Config, ExclusiveDevice, Operation, SpiBus, SpiDevice};
pub use crate::time::{Clock, Duration, Instant};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
