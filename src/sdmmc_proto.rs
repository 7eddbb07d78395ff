//! spi-sdmmc - Constants and register layouts from the SD Specifications.
//!
//! Command indices, control tokens and response bits as defined by the SD
//! Physical Layer Specification, plus the decoder for the Card Specific
//! Data register.

use bitflags::bitflags;

// ============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in SPI mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - legacy (MMC) operating condition negotiation
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - set the block length of byte-addressed cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a stop token
pub const CMD25: u8 = 0x19;
/// ERASE_WR_BLK_START_ADDR - set the first block marked for erase
pub const CMD32: u8 = 0x20;
/// ERASE_WR_BLK_END_ADDR - set the last block marked for erase
pub const CMD33: u8 = 0x21;
/// ERASE - erase the previously selected block range
pub const CMD38: u8 = 0x26;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COND - sends host capacity support and starts initialization
pub const ACMD41: u8 = 0x29;

// ============================================================================

/// CRC7 of CMD0 with a zero argument.
pub const CMD0_CRC: u8 = 0x4A;
/// CRC7 of CMD8 with the standard check pattern argument.
pub const CMD8_CRC: u8 = 0x43;
/// Supported voltage range and check pattern argument for CMD8.
pub const CMD8_PATTERN: u32 = 0x1AA;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;
/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;
/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// CCS bit of the OCR - the card is block addressed
pub const OCR_CCS_MASK: u32 = 1 << 30;
/// HCS bit of the ACMD41 argument - the host supports SDHC/SDXC
pub const ACMD41_HCS: u32 = 1 << 30;

/// Block size used for all data transfers, bytes.
pub const BLOCK_SIZE: usize = 512;

// ============================================================================

bitflags! {
    /// R1 response status bits.
    ///
    /// An empty set means the card is ready and the command was accepted.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct R1: u8 {
        /// Card is in the idle state, running initialization.
        const IN_IDLE_STATE = 1 << 0;
        /// An erase sequence was cleared before executing.
        const ERASE_RESET = 1 << 1;
        /// The command is not legal for the current card state.
        const ILLEGAL_COMMAND = 1 << 2;
        /// The CRC check of the last command failed.
        const COM_CRC_ERROR = 1 << 3;
        /// An error occurred in the sequence of erase commands.
        const ERASE_SEQUENCE_ERROR = 1 << 4;
        /// A misaligned address did not match the block length.
        const ADDRESS_ERROR = 1 << 5;
        /// The command argument was out of range.
        const PARAMETER_ERROR = 1 << 6;
    }
}

impl R1 {
    /// Card finished initialization and accepts data commands.
    pub fn is_ready(self) -> bool {
        self.is_empty()
    }

    /// Exactly the in-idle-state bit is set.
    pub fn is_idle(self) -> bool {
        self == R1::IN_IDLE_STATE
    }
}

// ============================================================================

/// Extracts up to 32 bits from a register image.
///
/// Bits are numbered as in the CSD register: bit 0 is the least significant
/// bit of the *last* byte of `buffer`, increasing toward the first byte.
/// The convention depends only on the memory order of `buffer`, not on host
/// endianness.
///
/// # Panics
///
/// Panics if `size > 32` or if `index + size` runs past the end of
/// `buffer`. Both are programming errors, not recoverable conditions.
pub fn extract_bits(buffer: &[u8], index: usize, size: usize) -> u32 {
    assert!(size <= 32);
    let begin = index / 8;
    let end = (index + size + 7) / 8;
    assert!(end <= buffer.len());

    let offset = (index % 8) as u32;
    let mut value = 0u32;
    for i in begin..end {
        let byte = u32::from(buffer[buffer.len() - 1 - i]);
        let shift = (i - begin) as u32 * 8;
        if shift >= offset {
            value |= byte << (shift - offset);
        } else {
            value |= byte >> (offset - shift);
        }
    }

    if size < 32 {
        value &= (1 << size) - 1;
    }
    value
}

/// Card Specific Data, structure version 2.0.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsdV2 {
    /// C_SIZE, device size
    pub c_size: u32,
    /// CCC, card command classes
    pub ccc: u16,
    /// TAAC, data read access-time
    pub taac: u8,
    /// NSAC, data read access-time in CLK cycles (NSAC*100)
    pub nsac: u8,
    /// TRAN_SPEED, max. data transfer rate
    pub tran_speed: u8,
    /// READ_BL_LEN, max. read data block length
    pub read_bl_len: u8,
    /// READ_BL_PARTIAL, partial blocks for read allowed
    pub read_bl_partial: bool,
    /// WRITE_BLK_MISALIGN, write block misalignment
    pub write_blk_misalign: bool,
    /// READ_BLK_MISALIGN, read block misalignment
    pub read_blk_misalign: bool,
    /// DSR_IMP, DSR implemented
    pub dsr_imp: bool,
    /// ERASE_BLK_EN, erase single block enable
    pub erase_blk_en: bool,
    /// SECTOR_SIZE, erase sector size
    pub sector_size: u8,
    /// WP_GRP_SIZE, write protect group size
    pub wp_grp_size: u8,
    /// WP_GRP_ENABLE, write protect group enable
    pub wp_grp_enable: bool,
    /// R2W_FACTOR, write speed factor
    pub r2w_factor: u8,
    /// WRITE_BL_LEN, max. write data block length
    pub write_bl_len: u8,
    /// WRITE_BL_PARTIAL, partial blocks for write allowed
    pub write_bl_partial: bool,
    /// FILE_FORMAT_GRP, file format group
    pub file_format_grp: bool,
    /// COPY, copy flag
    pub copy: bool,
    /// PERM_WRITE_PROTECT, permanent write protection
    pub perm_write_protect: bool,
    /// TMP_WRITE_PROTECT, temporary write protection
    pub tmp_write_protect: bool,
    /// FILE_FORMAT, file format
    pub file_format: u8,
}

impl CsdV2 {
    /// Usable size of the card, bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.c_size) + 1) * 512 * 1024
    }

    /// Number of 512-byte blocks the card holds.
    pub fn block_count(&self) -> u64 {
        self.card_capacity_bytes() / BLOCK_SIZE as u64
    }
}

/// Card Specific Data register, keyed by its CSD_STRUCTURE tag.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Csd {
    /// Structure version 2.0.
    V2(CsdV2),
    /// A structure version this driver does not decode.
    Unsupported {
        /// Raw value of the CSD_STRUCTURE field.
        structure: u8,
    },
}

impl Csd {
    /// Decodes a raw 16-byte CSD register image.
    ///
    /// Only the version 2.0 layout (CSD_STRUCTURE == 1) is decoded; any
    /// other tag is returned as [`Csd::Unsupported`] and it is up to the
    /// caller to reject it. CRC validity of the register is the transport's
    /// concern, not checked here.
    pub fn decode(buffer: &[u8; 16]) -> Csd {
        let structure = extract_bits(buffer, 126, 2) as u8;
        if structure != 1 {
            return Csd::Unsupported { structure };
        }

        Csd::V2(CsdV2 {
            taac: extract_bits(buffer, 112, 8) as u8,
            nsac: extract_bits(buffer, 104, 8) as u8,
            tran_speed: extract_bits(buffer, 96, 8) as u8,
            ccc: extract_bits(buffer, 84, 12) as u16,
            read_bl_len: extract_bits(buffer, 80, 4) as u8,
            read_bl_partial: extract_bits(buffer, 79, 1) != 0,
            write_blk_misalign: extract_bits(buffer, 78, 1) != 0,
            read_blk_misalign: extract_bits(buffer, 77, 1) != 0,
            dsr_imp: extract_bits(buffer, 76, 1) != 0,
            c_size: extract_bits(buffer, 48, 22),
            erase_blk_en: extract_bits(buffer, 46, 1) != 0,
            sector_size: extract_bits(buffer, 39, 7) as u8,
            wp_grp_size: extract_bits(buffer, 32, 7) as u8,
            wp_grp_enable: extract_bits(buffer, 31, 1) != 0,
            r2w_factor: extract_bits(buffer, 26, 3) as u8,
            write_bl_len: extract_bits(buffer, 22, 4) as u8,
            write_bl_partial: extract_bits(buffer, 21, 1) != 0,
            file_format_grp: extract_bits(buffer, 15, 1) != 0,
            copy: extract_bits(buffer, 14, 1) != 0,
            perm_write_protect: extract_bits(buffer, 13, 1) != 0,
            tmp_write_protect: extract_bits(buffer, 12, 1) != 0,
            file_format: extract_bits(buffer, 10, 2) as u8,
        })
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
