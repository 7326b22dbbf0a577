//! Constants and register structures from the SD Specifications.
//!
//! Everything the protocol engine needs to know about the wire format lives
//! here: command indices, response bits, data tokens, and the Card Specific
//! Data register layouts used to size a card.

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - legacy (MMC) initialization
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SET_BLOCKLEN - set the read/write block length
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_SEND_OP_COND - sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = APP_CMD_FLAG | 0x29;

/// Marker bit for application commands: send the CMD55 prefix first.
pub const APP_CMD_FLAG: u8 = 0x80;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// Argument to CMD8: 2.7-3.6V supply, check pattern 0xAA.
pub const CMD8_CHECK_ARG: u32 = 0x1AA;

/// HCS bit in the ACMD41 argument: host supports high capacity.
pub const ACMD41_HCS: u32 = 1 << 30;

/// CCS bit in the first OCR byte: card uses block addressing.
pub const OCR_CCS: u8 = 0x40;

//==============================================================================

// Command CRCs. CRC checking is off by default in SPI mode, but the two
// commands of the reset sequence are issued before that policy exists and
// must carry their real CRC-7. Everything else gets the dummy byte.

/// Valid CRC byte for CMD0 with a zero argument
pub const CMD0_CRC: u8 = 0x95;
/// Valid CRC byte for CMD8 with the check-pattern argument
pub const CMD8_CRC: u8 = 0x87;
/// Dummy CRC-and-stop byte for every other command
pub const DUMMY_CRC: u8 = 0x01;

/// Perform the 7-bit CRC used on SD card command frames
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

//==============================================================================

/// Card Specific Data, version 1
///
/// Also the layout MMC v3 cards report; they are decoded through this type.
#[derive(Default)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
#[derive(Default)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() - 7;
        (self.device_size() + 1) << multiplier
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}

impl Csd {
    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
