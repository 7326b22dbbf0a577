//! The per-slot device descriptor.

use crate::blockdevice::BlockCount;

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// An MMC card supporting v3 of the standard, initialised over the
    /// legacy command.
    Mmc3,
    /// A standard-capacity SD Card supporting v1.x of the standard.
    Sd1,
    /// A standard-capacity SD Card supporting v2.x of the standard.
    Sd2,
    /// A high-capacity 'SDHC' or 'SDXC' Card.
    ///
    /// Uses block-addressing internally to support capacities above 2GiB.
    Sdhc,
}

impl CardType {
    /// Does the card's CSD register use the version 2 layout?
    pub fn has_v2_csd(&self) -> bool {
        matches!(self, CardType::Sd2 | CardType::Sdhc)
    }
}

/// Cumulative operation counters, diagnostic only.
///
/// Reset when a card mounts. A transfer counts once it reaches the card,
/// whatever its outcome; requests rejected before any bus traffic do not.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Block read operations serviced.
    pub reads: u32,
    /// Block write operations serviced.
    pub writes: u32,
}

/// State of the one card slot this driver serves.
///
/// Created empty at driver startup; the initialization state machine mounts
/// it, and the transfer state machines keep the counters.
#[derive(Debug)]
pub struct SdDevice {
    pub(crate) mounted: bool,
    pub(crate) card_type: Option<CardType>,
    pub(crate) last_sector: u32,
    pub(crate) stats: TransferStats,
}

impl SdDevice {
    /// A fresh, unmounted slot.
    pub fn new() -> SdDevice {
        SdDevice {
            mounted: false,
            card_type: None,
            last_sector: 0,
            stats: TransferStats::default(),
        }
    }

    /// Has a card completed initialization in this slot?
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// The negotiated card type, once mounted.
    pub fn card_type(&self) -> Option<CardType> {
        self.card_type
    }

    /// Index of the last addressable sector (inclusive).
    ///
    /// Only meaningful while the device is mounted.
    pub fn last_sector(&self) -> u32 {
        self.last_sector
    }

    /// Total capacity, while mounted.
    pub fn num_blocks(&self) -> Option<BlockCount> {
        if self.mounted {
            Some(BlockCount(self.last_sector + 1))
        } else {
            None
        }
    }

    /// The diagnostic transfer counters.
    pub fn stats(&self) -> TransferStats {
        self.stats
    }
}

impl Default for SdDevice {
    fn default() -> SdDevice {
        SdDevice::new()
    }
}
