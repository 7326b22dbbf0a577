//! Blocking frontend over the same state machines.
//!
//! For firmware that has nowhere better to be, [`SdCard`] runs each state
//! machine to completion inside the call instead of one micro-step per
//! scheduler tick. There is no duplicated protocol code here: this is the
//! cooperative driver's machinery on a very fast scheduler.

use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx, BLOCK_LEN};
use crate::bus::SdBus;
use crate::cmd::{release, send_command};
use crate::device::SdDevice;
use crate::init::{InitFsm, InitOpts};
use crate::proto::CMD0;
use crate::read::{self, ReadFsm};
use crate::write::{self, WriteFsm};
use crate::{Progress, SdError, SdResult};

/// A blocking driver for the SD card behind an [`SdBus`].
pub struct SdCard<B>
where
    B: SdBus,
{
    bus: B,
    device: SdDevice,
    opts: InitOpts,
}

impl<B> SdCard<B>
where
    B: SdBus,
{
    /// Create a new driver with default options.
    ///
    /// The card is not touched yet; initialization is deferred until the
    /// first operation, or an explicit [`init`](SdCard::init).
    pub fn new(bus: B) -> SdCard<B> {
        Self::new_with_options(bus, InitOpts::default())
    }

    /// Create a new driver using the given negotiation options.
    pub fn new_with_options(bus: B, opts: InitOpts) -> SdCard<B> {
        SdCard {
            bus,
            device: SdDevice::new(),
            opts,
        }
    }

    /// Negotiate with the card and mount it.
    pub fn init(&mut self) -> SdResult {
        let mut fsm = InitFsm::new(&self.opts);
        loop {
            if let Progress::Done(res) = fsm.step(&mut self.bus, &mut self.device) {
                return res;
            }
        }
    }

    /// Read the block at `sector`, keeping stream bytes
    /// `[offset, offset + count)`. See [`crate::Request::Read`] for the
    /// window semantics.
    ///
    /// Triggers card initialization if no card is mounted yet.
    pub fn read(&mut self, buffer: &mut [u8], sector: u32, offset: u16, count: u16) -> SdResult {
        self.check_init()?;
        read::check_params(&self.device, buffer.len(), sector, count)?;
        let mut fsm = ReadFsm::new(buffer, sector, offset, count);
        loop {
            if let Progress::Done(res) = fsm.step(&mut self.bus, &mut self.device) {
                return res;
            }
        }
    }

    /// Write the first 512 bytes of `buffer` to the block at `sector`.
    ///
    /// Triggers card initialization if no card is mounted yet.
    pub fn write(&mut self, buffer: &[u8], sector: u32) -> SdResult {
        self.check_init()?;
        write::check_params(&self.device, buffer.len(), sector)?;
        let mut fsm = WriteFsm::new(buffer, sector);
        loop {
            if let Progress::Done(res) = fsm.step(&mut self.bus, &mut self.device) {
                return res;
            }
        }
    }

    /// Probe whether a card is answering at all.
    ///
    /// Issues the bare reset-class command: a present card answers
    /// something, a floating bus leaves the start bit set. Note that the
    /// probe drops an initialized card back to its idle state, so expect to
    /// re-run initialization afterwards.
    pub fn status(&mut self) -> SdResult {
        let res = send_command(&mut self.bus, CMD0, 0);
        release(&mut self.bus);
        // Whatever the answer, the mount is stale now.
        self.device.mounted = false;
        self.device.card_type = None;
        if res & 0x80 != 0 {
            Err(SdError::NoResponse)
        } else {
            Ok(())
        }
    }

    /// The device descriptor for the served card slot.
    pub fn device(&self) -> &SdDevice {
        &self.device
    }

    /// Get a temporary borrow on the underlying bus.
    pub fn bus<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut B) -> T,
    {
        func(&mut self.bus)
    }

    /// Destroy the driver and hand the bus back.
    pub fn free(self) -> B {
        self.bus
    }

    fn check_init(&mut self) -> SdResult {
        if self.device.mounted {
            Ok(())
        } else {
            self.init()
        }
    }
}

impl<B> BlockDevice for SdCard<B>
where
    B: SdBus,
{
    type Error = SdError;

    fn read(&mut self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), SdError> {
        for (i, block) in blocks.iter_mut().enumerate() {
            SdCard::read(self, block, start_block_idx.0 + i as u32, 0, BLOCK_LEN as u16)?;
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), SdError> {
        for (i, block) in blocks.iter().enumerate() {
            SdCard::write(self, block, start_block_idx.0 + i as u32)?;
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, SdError> {
        self.check_init()?;
        self.device.num_blocks().ok_or(SdError::NotInitialized)
    }
}
