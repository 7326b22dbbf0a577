//! The single-block write state machine.
//!
//! Streams one 512-byte block into the card, one byte per step, then waits
//! for the card's programming-busy line to clear. A rejected block surfaces
//! immediately; the busy wait only runs for accepted data.

use crate::blockdevice::BLOCK_LEN;
use crate::bus::SdBus;
use crate::cmd::{release, send_command};
use crate::device::SdDevice;
use crate::proto::{CMD24, DATA_RES_ACCEPTED, DATA_RES_MASK, DATA_START_BLOCK, R1_READY_STATE};
use crate::{trace, warn, Progress, SdError, SdResult};

/// Window for the card to finish programming a block.
const BUSY_WINDOW_MS: u32 = 250;

/// Reject caller mistakes before any bus traffic happens.
pub(crate) fn check_params(dev: &SdDevice, buf_len: usize, sector: u32) -> Result<(), SdError> {
    if !dev.mounted {
        return Err(SdError::NotInitialized);
    }
    if sector > dev.last_sector || buf_len < BLOCK_LEN {
        return Err(SdError::InvalidParameter);
    }
    Ok(())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WriteState {
    SendCommand,
    Stream,
    StartBusyWait,
    AwaitProgramming,
    Finish,
}

/// Execution state of one block-write request.
pub(crate) struct WriteFsm<'b> {
    state: WriteState,
    buf: &'b [u8],
    sector: u32,
    idx: usize,
    line: u8,
    result: SdResult,
}

impl<'b> WriteFsm<'b> {
    pub(crate) fn new(buf: &'b [u8], sector: u32) -> WriteFsm<'b> {
        WriteFsm {
            state: WriteState::SendCommand,
            buf,
            sector,
            idx: 0,
            line: 0,
            result: Err(SdError::DeviceError),
        }
    }

    /// Hand the caller's buffer back once the request has completed.
    pub(crate) fn into_buffer(self) -> &'b [u8] {
        self.buf
    }

    /// Advance the write by one micro-step.
    pub(crate) fn step<B: SdBus>(&mut self, bus: &mut B, dev: &mut SdDevice) -> Progress {
        match self.state {
            // Sector addressing on the wire, then the data-start token: the
            // same token value the read path recognises.
            WriteState::SendCommand => {
                if send_command(bus, CMD24, self.sector) == R1_READY_STATE {
                    bus.exchange(DATA_START_BLOCK);
                    self.idx = 0;
                    self.state = WriteState::Stream;
                } else {
                    trace!("write command declined, sector {}", self.sector);
                    self.state = WriteState::Finish;
                }
                Progress::Pending
            }

            WriteState::Stream => {
                if self.idx != BLOCK_LEN {
                    bus.exchange(self.buf[self.idx]);
                    self.idx += 1;
                } else {
                    // Dummy CRC trailer, then the data-response token.
                    bus.exchange(0xFF);
                    bus.exchange(0xFF);
                    let response = bus.exchange(0xFF);
                    if (response & DATA_RES_MASK) != DATA_RES_ACCEPTED {
                        warn!("block rejected, data response {:x}", response);
                        self.result = Err(SdError::Rejected);
                        self.state = WriteState::Finish;
                    } else {
                        self.state = WriteState::StartBusyWait;
                    }
                }
                Progress::Pending
            }

            WriteState::StartBusyWait => {
                bus.start_timeout(BUSY_WINDOW_MS);
                self.line = bus.exchange(0xFF);
                self.state = WriteState::AwaitProgramming;
                Progress::Pending
            }

            // The card holds the data line low while programming.
            WriteState::AwaitProgramming => {
                if self.line == 0 && bus.timeout_active() {
                    self.line = bus.exchange(0xFF);
                } else {
                    bus.cancel_timeout();
                    dev.stats.writes += 1;
                    self.result = if self.line == 0 {
                        Err(SdError::Busy)
                    } else {
                        Ok(())
                    };
                    self.state = WriteState::Finish;
                }
                Progress::Pending
            }

            WriteState::Finish => {
                release(bus);
                Progress::Done(self.result)
            }
        }
    }
}
