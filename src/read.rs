//! The single-block read state machine.
//!
//! Streams one 512-byte block (plus its two-byte CRC trailer, read and
//! discarded) out of the card, one byte per step. Only the bytes of the
//! caller's `[offset, offset + count)` window are stored, so a sub-range of
//! a block can be read without a staging buffer.

use crate::blockdevice::BLOCK_LEN;
use crate::bus::SdBus;
use crate::cmd::{release, send_command};
use crate::device::SdDevice;
use crate::proto::{CMD17, DATA_START_BLOCK, R1_READY_STATE};
use crate::{trace, Progress, SdError, SdResult};

/// Window for the data-start token after a read command.
const TOKEN_WINDOW_MS: u32 = 100;

/// Data block plus its CRC trailer.
const STREAM_LEN: u32 = BLOCK_LEN as u32 + 2;

/// Reject caller mistakes before any bus traffic happens.
pub(crate) fn check_params(
    dev: &SdDevice,
    buf_len: usize,
    sector: u32,
    count: u16,
) -> Result<(), SdError> {
    if !dev.mounted {
        return Err(SdError::NotInitialized);
    }
    if sector > dev.last_sector || count == 0 || count as usize > buf_len {
        return Err(SdError::InvalidParameter);
    }
    Ok(())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ReadState {
    SendCommand,
    AwaitToken,
    Stream,
    Finish,
}

/// Execution state of one block-read request.
pub(crate) struct ReadFsm<'b> {
    state: ReadState,
    buf: &'b mut [u8],
    sector: u32,
    offset: u16,
    count: u16,
    byte_num: u32,
    result: SdResult,
}

impl<'b> ReadFsm<'b> {
    /// Parameters are snapshotted here when the request is accepted; later
    /// changes to the caller's request cannot touch an in-flight read.
    pub(crate) fn new(buf: &'b mut [u8], sector: u32, offset: u16, count: u16) -> ReadFsm<'b> {
        ReadFsm {
            state: ReadState::SendCommand,
            buf,
            sector,
            offset,
            count,
            byte_num: 0,
            result: Err(SdError::DeviceError),
        }
    }

    /// Hand the caller's buffer back once the request has completed.
    pub(crate) fn into_buffer(self) -> &'b mut [u8] {
        self.buf
    }

    /// Advance the read by one micro-step.
    pub(crate) fn step<B: SdBus>(&mut self, bus: &mut B, dev: &mut SdDevice) -> Progress {
        match self.state {
            // Sector addressing on the wire: this driver serves SDHC/SDXC.
            ReadState::SendCommand => {
                if send_command(bus, CMD17, self.sector) == R1_READY_STATE {
                    bus.start_timeout(TOKEN_WINDOW_MS);
                    self.state = ReadState::AwaitToken;
                } else {
                    trace!("read command declined, sector {}", self.sector);
                    self.state = ReadState::Finish;
                }
                Progress::Pending
            }

            ReadState::AwaitToken => {
                let token = bus.exchange(0xFF);
                if token == 0xFF {
                    // Filler; keep polling until the window lapses.
                    if !bus.timeout_active() {
                        bus.cancel_timeout();
                        self.state = ReadState::Finish;
                    }
                } else {
                    bus.cancel_timeout();
                    if token == DATA_START_BLOCK {
                        self.byte_num = 0;
                        self.state = ReadState::Stream;
                    } else {
                        trace!("unexpected read token {:x}", token);
                        self.state = ReadState::Finish;
                    }
                }
                Progress::Pending
            }

            ReadState::Stream => {
                let data = bus.exchange(0xFF);
                let offset = u32::from(self.offset);
                let count = u32::from(self.count);
                if self.byte_num >= offset && self.byte_num < offset + count {
                    self.buf[(self.byte_num - offset) as usize] = data;
                }
                self.byte_num += 1;
                if self.byte_num == STREAM_LEN {
                    self.result = Ok(());
                    self.state = ReadState::Finish;
                }
                Progress::Pending
            }

            ReadState::Finish => {
                release(bus);
                dev.stats.reads += 1;
                Progress::Done(self.result)
            }
        }
    }
}
