//! The card initialization and negotiation state machine.
//!
//! Drives a freshly powered card from SPI-mode entry through voltage
//! checking, version detection and operating-condition polling into a
//! mounted, ready device. One bounded unit of work (a command, or a byte)
//! happens per [`step`](InitFsm::step); protocol waits live in the states,
//! never in loops.

use crate::bus::SdBus;
use crate::cmd::{read_sector_count, release, send_command};
use crate::device::{CardType, SdDevice, TransferStats};
use crate::proto::{
    ACMD41, ACMD41_HCS, CMD0, CMD1, CMD16, CMD58, CMD59, CMD8, CMD8_CHECK_ARG, OCR_CCS,
    R1_IDLE_STATE, R1_READY_STATE,
};
use crate::{debug, trace, warn, Progress, SdError};

/// Power-stabilization delay after the 80-clock bus reset.
const POWER_STABLE_MS: u32 = 500;

/// Window for the card to answer the software reset with "idle".
const RESET_WINDOW_MS: u32 = 500;

/// Window for ACMD41 to report the card ready.
const OP_COND_WINDOW_MS: u32 = 1000;

/// Window for the legacy (v1/MMC) initialization command.
const LEGACY_WINDOW_MS: u32 = 250;

/// Options governing card negotiation.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct InitOpts {
    /// How many full restarts of the negotiation sequence to attempt before
    /// reporting the card uninitialized.
    pub attempts: u8,
}

impl Default for InitOpts {
    fn default() -> InitOpts {
        InitOpts { attempts: 3 }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InitState {
    Enter,
    BusReset,
    WaitPowerStable,
    SendReset,
    CheckVersion,
    CollectVoltageEcho,
    ValidateEcho,
    PollOperatingCondition,
    ReadOcr,
    ClassifyCard,
    SelectLegacyCommand,
    PollLegacyIdle,
    DisableCrcCheck,
    SetBlockLength,
    Finalize,
}

/// Execution state of one initialization request.
pub(crate) struct InitFsm {
    state: InitState,
    attempts_limit: u8,
    attempts: u8,
    card_type: Option<CardType>,
    echo: [u8; 4],
    echo_len: usize,
    ocr: [u8; 4],
    ocr_len: usize,
    ocr_requested: bool,
    legacy_cmd: u8,
}

impl InitFsm {
    pub(crate) fn new(opts: &InitOpts) -> InitFsm {
        InitFsm {
            state: InitState::Enter,
            attempts_limit: opts.attempts,
            attempts: 0,
            card_type: None,
            echo: [0; 4],
            echo_len: 0,
            ocr: [0; 4],
            ocr_len: 0,
            ocr_requested: false,
            legacy_cmd: ACMD41,
        }
    }

    /// Restart the whole negotiation sequence, keeping the attempt count.
    fn restart(&mut self) {
        self.card_type = None;
        self.echo_len = 0;
        self.ocr_len = 0;
        self.ocr_requested = false;
        self.state = InitState::Enter;
    }

    /// Advance the negotiation by one micro-step.
    pub(crate) fn step<B: SdBus>(&mut self, bus: &mut B, dev: &mut SdDevice) -> Progress {
        match self.state {
            // Retry gate: a classified card or an exhausted budget falls
            // through to Finalize, otherwise charge an attempt and go again.
            InitState::Enter => {
                if self.card_type.is_some() || self.attempts >= self.attempts_limit {
                    self.state = InitState::Finalize;
                } else {
                    self.attempts += 1;
                    trace!(
                        "card negotiation attempt {}/{}",
                        self.attempts,
                        self.attempts_limit
                    );
                    bus.set_high_speed(false);
                    self.state = InitState::BusReset;
                }
                Progress::Pending
            }

            // 80 clocks with the card deselected drop it into SPI mode.
            InitState::BusReset => {
                bus.deselect();
                for _ in 0..10 {
                    bus.exchange(0xFF);
                }
                bus.start_timeout(POWER_STABLE_MS);
                self.state = InitState::WaitPowerStable;
                Progress::Pending
            }

            InitState::WaitPowerStable => {
                if !bus.timeout_active() {
                    dev.mounted = false;
                    dev.card_type = None;
                    bus.start_timeout(RESET_WINDOW_MS);
                    self.state = InitState::SendReset;
                }
                Progress::Pending
            }

            // Software reset, one CMD0 per tick until the card reports idle.
            InitState::SendReset => {
                if send_command(bus, CMD0, 0) == R1_IDLE_STATE {
                    bus.cancel_timeout();
                    self.state = InitState::CheckVersion;
                } else if !bus.timeout_active() {
                    bus.cancel_timeout();
                    trace!("no idle response to reset, restarting");
                    self.restart();
                }
                Progress::Pending
            }

            // CMD8 tells v2 cards apart: they echo the voltage/check
            // pattern, older cards reject the command outright.
            InitState::CheckVersion => {
                if send_command(bus, CMD8, CMD8_CHECK_ARG) == R1_IDLE_STATE {
                    self.echo_len = 0;
                    self.state = InitState::CollectVoltageEcho;
                } else {
                    self.state = InitState::SelectLegacyCommand;
                }
                Progress::Pending
            }

            // The four trailing bytes of the R7 response, one per tick.
            InitState::CollectVoltageEcho => {
                self.echo[self.echo_len] = bus.exchange(0xFF);
                self.echo_len += 1;
                if self.echo_len == self.echo.len() {
                    self.state = InitState::ValidateEcho;
                }
                Progress::Pending
            }

            InitState::ValidateEcho => {
                if self.echo[2] == 0x01 && self.echo[3] == 0xAA {
                    bus.start_timeout(OP_COND_WINDOW_MS);
                    self.state = InitState::PollOperatingCondition;
                } else {
                    // Answered CMD8, but not as a v2 card would.
                    warn!("bad voltage echo {:x} {:x}", self.echo[2], self.echo[3]);
                    self.state = InitState::SelectLegacyCommand;
                }
                Progress::Pending
            }

            // ACMD41 with the host-capacity bit until the card leaves idle.
            InitState::PollOperatingCondition => {
                if send_command(bus, ACMD41, ACMD41_HCS) == R1_READY_STATE {
                    bus.cancel_timeout();
                    self.ocr_requested = false;
                    self.state = InitState::ReadOcr;
                } else if !bus.timeout_active() {
                    bus.cancel_timeout();
                    trace!("card stayed idle past the operating-condition window");
                    self.restart();
                }
                Progress::Pending
            }

            // CMD58, then the four OCR bytes, one per tick.
            InitState::ReadOcr => {
                if !self.ocr_requested {
                    if send_command(bus, CMD58, 0) == R1_READY_STATE {
                        self.ocr_requested = true;
                        self.ocr_len = 0;
                    } else {
                        self.restart();
                    }
                } else {
                    self.ocr[self.ocr_len] = bus.exchange(0xFF);
                    self.ocr_len += 1;
                    if self.ocr_len == self.ocr.len() {
                        self.state = InitState::ClassifyCard;
                    }
                }
                Progress::Pending
            }

            InitState::ClassifyCard => {
                self.card_type = if self.ocr[0] & OCR_CCS != 0 {
                    Some(CardType::Sdhc)
                } else {
                    Some(CardType::Sd2)
                };
                self.state = InitState::Finalize;
                Progress::Pending
            }

            // v1 SD cards init over ACMD41, MMC over CMD1; probe which.
            InitState::SelectLegacyCommand => {
                if send_command(bus, ACMD41, 0) <= R1_IDLE_STATE {
                    self.card_type = Some(CardType::Sd1);
                    self.legacy_cmd = ACMD41;
                } else {
                    self.card_type = Some(CardType::Mmc3);
                    self.legacy_cmd = CMD1;
                }
                bus.start_timeout(LEGACY_WINDOW_MS);
                self.state = InitState::PollLegacyIdle;
                Progress::Pending
            }

            InitState::PollLegacyIdle => {
                if send_command(bus, self.legacy_cmd, 0) == R1_READY_STATE {
                    bus.cancel_timeout();
                    self.state = InitState::DisableCrcCheck;
                } else if !bus.timeout_active() {
                    bus.cancel_timeout();
                    trace!("card stayed idle past the legacy window");
                    self.restart();
                }
                Progress::Pending
            }

            InitState::DisableCrcCheck => {
                if send_command(bus, CMD59, 0) == R1_READY_STATE {
                    self.state = InitState::SetBlockLength;
                } else {
                    self.restart();
                }
                Progress::Pending
            }

            InitState::SetBlockLength => {
                if send_command(bus, CMD16, 512) == R1_READY_STATE {
                    self.state = InitState::Finalize;
                } else {
                    self.restart();
                }
                Progress::Pending
            }

            // Commit the mount, or report the card uninitialized. Either
            // way the bus is released and the request completes.
            InitState::Finalize => {
                if let Some(card_type) = self.card_type {
                    let sectors = read_sector_count(bus, card_type);
                    if sectors == 0 {
                        warn!("card answered but its capacity read failed");
                        release(bus);
                        return Progress::Done(Err(SdError::NotInitialized));
                    }
                    dev.card_type = Some(card_type);
                    dev.mounted = true;
                    dev.last_sector = sectors - 1;
                    dev.stats = TransferStats::default();
                    bus.set_high_speed(true);
                    release(bus);
                    debug!("mounted {:?}, {} sectors", card_type, sectors);
                    Progress::Done(Ok(()))
                } else {
                    warn!(
                        "card not initialized after {} attempts",
                        self.attempts_limit
                    );
                    release(bus);
                    Progress::Done(Err(SdError::NotInitialized))
                }
            }
        }
    }
}
