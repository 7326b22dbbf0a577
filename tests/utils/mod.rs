//! Useful library code for tests: a simulated SPI-mode SD card.
//!
//! `SimCard` implements [`SdBus`] and models just enough of the wire
//! protocol for the driver to negotiate, read and write: command frame
//! parsing, R1 responses with a one-byte answer delay, the CMD8 voltage
//! echo, OCR and CSD register reads, data tokens and the write data-response
//! plus programming-busy bytes.
//!
//! The countdown timer is modelled in polls, not milliseconds: each armed
//! window stays active for `timer_budget` calls of `timeout_active`, which
//! keeps every test deterministic.

// Not every test binary uses every helper here.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use sdspi_nb::{Completion, SdBus, SdServer};

/// Tick the server until the in-flight request posts its completion.
pub fn run_to_completion<'b, B: SdBus>(server: &mut SdServer<'b, B>) -> Completion<'b> {
    for _ in 0..1_000_000 {
        server.tick();
        if let Some(completion) = server.take_completion() {
            return completion;
        }
    }
    panic!("request never completed");
}

/// Sector count of the simulated v2 card: CSD `device_size` 15, so
/// (15 + 1) * 1024 sectors (8 MiB).
pub const SIM_SECTORS: u32 = 16384;

/// Sector count of the simulated v1 card (a real 1 GB card's register).
pub const SIM_SECTORS_V1: u32 = 1_984_000;

const CSD_V2: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x00, 0x0F, 0x7F, 0x80, 0x0A, 0x40, 0x00,
    0x8B,
];

const CSD_V1: [u8; 16] = [
    0x00, 0x26, 0x00, 0x32, 0x5F, 0x59, 0x83, 0xC8, 0xAD, 0xDB, 0xCF, 0xFF, 0xD2, 0x40, 0x40,
    0xA5,
];

/// Which generation the simulated card pretends to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardVersion {
    /// Answers CMD8 with a valid voltage echo; reports a v2 CSD. `hcs`
    /// controls the CCS bit in the OCR.
    V2 { hcs: bool },
    /// Rejects CMD8 as illegal; inits over ACMD41; reports a v1 CSD.
    Legacy,
}

enum WritePhase {
    AwaitToken { sector: u32 },
    Data { sector: u32, buf: Vec<u8> },
}

pub struct SimCard {
    mem: HashMap<u32, [u8; 512]>,

    // Wire state
    selected: bool,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    write_phase: Option<WritePhase>,
    prefixed: bool,
    idle: bool,
    init_polls: u32,

    // Timer model
    polls_left: u32,

    // Behaviour knobs
    pub version: CardVersion,
    /// The init command never reports ready (the card "never leaves idle").
    pub never_ready: bool,
    /// Polls of the init command before the card reports ready.
    pub ready_after: u32,
    /// Every written block is answered with a CRC-error data response.
    pub reject_writes: bool,
    /// Decline every single-block read command.
    pub fail_reads: bool,
    /// Programming-busy bytes clocked out after an accepted write.
    pub busy_zeros: usize,
    /// `timeout_active` polls per armed window.
    pub timer_budget: u32,

    // Instrumentation
    pub exchanges: usize,
    pub high_speed: bool,
    pub cmd_counts: HashMap<u8, u32>,
    pub timer_starts: Vec<u32>,
}

impl SimCard {
    pub fn new() -> SimCard {
        SimCard {
            mem: HashMap::new(),
            selected: false,
            out: VecDeque::new(),
            frame: Vec::new(),
            write_phase: None,
            prefixed: false,
            idle: false,
            init_polls: 0,
            polls_left: 0,
            version: CardVersion::V2 { hcs: true },
            never_ready: false,
            ready_after: 2,
            reject_writes: false,
            fail_reads: false,
            busy_zeros: 2,
            timer_budget: 8,
            exchanges: 0,
            high_speed: false,
            cmd_counts: HashMap::new(),
            timer_starts: Vec::new(),
        }
    }

    /// Put known content in a sector of the backing store.
    pub fn preload(&mut self, sector: u32, block: [u8; 512]) {
        self.mem.insert(sector, block);
    }

    /// What the backing store holds for a sector (zeroes if never written).
    pub fn sector(&self, sector: u32) -> [u8; 512] {
        self.mem.get(&sector).copied().unwrap_or([0u8; 512])
    }

    /// How many frames of this command index the card has seen.
    pub fn count(&self, cmd: u8) -> u32 {
        self.cmd_counts.get(&cmd).copied().unwrap_or(0)
    }

    /// How many windows of this many milliseconds have been armed.
    pub fn timer_starts_of(&self, ms: u32) -> usize {
        self.timer_starts.iter().filter(|&&v| v == ms).count()
    }

    fn consume_write(&mut self, out: u8) -> u8 {
        match self.write_phase.take().expect("write phase") {
            WritePhase::AwaitToken { sector } => {
                if out == 0xFE {
                    self.write_phase = Some(WritePhase::Data {
                        sector,
                        buf: Vec::new(),
                    });
                    0xFF
                } else {
                    // Still polling the R1 response; serve the queue.
                    self.write_phase = Some(WritePhase::AwaitToken { sector });
                    self.out.pop_front().unwrap_or(0xFF)
                }
            }
            WritePhase::Data { sector, mut buf } => {
                buf.push(out);
                if buf.len() == 514 {
                    // Block plus CRC trailer received; queue the data
                    // response and the programming-busy bytes.
                    if self.reject_writes {
                        self.out.push_back(0x0D);
                    } else {
                        let mut block = [0u8; 512];
                        block.copy_from_slice(&buf[..512]);
                        self.mem.insert(sector, block);
                        self.out.push_back(0x05);
                        for _ in 0..self.busy_zeros {
                            self.out.push_back(0x00);
                        }
                        self.out.push_back(0xFF);
                    }
                } else {
                    self.write_phase = Some(WritePhase::Data { sector, buf });
                }
                0xFF
            }
        }
    }

    fn init_command(&mut self) {
        if self.never_ready {
            self.out.push_back(0x01);
            return;
        }
        self.init_polls += 1;
        if self.init_polls >= self.ready_after {
            self.idle = false;
            self.out.push_back(0x00);
        } else {
            self.out.push_back(0x01);
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        *self.cmd_counts.entry(cmd).or_insert(0) += 1;
        let prefixed = self.prefixed;
        self.prefixed = cmd == 55;

        // One byte of answer delay before every response.
        self.out.push_back(0xFF);

        match cmd {
            0 => {
                self.idle = true;
                self.init_polls = 0;
                self.out.push_back(0x01);
            }
            8 => match self.version {
                CardVersion::V2 { .. } if arg == 0x1AA => {
                    self.out.push_back(0x01);
                    self.out.extend([0x00, 0x00, 0x01, 0xAA]);
                }
                CardVersion::V2 { .. } => {
                    self.out.push_back(0x01);
                    self.out.extend([0x00, 0x00, 0x00, 0x00]);
                }
                CardVersion::Legacy => {
                    // Illegal command while idle.
                    self.out.push_back(0x05);
                }
            },
            55 => {
                self.out.push_back(if self.idle { 0x01 } else { 0x00 });
            }
            41 if prefixed => self.init_command(),
            1 => self.init_command(),
            58 => {
                if self.idle {
                    self.out.push_back(0x01);
                } else {
                    let hcs = matches!(self.version, CardVersion::V2 { hcs: true });
                    self.out.push_back(0x00);
                    self.out
                        .extend([if hcs { 0xC0 } else { 0x80 }, 0xFF, 0x80, 0x00]);
                }
            }
            9 => {
                self.out.push_back(0x00);
                self.out.push_back(0xFF);
                self.out.push_back(0xFE);
                match self.version {
                    CardVersion::V2 { .. } => self.out.extend(CSD_V2),
                    CardVersion::Legacy => self.out.extend(CSD_V1),
                }
                self.out.extend([0x55, 0xAA]);
            }
            16 | 59 => {
                self.out.push_back(if self.idle { 0x01 } else { 0x00 });
            }
            17 => {
                if self.idle || self.fail_reads {
                    self.out.push_back(0x05);
                } else {
                    let block = self.sector(arg);
                    self.out.push_back(0x00);
                    self.out.push_back(0xFF);
                    self.out.push_back(0xFE);
                    self.out.extend(block);
                    self.out.extend([0x55, 0xAA]);
                }
            }
            24 => {
                if self.idle {
                    self.out.push_back(0x05);
                } else {
                    self.out.push_back(0x00);
                    self.write_phase = Some(WritePhase::AwaitToken { sector: arg });
                }
            }
            _ => {
                self.out.push_back(0x04);
            }
        }
    }
}

impl SdBus for SimCard {
    fn exchange(&mut self, out: u8) -> u8 {
        self.exchanges += 1;
        if !self.selected {
            return 0xFF;
        }
        if self.write_phase.is_some() {
            return self.consume_write(out);
        }
        if !self.frame.is_empty() {
            self.frame.push(out);
            if self.frame.len() == 6 {
                let frame = std::mem::take(&mut self.frame);
                self.handle_frame(&frame);
            }
            0xFF
        } else if out & 0xC0 == 0x40 {
            self.frame.push(out);
            0xFF
        } else {
            self.out.pop_front().unwrap_or(0xFF)
        }
    }

    fn select(&mut self) {
        self.selected = true;
    }

    fn deselect(&mut self) {
        // The card releases its output when deselected.
        self.selected = false;
        self.out.clear();
        self.frame.clear();
        self.write_phase = None;
    }

    fn set_high_speed(&mut self, enabled: bool) {
        self.high_speed = enabled;
    }

    fn start_timeout(&mut self, ms: u32) {
        self.timer_starts.push(ms);
        self.polls_left = self.timer_budget;
    }

    fn timeout_active(&mut self) -> bool {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            true
        } else {
            false
        }
    }

    fn cancel_timeout(&mut self) {
        self.polls_left = 0;
    }
}
