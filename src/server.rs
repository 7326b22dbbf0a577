//! The cooperative transaction server.
//!
//! A single-slot mailbox between one client and the card: the client submits
//! a [`Request`], an external scheduler calls [`SdServer::tick`] once per
//! pass, and the client collects the [`Completion`] when the server returns
//! to idle. Each tick advances the one live state machine by exactly one
//! micro-step, so no invocation holds the CPU for longer than one bus
//! transaction.
//!
//! Buffer ownership enforces the mailbox discipline: a read moves
//! `&mut [u8]` into the server and a write moves `&[u8]` in, so the client
//! cannot touch (or for writes, mutate) a buffer while its request is in
//! flight. The buffer comes back inside the completion.

use crate::bus::SdBus;
use crate::device::SdDevice;
use crate::init::{InitFsm, InitOpts};
use crate::read::{self, ReadFsm};
use crate::write::{self, WriteFsm};
use crate::{debug, warn, Progress, SdResult};

/// One request for the transaction server.
///
/// There is no "none" kind and no out-of-range kind; a value of this type is
/// always a serviceable request.
#[derive(Debug)]
pub enum Request<'b> {
    /// Negotiate with and mount the card.
    Init,
    /// Read the 512-byte block at `sector`, storing the bytes of the stream
    /// window `[offset, offset + count)` at the start of `buf`.
    ///
    /// The stream is the block plus its two CRC trailer bytes, so `offset`
    /// runs over `0..514`. A whole block is `offset: 0, count: 512`.
    Read {
        /// Destination; must hold at least `count` bytes.
        buf: &'b mut [u8],
        /// Zero-based sector index.
        sector: u32,
        /// First stream byte to keep.
        offset: u16,
        /// Number of stream bytes to keep.
        count: u16,
    },
    /// Write the first 512 bytes of `buf` to the block at `sector`.
    Write {
        /// Source; must hold at least one full block.
        buf: &'b [u8],
        /// Zero-based sector index.
        sector: u32,
    },
}

/// A finished request: the result code, and the buffer moving back to the
/// caller.
#[derive(Debug)]
pub enum Completion<'b> {
    /// An init request finished.
    Init(SdResult),
    /// A read request finished; the destination buffer comes back.
    Read(SdResult, &'b mut [u8]),
    /// A write request finished; the source buffer comes back.
    Write(SdResult, &'b [u8]),
}

impl Completion<'_> {
    /// The result code, whatever the request kind.
    pub fn result(&self) -> SdResult {
        match self {
            Completion::Init(res) => *res,
            Completion::Read(res, _) => *res,
            Completion::Write(res, _) => *res,
        }
    }
}

/// Externally visible state of the server.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// No request in flight; the server will accept a submission.
    Idle,
    /// A request is in flight; submissions are refused.
    Busy,
    /// The server hit its error sink and has halted service.
    Fault,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ServiceState {
    Idle,
    Init,
    Read,
    Write,
    Fault,
}

/// The cooperative SD transaction server.
///
/// Owns the bus, the device descriptor and the execution state of whichever
/// request is in flight. `'b` is the lifetime of the client buffers that
/// pass through the mailbox.
pub struct SdServer<'b, B>
where
    B: SdBus,
{
    bus: B,
    device: SdDevice,
    opts: InitOpts,
    state: ServiceState,
    pending: Option<Request<'b>>,
    completion: Option<Completion<'b>>,
    init: Option<InitFsm>,
    read: Option<ReadFsm<'b>>,
    write: Option<WriteFsm<'b>>,
}

impl<'b, B> SdServer<'b, B>
where
    B: SdBus,
{
    /// Create a server for the card behind `bus`, with default options.
    pub fn new(bus: B) -> SdServer<'b, B> {
        Self::new_with_options(bus, InitOpts::default())
    }

    /// Create a server for the card behind `bus`.
    pub fn new_with_options(bus: B, opts: InitOpts) -> SdServer<'b, B> {
        SdServer {
            bus,
            device: SdDevice::new(),
            opts,
            state: ServiceState::Idle,
            pending: None,
            completion: None,
            init: None,
            read: None,
            write: None,
        }
    }

    /// Stage a request for the next idle tick.
    ///
    /// Refused, with the request handed back untouched, while another
    /// request is staged or in flight, while a completion is waiting to be
    /// collected, or after a fault.
    pub fn submit(&mut self, request: Request<'b>) -> Result<(), Request<'b>> {
        if self.pending.is_some()
            || self.completion.is_some()
            || self.state != ServiceState::Idle
        {
            return Err(request);
        }
        self.pending = Some(request);
        Ok(())
    }

    /// Collect the completion of the most recently finished request.
    pub fn take_completion(&mut self) -> Option<Completion<'b>> {
        self.completion.take()
    }

    /// Current server status.
    pub fn status(&self) -> ServerStatus {
        match self.state {
            ServiceState::Fault => ServerStatus::Fault,
            ServiceState::Idle if self.pending.is_none() => ServerStatus::Idle,
            _ => ServerStatus::Busy,
        }
    }

    /// Has the server halted in its error sink?
    ///
    /// Escalation (resetting the device, raising an alert) is the
    /// integrator's decision; the server itself will never leave this state.
    pub fn is_faulted(&self) -> bool {
        self.state == ServiceState::Fault
    }

    /// The device descriptor for the served card slot.
    pub fn device(&self) -> &SdDevice {
        &self.device
    }

    /// Get a temporary borrow on the underlying bus.
    ///
    /// Useful if you need to re-clock or inspect the transport. Don't talk
    /// to the card with it while a request is in flight.
    pub fn bus<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut B) -> T,
    {
        func(&mut self.bus)
    }

    /// Destroy the server and hand the bus back.
    pub fn free(self) -> B {
        self.bus
    }

    /// Service the mailbox by one micro-step.
    ///
    /// Call this once per scheduler pass. Accepting a request, advancing the
    /// live state machine one state, and posting a completion each take one
    /// tick; nothing inside blocks beyond a single bus transaction.
    pub fn tick(&mut self) -> ServerStatus {
        match self.state {
            ServiceState::Idle => {
                if let Some(request) = self.pending.take() {
                    self.accept(request);
                }
            }

            ServiceState::Init => match self.init.take() {
                Some(mut fsm) => match fsm.step(&mut self.bus, &mut self.device) {
                    Progress::Pending => self.init = Some(fsm),
                    Progress::Done(res) => self.complete(Completion::Init(res)),
                },
                None => self.fault(),
            },

            ServiceState::Read => match self.read.take() {
                Some(mut fsm) => match fsm.step(&mut self.bus, &mut self.device) {
                    Progress::Pending => self.read = Some(fsm),
                    Progress::Done(res) => {
                        self.complete(Completion::Read(res, fsm.into_buffer()));
                    }
                },
                None => self.fault(),
            },

            ServiceState::Write => match self.write.take() {
                Some(mut fsm) => match fsm.step(&mut self.bus, &mut self.device) {
                    Progress::Pending => self.write = Some(fsm),
                    Progress::Done(res) => {
                        self.complete(Completion::Write(res, fsm.into_buffer()));
                    }
                },
                None => self.fault(),
            },

            // The error sink: nothing is serviced any more.
            ServiceState::Fault => {}
        }
        self.status()
    }

    /// Move a staged request into the matching state machine, or complete it
    /// straight away if its parameters are bad. Parameter failures cause no
    /// bus traffic and never show as busy.
    fn accept(&mut self, request: Request<'b>) {
        match request {
            Request::Init => {
                debug!("accepted init request");
                self.init = Some(InitFsm::new(&self.opts));
                self.state = ServiceState::Init;
            }
            Request::Read {
                buf,
                sector,
                offset,
                count,
            } => match read::check_params(&self.device, buf.len(), sector, count) {
                Ok(()) => {
                    debug!("accepted read request, sector {}", sector);
                    self.read = Some(ReadFsm::new(buf, sector, offset, count));
                    self.state = ServiceState::Read;
                }
                Err(e) => self.complete(Completion::Read(Err(e), buf)),
            },
            Request::Write { buf, sector } => {
                match write::check_params(&self.device, buf.len(), sector) {
                    Ok(()) => {
                        debug!("accepted write request, sector {}", sector);
                        self.write = Some(WriteFsm::new(buf, sector));
                        self.state = ServiceState::Write;
                    }
                    Err(e) => self.complete(Completion::Write(Err(e), buf)),
                }
            }
        }
    }

    fn complete(&mut self, completion: Completion<'b>) {
        match completion.result() {
            Ok(()) => debug!("request complete: OK"),
            Err(_e) => debug!("request complete: {}", _e.as_str()),
        }
        self.completion = Some(completion);
        self.state = ServiceState::Idle;
    }

    fn fault(&mut self) {
        warn!("state tag has no matching execution context; halting service");
        self.state = ServiceState::Fault;
    }
}
