//! The command/response codec.
//!
//! Frames commands onto the bus and polls their R1 responses. Every other
//! component issues its card traffic through [`send_command`]; nothing here
//! interprets a response beyond the top (start) bit, that is the caller's
//! job.

use byteorder::{BigEndian, ByteOrder};

use crate::bus::SdBus;
use crate::device::CardType;
use crate::proto::{
    Csd, CsdV1, CsdV2, APP_CMD_FLAG, CMD0, CMD0_CRC, CMD55, CMD8, CMD8_CRC, CMD9, DUMMY_CRC,
    R1_READY_STATE,
};

/// R1 poll bound, in byte times. Cards answer within 8; this is the classic
/// generous bound. The shared one-shot timer is left alone here so the state
/// machines' protocol windows stay armed across a command.
pub(crate) const CMD_RESPONSE_POLLS: u32 = 512;

/// How long to wait for the CSD register's data token, in milliseconds.
pub(crate) const CSD_TOKEN_TIMEOUT_MS: u32 = 100;

/// Send one command frame and return its R1 response byte.
///
/// A command carrying [`APP_CMD_FLAG`] is sent as the CMD55 prefix followed
/// by the command itself; if the prefix answers with anything past "idle"
/// that response is final and the real command is not sent, so the failure
/// cannot be masked by whatever the follow-up would have returned.
///
/// When the poll bound runs out the last polled byte is returned; its set
/// start bit marks it as a non-response.
pub(crate) fn send_command<B: SdBus>(bus: &mut B, cmd: u8, arg: u32) -> u8 {
    let mut cmd = cmd;
    if cmd & APP_CMD_FLAG != 0 {
        cmd &= !APP_CMD_FLAG;
        let res = send_command(bus, CMD55, 0);
        if res > 1 {
            return res;
        }
    }

    // Deselect/reselect with an idle byte on each side: the dummy clock
    // pulse cards need between command frames.
    bus.deselect();
    bus.exchange(0xFF);
    bus.select();
    bus.exchange(0xFF);

    let mut frame = [0u8; 6];
    frame[0] = 0x40 | cmd;
    BigEndian::write_u32(&mut frame[1..5], arg);
    // CRC checking is not negotiated yet when the reset-sequence commands
    // go out, so those two must carry their real CRC-7.
    frame[5] = match cmd {
        CMD0 => CMD0_CRC,
        CMD8 => CMD8_CRC,
        _ => DUMMY_CRC,
    };
    for b in frame.iter() {
        bus.exchange(*b);
    }

    let mut res = bus.exchange(0xFF);
    let mut polls = CMD_RESPONSE_POLLS;
    while (res & 0x80) != 0 && polls > 0 {
        res = bus.exchange(0xFF);
        polls -= 1;
    }
    res
}

/// Deassert the card and clock one trailing idle byte so it lets go of the
/// data line.
pub(crate) fn release<B: SdBus>(bus: &mut B) {
    bus.deselect();
    bus.exchange(0xFF);
}

/// Query the CSD register and decode the card's capacity in 512-byte
/// sectors. Zero means the query failed.
pub(crate) fn read_sector_count<B: SdBus>(bus: &mut B, card_type: CardType) -> u32 {
    if send_command(bus, CMD9, 0) != R1_READY_STATE {
        return 0;
    }

    // Filler until the data token announces the register; the token itself
    // is consumed here.
    bus.start_timeout(CSD_TOKEN_TIMEOUT_MS);
    loop {
        if bus.exchange(0xFF) != 0xFF {
            break;
        }
        if !bus.timeout_active() {
            bus.cancel_timeout();
            release(bus);
            return 0;
        }
    }
    bus.cancel_timeout();

    let mut data = [0u8; 16];
    for byte in data.iter_mut() {
        *byte = bus.exchange(0xFF);
    }
    // CRC trailer, read but not checked
    bus.exchange(0xFF);
    bus.exchange(0xFF);
    release(bus);

    let csd = if card_type.has_v2_csd() {
        Csd::V2(CsdV2 { data })
    } else {
        Csd::V1(CsdV1 { data })
    };
    csd.card_capacity_blocks()
}
