//! Block read and write tests.

mod utils;

use sdspi_nb::{Completion, Request, SdError, SdServer};
use utils::{run_to_completion, SimCard, SIM_SECTORS};

fn pattern(seed: u8) -> [u8; 512] {
    let mut block = [0u8; 512];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
    block
}

fn mounted_server<'b>(sim: SimCard) -> SdServer<'b, SimCard> {
    let mut server = SdServer::new(sim);
    server.submit(Request::Init).unwrap();
    let completion = run_to_completion(&mut server);
    assert_eq!(completion.result(), Ok(()));
    server
}

#[test]
fn round_trips_a_block() {
    let _ = env_logger::builder().is_test(true).try_init();
    let data = pattern(7);
    let mut readback = [0u8; 512];
    let mut server = mounted_server(SimCard::new());

    server
        .submit(Request::Write {
            buf: &data,
            sector: 42,
        })
        .unwrap();
    assert_eq!(run_to_completion(&mut server).result(), Ok(()));

    server
        .submit(Request::Read {
            buf: &mut readback,
            sector: 42,
            offset: 0,
            count: 512,
        })
        .unwrap();
    match run_to_completion(&mut server) {
        Completion::Read(result, buf) => {
            assert_eq!(result, Ok(()));
            assert_eq!(&buf[..], &data[..]);
        }
        other => panic!("unexpected completion {:?}", other),
    }

    let stats = server.device().stats();
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.writes, 1);
}

#[test]
fn windowed_read_copies_exactly_the_window() {
    let block = pattern(3);
    let mut buf = [0xEEu8; 64];
    let mut sim = SimCard::new();
    sim.preload(7, block);
    let mut server = mounted_server(sim);

    server
        .submit(Request::Read {
            buf: &mut buf,
            sector: 7,
            offset: 100,
            count: 50,
        })
        .unwrap();
    match run_to_completion(&mut server) {
        Completion::Read(result, buf) => {
            assert_eq!(result, Ok(()));
            assert_eq!(&buf[..50], &block[100..150]);
            // Bytes past the window stay untouched.
            assert!(buf[50..].iter().all(|&b| b == 0xEE));
        }
        other => panic!("unexpected completion {:?}", other),
    }
}

#[test]
fn out_of_range_sector_is_rejected_without_bus_traffic() {
    let mut buf = [0u8; 512];
    let mut server = mounted_server(SimCard::new());

    let before = server.bus(|sim| sim.exchanges);
    server
        .submit(Request::Read {
            buf: &mut buf,
            sector: SIM_SECTORS,
            offset: 0,
            count: 512,
        })
        .unwrap();
    let completion = run_to_completion(&mut server);

    assert_eq!(completion.result(), Err(SdError::InvalidParameter));
    assert_eq!(server.bus(|sim| sim.exchanges), before);
}

#[test]
fn zero_count_read_is_rejected_without_bus_traffic() {
    let mut buf = [0u8; 512];
    let mut server = mounted_server(SimCard::new());

    let before = server.bus(|sim| sim.exchanges);
    server
        .submit(Request::Read {
            buf: &mut buf,
            sector: 0,
            offset: 0,
            count: 0,
        })
        .unwrap();
    assert_eq!(
        run_to_completion(&mut server).result(),
        Err(SdError::InvalidParameter)
    );
    assert_eq!(server.bus(|sim| sim.exchanges), before);
}

#[test]
fn out_of_range_write_is_rejected_without_bus_traffic() {
    let data = [0u8; 512];
    let mut server = mounted_server(SimCard::new());

    let before = server.bus(|sim| sim.exchanges);
    server
        .submit(Request::Write {
            buf: &data,
            sector: SIM_SECTORS,
        })
        .unwrap();
    assert_eq!(
        run_to_completion(&mut server).result(),
        Err(SdError::InvalidParameter)
    );
    assert_eq!(server.bus(|sim| sim.exchanges), before);
}

#[test]
fn undersized_write_buffer_is_rejected() {
    let data = [0u8; 64];
    let mut server = mounted_server(SimCard::new());

    server
        .submit(Request::Write {
            buf: &data,
            sector: 0,
        })
        .unwrap();
    assert_eq!(
        run_to_completion(&mut server).result(),
        Err(SdError::InvalidParameter)
    );
}

#[test]
fn transfers_against_an_unmounted_device_are_refused() {
    let mut buf = [0u8; 512];
    let mut server = SdServer::new(SimCard::new());

    let before = server.bus(|sim| sim.exchanges);
    server
        .submit(Request::Read {
            buf: &mut buf,
            sector: 0,
            offset: 0,
            count: 512,
        })
        .unwrap();
    assert_eq!(
        run_to_completion(&mut server).result(),
        Err(SdError::NotInitialized)
    );
    assert_eq!(server.bus(|sim| sim.exchanges), before);
}

#[test]
fn rejected_write_skips_the_programming_wait() {
    let data = pattern(9);
    let mut server = mounted_server(SimCard::new());
    server.bus(|sim| sim.reject_writes = true);

    let windows_before = server.bus(|sim| sim.timer_starts.len());
    server
        .submit(Request::Write {
            buf: &data,
            sector: 3,
        })
        .unwrap();
    let completion = run_to_completion(&mut server);

    assert_eq!(completion.result(), Err(SdError::Rejected));
    // Straight back to idle: the programming-busy window was never armed.
    assert_eq!(server.bus(|sim| sim.timer_starts.len()), windows_before);
    // And nothing was stored.
    assert_eq!(server.bus(|sim| sim.sector(3)), [0u8; 512]);
}

#[test]
fn write_reports_busy_when_programming_outlasts_the_window() {
    let data = pattern(5);
    let mut server = mounted_server(SimCard::new());
    // More busy bytes than the window has polls.
    server.bus(|sim| sim.busy_zeros = 100);

    server
        .submit(Request::Write {
            buf: &data,
            sector: 8,
        })
        .unwrap();
    let completion = run_to_completion(&mut server);

    assert_eq!(completion.result(), Err(SdError::Busy));
    // The block reached the card; only the wait for programming lapsed.
    assert_eq!(server.device().stats().writes, 1);
}

#[test]
fn failed_transfers_still_count_as_operations() {
    let mut buf = [0u8; 512];
    let mut server = mounted_server(SimCard::new());

    // A declined read command surfaces as a device error after reaching the
    // card, so the attempt shows in the diagnostics.
    server.bus(|sim| sim.fail_reads = true);
    server
        .submit(Request::Read {
            buf: &mut buf,
            sector: 1,
            offset: 0,
            count: 512,
        })
        .unwrap();
    assert_eq!(
        run_to_completion(&mut server).result(),
        Err(SdError::DeviceError)
    );
    assert_eq!(server.device().stats().reads, 1);
}
