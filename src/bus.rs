//! The bus transport the driver runs on.
//!
//! The protocol engine is written against [`SdBus`], a byte-exchange
//! interface with chip-select, a speed throttle and a one-shot countdown
//! timer. Platforms with `embedded-hal` 1.0 peripherals can use the bundled
//! [`SpiTransport`] adapter; anything else (PIO engines, memory-mapped SPI
//! blocks, simulations) implements the trait directly.

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

/// Byte-level transport to the card.
///
/// The contract is deliberately infallible, mirroring what a polled SPI
/// block actually does. An implementation whose underlying peripheral can
/// fail must degrade to returning `0xFF` (an idle bus); the protocol layer
/// resolves that through its command and token timeouts.
///
/// The timer is a single one-shot countdown owned by the transport. Only one
/// timeout is ever armed at a time; [`start_timeout`](SdBus::start_timeout)
/// on a running timer re-arms it.
pub trait SdBus {
    /// Clock one byte out while clocking one byte in.
    fn exchange(&mut self, out: u8) -> u8;

    /// Assert the card's chip-select line.
    fn select(&mut self);

    /// Deassert the card's chip-select line.
    fn deselect(&mut self);

    /// Throttle the bus clock: `false` for the sub-400 kHz identification
    /// rate, `true` for the full transfer rate.
    fn set_high_speed(&mut self, enabled: bool);

    /// Arm the one-shot countdown timer for `ms` milliseconds.
    fn start_timeout(&mut self, ms: u32);

    /// Is the armed countdown still running?
    ///
    /// Returns `false` once it lapses, and `false` when no timeout is armed.
    fn timeout_active(&mut self) -> bool;

    /// Disarm the countdown timer.
    fn cancel_timeout(&mut self);
}

impl<B> SdBus for &mut B
where
    B: SdBus + ?Sized,
{
    fn exchange(&mut self, out: u8) -> u8 {
        (**self).exchange(out)
    }

    fn select(&mut self) {
        (**self).select()
    }

    fn deselect(&mut self) {
        (**self).deselect()
    }

    fn set_high_speed(&mut self, enabled: bool) {
        (**self).set_high_speed(enabled)
    }

    fn start_timeout(&mut self, ms: u32) {
        (**self).start_timeout(ms)
    }

    fn timeout_active(&mut self) -> bool {
        (**self).timeout_active()
    }

    fn cancel_timeout(&mut self) {
        (**self).cancel_timeout()
    }
}

/// A monotonic millisecond clock.
///
/// Blanket-implemented for closures, so a HAL tick counter drops straight
/// in: `SpiTransport::new(spi, cs, || timer.now().ticks())`.
pub trait MonotonicMs {
    /// Milliseconds since some fixed point. Wrapping is fine; the transport
    /// only ever looks at differences.
    fn now_ms(&mut self) -> u32;
}

impl<F> MonotonicMs for F
where
    F: FnMut() -> u32,
{
    fn now_ms(&mut self) -> u32 {
        self()
    }
}

/// Adapts an `embedded-hal` SPI bus, chip-select pin and millisecond clock
/// to [`SdBus`].
///
/// `embedded-hal` has no portable way to re-clock a bus, so the speed
/// throttle is a no-op unless a platform hook is installed with
/// [`on_speed_change`](SpiTransport::on_speed_change).
///
/// Peripheral errors are swallowed per the [`SdBus`] contract: a failed
/// transfer reads as `0xFF`.
pub struct SpiTransport<SPI, CS, CLK> {
    spi: SPI,
    cs: CS,
    clock: CLK,
    window: Option<(u32, u32)>,
    speed_hook: Option<fn(&mut SPI, bool)>,
}

impl<SPI, CS, CLK> SpiTransport<SPI, CS, CLK>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: MonotonicMs,
{
    /// Build a transport from an SPI bus, a chip-select pin and a clock.
    pub fn new(spi: SPI, cs: CS, clock: CLK) -> SpiTransport<SPI, CS, CLK> {
        SpiTransport {
            spi,
            cs,
            clock,
            window: None,
            speed_hook: None,
        }
    }

    /// Install the platform hook that re-clocks the SPI peripheral when the
    /// driver throttles between identification and transfer speed.
    pub fn on_speed_change(mut self, hook: fn(&mut SPI, bool)) -> SpiTransport<SPI, CS, CLK> {
        self.speed_hook = Some(hook);
        self
    }

    /// Destroy the transport and hand the peripherals back.
    pub fn free(self) -> (SPI, CS, CLK) {
        (self.spi, self.cs, self.clock)
    }
}

impl<SPI, CS, CLK> SdBus for SpiTransport<SPI, CS, CLK>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: MonotonicMs,
{
    fn exchange(&mut self, out: u8) -> u8 {
        let mut word = [out];
        match self.spi.transfer_in_place(&mut word) {
            Ok(()) => word[0],
            Err(_) => 0xFF,
        }
    }

    fn select(&mut self) {
        let _ = self.cs.set_low();
    }

    fn deselect(&mut self) {
        let _ = self.cs.set_high();
    }

    fn set_high_speed(&mut self, enabled: bool) {
        if let Some(hook) = self.speed_hook {
            hook(&mut self.spi, enabled);
        }
    }

    fn start_timeout(&mut self, ms: u32) {
        let now = self.clock.now_ms();
        self.window = Some((now, ms));
    }

    fn timeout_active(&mut self) -> bool {
        match self.window {
            Some((start, dur)) => self.clock.now_ms().wrapping_sub(start) < dur,
            None => false,
        }
    }

    fn cancel_timeout(&mut self) {
        self.window = None;
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
