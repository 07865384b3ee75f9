//! `embedded-hal` 1.0 bus backend
//!
//! A [`BusDriver`] over a raw [`SpiBus`] plus the three control lines the
//! protocol needs: chip select (output), peer-ready handshake (input), and
//! the "notifications queued" side-channel (input). Chip select is driven
//! manually because the protocol requires waiting for the handshake line
//! *before* asserting select, which `SpiDevice` transactions cannot express.
//!
//! `embedded-hal` has no clock, so elapsed time is accounted by the delay
//! calls themselves: `now_ms` advances only while the driver sleeps. All
//! waits in this crate are sleep-polling loops, so deadlines measured this
//! way bound them correctly.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

use super::{BusDriver, BusFault};

pub struct Eh1Bus<S, CS, RDY, EVT, D> {
    spi: S,
    cs: CS,
    ready: RDY,
    event: EVT,
    delay: D,
    slept_ms: u64,
}

impl<S, CS, RDY, EVT, D> Eh1Bus<S, CS, RDY, EVT, D>
where
    S: SpiBus,
    CS: OutputPin,
    RDY: InputPin,
    EVT: InputPin,
    D: DelayNs,
{
    /// Both input lines are treated as active-high.
    pub fn new(spi: S, cs: CS, ready: RDY, event: EVT, delay: D) -> Self {
        let mut me = Self {
            spi,
            cs,
            ready,
            event,
            delay,
            slept_ms: 0,
        };
        me.deselect();
        me
    }
}

impl<S, CS, RDY, EVT, D> BusDriver for Eh1Bus<S, CS, RDY, EVT, D>
where
    S: SpiBus,
    CS: OutputPin,
    RDY: InputPin,
    EVT: InputPin,
    D: DelayNs,
{
    fn select(&mut self) {
        let _ = self.cs.set_low();
    }

    fn deselect(&mut self) {
        let _ = self.cs.set_high();
    }

    fn is_ready(&mut self) -> bool {
        self.ready.is_high().unwrap_or(false)
    }

    fn event_pending(&mut self) -> bool {
        self.event.is_high().unwrap_or(false)
    }

    fn transfer(&mut self, byte: u8) -> Result<u8, BusFault> {
        let mut rx = [0u8];
        self.spi
            .transfer(&mut rx, &[byte])
            .map_err(|_| BusFault)?;
        Ok(rx[0])
    }

    fn now_ms(&mut self) -> u64 {
        self.slept_ms
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
        self.slept_ms += u64::from(ms);
    }
}
