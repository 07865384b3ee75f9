//! Framed SPI transport
//!
//! [`SpiTransport`] implements the [`Transport`] exchange on top of any
//! [`BusDriver`]. An exchange is two framed transfers: the request is
//! clocked out while the peer is selected, the select line is released so
//! the peer can prepare its answer, then the reply frame is clocked in
//! under a second scoped selection.
//!
//! The select line is held by a guard type, so it is released on every
//! exit path, including early failures mid-frame.

use crate::fmt::trace;
use crate::Opcode;

use super::{
    BusDriver, LenClass, Reply, Transport, TransportError, END, ERR, FRAME_ALIGN, MAX_PARAMS, PAD,
    REPLY_FLAG, START,
};

/// Filler bytes tolerated in front of a reply's `START` marker while the
/// peer is still draining its transmit register.
const START_SLOP: usize = 32;

pub struct SpiTransport<B: BusDriver> {
    bus: B,
}

impl<B: BusDriver> SpiTransport<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Give back the contained bus driver.
    pub fn release(self) -> B {
        self.bus
    }

    /// Bounded wait for the peer's ready line.
    fn wait_ready(&mut self, deadline: u64) -> Result<(), TransportError> {
        loop {
            if self.bus.is_ready() {
                return Ok(());
            }
            if self.bus.now_ms() >= deadline {
                return Err(TransportError::Timeout);
            }
            self.bus.delay_ms(1);
        }
    }
}

impl<B: BusDriver> Transport for SpiTransport<B> {
    fn exchange<'a>(
        &mut self,
        op: Opcode,
        params: &[&[u8]],
        class: LenClass,
        timeout_ms: u32,
        scratch: &'a mut [u8],
    ) -> Result<Reply<'a>, TransportError> {
        let deadline = self.bus.now_ms() + u64::from(timeout_ms);

        self.wait_ready(deadline)?;
        {
            let mut sel = Selected::new(&mut self.bus);
            write_frame(sel.bus(), op, params, class)?;
        }

        self.wait_ready(deadline)?;
        let mut sel = Selected::new(&mut self.bus);
        let reply = read_reply(sel.bus(), op, class, scratch)?;
        trace!("exchange op={} -> {} params", op.0, reply.param_count());
        Ok(reply)
    }

    fn event_pending(&mut self) -> bool {
        self.bus.event_pending()
    }

    fn now_ms(&mut self) -> u64 {
        self.bus.now_ms()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.bus.delay_ms(ms)
    }
}

/// Scoped select: released on drop, so every exit path deselects.
struct Selected<'a, B: BusDriver> {
    bus: &'a mut B,
}

impl<'a, B: BusDriver> Selected<'a, B> {
    fn new(bus: &'a mut B) -> Self {
        bus.select();
        Self { bus }
    }

    fn bus(&mut self) -> &mut B {
        self.bus
    }
}

impl<B: BusDriver> Drop for Selected<'_, B> {
    fn drop(&mut self) {
        self.bus.deselect();
    }
}

fn put<B: BusDriver>(bus: &mut B, sent: &mut usize, byte: u8) -> Result<(), TransportError> {
    bus.transfer(byte)?;
    *sent += 1;
    Ok(())
}

fn get<B: BusDriver>(bus: &mut B) -> Result<u8, TransportError> {
    Ok(bus.transfer(PAD)?)
}

/// Write one complete request frame, padded to [`FRAME_ALIGN`].
pub(crate) fn write_frame<B: BusDriver>(
    bus: &mut B,
    op: Opcode,
    params: &[&[u8]],
    class: LenClass,
) -> Result<(), TransportError> {
    if params.len() > MAX_PARAMS {
        return Err(TransportError::TooLarge);
    }

    let mut sent = 0usize;
    put(bus, &mut sent, START)?;
    put(bus, &mut sent, op.0)?;
    put(bus, &mut sent, params.len() as u8)?;

    for p in params {
        match class {
            LenClass::Byte => {
                let len: u8 = p.len().try_into().map_err(|_| TransportError::TooLarge)?;
                put(bus, &mut sent, len)?;
            }
            LenClass::Word => {
                let len: u16 = p.len().try_into().map_err(|_| TransportError::TooLarge)?;
                let [hi, lo] = len.to_be_bytes();
                put(bus, &mut sent, hi)?;
                put(bus, &mut sent, lo)?;
            }
        }
        for &b in *p {
            put(bus, &mut sent, b)?;
        }
    }

    put(bus, &mut sent, END)?;
    while sent % FRAME_ALIGN != 0 {
        put(bus, &mut sent, PAD)?;
    }
    Ok(())
}

/// Read and decode one reply frame for `op` into `scratch`.
pub(crate) fn read_reply<'a, B: BusDriver>(
    bus: &mut B,
    op: Opcode,
    class: LenClass,
    scratch: &'a mut [u8],
) -> Result<Reply<'a>, TransportError> {
    // Scan past filler for the START marker. ERR anywhere aborts.
    let mut found = false;
    for _ in 0..START_SLOP {
        match get(bus)? {
            START => {
                found = true;
                break;
            }
            ERR => return Err(TransportError::ErrorFrame),
            PAD => continue,
            _ => return Err(TransportError::Framing),
        }
    }
    if !found {
        return Err(TransportError::Framing);
    }

    match get(bus)? {
        b if b == op.0 | REPLY_FLAG => {}
        ERR => return Err(TransportError::ErrorFrame),
        _ => return Err(TransportError::Framing),
    }

    let count = get(bus)?;
    if count == ERR {
        return Err(TransportError::ErrorFrame);
    }
    if usize::from(count) > MAX_PARAMS {
        return Err(TransportError::Framing);
    }

    let mut parts = heapless::Vec::new();
    let mut used = 0usize;
    for _ in 0..count {
        let len = match class {
            LenClass::Byte => usize::from(get(bus)?),
            LenClass::Word => {
                let hi = get(bus)?;
                let lo = get(bus)?;
                usize::from(u16::from_be_bytes([hi, lo]))
            }
        };
        if used + len > scratch.len() {
            return Err(TransportError::TooLarge);
        }
        for i in 0..len {
            scratch[used + i] = get(bus)?;
        }
        // Infallible: count <= MAX_PARAMS was checked above.
        let _ = parts.push((used as u16, len as u16));
        used += len;
    }

    match get(bus)? {
        END => {}
        ERR => return Err(TransportError::ErrorFrame),
        _ => return Err(TransportError::Framing),
    }

    Ok(Reply::from_raw(&scratch[..used], parts))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::BusFault;
    use std::collections::VecDeque;

    /// Captures written bytes and replays a scripted inbound stream.
    struct LoopBus {
        tx: Vec<u8>,
        rx: VecDeque<u8>,
        now: u64,
        ready: bool,
    }

    impl LoopBus {
        fn new(rx: &[u8]) -> Self {
            Self {
                tx: Vec::new(),
                rx: rx.iter().copied().collect(),
                now: 0,
                ready: true,
            }
        }
    }

    impl BusDriver for LoopBus {
        fn select(&mut self) {}
        fn deselect(&mut self) {}
        fn is_ready(&mut self) -> bool {
            self.ready
        }
        fn event_pending(&mut self) -> bool {
            false
        }
        fn transfer(&mut self, byte: u8) -> Result<u8, BusFault> {
            self.tx.push(byte);
            Ok(self.rx.pop_front().unwrap_or(PAD))
        }
        fn now_ms(&mut self) -> u64 {
            self.now += 1;
            self.now
        }
        fn delay_ms(&mut self, ms: u32) {
            self.now += u64::from(ms);
        }
    }

    #[test]
    fn request_frame_shape() {
        let mut bus = LoopBus::new(&[]);
        write_frame(&mut bus, Opcode(0x2D), &[&[1, 2, 3], &[7]], LenClass::Byte).unwrap();
        assert_eq!(
            bus.tx,
            // START, op, count, len=3, bytes, len=1, byte, END, pad to 12
            vec![START, 0x2D, 2, 3, 1, 2, 3, 1, 7, END, PAD, PAD],
        );
        assert_eq!(bus.tx.len() % FRAME_ALIGN, 0);
    }

    #[test]
    fn roundtrip_byte_class() {
        // Encode a reply frame, then decode it: the opcode and parameter
        // list must come back bit-for-bit.
        let mut enc = LoopBus::new(&[]);
        let params: [&[u8]; 3] = [&[0xAA], &[1, 2, 3, 4], &[]];
        write_frame(
            &mut enc,
            Opcode(0x2B | REPLY_FLAG),
            &params,
            LenClass::Byte,
        )
        .unwrap();

        let mut dec = LoopBus::new(&enc.tx);
        let mut scratch = [0u8; 64];
        let reply = read_reply(&mut dec, Opcode(0x2B), LenClass::Byte, &mut scratch).unwrap();
        assert_eq!(reply.param_count(), 3);
        assert_eq!(reply.param(0).unwrap(), &[0xAA]);
        assert_eq!(reply.param(1).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(reply.param(2).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn roundtrip_word_class() {
        let big: Vec<u8> = (0..300u16).map(|v| v as u8).collect();
        let mut enc = LoopBus::new(&[]);
        write_frame(
            &mut enc,
            Opcode(0x44 | REPLY_FLAG),
            &[&big],
            LenClass::Word,
        )
        .unwrap();

        let mut dec = LoopBus::new(&enc.tx);
        let mut scratch = [0u8; 512];
        let reply = read_reply(&mut dec, Opcode(0x44), LenClass::Word, &mut scratch).unwrap();
        assert_eq!(reply.param_count(), 1);
        assert_eq!(reply.param(0).unwrap(), &big[..]);
    }

    #[test]
    fn err_marker_aborts() {
        let mut dec = LoopBus::new(&[ERR]);
        let mut scratch = [0u8; 8];
        assert_eq!(
            read_reply(&mut dec, Opcode(0x2B), LenClass::Byte, &mut scratch).unwrap_err(),
            TransportError::ErrorFrame,
        );
    }

    #[test]
    fn wrong_opcode_is_framing_error() {
        let mut enc = LoopBus::new(&[]);
        write_frame(&mut enc, Opcode(0x11 | REPLY_FLAG), &[], LenClass::Byte).unwrap();
        let mut dec = LoopBus::new(&enc.tx);
        let mut scratch = [0u8; 8];
        assert_eq!(
            read_reply(&mut dec, Opcode(0x22), LenClass::Byte, &mut scratch).unwrap_err(),
            TransportError::Framing,
        );
    }

    #[test]
    fn oversize_byte_param_rejected() {
        let big = [0u8; 300];
        let mut bus = LoopBus::new(&[]);
        assert_eq!(
            write_frame(&mut bus, Opcode(0x10), &[&big], LenClass::Byte).unwrap_err(),
            TransportError::TooLarge,
        );
    }

    #[test]
    fn ready_timeout() {
        let mut t = SpiTransport::new(LoopBus::new(&[]));
        t.bus.ready = false;
        let mut scratch = [0u8; 8];
        assert_eq!(
            t.exchange(Opcode(0x20), &[], LenClass::Byte, 5, &mut scratch)
                .unwrap_err(),
            TransportError::Timeout,
        );
    }
}
