//! The Bus Transport
//!
//! The co-processor is reachable only through a shared, synchronous,
//! byte-oriented serial bus. This module owns the command/response framing
//! on that bus: exactly one exchange is in flight at any instant, and each
//! exchange either completes within a bounded wait for the peer's ready
//! signal or fails without leaving partial state behind.
//!
//! Two seams are defined here:
//!
//! - [`BusDriver`] is the physical collaborator: byte-level duplex transfer,
//!   chip-select and ready-signal I/O, and timing primitives. It is
//!   implemented outside of this crate (or by the `eh1` feature's
//!   `embedded-hal` backend).
//! - [`Transport`] is the capability interface the command codec, socket
//!   registry and façade are written against. [`spi::SpiTransport`] is the
//!   real backend; alternate backends (including test doubles) only need to
//!   produce [`Reply`] values via [`Reply::pack`].
//!
//! ## Wire framing
//!
//! ```text
//! START(0xE0) | opcode | param_count | { len(1 or 2) | bytes }* | END(0xEE)
//! ```
//!
//! Reply frames set bit 7 of the opcode. The whole frame is padded with
//! `0xFF` to a 4-byte boundary. A dedicated `ERR(0xEF)` byte in place of an
//! expected marker aborts the read immediately. Multi-byte integers are
//! big-endian unless a command is documented otherwise.

use crate::Opcode;

pub mod spi;

#[cfg(feature = "eh1")]
pub mod eh1;

/// Start-of-frame marker.
pub const START: u8 = 0xE0;
/// End-of-frame marker.
pub const END: u8 = 0xEE;
/// Error marker; aborts an in-progress read wherever it appears.
pub const ERR: u8 = 0xEF;
/// Set on the opcode byte of reply frames.
pub const REPLY_FLAG: u8 = 0x80;
/// Filler clocked out while reading, and used to pad frames.
pub const PAD: u8 = 0xFF;
/// Frames are padded to a multiple of this many bytes.
pub const FRAME_ALIGN: usize = 4;

/// The largest number of parameters a single frame may carry.
///
/// Sized for the fetch-events reply, which batches one notification per
/// parameter.
pub const MAX_PARAMS: usize = 8;

/// Length-prefix class of a frame's parameters.
///
/// Control commands use single-byte length prefixes; data-bearing commands
/// use two-byte (big-endian) prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LenClass {
    Byte,
    Word,
}

/// An opaque physical-layer failure reported by a [`BusDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusFault;

/// An error from a transport exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The peer did not raise its ready signal within the bounded wait.
    Timeout,
    /// An expected marker byte did not match.
    Framing,
    /// The peer sent the `ERR` marker in place of an expected byte.
    ErrorFrame,
    /// The physical bus driver reported a failure.
    Bus,
    /// A parameter exceeded its length class, or a reply exceeded the
    /// caller's scratch space.
    TooLarge,
}

impl From<BusFault> for TransportError {
    fn from(_: BusFault) -> Self {
        TransportError::Bus
    }
}

/// The physical bus: byte-level duplex transfer, select/ready I/O, timing.
///
/// Everything here is a thin wrapper over hardware; no framing knowledge
/// belongs in implementations of this trait.
pub trait BusDriver {
    /// Assert the peer's select line.
    fn select(&mut self);

    /// Release the peer's select line.
    fn deselect(&mut self);

    /// Whether the peer's handshake line indicates it can take an exchange.
    fn is_ready(&mut self) -> bool;

    /// Whether the peer's side-channel line indicates queued notifications.
    fn event_pending(&mut self) -> bool;

    /// Full-duplex transfer of a single byte.
    fn transfer(&mut self, byte: u8) -> Result<u8, BusFault>;

    /// Milliseconds of elapsed time from an arbitrary epoch.
    fn now_ms(&mut self) -> u64;

    /// Block for at least `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
}

/// One decoded reply frame.
///
/// Parameter bytes live in the caller-provided scratch buffer; the reply
/// only records where each parameter starts and ends.
#[derive(Debug)]
pub struct Reply<'a> {
    buf: &'a [u8],
    parts: heapless::Vec<(u16, u16), MAX_PARAMS>,
}

impl<'a> Reply<'a> {
    /// Build a reply by copying `params` into `scratch`.
    ///
    /// This is how alternate [`Transport`] backends (and test doubles)
    /// produce replies without speaking the byte framing.
    pub fn pack(scratch: &'a mut [u8], params: &[&[u8]]) -> Result<Reply<'a>, TransportError> {
        let mut parts = heapless::Vec::new();
        let mut used = 0usize;
        for p in params {
            if used + p.len() > scratch.len() {
                return Err(TransportError::TooLarge);
            }
            scratch[used..used + p.len()].copy_from_slice(p);
            parts
                .push((used as u16, p.len() as u16))
                .map_err(|_| TransportError::TooLarge)?;
            used += p.len();
        }
        Ok(Reply {
            buf: &scratch[..used],
            parts,
        })
    }

    pub(crate) fn from_raw(buf: &'a [u8], parts: heapless::Vec<(u16, u16), MAX_PARAMS>) -> Self {
        Reply { buf, parts }
    }

    pub fn param_count(&self) -> usize {
        self.parts.len()
    }

    /// Borrow parameter `idx`, if present.
    pub fn param(&self, idx: usize) -> Option<&'a [u8]> {
        let &(ofs, len) = self.parts.get(idx)?;
        Some(&self.buf[usize::from(ofs)..usize::from(ofs) + usize::from(len)])
    }

    /// Parameter `idx` as a single byte.
    pub fn u8(&self, idx: usize) -> Option<u8> {
        match self.param(idx)? {
            [b] => Some(*b),
            _ => None,
        }
    }

    /// Parameter `idx` as a big-endian `u16`.
    pub fn u16(&self, idx: usize) -> Option<u16> {
        match self.param(idx)? {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Parameter `idx` as an IPv4 address.
    pub fn ipv4(&self, idx: usize) -> Option<core::net::Ipv4Addr> {
        let p = self.param(idx)?;
        let octets: [u8; 4] = p.try_into().ok()?;
        Some(core::net::Ipv4Addr::from(octets))
    }
}

/// The exchange-level capability interface.
///
/// One call, one exclusive command/response exchange. Implementations must
/// guarantee that a failed exchange leaves no partial state behind and that
/// any select line is released on every exit path.
pub trait Transport {
    /// Perform one command exchange.
    ///
    /// Reply parameter bytes are written into `scratch`; the returned
    /// [`Reply`] borrows them from there.
    fn exchange<'a>(
        &mut self,
        op: Opcode,
        params: &[&[u8]],
        class: LenClass,
        timeout_ms: u32,
        scratch: &'a mut [u8],
    ) -> Result<Reply<'a>, TransportError>;

    /// Non-blocking poll of the peer's "notifications queued" side-channel.
    fn event_pending(&mut self) -> bool;

    /// Milliseconds of elapsed time from an arbitrary epoch.
    fn now_ms(&mut self) -> u64;

    /// Block for at least `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
}
