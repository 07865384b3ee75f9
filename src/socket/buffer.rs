//! Per-slot receive buffer
//!
//! A linear, fixed-capacity byte region with bounds-checked push/pop.
//! `tail` chases `head`; once the buffer is fully drained both reset to
//! zero so the whole capacity is writable again. The `full` flag is the
//! backpressure latch: the registry sets it when remaining free space
//! drops below one transfer unit and clears it once a read drains back
//! under that threshold.
//!
//! Datagram sockets queue several independent datagrams in one region by
//! prefixing each payload with a mini-header (payload length, peer port,
//! peer address).

use core::net::Ipv4Addr;

/// Length (2) + port (2) + address (4) prefix on each buffered datagram.
pub const DGRAM_HDR: usize = 8;

/// Returned when a push would exceed the buffer's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufferFull;

pub struct RxBuffer<const N: usize> {
    data: [u8; N],
    /// Write index; bytes below it are occupied.
    head: usize,
    /// Read index; `tail <= head` always.
    tail: usize,
    full: bool,
}

impl<const N: usize> RxBuffer<N> {
    pub const fn new() -> Self {
        Self {
            data: [0; N],
            head: 0,
            tail: 0,
            full: false,
        }
    }

    /// Unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.head - self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Writable bytes remaining at the end of the region.
    #[inline]
    pub fn free(&self) -> usize {
        N - self.head
    }

    /// The backpressure latch.
    #[inline]
    pub fn full(&self) -> bool {
        self.full
    }

    pub fn set_full(&mut self, full: bool) {
        self.full = full;
    }

    /// Drop all contents and release the latch.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.full = false;
    }

    /// Append raw bytes (stream sockets).
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if bytes.len() > self.free() {
            return Err(BufferFull);
        }
        self.data[self.head..self.head + bytes.len()].copy_from_slice(bytes);
        self.head += bytes.len();
        Ok(())
    }

    /// Drain up to `out.len()` bytes (stream sockets).
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.len().min(out.len());
        out[..n].copy_from_slice(&self.data[self.tail..self.tail + n]);
        self.tail += n;
        self.reset_if_drained();
        n
    }

    /// Append one datagram with its mini-header.
    pub fn push_datagram(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
        payload: &[u8],
    ) -> Result<(), BufferFull> {
        if payload.len() > usize::from(u16::MAX) || DGRAM_HDR + payload.len() > self.free() {
            return Err(BufferFull);
        }
        let len = (payload.len() as u16).to_be_bytes();
        self.push(&len)?;
        self.push(&port.to_be_bytes())?;
        self.push(&addr.octets())?;
        self.push(payload)
    }

    /// Payload length of the next queued datagram, if any.
    pub fn peek_datagram_len(&self) -> Option<usize> {
        if self.len() < DGRAM_HDR {
            return None;
        }
        let len = u16::from_be_bytes([self.data[self.tail], self.data[self.tail + 1]]);
        Some(usize::from(len))
    }

    /// Remove the next queued datagram, copying its payload into `out`.
    ///
    /// Returns the copied length and the peer's address and port. A
    /// payload longer than `out` is truncated; the excess is discarded so
    /// the following datagram stays aligned.
    pub fn pop_datagram(&mut self, out: &mut [u8]) -> Option<(usize, Ipv4Addr, u16)> {
        let len = self.peek_datagram_len()?;
        let port = u16::from_be_bytes([self.data[self.tail + 2], self.data[self.tail + 3]]);
        let addr = Ipv4Addr::new(
            self.data[self.tail + 4],
            self.data[self.tail + 5],
            self.data[self.tail + 6],
            self.data[self.tail + 7],
        );
        self.tail += DGRAM_HDR;
        let n = len.min(out.len());
        out[..n].copy_from_slice(&self.data[self.tail..self.tail + n]);
        self.tail += len;
        self.reset_if_drained();
        Some((n, addr, port))
    }

    fn reset_if_drained(&mut self) {
        if self.tail == self.head {
            self.tail = 0;
            self.head = 0;
        }
    }

    /// `tail <= head <= N`. Checked by tests after every mutation.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert!(self.tail <= self.head);
        assert!(self.head <= N);
    }
}

impl<const N: usize> Default for RxBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
