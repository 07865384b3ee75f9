//! The Socket Registry
//!
//! A fixed-size table of socket slots. Each slot carries a state machine,
//! an owned receive buffer, and bookkeeping for its peer address. The
//! registry is pure bookkeeping: folding a co-processor notification into
//! slot state never touches the transport. Where a notification obliges
//! the caller to issue a command (re-arming the low-level receive request,
//! stopping a surplus child connection), the registry returns an
//! [`Action`] and the façade executes it. That keeps every transition
//! unit-testable without a bus.
//!
//! ## States
//!
//! ```text
//! Invalid ──alloc──▶ Idle ──start client──▶ Connecting ──ConnectOk──▶ Connected
//!                      │                                                  │
//!                      └──start server──▶ Binding ──BindOk──▶ Bound       │ PeerClosed / close
//!                                                               │         ▼
//!                                                    listen ok  ▼      Invalid
//!                                            Listening ──ChildAccepted──▶ (child: Accepted)
//! ```
//!
//! Accepted children are promoted to `Connected` when the application
//! retrieves them via `accept`.
//!
//! ## Backpressure
//!
//! On arrival of data the registry appends into the slot's buffer. If the
//! free space left afterwards is smaller than one [`TRANSFER_UNIT`] (plus
//! the datagram mini-header for datagram sockets), the slot's `full` flag
//! is set and no re-arm action is returned, so the co-processor stops
//! delivering for that slot. Once a read drains below the threshold the
//! flag is cleared and exactly one re-arm is returned.

use core::net::Ipv4Addr;

use crate::cmd::Event;
use crate::fmt::{debug, warn};
use crate::{SocketId, SocketKind};

pub mod buffer;

use buffer::{RxBuffer, DGRAM_HDR};

/// The largest payload the co-processor delivers in one notification, and
/// the granularity of the backpressure threshold.
pub const TRANSFER_UNIT: usize = 64;

/// One socket slot's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Slot unused.
    Invalid,
    /// Allocated, not yet configured.
    Idle,
    /// Client connect issued, answer outstanding.
    Connecting,
    /// Stream established (or datagram socket ready).
    Connected,
    /// Bind issued, acknowledgement outstanding.
    Binding,
    /// Bound to a local port.
    Bound,
    /// Accepting peers.
    Listening,
    /// Server-side child, not yet retrieved by the application.
    Accepted,
}

/// A command the façade must issue as a consequence of applying a
/// notification or draining a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Re-issue the low-level receive request for this slot.
    Arm(SocketId),
    /// Stop a surplus child connection on the wire.
    DiscardChild(SocketId),
}

struct Slot<const RXBUF: usize> {
    kind: SocketKind,
    state: State,
    peer_addr: Ipv4Addr,
    peer_port: u16,
    parent: Option<SocketId>,
    /// Listener side: the one child connection awaiting `accept`.
    pending_child: Option<SocketId>,
    buf: RxBuffer<RXBUF>,
}

impl<const RXBUF: usize> Slot<RXBUF> {
    fn new() -> Self {
        Self {
            kind: SocketKind::Stream,
            state: State::Invalid,
            peer_addr: Ipv4Addr::UNSPECIFIED,
            peer_port: 0,
            parent: None,
            pending_child: None,
            buf: RxBuffer::new(),
        }
    }

    fn reset(&mut self) {
        self.kind = SocketKind::Stream;
        self.state = State::Invalid;
        self.peer_addr = Ipv4Addr::UNSPECIFIED;
        self.peer_port = 0;
        self.parent = None;
        self.pending_child = None;
        self.buf.clear();
    }

    /// Minimum free space needed to take one more delivery.
    fn threshold(&self) -> usize {
        match self.kind {
            SocketKind::Stream => TRANSFER_UNIT,
            SocketKind::Datagram => TRANSFER_UNIT + DGRAM_HDR,
        }
    }
}

pub struct Registry<const SOCKETS: usize, const RXBUF: usize> {
    slots: [Slot<RXBUF>; SOCKETS],
}

impl<const SOCKETS: usize, const RXBUF: usize> Registry<SOCKETS, RXBUF> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::new()),
        }
    }

    fn slot(&self, id: SocketId) -> Option<&Slot<RXBUF>> {
        self.slots.get(id.index())
    }

    fn slot_mut(&mut self, id: SocketId) -> Option<&mut Slot<RXBUF>> {
        self.slots.get_mut(id.index())
    }

    /// Claim a free slot. Fails immediately when the pool is exhausted.
    pub fn alloc(&mut self, kind: SocketKind) -> Option<SocketId> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.state == State::Invalid)?;
        let slot = &mut self.slots[idx];
        slot.reset();
        slot.kind = kind;
        slot.state = State::Idle;
        Some(SocketId(idx as u8))
    }

    /// Return a slot to the pool, dropping its buffer contents. Total and
    /// idempotent; out-of-range ids are ignored.
    pub fn release(&mut self, id: SocketId) {
        // A listener's pending child dies with it.
        let pending = self.slot(id).and_then(|s| s.pending_child);
        if let Some(child) = pending {
            self.release(child);
        }
        let parent = self.slot(id).and_then(|s| s.parent);
        if let Some(slot) = self.slot_mut(id) {
            slot.reset();
        }
        // A child released before retrieval must not stay recorded on its
        // listener, or accept would hand out the freed slot.
        if let Some(parent) = parent {
            if let Some(slot) = self.slot_mut(parent) {
                if slot.pending_child == Some(id) {
                    slot.pending_child = None;
                }
            }
        }
    }

    pub fn state(&self, id: SocketId) -> State {
        self.slot(id).map(|s| s.state).unwrap_or(State::Invalid)
    }

    pub fn kind(&self, id: SocketId) -> Option<SocketKind> {
        let slot = self.slot(id)?;
        (slot.state != State::Invalid).then_some(slot.kind)
    }

    pub fn peer(&self, id: SocketId) -> Option<(Ipv4Addr, u16)> {
        let slot = self.slot(id)?;
        match slot.state {
            State::Connected | State::Accepted => Some((slot.peer_addr, slot.peer_port)),
            _ => None,
        }
    }

    /// For server-accepted sockets, the listening slot that spawned them.
    pub fn parent(&self, id: SocketId) -> Option<SocketId> {
        self.slot(id)?.parent
    }

    /// `Idle -> Connecting`, recording the intended peer.
    pub fn begin_connect(&mut self, id: SocketId, addr: Ipv4Addr, port: u16) {
        if let Some(slot) = self.slot_mut(id) {
            debug_assert_eq!(slot.state, State::Idle);
            slot.state = State::Connecting;
            slot.peer_addr = addr;
            slot.peer_port = port;
        }
    }

    /// `Idle -> Binding`.
    pub fn begin_bind(&mut self, id: SocketId) {
        if let Some(slot) = self.slot_mut(id) {
            debug_assert_eq!(slot.state, State::Idle);
            slot.state = State::Binding;
        }
    }

    /// `Bound -> Listening`, once the wire state query confirms it.
    pub fn mark_listening(&mut self, id: SocketId) {
        if let Some(slot) = self.slot_mut(id) {
            debug_assert_eq!(slot.state, State::Bound);
            slot.state = State::Listening;
        }
    }

    /// Reset a slot whose expected transition never arrived back to `Idle`.
    pub fn abort_transition(&mut self, id: SocketId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.state = State::Idle;
            slot.peer_addr = Ipv4Addr::UNSPECIFIED;
            slot.peer_port = 0;
        }
    }

    /// Take the listener's pending child, promoting it to `Connected`.
    ///
    /// Returns the child and the re-arm obligation for it. A child torn
    /// down before retrieval reads as none available.
    pub fn take_pending_child(&mut self, listener: SocketId) -> Option<(SocketId, Action)> {
        let child = self.slot_mut(listener)?.pending_child.take()?;
        let slot = self.slot_mut(child)?;
        if slot.state != State::Accepted {
            return None;
        }
        slot.state = State::Connected;
        Some((child, Action::Arm(child)))
    }

    /// Unread byte count (next datagram's payload length for datagram
    /// sockets); zero for slots without a buffer.
    pub fn available(&self, id: SocketId) -> usize {
        let Some(slot) = self.slot(id) else { return 0 };
        match slot.kind {
            SocketKind::Stream => slot.buf.len(),
            SocketKind::Datagram => slot.buf.peek_datagram_len().unwrap_or(0),
        }
    }

    /// Drain stream bytes into `out`, together with any re-arm obligation.
    pub fn read(&mut self, id: SocketId, out: &mut [u8]) -> (usize, Option<Action>) {
        let Some(slot) = self.slot_mut(id) else {
            return (0, None);
        };
        let n = slot.buf.pop(out);
        (n, Self::after_drain(slot, id))
    }

    /// Remove the next queued datagram, together with any re-arm obligation.
    pub fn read_datagram(
        &mut self,
        id: SocketId,
        out: &mut [u8],
    ) -> (Option<(usize, Ipv4Addr, u16)>, Option<Action>) {
        let Some(slot) = self.slot_mut(id) else {
            return (None, None);
        };
        let res = slot.buf.pop_datagram(out);
        (res, Self::after_drain(slot, id))
    }

    /// Clear the backpressure latch once a drain has made room again.
    /// Returns the single re-arm this resumption is entitled to.
    fn after_drain(slot: &mut Slot<RXBUF>, id: SocketId) -> Option<Action> {
        if slot.buf.full() && slot.buf.free() >= slot.threshold() {
            slot.buf.set_full(false);
            debug!("socket {}: backpressure released", id.0);
            return Some(Action::Arm(id));
        }
        None
    }

    /// Fold one co-processor notification into slot state.
    ///
    /// Notifications for slots in a state that cannot take them are
    /// discarded with a warning; the co-processor's view can lag a close.
    pub fn apply(&mut self, ev: &Event<'_>) -> Option<Action> {
        match *ev {
            Event::ConnectOk { sock } => {
                let slot = self.slot_mut(sock)?;
                if slot.state != State::Connecting {
                    warn!("socket {}: stray connect notification", sock.0);
                    return None;
                }
                slot.state = State::Connected;
                debug!("socket {}: connected", sock.0);
                Some(Action::Arm(sock))
            }
            Event::BindOk { sock } => {
                let slot = self.slot_mut(sock)?;
                if slot.state != State::Binding {
                    warn!("socket {}: stray bind notification", sock.0);
                    return None;
                }
                slot.state = State::Bound;
                debug!("socket {}: bound", sock.0);
                // Listeners hold no buffer; only datagram sockets take
                // deliveries straight from the bound state.
                (slot.kind == SocketKind::Datagram).then_some(Action::Arm(sock))
            }
            Event::ChildAccepted {
                listener,
                child,
                addr,
                port,
            } => self.apply_child_accepted(listener, child, addr, port),
            Event::StreamData { sock, payload } => {
                let slot = self.slot_mut(sock)?;
                if !matches!(slot.state, State::Connected | State::Accepted) {
                    warn!("socket {}: dropping {} stray bytes", sock.0, payload.len());
                    return None;
                }
                if slot.buf.push(payload).is_err() {
                    // Cannot happen while the peer honors the arm protocol.
                    warn!("socket {}: receive overflow, payload dropped", sock.0);
                    return None;
                }
                Self::after_append(slot, sock)
            }
            Event::DatagramData {
                sock,
                addr,
                port,
                payload,
            } => {
                let slot = self.slot_mut(sock)?;
                if !matches!(slot.state, State::Bound | State::Connected) {
                    warn!("socket {}: dropping stray datagram", sock.0);
                    return None;
                }
                if slot.buf.push_datagram(addr, port, payload).is_err() {
                    warn!("socket {}: receive overflow, datagram dropped", sock.0);
                    return None;
                }
                Self::after_append(slot, sock)
            }
            Event::PeerClosed { sock } => {
                let slot = self.slot_mut(sock)?;
                if slot.state != State::Connected && slot.state != State::Accepted {
                    return None;
                }
                debug!("socket {}: peer closed", sock.0);
                self.release(sock);
                None
            }
        }
    }

    fn apply_child_accepted(
        &mut self,
        listener: SocketId,
        child: SocketId,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<Action> {
        if self.state(listener) != State::Listening {
            warn!("socket {}: accept notification without listener", child.0);
            return Some(Action::DiscardChild(child));
        }
        if self.slot(listener)?.pending_child.is_some() {
            // One-pending-child policy: a second unretrieved connection is
            // discarded rather than queued.
            warn!("listener {}: discarding surplus child {}", listener.0, child.0);
            return Some(Action::DiscardChild(child));
        }
        let Some(slot) = self.slot_mut(child) else {
            warn!("accept notification names bad slot {}", child.0);
            return Some(Action::DiscardChild(child));
        };
        if slot.state != State::Invalid {
            warn!("socket {}: accept collides with live slot", child.0);
            return Some(Action::DiscardChild(child));
        }
        slot.reset();
        slot.kind = SocketKind::Stream;
        slot.state = State::Accepted;
        slot.peer_addr = addr;
        slot.peer_port = port;
        slot.parent = Some(listener);
        self.slot_mut(listener)?.pending_child = Some(child);
        debug!("listener {}: child {} accepted", listener.0, child.0);
        None
    }

    /// Engage the backpressure latch if this append left less than one
    /// delivery of free space; otherwise hand back the re-arm.
    fn after_append(slot: &mut Slot<RXBUF>, id: SocketId) -> Option<Action> {
        if slot.buf.free() < slot.threshold() {
            slot.buf.set_full(true);
            debug!("socket {}: backpressure engaged", id.0);
            None
        } else {
            Some(Action::Arm(id))
        }
    }
}

impl<const SOCKETS: usize, const RXBUF: usize> Default for Registry<SOCKETS, RXBUF> {
    fn default() -> Self {
        Self::new()
    }
}
