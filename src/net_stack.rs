//! The Socket Façade
//!
//! [`NetStack`] is the public connect/listen/accept/send/receive/close
//! surface, expressed in terms of the [registry] and the [command codec].
//! It owns the one [`Transport`] and the one slot table, so all socket
//! state mutation happens on the application's single thread of control.
//!
//! ## Event reconciliation
//!
//! Every public operation first drains pending co-processor notifications
//! and folds them into registry state ([`NetStack::reconcile`]). This is
//! the system's entire concurrency model: there are no threads and no
//! interrupts, only synchronous polling interleaved with application
//! calls. "Suspension" happens exclusively inside bounded wait loops tied
//! to the codec's timeouts, so a stalled peer can delay a caller only up
//! to the documented timeout, never forever.
//!
//! [registry]: crate::socket::Registry
//! [command codec]: crate::cmd

use core::net::Ipv4Addr;

use crate::cmd::{self, CmdError, ServerMode};
use crate::fmt::{debug, warn};
use crate::socket::{Action, Registry, State, TRANSFER_UNIT};
use crate::transport::{Transport, MAX_PARAMS};
use crate::{SocketId, SocketKind};

/// Poll interval of the bounded wait loops.
const POLL_DELAY_MS: u32 = 1;
/// Pause before the single write retry.
const WRITE_RETRY_DELAY_MS: u32 = 10;

/// An error from a [`NetStack`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetError {
    /// No free slot in the socket pool.
    Exhausted,
    /// The operation is not permitted in the slot's current state.
    WrongState,
    /// The expected state transition did not arrive within the timeout.
    Timeout,
    /// The send and its one retry both failed.
    SendFailed,
    /// A codec-level failure.
    Cmd(CmdError),
}

impl From<CmdError> for NetError {
    fn from(value: CmdError) -> Self {
        NetError::Cmd(value)
    }
}

pub struct NetStack<T: Transport, const SOCKETS: usize = 8, const RXBUF: usize = 1024> {
    transport: T,
    reg: Registry<SOCKETS, RXBUF>,
    local_addr: Option<Ipv4Addr>,
}

impl<T: Transport, const SOCKETS: usize, const RXBUF: usize> NetStack<T, SOCKETS, RXBUF> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            reg: Registry::new(),
            local_addr: None,
        }
    }

    /// Give back the contained transport.
    pub fn release(self) -> T {
        self.transport
    }

    /// Access the contained transport directly.
    ///
    /// An escape hatch for backend-specific control (link management,
    /// test instrumentation). The registry is bypassed entirely; do not
    /// issue socket commands through this.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drain pending co-processor notifications into registry state.
    ///
    /// Called implicitly at the head of every public operation; callers
    /// only need it directly when idling for long stretches without
    /// touching any socket.
    pub fn reconcile(&mut self) -> Result<(), NetError> {
        while self.transport.event_pending() {
            let mut scratch = [0u8; cmd::EVENT_SCRATCH];
            let mut events: heapless::Vec<cmd::Event<'_>, MAX_PARAMS> = heapless::Vec::new();
            cmd::fetch_events(&mut self.transport, &mut scratch, &mut events)?;
            if events.is_empty() {
                // Pending line set but nothing queued; don't spin on it.
                break;
            }
            for ev in &events {
                if let Some(act) = self.reg.apply(ev) {
                    self.run_action(act)?;
                }
            }
        }
        Ok(())
    }

    fn run_action(&mut self, act: Action) -> Result<(), NetError> {
        match act {
            Action::Arm(id) => {
                cmd::recv_arm(&mut self.transport, id, TRANSFER_UNIT as u16)?;
            }
            Action::DiscardChild(id) => {
                // Best effort: the slot was never ours.
                if let Err(e) = cmd::stop(&mut self.transport, id) {
                    warn!("failed to discard child {}: {:?}", id.0, e);
                }
            }
        }
        Ok(())
    }

    /// Wait until reconciliation observes `want` on `id`, bounded by
    /// `timeout_ms`.
    fn wait_for_state(
        &mut self,
        id: SocketId,
        want: State,
        timeout_ms: u32,
    ) -> Result<(), NetError> {
        let deadline = self.transport.now_ms() + u64::from(timeout_ms);
        loop {
            self.reconcile()?;
            let state = self.reg.state(id);
            if state == want {
                return Ok(());
            }
            if state == State::Invalid {
                // Torn down underneath us (e.g. peer refused and closed).
                return Err(NetError::Timeout);
            }
            if self.transport.now_ms() >= deadline {
                return Err(NetError::Timeout);
            }
            self.transport.delay_ms(POLL_DELAY_MS);
        }
    }

    /// Open a stream connection to `addr:port`.
    ///
    /// Returns once the connection is established; on timeout or refusal
    /// the slot goes back to the pool and the error is surfaced.
    pub fn connect(&mut self, addr: Ipv4Addr, port: u16) -> Result<SocketId, NetError> {
        self.reconcile()?;
        let id = self
            .reg
            .alloc(SocketKind::Stream)
            .ok_or(NetError::Exhausted)?;
        if let Err(e) = cmd::start_client(&mut self.transport, id, addr, port) {
            self.reg.release(id);
            return Err(e.into());
        }
        self.reg.begin_connect(id, addr, port);
        match self.wait_for_state(id, State::Connected, cmd::LONG_TIMEOUT_MS) {
            Ok(()) => {
                debug!("socket {}: connected to port {}", id.0, port);
                Ok(id)
            }
            Err(e) => {
                let _ = cmd::stop(&mut self.transport, id);
                self.reg.release(id);
                Err(e)
            }
        }
    }

    fn bind_inner(
        &mut self,
        kind: SocketKind,
        group: Option<Ipv4Addr>,
        port: u16,
    ) -> Result<SocketId, NetError> {
        self.reconcile()?;
        let id = self.reg.alloc(kind).ok_or(NetError::Exhausted)?;
        let res = match (kind, group) {
            (SocketKind::Datagram, Some(group)) => {
                cmd::start_multicast(&mut self.transport, id, group, port)
            }
            (SocketKind::Datagram, None) => {
                cmd::start_server(&mut self.transport, id, port, ServerMode::Udp)
            }
            (SocketKind::Stream, _) => {
                cmd::start_server(&mut self.transport, id, port, ServerMode::Tcp)
            }
        };
        if let Err(e) = res {
            self.reg.release(id);
            return Err(e.into());
        }
        self.reg.begin_bind(id);
        match self.wait_for_state(id, State::Bound, cmd::SHORT_TIMEOUT_MS) {
            Ok(()) => Ok(id),
            Err(e) => {
                let _ = cmd::stop(&mut self.transport, id);
                self.reg.release(id);
                Err(e)
            }
        }
    }

    /// Bind a stream socket to a local port, ready for [`NetStack::listen`].
    pub fn bind(&mut self, port: u16) -> Result<SocketId, NetError> {
        self.bind_inner(SocketKind::Stream, None, port)
    }

    /// Bind a datagram socket to a local port.
    pub fn bind_udp(&mut self, port: u16) -> Result<SocketId, NetError> {
        self.bind_inner(SocketKind::Datagram, None, port)
    }

    /// Bind a datagram socket to a multicast group.
    pub fn bind_multicast(&mut self, group: Ipv4Addr, port: u16) -> Result<SocketId, NetError> {
        self.bind_inner(SocketKind::Datagram, Some(group), port)
    }

    /// Move a bound stream socket to listening, confirmed against the
    /// co-processor's own state.
    ///
    /// Listening sockets never hold a receive buffer themselves; accepted
    /// children do.
    pub fn listen(&mut self, id: SocketId) -> Result<(), NetError> {
        self.reconcile()?;
        if self.reg.state(id) != State::Bound || self.reg.kind(id) != Some(SocketKind::Stream) {
            return Err(NetError::WrongState);
        }
        let deadline = self.transport.now_ms() + u64::from(cmd::SHORT_TIMEOUT_MS);
        loop {
            if cmd::socket_state(&mut self.transport, id)? == cmd::wire_state::LISTENING {
                self.reg.mark_listening(id);
                return Ok(());
            }
            if self.transport.now_ms() >= deadline {
                self.reg.abort_transition(id);
                return Err(NetError::Timeout);
            }
            self.transport.delay_ms(POLL_DELAY_MS);
        }
    }

    /// Retrieve a connected child of a listening socket, if one has been
    /// reconciled. Non-blocking.
    pub fn accept(&mut self, id: SocketId) -> Result<Option<SocketId>, NetError> {
        self.reconcile()?;
        if self.reg.state(id) != State::Listening {
            return Err(NetError::WrongState);
        }
        match self.reg.take_pending_child(id) {
            Some((child, act)) => {
                self.run_action(act)?;
                Ok(Some(child))
            }
            None => Ok(None),
        }
    }

    /// Send stream data. Permitted only while connected.
    ///
    /// A failed or partial send is retried once after a short pause; this
    /// is the only retry policy in the core. Bytes the peer already
    /// accepted are never resent, so a short first attempt retries only
    /// the remainder.
    pub fn write(&mut self, id: SocketId, data: &[u8]) -> Result<(), NetError> {
        self.reconcile()?;
        if self.reg.state(id) != State::Connected
            || self.reg.kind(id) != Some(SocketKind::Stream)
        {
            return Err(NetError::WrongState);
        }
        let mut rest = data;
        for attempt in 0..2 {
            match cmd::send_stream(&mut self.transport, id, rest) {
                Ok(n) if usize::from(n) == rest.len() => return Ok(()),
                Ok(n) => {
                    warn!("socket {}: short send {}/{}", id.0, n, rest.len());
                    rest = &rest[usize::from(n).min(rest.len())..];
                }
                Err(e) => warn!("socket {}: send failed: {:?}", id.0, e),
            }
            if attempt == 0 {
                self.transport.delay_ms(WRITE_RETRY_DELAY_MS);
            }
        }
        Err(NetError::SendFailed)
    }

    /// Send one datagram from a bound datagram socket.
    pub fn send_to(
        &mut self,
        id: SocketId,
        addr: Ipv4Addr,
        port: u16,
        data: &[u8],
    ) -> Result<(), NetError> {
        self.reconcile()?;
        if self.reg.kind(id) != Some(SocketKind::Datagram) {
            return Err(NetError::WrongState);
        }
        cmd::send_datagram(&mut self.transport, id, addr, port, data)?;
        Ok(())
    }

    /// Drain buffered stream bytes into `out`.
    ///
    /// Triggers no transport traffic of its own beyond the reconcile
    /// pre-step and, when a drain releases backpressure, the single
    /// re-arm of the inbound flow.
    pub fn read(&mut self, id: SocketId, out: &mut [u8]) -> Result<usize, NetError> {
        self.reconcile()?;
        if self.reg.state(id) != State::Connected
            || self.reg.kind(id) != Some(SocketKind::Stream)
        {
            return Err(NetError::WrongState);
        }
        let (n, act) = self.reg.read(id, out);
        if let Some(act) = act {
            self.run_action(act)?;
        }
        Ok(n)
    }

    /// Remove the next buffered datagram, returning its length and source.
    pub fn recv_from(
        &mut self,
        id: SocketId,
        out: &mut [u8],
    ) -> Result<Option<(usize, Ipv4Addr, u16)>, NetError> {
        self.reconcile()?;
        if self.reg.kind(id) != Some(SocketKind::Datagram) {
            return Err(NetError::WrongState);
        }
        let (res, act) = self.reg.read_datagram(id, out);
        if let Some(act) = act {
            self.run_action(act)?;
        }
        Ok(res)
    }

    /// Buffered byte count: unread stream bytes, or the next datagram's
    /// payload length. Zero for slots without a buffer.
    pub fn available(&mut self, id: SocketId) -> Result<usize, NetError> {
        self.reconcile()?;
        Ok(self.reg.available(id))
    }

    /// Whether `id` currently holds an established connection.
    pub fn connected(&mut self, id: SocketId) -> bool {
        // Best effort; a reconcile failure reads as "not connected".
        let _ = self.reconcile();
        self.reg.state(id) == State::Connected
    }

    pub fn state(&self, id: SocketId) -> State {
        self.reg.state(id)
    }

    pub fn remote_address(&self, id: SocketId) -> Option<Ipv4Addr> {
        self.reg.peer(id).map(|(addr, _)| addr)
    }

    pub fn remote_port(&self, id: SocketId) -> Option<u16> {
        self.reg.peer(id).map(|(_, port)| port)
    }

    /// For server-accepted sockets, the listener that spawned them.
    pub fn parent(&self, id: SocketId) -> Option<SocketId> {
        self.reg.parent(id)
    }

    /// Release a socket from any state. Total and idempotent.
    ///
    /// Pending notifications for the slot are flushed before the slot is
    /// released, so a stale notification can never land on a reused id.
    pub fn close(&mut self, id: SocketId) {
        let _ = self.reconcile();
        if self.reg.state(id) != State::Invalid {
            let _ = cmd::stop(&mut self.transport, id);
        }
        let _ = self.drain_discarding(id);
        self.reg.release(id);
        debug!("socket {}: closed", id.0);
    }

    /// Post-stop flush: apply remaining notifications normally, except
    /// those addressed to `id`, which are dropped. Children announced to
    /// a closing listener are torn down by the peer as part of the stop.
    fn drain_discarding(&mut self, id: SocketId) -> Result<(), NetError> {
        while self.transport.event_pending() {
            let mut scratch = [0u8; cmd::EVENT_SCRATCH];
            let mut events: heapless::Vec<cmd::Event<'_>, MAX_PARAMS> = heapless::Vec::new();
            cmd::fetch_events(&mut self.transport, &mut scratch, &mut events)?;
            if events.is_empty() {
                break;
            }
            for ev in &events {
                if ev.socket() == id {
                    debug!("socket {}: flushing stale notification", id.0);
                    continue;
                }
                if let Some(act) = self.reg.apply(ev) {
                    self.run_action(act)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a host name through the co-processor's resolver.
    pub fn resolve(&mut self, name: &str) -> Result<Ipv4Addr, NetError> {
        self.reconcile()?;
        Ok(cmd::resolve(&mut self.transport, name)?)
    }

    /// Ping `addr`; returns the round-trip time in milliseconds.
    pub fn ping(&mut self, addr: Ipv4Addr) -> Result<u16, NetError> {
        self.reconcile()?;
        Ok(cmd::ping(&mut self.transport, addr)?)
    }

    /// The co-processor's current local address (cached after first use).
    pub fn local_address(&mut self) -> Result<Ipv4Addr, NetError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        let addr = cmd::local_address(&mut self.transport)?;
        self.local_addr = Some(addr);
        Ok(addr)
    }
}
