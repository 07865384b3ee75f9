//! The Command Codec
//!
//! One typed request/response wrapper per socket lifecycle operation, on
//! top of the [`Transport`] framing. Each wrapper blocks until the exchange
//! completes or its class timeout elapses: local operations use
//! [`SHORT_TIMEOUT_MS`], operations that depend on the co-processor's own
//! network dealings (connect, name resolution, ping) use
//! [`LONG_TIMEOUT_MS`]. On timeout the call reports failure and performs no
//! state mutation; retry policy belongs to the façade.
//!
//! Control commands carry single-byte parameter length prefixes
//! ([`LenClass::Byte`]); data-bearing commands use two-byte prefixes
//! ([`LenClass::Word`]).

use core::net::Ipv4Addr;

use crate::fmt::warn;
use crate::socket::TRANSFER_UNIT;
use crate::transport::{LenClass, Transport, TransportError, MAX_PARAMS};
use crate::{Opcode, SocketId};

/// Timeout for operations local to the co-processor (bind, stop, queries).
pub const SHORT_TIMEOUT_MS: u32 = 1_500;
/// Timeout for operations involving the network behind the co-processor.
pub const LONG_TIMEOUT_MS: u32 = 15_000;

/// Scratch space large enough for any fetch-events reply: one notification
/// per parameter, each at most one transfer unit plus its event header.
pub const EVENT_SCRATCH: usize = MAX_PARAMS * (TRANSFER_UNIT + 16);

impl Opcode {
    pub const LOCAL_ADDR: Self = Self(0x21);
    pub const START_SERVER: Self = Self(0x28);
    pub const SOCKET_STATE: Self = Self(0x29);
    pub const AVAIL_DATA: Self = Self(0x2B);
    pub const RECV_ARM: Self = Self(0x2C);
    pub const START_CLIENT: Self = Self(0x2D);
    pub const STOP: Self = Self(0x2E);
    pub const RESOLVE_REQ: Self = Self(0x34);
    pub const RESOLVE_GET: Self = Self(0x35);
    pub const SEND_DGRAM: Self = Self(0x39);
    pub const PING: Self = Self(0x3E);
    pub const SEND_STREAM: Self = Self(0x44);
    pub const FETCH_EVENTS: Self = Self(0x4A);
}

/// Socket states as the co-processor reports them in state queries.
pub mod wire_state {
    pub const CLOSED: u8 = 0;
    pub const LISTENING: u8 = 1;
    pub const ESTABLISHED: u8 = 4;
}

/// Mode byte of the start-server command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServerMode {
    Tcp,
    Udp,
    UdpMulticast,
}

impl ServerMode {
    fn wire(self) -> u8 {
        match self {
            ServerMode::Tcp => 0,
            ServerMode::Udp => 1,
            ServerMode::UdpMulticast => 2,
        }
    }
}

/// An error from a codec call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdError {
    Transport(TransportError),
    /// The peer answered with a negative status.
    Rejected,
    /// The reply's shape did not match the command.
    BadReply,
}

impl From<TransportError> for CmdError {
    fn from(value: TransportError) -> Self {
        CmdError::Transport(value)
    }
}

/// An asynchronous co-processor notification, decoded off the wire.
///
/// Payload slices borrow from the scratch buffer handed to
/// [`fetch_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<'a> {
    /// A client connection reached the established state.
    ConnectOk { sock: SocketId },
    /// A bind request was acknowledged.
    BindOk { sock: SocketId },
    /// A listening socket accepted a peer into a new slot.
    ChildAccepted {
        listener: SocketId,
        child: SocketId,
        addr: Ipv4Addr,
        port: u16,
    },
    /// Inbound bytes for a stream socket.
    StreamData { sock: SocketId, payload: &'a [u8] },
    /// One inbound datagram, with its source.
    DatagramData {
        sock: SocketId,
        addr: Ipv4Addr,
        port: u16,
        payload: &'a [u8],
    },
    /// The remote end closed a stream connection.
    PeerClosed { sock: SocketId },
}

impl Event<'_> {
    /// The slot this notification is addressed to.
    pub fn socket(&self) -> SocketId {
        match self {
            Event::ConnectOk { sock }
            | Event::BindOk { sock }
            | Event::StreamData { sock, .. }
            | Event::DatagramData { sock, .. }
            | Event::PeerClosed { sock } => *sock,
            Event::ChildAccepted { listener, .. } => *listener,
        }
    }
}

/// Notification kind bytes, as they appear on the wire.
pub const EV_CONNECT_OK: u8 = 1;
pub const EV_BIND_OK: u8 = 2;
pub const EV_CHILD_ACCEPTED: u8 = 3;
pub const EV_STREAM_DATA: u8 = 4;
pub const EV_DGRAM_DATA: u8 = 5;
pub const EV_PEER_CLOSED: u8 = 6;

fn decode_event(raw: &[u8]) -> Option<Event<'_>> {
    let (&kind, rest) = raw.split_first()?;
    let (&sock, rest) = rest.split_first()?;
    let sock = SocketId(sock);
    match kind {
        EV_CONNECT_OK if rest.is_empty() => Some(Event::ConnectOk { sock }),
        EV_BIND_OK if rest.is_empty() => Some(Event::BindOk { sock }),
        EV_CHILD_ACCEPTED => {
            let [child, a, b, c, d, hi, lo] = *rest else {
                return None;
            };
            Some(Event::ChildAccepted {
                listener: sock,
                child: SocketId(child),
                addr: Ipv4Addr::new(a, b, c, d),
                port: u16::from_be_bytes([hi, lo]),
            })
        }
        EV_STREAM_DATA => Some(Event::StreamData {
            sock,
            payload: rest,
        }),
        EV_DGRAM_DATA => {
            let (meta, payload) = rest.split_at_checked(6)?;
            let [a, b, c, d, hi, lo] = *meta else {
                return None;
            };
            Some(Event::DatagramData {
                sock,
                addr: Ipv4Addr::new(a, b, c, d),
                port: u16::from_be_bytes([hi, lo]),
                payload,
            })
        }
        EV_PEER_CLOSED if rest.is_empty() => Some(Event::PeerClosed { sock }),
        _ => None,
    }
}

/// Expect the single-byte positive acknowledgement.
fn ack(reply: &crate::transport::Reply<'_>) -> Result<(), CmdError> {
    match reply.u8(0) {
        Some(1) => Ok(()),
        Some(0) => Err(CmdError::Rejected),
        _ => Err(CmdError::BadReply),
    }
}

/// Open a stream connection to `addr:port` on slot `sock`.
pub fn start_client<T: Transport>(
    t: &mut T,
    sock: SocketId,
    addr: Ipv4Addr,
    port: u16,
) -> Result<(), CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::START_CLIENT,
        &[&addr.octets(), &port.to_be_bytes(), &[sock.0]],
        LenClass::Byte,
        LONG_TIMEOUT_MS,
        &mut scratch,
    )?;
    ack(&reply)
}

/// Bind slot `sock` to a local port, as a TCP listener or a UDP socket.
pub fn start_server<T: Transport>(
    t: &mut T,
    sock: SocketId,
    port: u16,
    mode: ServerMode,
) -> Result<(), CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::START_SERVER,
        &[&port.to_be_bytes(), &[sock.0], &[mode.wire()]],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    ack(&reply)
}

/// Bind slot `sock` to a multicast group.
pub fn start_multicast<T: Transport>(
    t: &mut T,
    sock: SocketId,
    group: Ipv4Addr,
    port: u16,
) -> Result<(), CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::START_SERVER,
        &[
            &group.octets(),
            &port.to_be_bytes(),
            &[sock.0],
            &[ServerMode::UdpMulticast.wire()],
        ],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    ack(&reply)
}

/// Stop whatever slot `sock` is doing on the co-processor side.
pub fn stop<T: Transport>(t: &mut T, sock: SocketId) -> Result<(), CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::STOP,
        &[&[sock.0]],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    ack(&reply)
}

/// Query the co-processor's own state for slot `sock` (see [`wire_state`]).
pub fn socket_state<T: Transport>(t: &mut T, sock: SocketId) -> Result<u8, CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::SOCKET_STATE,
        &[&[sock.0]],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    reply.u8(0).ok_or(CmdError::BadReply)
}

/// Query how many bytes the co-processor holds for slot `sock`.
pub fn avail_data<T: Transport>(t: &mut T, sock: SocketId) -> Result<u16, CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::AVAIL_DATA,
        &[&[sock.0]],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    reply.u16(0).ok_or(CmdError::BadReply)
}

/// Send stream data; returns how many bytes the peer accepted.
pub fn send_stream<T: Transport>(
    t: &mut T,
    sock: SocketId,
    data: &[u8],
) -> Result<u16, CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::SEND_STREAM,
        &[&[sock.0], data],
        LenClass::Word,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    reply.u16(0).ok_or(CmdError::BadReply)
}

/// Send one datagram to `addr:port` from slot `sock`.
pub fn send_datagram<T: Transport>(
    t: &mut T,
    sock: SocketId,
    addr: Ipv4Addr,
    port: u16,
    data: &[u8],
) -> Result<(), CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::SEND_DGRAM,
        &[&[sock.0], &addr.octets(), &port.to_be_bytes(), data],
        LenClass::Word,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    ack(&reply)
}

/// Re-issue the low-level receive request for slot `sock`, allowing the
/// co-processor to deliver up to `max` more payload bytes.
pub fn recv_arm<T: Transport>(t: &mut T, sock: SocketId, max: u16) -> Result<(), CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::RECV_ARM,
        &[&[sock.0], &max.to_be_bytes()],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    ack(&reply)
}

/// Drain queued notifications from the co-processor.
///
/// Each reply parameter is one notification; undecodable ones are
/// discarded with a warning. An empty `out` after a successful call means
/// the peer's queue was empty.
pub fn fetch_events<'a, T: Transport>(
    t: &mut T,
    scratch: &'a mut [u8],
    out: &mut heapless::Vec<Event<'a>, MAX_PARAMS>,
) -> Result<(), CmdError> {
    let reply = t.exchange(
        Opcode::FETCH_EVENTS,
        &[],
        LenClass::Word,
        SHORT_TIMEOUT_MS,
        scratch,
    )?;
    for idx in 0..reply.param_count() {
        let raw = reply.param(idx).ok_or(CmdError::BadReply)?;
        match decode_event(raw) {
            // Infallible: out is as large as the reply's parameter limit.
            Some(ev) => {
                let _ = out.push(ev);
            }
            None => warn!("discarding undecodable notification ({} bytes)", raw.len()),
        }
    }
    Ok(())
}

/// Resolve a host name to an address via the co-processor's own resolver.
pub fn resolve<T: Transport>(t: &mut T, name: &str) -> Result<Ipv4Addr, CmdError> {
    {
        let mut scratch = [0u8; 8];
        let reply = t.exchange(
            Opcode::RESOLVE_REQ,
            &[name.as_bytes()],
            LenClass::Byte,
            LONG_TIMEOUT_MS,
            &mut scratch,
        )?;
        ack(&reply)?;
    }
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::RESOLVE_GET,
        &[],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    let addr = reply.ipv4(0).ok_or(CmdError::BadReply)?;
    if addr.is_unspecified() {
        return Err(CmdError::Rejected);
    }
    Ok(addr)
}

/// Ping `addr`; returns the round-trip time in milliseconds.
pub fn ping<T: Transport>(t: &mut T, addr: Ipv4Addr) -> Result<u16, CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::PING,
        &[&addr.octets()],
        LenClass::Byte,
        LONG_TIMEOUT_MS,
        &mut scratch,
    )?;
    match reply.u16(0) {
        Some(u16::MAX) => Err(CmdError::Rejected),
        Some(ms) => Ok(ms),
        None => Err(CmdError::BadReply),
    }
}

/// Query the co-processor's current local address.
pub fn local_address<T: Transport>(t: &mut T) -> Result<Ipv4Addr, CmdError> {
    let mut scratch = [0u8; 8];
    let reply = t.exchange(
        Opcode::LOCAL_ADDR,
        &[],
        LenClass::Byte,
        SHORT_TIMEOUT_MS,
        &mut scratch,
    )?;
    reply.ipv4(0).ok_or(CmdError::BadReply)
}
