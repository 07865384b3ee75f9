#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub(crate) mod fmt;

pub mod cmd;
pub mod mdns;
pub mod net_stack;
pub mod socket;
pub mod transport;

pub use net_stack::{NetError, NetStack};
pub use socket::State;

/// A handle to one entry of the fixed-size socket pool.
///
/// The contained index is stable for the lifetime of the socket and doubles
/// as the wire-protocol socket handle sent to the co-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketId(pub u8);

impl SocketId {
    #[inline]
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// Whether a socket is connection-oriented or datagram-oriented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// One command opcode on the bus protocol.
///
/// Reply frames carry the same opcode with [`transport::REPLY_FLAG`] set.
/// The full table lives in [`cmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Opcode(pub u8);
