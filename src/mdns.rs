//! The Local-Name Responder
//!
//! A small protocol consumer answering multicast name queries for a single
//! registered host name, built purely on the façade's datagram primitives.
//!
//! Incoming packets are validated against the fixed 12-byte query header
//! template, a length-prefixed name label, the fixed `local` domain label,
//! and the query type/class fields. A matching query for the registered
//! name is answered with one positive A record (cache-flush bit, the
//! registered TTL, the device's current local address) and one NSEC record
//! affirmatively declaring that no other address family exists. Anything
//! else is ignored.

use core::net::Ipv4Addr;

use crate::fmt::{debug, warn};
use crate::net_stack::{NetError, NetStack};
use crate::transport::Transport;
use crate::SocketId;

/// The conventional multicast group for local-name queries.
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// The conventional port.
pub const MDNS_PORT: u16 = 5353;
/// Advertised record lifetime when the caller has no opinion.
pub const DEFAULT_TTL: u32 = 120;

/// A name label is at most 63 bytes on the wire.
const NAME_MAX: usize = 63;
/// Fixed header of a valid query: zero id and flags, one question.
const QUERY_HEADER: [u8; 12] = [0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
/// Fixed header of our responses: authoritative answer, two records.
const RESPONSE_HEADER: [u8; 12] = [0, 0, 0x84, 0, 0, 0, 0, 2, 0, 0, 0, 0];

const TYPE_A: u16 = 0x0001;
const TYPE_NSEC: u16 = 0x002F;
const TYPE_ANY: u16 = 0x00FF;
const CLASS_IN: u16 = 0x0001;
/// Class IN with the cache-flush bit.
const CLASS_IN_FLUSH: u16 = 0x8001;

/// Largest packet we will look at or emit.
const PKT_MAX: usize = 512;

pub struct MdnsResponder {
    name: heapless::String<NAME_MAX>,
    ttl: u32,
    sock: Option<SocketId>,
}

impl MdnsResponder {
    pub const fn new() -> Self {
        Self {
            name: heapless::String::new(),
            ttl: DEFAULT_TTL,
            sock: None,
        }
    }

    /// Register `name` and join the multicast group.
    ///
    /// `name` may be given with or without the `.local` suffix. Calling
    /// `begin` again replaces the previous registration entirely.
    pub fn begin<T: Transport, const S: usize, const R: usize>(
        &mut self,
        stack: &mut NetStack<T, S, R>,
        name: &str,
        ttl: u32,
    ) -> Result<(), NetError> {
        let host = name.strip_suffix(".local").unwrap_or(name);
        if host.is_empty() || host.len() > NAME_MAX || host.contains('.') {
            return Err(NetError::WrongState);
        }
        if let Some(old) = self.sock.take() {
            stack.close(old);
        }
        self.name.clear();
        // Length was checked just above.
        let _ = self.name.push_str(host);
        self.ttl = ttl;
        let sock = stack.bind_multicast(MDNS_GROUP, MDNS_PORT)?;
        self.sock = Some(sock);
        debug!("responder: registered name ({} bytes)", host.len());
        Ok(())
    }

    /// Stop answering and release the socket.
    pub fn end<T: Transport, const S: usize, const R: usize>(
        &mut self,
        stack: &mut NetStack<T, S, R>,
    ) {
        if let Some(sock) = self.sock.take() {
            stack.close(sock);
        }
        self.name.clear();
    }

    /// Drain queued queries, answering those for the registered name.
    ///
    /// Call this from the application's main loop.
    pub fn poll<T: Transport, const S: usize, const R: usize>(
        &mut self,
        stack: &mut NetStack<T, S, R>,
    ) -> Result<(), NetError> {
        let Some(sock) = self.sock else {
            return Ok(());
        };
        let mut pkt = [0u8; PKT_MAX];
        while let Some((len, _addr, _port)) = stack.recv_from(sock, &mut pkt)? {
            if !self.matches_query(&pkt[..len]) {
                continue;
            }
            let local = stack.local_address()?;
            let mut out = [0u8; PKT_MAX];
            let Some(n) = self.build_response(local, &mut out) else {
                warn!("responder: response did not fit");
                continue;
            };
            stack.send_to(sock, MDNS_GROUP, MDNS_PORT, &out[..n])?;
            debug!("responder: answered query ({} bytes)", n);
        }
        Ok(())
    }

    /// Strict validation of one inbound packet against the query shape.
    fn matches_query(&self, pkt: &[u8]) -> bool {
        let Some(rest) = pkt.strip_prefix(&QUERY_HEADER[..]) else {
            return false;
        };
        // Name label, case-insensitive.
        let Some((&len, rest)) = rest.split_first() else {
            return false;
        };
        let Some((label, rest)) = rest.split_at_checked(usize::from(len)) else {
            return false;
        };
        if !label.eq_ignore_ascii_case(self.name.as_bytes()) {
            return false;
        }
        // Fixed domain label, terminator, then QTYPE/QCLASS.
        let Some(rest) = rest.strip_prefix(&[5u8][..]) else {
            return false;
        };
        let Some((domain, rest)) = rest.split_at_checked(5) else {
            return false;
        };
        if !domain.eq_ignore_ascii_case(b"local") {
            return false;
        }
        let [0, qt_hi, qt_lo, qc_hi, qc_lo] = *rest else {
            return false;
        };
        let qtype = u16::from_be_bytes([qt_hi, qt_lo]);
        let qclass = u16::from_be_bytes([qc_hi, qc_lo]);
        // The top class bit is the unicast-response request; tolerated.
        matches!(qtype, TYPE_A | TYPE_ANY) && qclass & 0x7FFF == CLASS_IN
    }

    /// Emit the two-record answer into `out`.
    fn build_response(&self, local: Ipv4Addr, out: &mut [u8]) -> Option<usize> {
        let mut w = Writer { out, pos: 0 };
        w.put(&RESPONSE_HEADER)?;

        // A record: name, cache-flush IN, TTL, address.
        w.put_name(&self.name)?;
        w.put(&TYPE_A.to_be_bytes())?;
        w.put(&CLASS_IN_FLUSH.to_be_bytes())?;
        w.put(&self.ttl.to_be_bytes())?;
        w.put(&4u16.to_be_bytes())?;
        w.put(&local.octets())?;

        // NSEC record declaring A as the only type present: next domain
        // is the name itself, bitmap window 0 with the A bit set. No name
        // compression; the labels are simply repeated.
        w.put_name(&self.name)?;
        w.put(&TYPE_NSEC.to_be_bytes())?;
        w.put(&CLASS_IN_FLUSH.to_be_bytes())?;
        w.put(&self.ttl.to_be_bytes())?;
        let rdlen = (self.name.len() + 1 + 5 + 1 + 1 + 3) as u16;
        w.put(&rdlen.to_be_bytes())?;
        w.put_name(&self.name)?;
        w.put(&[0x00, 0x01, 0x40])?;

        Some(w.pos)
    }
}

impl Default for MdnsResponder {
    fn default() -> Self {
        Self::new()
    }
}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) -> Option<()> {
        let end = self.pos.checked_add(bytes.len())?;
        self.out.get_mut(self.pos..end)?.copy_from_slice(bytes);
        self.pos = end;
        Some(())
    }

    /// `<len>name<5>local<0>`.
    fn put_name(&mut self, name: &str) -> Option<()> {
        self.put(&[name.len() as u8])?;
        self.put(name.as_bytes())?;
        self.put(&[5])?;
        self.put(b"local")?;
        self.put(&[0])
    }
}
