//! A scripted transport backend standing in for the co-processor.
//!
//! Commands are logged, replies come from per-opcode scripts (defaulting
//! to a positive acknowledgement), and the notification queue doubles as
//! the event side-channel. Time is virtual: it advances only when the
//! stack sleeps.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use lacewing::cmd;
use lacewing::transport::{LenClass, Reply, Transport, TransportError, MAX_PARAMS};
use lacewing::Opcode;

pub struct ScriptTransport {
    pub now: u64,
    /// Encoded notifications awaiting a fetch.
    pub pending: VecDeque<Vec<u8>>,
    /// Every exchange performed: opcode byte and its parameters.
    pub sent: Vec<(u8, Vec<Vec<u8>>)>,
    /// Scripted reply parameter lists, per opcode.
    pub replies: HashMap<u8, VecDeque<Vec<Vec<u8>>>>,
    /// Notification batches queued when a given opcode is seen.
    pub auto_events: HashMap<u8, VecDeque<Vec<Vec<u8>>>>,
    /// Number of upcoming exchanges per opcode to fail with a timeout.
    pub fail: HashMap<u8, usize>,
}

impl ScriptTransport {
    pub fn new() -> Self {
        Self {
            now: 0,
            pending: VecDeque::new(),
            sent: Vec::new(),
            replies: HashMap::new(),
            auto_events: HashMap::new(),
            fail: HashMap::new(),
        }
    }

    pub fn push_event(&mut self, ev: Vec<u8>) {
        self.pending.push_back(ev);
    }

    /// Queue a reply for the next exchange of `op`.
    pub fn script_reply(&mut self, op: Opcode, params: Vec<Vec<u8>>) {
        self.replies.entry(op.0).or_default().push_back(params);
    }

    /// Queue notifications to appear once the next `op` exchange lands.
    pub fn auto(&mut self, op: Opcode, events: Vec<Vec<u8>>) {
        self.auto_events.entry(op.0).or_default().push_back(events);
    }

    pub fn fail_next(&mut self, op: Opcode, times: usize) {
        *self.fail.entry(op.0).or_default() += times;
    }

    pub fn count_op(&self, op: Opcode) -> usize {
        self.sent.iter().filter(|(o, _)| *o == op.0).count()
    }

    pub fn sent_params(&self, op: Opcode) -> Vec<&Vec<Vec<u8>>> {
        self.sent
            .iter()
            .filter(|(o, _)| *o == op.0)
            .map(|(_, p)| p)
            .collect()
    }
}

impl Transport for ScriptTransport {
    fn exchange<'a>(
        &mut self,
        op: Opcode,
        params: &[&[u8]],
        _class: LenClass,
        _timeout_ms: u32,
        scratch: &'a mut [u8],
    ) -> Result<Reply<'a>, TransportError> {
        self.sent
            .push((op.0, params.iter().map(|p| p.to_vec()).collect()));

        if let Some(n) = self.fail.get_mut(&op.0) {
            if *n > 0 {
                *n -= 1;
                return Err(TransportError::Timeout);
            }
        }

        if let Some(q) = self.auto_events.get_mut(&op.0) {
            if let Some(batch) = q.pop_front() {
                self.pending.extend(batch);
            }
        }

        if op == Opcode::FETCH_EVENTS {
            let mut evs: Vec<Vec<u8>> = Vec::new();
            while evs.len() < MAX_PARAMS {
                match self.pending.pop_front() {
                    Some(ev) => evs.push(ev),
                    None => break,
                }
            }
            let refs: Vec<&[u8]> = evs.iter().map(|v| v.as_slice()).collect();
            return Reply::pack(scratch, &refs);
        }

        if let Some(q) = self.replies.get_mut(&op.0) {
            if let Some(ps) = q.pop_front() {
                let refs: Vec<&[u8]> = ps.iter().map(|v| v.as_slice()).collect();
                return Reply::pack(scratch, &refs);
            }
        }

        // Defaults: sends are accepted in full, everything else is a
        // positive acknowledgement.
        if op == Opcode::SEND_STREAM {
            let n = params.get(1).map(|p| p.len()).unwrap_or(0) as u16;
            return Reply::pack(scratch, &[&n.to_be_bytes()]);
        }
        Reply::pack(scratch, &[&[1u8]])
    }

    fn event_pending(&mut self) -> bool {
        !self.pending.is_empty()
    }

    fn now_ms(&mut self) -> u64 {
        self.now
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now += u64::from(ms);
    }
}

// Wire encodings of the co-processor notifications.

pub fn ev_connect_ok(sock: u8) -> Vec<u8> {
    vec![cmd::EV_CONNECT_OK, sock]
}

pub fn ev_bind_ok(sock: u8) -> Vec<u8> {
    vec![cmd::EV_BIND_OK, sock]
}

pub fn ev_child_accepted(listener: u8, child: u8, addr: [u8; 4], port: u16) -> Vec<u8> {
    let mut ev = vec![cmd::EV_CHILD_ACCEPTED, listener, child];
    ev.extend_from_slice(&addr);
    ev.extend_from_slice(&port.to_be_bytes());
    ev
}

pub fn ev_stream_data(sock: u8, payload: &[u8]) -> Vec<u8> {
    let mut ev = vec![cmd::EV_STREAM_DATA, sock];
    ev.extend_from_slice(payload);
    ev
}

pub fn ev_dgram_data(sock: u8, addr: [u8; 4], port: u16, payload: &[u8]) -> Vec<u8> {
    let mut ev = vec![cmd::EV_DGRAM_DATA, sock];
    ev.extend_from_slice(&addr);
    ev.extend_from_slice(&port.to_be_bytes());
    ev.extend_from_slice(payload);
    ev
}

pub fn ev_peer_closed(sock: u8) -> Vec<u8> {
    vec![cmd::EV_PEER_CLOSED, sock]
}
