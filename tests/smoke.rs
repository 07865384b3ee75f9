use core::net::Ipv4Addr;

use lacewing::{NetError, NetStack, Opcode, SocketId, State};

mod common;

use common::{ev_peer_closed, ev_stream_data, ScriptTransport};

type TestStack = NetStack<ScriptTransport, 4, 256>;

fn connected_stack() -> (TestStack, SocketId) {
    let mut t = ScriptTransport::new();
    t.auto(Opcode::START_CLIENT, vec![common::ev_connect_ok(0)]);
    let mut stack = TestStack::new(t);
    let id = stack.connect(Ipv4Addr::new(10, 0, 0, 1), 80).unwrap();
    (stack, id)
}

#[test]
fn connect_then_receive() {
    let mut t = ScriptTransport::new();
    // The co-processor confirms the connection right after start-client.
    t.auto(Opcode::START_CLIENT, vec![common::ev_connect_ok(0)]);
    let mut stack = TestStack::new(t);

    let id = stack.connect(Ipv4Addr::new(10, 0, 0, 1), 80).unwrap();
    assert_eq!(id, SocketId(0));
    assert!(stack.connected(id));
    assert_eq!(stack.state(id), State::Connected);
    // Connecting armed the inbound flow once.
    assert_eq!(stack.transport_mut().count_op(Opcode::RECV_ARM), 1);

    // Data arrives asynchronously; the next call reconciles it in.
    stack.transport_mut().push_event(ev_stream_data(0, b"hello"));
    assert_eq!(stack.available(id).unwrap(), 5);

    let mut buf = [0u8; 16];
    assert_eq!(stack.read(id, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(stack.available(id).unwrap(), 0);
}

#[test]
fn connect_timeout_releases_slot() {
    // No confirmation ever arrives.
    let mut stack = TestStack::new(ScriptTransport::new());
    let err = stack.connect(Ipv4Addr::new(10, 0, 0, 1), 80).unwrap_err();
    assert_eq!(err, NetError::Timeout);
    assert_eq!(stack.state(SocketId(0)), State::Invalid);
    // The half-open attempt was stopped on the wire.
    assert_eq!(stack.transport_mut().count_op(Opcode::STOP), 1);

    // The slot is usable again.
    stack
        .transport_mut()
        .auto(Opcode::START_CLIENT, vec![common::ev_connect_ok(0)]);
    assert_eq!(
        stack.connect(Ipv4Addr::new(10, 0, 0, 2), 81).unwrap(),
        SocketId(0),
    );
}

#[test]
fn pool_exhaustion_fails_fast() {
    let mut t = ScriptTransport::new();
    t.auto(Opcode::START_CLIENT, vec![common::ev_connect_ok(0)]);
    let mut stack: NetStack<ScriptTransport, 1, 256> = NetStack::new(t);

    stack.connect(Ipv4Addr::new(10, 0, 0, 1), 80).unwrap();
    let before = stack.transport_mut().sent.len();
    assert_eq!(
        stack.connect(Ipv4Addr::new(10, 0, 0, 2), 81).unwrap_err(),
        NetError::Exhausted,
    );
    // No partial allocation, no wire traffic for the failed attempt.
    assert_eq!(stack.transport_mut().sent.len(), before);
}

#[test]
fn write_requires_connected_state() {
    let (mut stack, id) = connected_stack();
    stack.close(id);

    assert_eq!(stack.write(id, b"nope").unwrap_err(), NetError::WrongState);
    // The refusal happened before any frame went out.
    assert_eq!(stack.transport_mut().count_op(Opcode::SEND_STREAM), 0);
}

#[test]
fn write_retries_exactly_once() {
    let (mut stack, id) = connected_stack();

    stack.transport_mut().fail_next(Opcode::SEND_STREAM, 1);
    stack.write(id, b"payload").unwrap();
    assert_eq!(stack.transport_mut().count_op(Opcode::SEND_STREAM), 2);

    stack.transport_mut().fail_next(Opcode::SEND_STREAM, 2);
    assert_eq!(
        stack.write(id, b"payload").unwrap_err(),
        NetError::SendFailed,
    );
    assert_eq!(stack.transport_mut().count_op(Opcode::SEND_STREAM), 4);
}

#[test]
fn short_send_retries_only_the_remainder() {
    let (mut stack, id) = connected_stack();
    // Peer accepts only 3 of 7 bytes on the first attempt.
    stack
        .transport_mut()
        .script_reply(Opcode::SEND_STREAM, vec![3u16.to_be_bytes().to_vec()]);
    stack.write(id, b"payload").unwrap();

    let sends = stack.transport_mut().sent_params(Opcode::SEND_STREAM);
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0][1], b"payload".to_vec());
    // The accepted prefix is never resent.
    assert_eq!(sends[1][1], b"load".to_vec());
}

#[test]
fn two_short_sends_count_as_failure() {
    let (mut stack, id) = connected_stack();
    stack
        .transport_mut()
        .script_reply(Opcode::SEND_STREAM, vec![3u16.to_be_bytes().to_vec()]);
    stack
        .transport_mut()
        .script_reply(Opcode::SEND_STREAM, vec![1u16.to_be_bytes().to_vec()]);
    assert_eq!(
        stack.write(id, b"payload").unwrap_err(),
        NetError::SendFailed,
    );
    // Even the failing retry carried only the unaccepted tail.
    let sends = stack.transport_mut().sent_params(Opcode::SEND_STREAM);
    assert_eq!(sends[1][1], b"load".to_vec());
}

#[test]
fn peer_close_invalidates() {
    let (mut stack, id) = connected_stack();
    stack.transport_mut().push_event(ev_peer_closed(0));
    assert!(!stack.connected(id));
    assert_eq!(stack.state(id), State::Invalid);
}

#[test]
fn close_is_total_and_idempotent() {
    let (mut stack, id) = connected_stack();

    // A notification still queued for the slot is flushed, not applied
    // to the next occupant of the id.
    stack.transport_mut().push_event(ev_stream_data(0, b"stale"));
    stack.close(id);
    assert_eq!(stack.state(id), State::Invalid);
    assert!(stack.transport_mut().pending.is_empty());
    assert_eq!(stack.transport_mut().count_op(Opcode::STOP), 1);

    // Again, from Invalid: still fine, and no second wire stop.
    stack.close(id);
    assert_eq!(stack.transport_mut().count_op(Opcode::STOP), 1);

    // Wildly out of range: ignored.
    stack.close(SocketId(200));

    // The reused slot starts clean.
    stack
        .transport_mut()
        .auto(Opcode::START_CLIENT, vec![common::ev_connect_ok(0)]);
    let id = stack.connect(Ipv4Addr::new(10, 0, 0, 9), 80).unwrap();
    assert_eq!(stack.available(id).unwrap(), 0);
}

#[test]
fn resolve_and_ping_passthrough() {
    let mut t = ScriptTransport::new();
    t.script_reply(Opcode::RESOLVE_GET, vec![vec![93, 184, 216, 34]]);
    t.script_reply(Opcode::PING, vec![23u16.to_be_bytes().to_vec()]);
    let mut stack = TestStack::new(t);

    assert_eq!(
        stack.resolve("example.com").unwrap(),
        Ipv4Addr::new(93, 184, 216, 34),
    );
    assert_eq!(stack.ping(Ipv4Addr::new(93, 184, 216, 34)).unwrap(), 23);

    // An unresolvable name comes back as a rejection, not a bogus address.
    stack
        .transport_mut()
        .script_reply(Opcode::RESOLVE_GET, vec![vec![0, 0, 0, 0]]);
    assert!(stack.resolve("nope.invalid").is_err());
}
