//! End-to-end stream socket scenarios: connect, decode, broadcast,
//! reconnect, poisoning, descriptor passing.

mod common;

use std::io::Write as _;
use std::os::fd::AsFd;
use std::rc::Rc;
use std::time::Duration;

use common::{EventLog, count, dumps, init_tracing, new_log, pump_until, recording_handler};
use wiremsg::{Addr, Arg, Config, Context, Event, EventKind, EventLoop, Field, Message};

fn unix_addr(dir: &tempfile::TempDir, name: &str) -> Addr {
    format!("unix:{}", dir.path().join(name).display())
        .parse()
        .unwrap()
}

fn server_client(
    lp: &EventLoop,
    addr: &Addr,
) -> (Context, EventLog, Context, EventLog) {
    let server_log = new_log();
    let server = Context::with_loop(lp, Config::default(), recording_handler(server_log.clone()))
        .unwrap();
    server.listen(addr).unwrap();

    let client_log = new_log();
    let client = Context::with_loop(lp, Config::default(), recording_handler(client_log.clone()))
        .unwrap();
    client.connect(addr).unwrap();

    assert!(
        pump_until(lp, Duration::from_secs(5), || {
            count(&server_log, EventKind::Connected) == 1
                && count(&client_log, EventKind::Connected) == 1
        }),
        "connection was never established"
    );
    (server, server_log, client, client_log)
}

#[test]
fn client_message_reaches_the_server_decoded() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "t.sock");
    let lp = EventLoop::new().unwrap();
    let (_server, server_log, client, _client_log) = server_client(&lp, &addr);

    client
        .send(42, "%u%s", &[Arg::U32(10), Arg::Str("PING")])
        .unwrap();

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&server_log, EventKind::Msg) == 1
    }));
    assert_eq!(dumps(&server_log), vec!["{ID:42, U32:10, STR:'PING'}"]);
}

#[test]
fn server_sees_peer_credentials_on_unix() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "creds.sock");
    let lp = EventLoop::new().unwrap();
    let (server, _server_log, _client, _client_log) = server_client(&lp, &addr);

    let conns = server.connections();
    assert_eq!(conns.len(), 1);
    let creds = conns[0].peer_creds().expect("peer credentials on unix");
    assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
    assert_eq!(creds.gid, nix::unistd::getgid().as_raw());
    assert_eq!(creds.pid, Some(std::process::id() as i32));
}

#[test]
fn broadcast_reaches_every_client_identically() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "bcast.sock");
    let lp = EventLoop::new().unwrap();

    let server_log = new_log();
    let server = Context::with_loop(&lp, Config::default(), recording_handler(server_log.clone()))
        .unwrap();
    server.listen(&addr).unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let log = new_log();
        let client =
            Context::with_loop(&lp, Config::default(), recording_handler(log.clone())).unwrap();
        client.connect(&addr).unwrap();
        clients.push((client, log));
    }
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&server_log, EventKind::Connected) == 3
    }));

    server.send(7, "%i%f", &[Arg::I32(-1), Arg::F32(3.5)]).unwrap();

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        clients.iter().all(|(_, log)| count(log, EventKind::Msg) == 1)
    }));
    for (_, log) in &clients {
        assert_eq!(dumps(log), vec!["{ID:7, I32:-1, F32:3.5}"]);
    }
}

#[test]
fn client_reconnects_after_server_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "re.sock");
    let lp = EventLoop::new().unwrap();

    let server_log = new_log();
    let server = Context::with_loop(&lp, Config::default(), recording_handler(server_log.clone()))
        .unwrap();
    server.listen(&addr).unwrap();

    let client_log = new_log();
    let cfg = Config {
        reconnect_delay: Duration::from_millis(100),
        ..Config::default()
    };
    let client = Context::with_loop(&lp, cfg, recording_handler(client_log.clone())).unwrap();
    client.connect(&addr).unwrap();

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&client_log, EventKind::Connected) == 1
    }));

    server.stop().unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&client_log, EventKind::Disconnected) == 1
    }));

    // Reconnection is silent until the listener is back.
    server.listen(&addr).unwrap();
    assert!(
        pump_until(&lp, Duration::from_millis(2500), || {
            count(&client_log, EventKind::Connected) == 2
        }),
        "client did not reconnect in time"
    );
}

#[test]
fn malformed_bytes_poison_only_that_connection() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "poison.sock");
    let path = dir.path().join("poison.sock");
    let lp = EventLoop::new().unwrap();

    let server_log = new_log();
    let server = Context::with_loop(&lp, Config::default(), recording_handler(server_log.clone()))
        .unwrap();
    server.listen(&addr).unwrap();

    // A well-behaved client...
    let client_log = new_log();
    let client = Context::with_loop(&lp, Config::default(), recording_handler(client_log.clone()))
        .unwrap();
    client.connect(&addr).unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&server_log, EventKind::Connected) == 1
    }));

    // ...and a raw socket injecting garbage.
    let mut raw = std::os::unix::net::UnixStream::connect(&path).unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&server_log, EventKind::Connected) == 2
    }));
    raw.write_all(b"\xde\xad\xbe\xef\xde\xad\xbe\xef\xde\xad\xbe\xef\xde\xad")
        .unwrap();

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&server_log, EventKind::Disconnected) == 1
    }));
    assert_eq!(count(&server_log, EventKind::Msg), 0);

    // Exactly one disconnect, and the healthy client still works.
    client
        .send(5, "%s", &[Arg::Str("still-alive")])
        .unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&server_log, EventKind::Msg) == 1
    }));
    assert_eq!(count(&server_log, EventKind::Disconnected), 1);
}

#[test]
fn pipe_fd_crosses_the_socket_and_outlives_the_sender_copy() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "fd.sock");
    let lp = EventLoop::new().unwrap();

    // Server keeps the received descriptor as an owned duplicate.
    let received = Rc::new(std::cell::RefCell::new(None));
    let received_in_handler = received.clone();
    let server = Context::with_loop(
        &lp,
        Config::default(),
        Box::new(move |_ctx, event| {
            if let Event::Msg(_conn, msg) = event {
                assert_eq!(msg.id(), 99);
                let fields = msg.read("%x").unwrap();
                let Field::Fd(fd) = &fields[0] else {
                    panic!("expected a descriptor");
                };
                *received_in_handler.borrow_mut() = Some(fd.try_clone().unwrap());
            }
        }),
    )
    .unwrap();
    server.listen(&addr).unwrap();

    let client_log = new_log();
    let client = Context::with_loop(&lp, Config::default(), recording_handler(client_log.clone()))
        .unwrap();
    client.connect(&addr).unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&client_log, EventKind::Connected) == 1
    }));

    let (pipe_r, pipe_w) = nix::unistd::pipe().unwrap();
    let mut msg = Message::new();
    msg.write(99, "%x", &[Arg::Fd(pipe_r.as_fd())]).unwrap();
    // The sender's own copy goes away before the peer reads.
    drop(pipe_r);
    client.send_msg(&msg).unwrap();
    drop(msg);

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        received.borrow().is_some()
    }));

    std::fs::File::from(pipe_w).write_all(b"through the pipe").unwrap();
    let fd = received.borrow_mut().take().unwrap();
    let mut got = String::new();
    use std::io::Read as _;
    std::fs::File::from(fd).read_to_string(&mut got).unwrap();
    assert_eq!(got, "through the pipe");
}

#[test]
fn megabyte_message_survives_partial_writes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "big.sock");
    let lp = EventLoop::new().unwrap();

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let got = Rc::new(std::cell::RefCell::new(None));
    let got_in_handler = got.clone();
    let server = Context::with_loop(
        &lp,
        Config::default(),
        Box::new(move |_ctx, event| {
            if let Event::Msg(_conn, msg) = event {
                let fields = msg.read("%p%u").unwrap();
                let Field::Buf(bytes) = &fields[0] else {
                    panic!("expected a buffer");
                };
                *got_in_handler.borrow_mut() = Some(bytes.to_vec());
            }
        }),
    )
    .unwrap();
    server.listen(&addr).unwrap();

    let client_log = new_log();
    let client = Context::with_loop(&lp, Config::default(), recording_handler(client_log.clone()))
        .unwrap();
    client.connect(&addr).unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&client_log, EventKind::Connected) == 1
    }));

    client.send(3, "%p%u", &[Arg::Buf(&payload)]).unwrap();

    assert!(pump_until(&lp, Duration::from_secs(10), || {
        got.borrow().is_some()
    }));
    assert_eq!(got.borrow().as_deref(), Some(expected.as_slice()));
}

#[test]
fn stop_inside_a_callback_is_safe() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = unix_addr(&dir, "stop.sock");
    let lp = EventLoop::new().unwrap();

    // The server stops itself on the first message; the deferred
    // Disconnected must still arrive, exactly once.
    let log = new_log();
    let log_in_handler = log.clone();
    let server = Context::with_loop(
        &lp,
        Config::default(),
        Box::new(move |ctx, event| {
            let dump = match &event {
                Event::Msg(_, msg) => Some(msg.dump()),
                _ => None,
            };
            log_in_handler.borrow_mut().push((event.kind(), dump));
            if matches!(event, Event::Msg(..)) {
                ctx.stop().unwrap();
            }
        }),
    )
    .unwrap();
    server.listen(&addr).unwrap();

    let client_log = new_log();
    let client = Context::with_loop(&lp, Config::default(), recording_handler(client_log.clone()))
        .unwrap();
    client.connect(&addr).unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&client_log, EventKind::Connected) == 1
    }));

    client.send(1, "%u", &[Arg::U32(1)]).unwrap();

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&log, EventKind::Disconnected) == 1
    }));
    assert_eq!(count(&log, EventKind::Msg), 1);
    assert_eq!(server.connections().len(), 0);
}
