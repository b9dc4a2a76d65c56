//! Datagram endpoint scenarios.

mod common;

use std::time::Duration;

use common::{count, dumps, init_tracing, new_log, pump_until, recording_handler};
use wiremsg::{Addr, Arg, Config, Context, Error, EventKind, EventLoop};

fn unix_addr(dir: &tempfile::TempDir, name: &str) -> Addr {
    format!("unix:{}", dir.path().join(name).display())
        .parse()
        .unwrap()
}

#[test]
fn two_endpoints_exchange_one_datagram() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr_a = unix_addr(&dir, "a.sock");
    let addr_b = unix_addr(&dir, "b.sock");
    let lp = EventLoop::new().unwrap();

    let log_a = new_log();
    let a = Context::with_loop(&lp, Config::default(), recording_handler(log_a.clone())).unwrap();
    a.bind(&addr_a).unwrap();

    let log_b = new_log();
    let b = Context::with_loop(&lp, Config::default(), recording_handler(log_b.clone())).unwrap();
    b.bind(&addr_b).unwrap();

    let text = "m".repeat(1400);
    a.send_to(&addr_b, 21, "%s", &[Arg::Str(&text)]).unwrap();

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&log_b, EventKind::Msg) == 1
    }));
    assert_eq!(dumps(&log_b), vec![format!("{{ID:21, STR:'{text}'}}")]);

    // Delivered exactly once: nothing further shows up.
    let _ = lp.wait_and_process(Some(Duration::from_millis(100)));
    assert_eq!(count(&log_b, EventKind::Msg), 1);
    assert_eq!(b.dropped_count(), 0);
}

#[test]
fn oversized_string_fails_at_encode() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr_a = unix_addr(&dir, "big-a.sock");
    let addr_b = unix_addr(&dir, "big-b.sock");
    let lp = EventLoop::new().unwrap();

    let a = Context::with_loop(&lp, Config::default(), recording_handler(new_log())).unwrap();
    a.bind(&addr_a).unwrap();

    let text = "x".repeat(70_000);
    assert!(matches!(
        a.send_to(&addr_b, 1, "%s", &[Arg::Str(&text)]),
        Err(Error::TooLarge { .. })
    ));
}

#[test]
fn malformed_datagrams_are_counted_and_dropped() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr_b = unix_addr(&dir, "drop-b.sock");
    let path = dir.path().join("drop-b.sock");
    let lp = EventLoop::new().unwrap();

    let log_b = new_log();
    let b = Context::with_loop(&lp, Config::default(), recording_handler(log_b.clone())).unwrap();
    b.bind(&addr_b).unwrap();

    let raw = std::os::unix::net::UnixDatagram::unbound().unwrap();
    raw.send_to(b"\xde\xad\xbe\xef not a frame", &path).unwrap();

    assert!(pump_until(&lp, Duration::from_secs(5), || {
        b.dropped_count() == 1
    }));
    assert_eq!(count(&log_b, EventKind::Msg), 0);

    // A well-formed datagram still gets through afterwards.
    let sender = Context::with_loop(&lp, Config::default(), recording_handler(new_log())).unwrap();
    sender.bind(&unix_addr(&dir, "drop-a.sock")).unwrap();
    sender.send_to(&addr_b, 5, "%u", &[Arg::U32(5)]).unwrap();
    assert!(pump_until(&lp, Duration::from_secs(5), || {
        count(&log_b, EventKind::Msg) == 1
    }));
    assert_eq!(b.dropped_count(), 1);
}
