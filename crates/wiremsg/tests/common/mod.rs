//! Shared helpers for the socket integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use wiremsg::{Event, EventKind, EventLoop, Handler};

/// Everything a handler saw, in order: the event kind plus, for messages,
/// the payload dump.
pub type EventLog = Rc<RefCell<Vec<(EventKind, Option<String>)>>>;

pub fn new_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// Handler that records every event into `log`.
pub fn recording_handler(log: EventLog) -> Handler {
    Box::new(move |_ctx, event| {
        let dump = match &event {
            Event::Msg(_, msg) => Some(msg.dump()),
            _ => None,
        };
        log.borrow_mut().push((event.kind(), dump));
    })
}

pub fn count(log: &EventLog, kind: EventKind) -> usize {
    log.borrow().iter().filter(|(k, _)| *k == kind).count()
}

pub fn dumps(log: &EventLog) -> Vec<String> {
    log.borrow()
        .iter()
        .filter_map(|(_, dump)| dump.clone())
        .collect()
}

/// Drive the loop until `cond` holds or `deadline` passes. True when the
/// condition was reached.
pub fn pump_until(lp: &EventLoop, deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while !cond() {
        if Instant::now() >= end {
            return false;
        }
        let _ = lp.wait_and_process(Some(Duration::from_millis(20)));
    }
    true
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
