//! I/O readiness loop.
//!
//! A single-threaded reactor: callers register file descriptors with a
//! callback, then drive everything from [`EventLoop::wait_and_process`].
//! The readiness backend is mio's poller, which picks epoll, kqueue or
//! poll per platform; this module owns the dispatch table, the timers and
//! the cross-thread wakeup on top of it.
//!
//! Everything except [`LoopWaker`] stays on the owning thread; the handle
//! types are `!Send` by construction. `wakeup` is the one cross-thread
//! entry point: an atomic pending flag in front of the mio waker coalesces
//! storms of wakeups into a single loop turn.

mod timer;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::trace;

pub use timer::Timer;
use timer::TimerTable;

use crate::error::{Error, Result};

/// Token reserved for the wakeup channel.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Which readiness to watch a descriptor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watch {
    /// Wake on readable.
    pub read: bool,
    /// Wake on writable.
    pub write: bool,
}

impl Watch {
    /// Readable only.
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    /// Writable only.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    /// Both directions.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    fn interest(self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness reported to a descriptor callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    /// Data can be read.
    pub readable: bool,
    /// Data can be written.
    pub writable: bool,
    /// The descriptor is in an error state.
    pub error: bool,
    /// The peer closed its half of the stream.
    pub closed: bool,
}

type FdCallback = Rc<RefCell<dyn FnMut(RawFd, Readiness)>>;

struct SourceEntry {
    token: Token,
    cb: FdCallback,
}

struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    sources: RefCell<HashMap<RawFd, SourceEntry>>,
    by_token: RefCell<HashMap<Token, RawFd>>,
    next_token: Cell<usize>,
    timers: RefCell<TimerTable>,
    idles: RefCell<Vec<Box<dyn FnOnce()>>>,
    processing: Cell<bool>,
    waker: Arc<Waker>,
    wake_pending: Arc<AtomicBool>,
}

/// Handle to one readiness loop. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("fds", &self.inner.sources.borrow().len())
            .finish()
    }
}

impl EventLoop {
    /// Fresh loop with its own poller and wakeup channel.
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(64)),
                sources: RefCell::new(HashMap::new()),
                by_token: RefCell::new(HashMap::new()),
                next_token: Cell::new(0),
                timers: RefCell::new(TimerTable::new()),
                idles: RefCell::new(Vec::new()),
                processing: Cell::new(false),
                waker,
                wake_pending: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerTable> {
        &self.inner.timers
    }

    /// Register `fd` with a callback invoked on readiness.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the fd is already registered or `watch` is
    /// empty.
    pub fn add<F>(&self, fd: RawFd, watch: Watch, cb: F) -> Result<()>
    where
        F: FnMut(RawFd, Readiness) + 'static,
    {
        let interest = watch
            .interest()
            .ok_or(Error::InvalidArgument("empty watch"))?;
        let mut sources = self.inner.sources.borrow_mut();
        if sources.contains_key(&fd) {
            return Err(Error::InvalidArgument("fd is already registered"));
        }
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0.wrapping_add(1));
        self.inner
            .poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;
        sources.insert(
            fd,
            SourceEntry {
                token,
                cb: Rc::new(RefCell::new(cb)),
            },
        );
        self.inner.by_token.borrow_mut().insert(token, fd);
        trace!(fd, ?watch, "fd registered");
        Ok(())
    }

    /// Change the watched readiness of a registered fd.
    pub fn update(&self, fd: RawFd, watch: Watch) -> Result<()> {
        let interest = watch
            .interest()
            .ok_or(Error::InvalidArgument("empty watch"))?;
        let sources = self.inner.sources.borrow();
        let entry = sources
            .get(&fd)
            .ok_or(Error::InvalidArgument("fd is not registered"))?;
        self.inner
            .poll
            .borrow()
            .registry()
            .reregister(&mut SourceFd(&fd), entry.token, interest)?;
        Ok(())
    }

    /// Deregister a fd. Its callback is dropped.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        let entry = self
            .inner
            .sources
            .borrow_mut()
            .remove(&fd)
            .ok_or(Error::InvalidArgument("fd is not registered"))?;
        self.inner.by_token.borrow_mut().remove(&entry.token);
        self.inner
            .poll
            .borrow()
            .registry()
            .deregister(&mut SourceFd(&fd))?;
        trace!(fd, "fd removed");
        Ok(())
    }

    /// True if `fd` is currently registered.
    #[must_use]
    pub fn has_fd(&self, fd: RawFd) -> bool {
        self.inner.sources.borrow().contains_key(&fd)
    }

    /// Queue a closure to run once after the current (or next) dispatch
    /// pass.
    pub fn idle_add<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.idles.borrow_mut().push(Box::new(cb));
    }

    /// The poller's own descriptor, for nesting this loop inside another
    /// one. It polls readable whenever a dispatch pass would deliver work.
    pub fn get_fd(&self) -> Result<RawFd> {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            Ok(self.inner.poll.borrow().as_raw_fd())
        }
        #[cfg(not(unix))]
        {
            Err(Error::Unsupported("the poller has no readable fd here"))
        }
    }

    /// One zero-timeout dispatch pass: deliver whatever is ready, never
    /// block.
    pub fn process_fd(&self) -> Result<()> {
        match self.wait_and_process(Some(Duration::ZERO)) {
            Err(Error::Timeout) => Ok(()),
            other => other,
        }
    }

    /// Wait for readiness, timers or a wakeup, and dispatch callbacks.
    ///
    /// Returns `Ok(())` once at least one delivery happened, `Timeout`
    /// when `timeout` elapsed with nothing to do. `None` waits forever.
    ///
    /// # Errors
    ///
    /// `Busy` when called from inside a callback of the same loop.
    pub fn wait_and_process(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let now = Instant::now();
            let poll_timeout = self.poll_timeout(deadline, now);
            if self.dispatch_one_pass(poll_timeout)? {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// How long one poll call may sleep: bounded by the caller's deadline
    /// and the earliest timer.
    fn poll_timeout(&self, deadline: Option<Instant>, now: Instant) -> Option<Duration> {
        let next_timer = self.inner.timers.borrow_mut().next_deadline();
        let bound = match (deadline, next_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        bound.map(|at| at.saturating_duration_since(now))
    }

    /// Run one poll-and-dispatch pass. True if anything was delivered.
    fn dispatch_one_pass(&self, poll_timeout: Option<Duration>) -> Result<bool> {
        if self.inner.processing.replace(true) {
            return Err(Error::Busy("loop is already processing"));
        }
        let result = self.dispatch_inner(poll_timeout);
        self.inner.processing.set(false);
        result
    }

    fn dispatch_inner(&self, poll_timeout: Option<Duration>) -> Result<bool> {
        let mut ready = Vec::new();
        let mut woken = false;
        {
            let mut events = self
                .inner
                .events
                .try_borrow_mut()
                .map_err(|_| Error::Busy("loop is already processing"))?;
            let mut poll = self
                .inner
                .poll
                .try_borrow_mut()
                .map_err(|_| Error::Busy("loop is already processing"))?;
            match poll.poll(&mut events, poll_timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(false),
                Err(err) => return Err(err.into()),
            }
            drop(poll);

            let sources = self.inner.sources.borrow();
            let by_token = self.inner.by_token.borrow();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    self.inner.wake_pending.store(false, Ordering::Release);
                    woken = true;
                    continue;
                }
                let Some(&fd) = by_token.get(&event.token()) else {
                    continue;
                };
                let Some(entry) = sources.get(&fd) else {
                    continue;
                };
                let readiness = Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    error: event.is_error(),
                    closed: event.is_read_closed() || event.is_write_closed(),
                };
                ready.push((Rc::clone(&entry.cb), entry.token, fd, readiness));
            }
        }

        let mut processed = woken;
        for (cb, token, fd, readiness) in ready {
            // A previous callback may have removed or replaced this fd.
            let still_current = self
                .inner
                .sources
                .borrow()
                .get(&fd)
                .is_some_and(|entry| entry.token == token);
            if !still_current {
                continue;
            }
            (&mut *cb.borrow_mut())(fd, readiness);
            processed = true;
        }

        let due = self.inner.timers.borrow_mut().collect_due(Instant::now());
        for cb in due {
            (&mut *cb.borrow_mut())();
            processed = true;
        }

        let idles: Vec<_> = self.inner.idles.borrow_mut().drain(..).collect();
        for idle in idles {
            idle();
        }

        Ok(processed)
    }

    /// Cross-thread wakeup handle. Clone it freely; it stays valid for the
    /// life of the loop.
    #[must_use]
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            waker: Arc::clone(&self.inner.waker),
            pending: Arc::clone(&self.inner.wake_pending),
        }
    }

    /// Wake the loop from this thread; see [`LoopWaker::wakeup`].
    pub fn wakeup(&self) -> Result<()> {
        self.waker().wakeup()
    }
}

/// Sendable wakeup handle for one [`EventLoop`].
///
/// The only part of the loop that may be touched from another thread or a
/// signal handler. The pending flag swallows repeated wakeups between two
/// dispatch passes, so a storm of callers costs one write.
#[derive(Debug, Clone)]
pub struct LoopWaker {
    waker: Arc<Waker>,
    pending: Arc<AtomicBool>,
}

impl LoopWaker {
    /// Make the loop's `wait_and_process` return promptly.
    pub fn wakeup(&self) -> Result<()> {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.waker.wake()?;
        }
        Ok(())
    }
}
