//! Endpoint orchestrator.
//!
//! A [`Context`] turns one socket endpoint into a stream of callbacks:
//! `listen` makes a server owning many connections, `connect` a client
//! owning at most one (with silent, timer-driven reconnection), `bind` a
//! datagram endpoint. All of it runs on a single [`EventLoop`], owned by
//! the context or shared with other contexts.

use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{self, Backlog, SockFlag, SockType, SockaddrStorage, sockopt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::conn::{ConnState, Connection, SocketStatus};
use crate::error::{Error, Result};
use crate::evloop::{EventLoop, LoopWaker, Readiness, Timer, Watch};
use crate::message::{MAX_MSG_SIZE, Message};

/// Tuning knobs of a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Delay between a client losing its server and the next connection
    /// attempt. Reconnection keeps retrying at this interval.
    #[serde(default = "default_reconnect_delay")]
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Upper bound for one frame, header included, on both the encode and
    /// the receive path. Capped by the protocol hard limit.
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: u32,
}

const fn default_reconnect_delay() -> Duration {
    Duration::from_secs(2)
}

const fn default_max_msg_size() -> u32 {
    MAX_MSG_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect_delay: default_reconnect_delay(),
            max_msg_size: default_max_msg_size(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.max_msg_size < crate::message::HEADER_SIZE as u32
            || self.max_msg_size > MAX_MSG_SIZE
        {
            return Err(Error::InvalidArgument("max_msg_size out of range"));
        }
        Ok(())
    }
}

/// What happened on a context, as seen by its handler.
#[derive(Debug)]
pub enum Event<'a> {
    /// A connection became usable (accepted, or client connect finished).
    Connected(&'a Connection),
    /// A connection went away. Delivered exactly once per connection.
    Disconnected(&'a Connection),
    /// One complete message arrived. Owned by the library for the duration
    /// of the callback; use [`Message::try_clone`] to keep it.
    Msg(&'a Connection, &'a Message),
}

impl Event<'_> {
    /// The kind without the borrowed payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected(_) => EventKind::Connected,
            Self::Disconnected(_) => EventKind::Disconnected,
            Self::Msg(..) => EventKind::Msg,
        }
    }
}

/// Discriminant of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// See [`Event::Connected`].
    Connected,
    /// See [`Event::Disconnected`].
    Disconnected,
    /// See [`Event::Msg`].
    Msg,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("CONNECTED"),
            Self::Disconnected => f.write_str("DISCONNECTED"),
            Self::Msg => f.write_str("MSG"),
        }
    }
}

/// Handler invoked for every context event, always on the loop thread.
pub type Handler = Box<dyn FnMut(&Context, Event<'_>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Server,
    Client,
    Dgram,
}

struct Core {
    lp: EventLoop,
    cfg: Config,
    handler: RefCell<Handler>,
    mode: Cell<Mode>,
    /// True when the active endpoint is a unix-domain socket.
    local_domain: Cell<bool>,
    listen_fd: RefCell<Option<OwnedFd>>,
    conns: RefCell<Vec<Rc<Connection>>>,
    client: RefCell<Option<Rc<Connection>>>,
    target: RefCell<Option<Addr>>,
    reconnect: RefCell<Option<Timer>>,
    dgram_conn: RefCell<Option<Rc<Connection>>>,
    dropped: Cell<u64>,
    dispatch_depth: Cell<u32>,
}

/// Handle to one endpoint. Clones share the same endpoint.
#[derive(Clone)]
pub struct Context {
    core: Rc<Core>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("mode", &self.core.mode.get())
            .field("connections", &self.core.conns.borrow().len())
            .finish()
    }
}

impl Context {
    /// Context with a default config and its own loop.
    pub fn new(handler: Handler) -> Result<Self> {
        Self::with_config(Config::default(), handler)
    }

    /// Context with `cfg` and its own loop.
    pub fn with_config(cfg: Config, handler: Handler) -> Result<Self> {
        Self::build(EventLoop::new()?, cfg, handler)
    }

    /// Context driven by a shared loop. Several contexts can ride one
    /// loop; each keeps its own handler.
    pub fn with_loop(lp: &EventLoop, cfg: Config, handler: Handler) -> Result<Self> {
        Self::build(lp.clone(), cfg, handler)
    }

    fn build(lp: EventLoop, cfg: Config, handler: Handler) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            core: Rc::new(Core {
                lp,
                cfg,
                handler: RefCell::new(handler),
                mode: Cell::new(Mode::Idle),
                local_domain: Cell::new(false),
                listen_fd: RefCell::new(None),
                conns: RefCell::new(Vec::new()),
                client: RefCell::new(None),
                target: RefCell::new(None),
                reconnect: RefCell::new(None),
                dgram_conn: RefCell::new(None),
                dropped: Cell::new(0),
                dispatch_depth: Cell::new(0),
            }),
        })
    }

    /// The loop driving this context.
    #[must_use]
    pub fn event_loop(&self) -> EventLoop {
        self.core.lp.clone()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.core.cfg
    }

    /// Start a server on `addr`.
    ///
    /// # Errors
    ///
    /// `Busy` if the context is already listening, connected or bound.
    pub fn listen(&self, addr: &Addr) -> Result<()> {
        self.core.require_idle()?;
        let fd = open_socket(addr, SockType::Stream)?;
        if !addr.is_unix() {
            socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        }
        if let Some(path) = addr.unix_path() {
            // A previous crash may have left the socket file behind.
            let _ = std::fs::remove_file(path);
        }
        addr.to_os()?.bind(fd.as_raw_fd())?;
        socket::listen(&fd, Backlog::new(128)?)?;

        let raw = fd.as_raw_fd();
        let weak = Rc::downgrade(&self.core);
        self.core.lp.add(raw, Watch::READ, move |_, _| {
            if let Some(core) = weak.upgrade() {
                Core::handle_accept(&core);
            }
        })?;
        self.core.local_domain.set(addr.is_unix());
        *self.core.listen_fd.borrow_mut() = Some(fd);
        self.core.mode.set(Mode::Server);
        info!(%addr, "listening");
        Ok(())
    }

    /// Start a client towards `addr`.
    ///
    /// The first attempt is made immediately; failures are silent and
    /// retried every [`Config::reconnect_delay`] until `Connected` is
    /// delivered or the context is stopped.
    pub fn connect(&self, addr: &Addr) -> Result<()> {
        self.core.require_idle()?;
        self.core.local_domain.set(addr.is_unix());
        *self.core.target.borrow_mut() = Some(addr.clone());
        self.core.mode.set(Mode::Client);
        info!(%addr, "client starting");
        Core::start_connect(&self.core);
        Ok(())
    }

    /// Bind a datagram endpoint on `addr`.
    pub fn bind(&self, addr: &Addr) -> Result<()> {
        self.core.require_idle()?;
        let fd = open_socket(addr, SockType::Datagram)?;
        if !addr.is_unix() {
            socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        }
        if let Some(path) = addr.unix_path() {
            let _ = std::fs::remove_file(path);
        }
        addr.to_os()?.bind(fd.as_raw_fd())?;

        let conn = Connection::dgram(
            self.core.lp.clone(),
            fd,
            addr.is_unix(),
            self.core.cfg.max_msg_size,
        );
        conn.load_endpoints();
        let raw = conn.raw_fd();
        let weak = Rc::downgrade(&self.core);
        self.core.lp.add(raw, Watch::READ, move |_, _| {
            if let Some(core) = weak.upgrade() {
                Core::handle_dgram_readable(&core);
            }
        })?;
        self.core.local_domain.set(addr.is_unix());
        *self.core.dgram_conn.borrow_mut() = Some(conn);
        self.core.mode.set(Mode::Dgram);
        info!(%addr, "datagram endpoint bound");
        Ok(())
    }

    /// Stop the endpoint: close the listening/bound/connecting socket,
    /// tear down every live connection (each delivers `Disconnected`), and
    /// drop queued sends. Idempotent; the context can listen, connect or
    /// bind again afterwards.
    pub fn stop(&self) -> Result<()> {
        let core = &self.core;
        if core.mode.get() == Mode::Idle {
            return Ok(());
        }
        core.mode.set(Mode::Idle);
        core.reconnect.borrow_mut().take();
        *core.target.borrow_mut() = None;

        if let Some(fd) = core.listen_fd.borrow_mut().take() {
            let _ = core.lp.remove(fd.as_raw_fd());
        }
        if let Some(conn) = core.dgram_conn.borrow_mut().take() {
            let _ = core.lp.remove(conn.raw_fd());
        }
        let conns: Vec<_> = core.conns.borrow_mut().drain(..).collect();
        for conn in conns {
            Core::teardown(core, &conn, true, false);
        }
        if let Some(conn) = core.client.borrow_mut().take() {
            Core::teardown(core, &conn, true, false);
        }
        info!("context stopped");
        Ok(())
    }

    /// Send a finished message.
    ///
    /// Servers broadcast to every established connection by sharing the
    /// frame buffer (descriptor-bearing messages get per-peer duplicates,
    /// since the kernel consumes ancillary data at send time). Clients
    /// send to their single connection.
    pub fn send_msg(&self, msg: &Message) -> Result<()> {
        let core = &self.core;
        match core.mode.get() {
            Mode::Server => {
                let conns: Vec<_> = core.conns.borrow().clone();
                let fd_bearing = msg.buffer().fd_count() > 0;
                for conn in conns {
                    if conn.state() != ConnState::Established {
                        continue;
                    }
                    let result = if fd_bearing {
                        Core::enqueue_fd_copy(&conn, msg)
                    } else {
                        conn.send_msg(msg)
                    };
                    if let Err(err) = result {
                        warn!(fd = conn.raw_fd(), %err, "broadcast skipped a peer");
                    }
                }
                Ok(())
            }
            Mode::Client => {
                let conn = core.client.borrow().clone().ok_or(Error::NotConnected)?;
                conn.send_msg(msg)
            }
            Mode::Dgram => Err(Error::InvalidArgument(
                "datagram context needs a destination address",
            )),
            Mode::Idle => Err(Error::NotConnected),
        }
    }

    /// Encode and send in one call.
    pub fn send(&self, msgid: u32, fmt: &str, args: &[crate::codec::Arg<'_>]) -> Result<()> {
        self.send_msg(&Message::with_args(msgid, fmt, args)?)
    }

    /// Send one datagram to `addr`. The whole frame travels in a single
    /// `sendto`; the datagram boundary is the frame.
    pub fn send_msg_to(&self, msg: &Message, addr: &Addr) -> Result<()> {
        let core = &self.core;
        if core.mode.get() != Mode::Dgram {
            return Err(Error::InvalidArgument(
                "sending to an address needs a datagram context",
            ));
        }
        let conn = core.dgram_conn.borrow().clone().ok_or(Error::NotConnected)?;
        conn.set_peer_addr(Some(addr.clone()));
        conn.send_msg(msg)
    }

    /// Encode and send one datagram to `addr`.
    pub fn send_to(
        &self,
        addr: &Addr,
        msgid: u32,
        fmt: &str,
        args: &[crate::codec::Arg<'_>],
    ) -> Result<()> {
        self.send_msg_to(&Message::with_args(msgid, fmt, args)?, addr)
    }

    /// Live server connections, in accept order.
    #[must_use]
    pub fn connections(&self) -> Vec<Rc<Connection>> {
        self.core.conns.borrow().clone()
    }

    /// The client's connection once established.
    #[must_use]
    pub fn connection(&self) -> Option<Rc<Connection>> {
        self.core
            .client
            .borrow()
            .clone()
            .filter(|conn| conn.state() == ConnState::Established)
    }

    /// Datagrams dropped for failing magic/size validation.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.core.dropped.get()
    }

    /// Drive the loop once; see [`EventLoop::wait_and_process`].
    pub fn wait_and_process(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.lp.wait_and_process(timeout)
    }

    /// One non-blocking dispatch pass; see [`EventLoop::process_fd`].
    pub fn process_fd(&self) -> Result<()> {
        self.core.lp.process_fd()
    }

    /// The loop's pollable descriptor, for embedding in a foreign loop.
    pub fn get_fd(&self) -> Result<RawFd> {
        self.core.lp.get_fd()
    }

    /// Wake the loop from any thread.
    pub fn wakeup(&self) -> Result<()> {
        self.core.lp.wakeup()
    }

    /// Sendable wakeup handle; see [`LoopWaker`].
    #[must_use]
    pub fn waker(&self) -> LoopWaker {
        self.core.lp.waker()
    }
}

impl Core {
    fn require_idle(&self) -> Result<()> {
        if self.mode.get() != Mode::Idle {
            return Err(Error::Busy("context is already active"));
        }
        Ok(())
    }

    fn deliver(core: &Rc<Self>, event: Event<'_>) {
        core.dispatch_depth.set(core.dispatch_depth.get() + 1);
        let ctx = Context {
            core: Rc::clone(core),
        };
        (&mut *core.handler.borrow_mut())(&ctx, event);
        core.dispatch_depth.set(core.dispatch_depth.get() - 1);
    }

    /// Deliver `Disconnected`, deferring when a handler is already on the
    /// stack (a `stop` from inside a callback). The connection is already
    /// unreachable either way.
    fn deliver_disconnected(core: &Rc<Self>, conn: Rc<Connection>) {
        if core.dispatch_depth.get() > 0 {
            let weak = Rc::downgrade(core);
            core.lp.idle_add(move || {
                if let Some(core) = weak.upgrade() {
                    Self::deliver(&core, Event::Disconnected(&conn));
                }
            });
        } else {
            Self::deliver(core, Event::Disconnected(&conn));
        }
    }

    /// Accept until the socket would block.
    fn handle_accept(core: &Rc<Self>) {
        loop {
            let raw_listen = match core.listen_fd.borrow().as_ref() {
                Some(fd) => fd.as_raw_fd(),
                None => return,
            };
            let fd = match accept_nonblocking(raw_listen) {
                Ok(fd) => fd,
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR | Errno::ECONNABORTED) => continue,
                Err(errno) => {
                    warn!(%errno, "accept failed");
                    return;
                }
            };
            if !core.local_domain.get() {
                let _ = socket::setsockopt(&fd, sockopt::TcpNoDelay, &true);
            }
            let conn = Connection::stream(
                core.lp.clone(),
                fd,
                core.local_domain.get(),
                ConnState::Established,
                core.cfg.max_msg_size,
            );
            conn.load_endpoints();
            if Self::register_conn(core, &conn).is_err() {
                continue;
            }
            core.conns.borrow_mut().push(Rc::clone(&conn));
            info!(fd = conn.raw_fd(), peer = ?conn.peer_addr(), "connection accepted");
            Self::deliver(core, Event::Connected(&conn));
        }
    }

    fn register_conn(core: &Rc<Self>, conn: &Rc<Connection>) -> Result<()> {
        let weak = Rc::downgrade(core);
        let conn_cb = Rc::clone(conn);
        let watch = if conn.state() == ConnState::Connecting {
            Watch::WRITE
        } else {
            Watch::READ
        };
        core.lp.add(conn.raw_fd(), watch, move |_, readiness| {
            if let Some(core) = weak.upgrade() {
                Self::handle_conn_event(&core, &conn_cb, readiness);
            }
        })
    }

    fn handle_conn_event(core: &Rc<Self>, conn: &Rc<Connection>, readiness: Readiness) {
        if conn.state() == ConnState::Connecting {
            Self::finish_connect(core, conn);
            return;
        }
        if readiness.writable {
            match conn.handle_writable() {
                SocketStatus::Open => {}
                SocketStatus::Closed | SocketStatus::Poisoned(_) => {
                    Self::teardown(core, conn, true, true);
                    return;
                }
            }
        }
        if readiness.readable || readiness.closed || readiness.error {
            let (msgs, status) = conn.handle_readable();
            for msg in msgs {
                if conn.state() == ConnState::Closed {
                    // A callback stopped the context; the rest of the batch
                    // dies with the connection.
                    return;
                }
                debug!(fd = conn.raw_fd(), msgid = msg.id(), "message dispatched");
                Self::deliver(core, Event::Msg(conn, &msg));
            }
            match status {
                SocketStatus::Open => {}
                SocketStatus::Closed => Self::teardown(core, conn, true, true),
                SocketStatus::Poisoned(err) => {
                    warn!(fd = conn.raw_fd(), %err, "connection poisoned");
                    Self::teardown(core, conn, true, true);
                }
            }
        }
    }

    /// First attempt or retry of the client connection.
    fn start_connect(core: &Rc<Self>) {
        let Some(addr) = core.target.borrow().clone() else {
            return;
        };
        let attempt = (|| -> Result<Rc<Connection>> {
            let fd = open_socket(&addr, SockType::Stream)?;
            match addr.to_os()?.connect(fd.as_raw_fd()) {
                // In-flight or immediately connected; either way the
                // writable event finishes the job.
                Ok(()) | Err(Errno::EINPROGRESS | Errno::EAGAIN | Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
            if !addr.is_unix() {
                let _ = socket::setsockopt(&fd, sockopt::TcpNoDelay, &true);
            }
            let conn = Connection::stream(
                core.lp.clone(),
                fd,
                addr.is_unix(),
                ConnState::Connecting,
                core.cfg.max_msg_size,
            );
            Self::register_conn(core, &conn)?;
            Ok(conn)
        })();
        match attempt {
            Ok(conn) => {
                *core.client.borrow_mut() = Some(conn);
            }
            Err(err) => {
                debug!(%addr, %err, "connect attempt failed, retrying");
                Self::arm_reconnect(core);
            }
        }
    }

    /// Writable on a connecting socket: `SO_ERROR` decides.
    fn finish_connect(core: &Rc<Self>, conn: &Rc<Connection>) {
        let err = socket::getsockopt(&conn.fd(), sockopt::SocketError)
            .unwrap_or(Errno::EINVAL as i32);
        if err == 0 {
            conn.set_state(ConnState::Established);
            conn.load_endpoints();
            let watch = if conn.has_pending_writes() {
                Watch::READ_WRITE
            } else {
                Watch::READ
            };
            let _ = core.lp.update(conn.raw_fd(), watch);
            info!(fd = conn.raw_fd(), peer = ?conn.peer_addr(), "connected");
            Self::deliver(core, Event::Connected(conn));
        } else {
            debug!(fd = conn.raw_fd(), errno = err, "connect failed, retrying");
            Self::teardown(core, conn, false, true);
        }
    }

    fn arm_reconnect(core: &Rc<Self>) {
        if core.mode.get() != Mode::Client {
            return;
        }
        let mut slot = core.reconnect.borrow_mut();
        if slot.is_none() {
            let weak = Rc::downgrade(core);
            *slot = Some(Timer::new(&core.lp, move || {
                if let Some(core) = weak.upgrade() {
                    Self::start_connect(&core);
                }
            }));
        }
        if let Some(timer) = slot.as_ref() {
            let _ = timer.set(core.cfg.reconnect_delay);
        }
    }

    /// Remove a connection from the loop and the context. Delivers
    /// `Disconnected` at most once, and only for connections that were
    /// established.
    fn teardown(core: &Rc<Self>, conn: &Rc<Connection>, deliver: bool, may_reconnect: bool) {
        let prev = conn.state();
        if prev == ConnState::Closed {
            return;
        }
        conn.set_state(ConnState::Closed);
        let _ = core.lp.remove(conn.raw_fd());
        conn.abandon();
        core.conns.borrow_mut().retain(|c| !Rc::ptr_eq(c, conn));
        let was_client = core
            .client
            .borrow()
            .as_ref()
            .is_some_and(|c| Rc::ptr_eq(c, conn));
        if was_client {
            *core.client.borrow_mut() = None;
        }

        let was_live = matches!(prev, ConnState::Established | ConnState::Closing);
        if deliver && was_live {
            info!(fd = conn.raw_fd(), "disconnected");
            Self::deliver_disconnected(core, Rc::clone(conn));
        }
        if may_reconnect && core.mode.get() == Mode::Client {
            Self::arm_reconnect(core);
        }
    }

    /// Per-peer buffer duplicate for a descriptor-bearing broadcast.
    fn enqueue_fd_copy(conn: &Rc<Connection>, msg: &Message) -> Result<()> {
        if !conn.is_local() {
            return Err(Error::Unsupported(
                "descriptor passing needs a local stream socket",
            ));
        }
        let copy = msg.buffer().try_clone()?;
        conn.enqueue(Arc::new(copy));
        Ok(())
    }

    /// Drain every waiting datagram; each one is a whole frame or it is
    /// dropped.
    fn handle_dgram_readable(core: &Rc<Self>) {
        loop {
            let Some(conn) = core.dgram_conn.borrow().clone() else {
                return;
            };
            let mut scratch = [0u8; 65536];
            let (len, from) =
                match socket::recvfrom::<SockaddrStorage>(conn.raw_fd(), &mut scratch) {
                    Ok((len, from)) => (len, from),
                    Err(Errno::EAGAIN) => return,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => {
                        warn!(%errno, "datagram read failed");
                        return;
                    }
                };
            let mut buffer = Buffer::with_capacity(len);
            buffer.extend_from_slice(&scratch[..len]);
            match Message::from_frame(buffer) {
                Ok(msg) => {
                    conn.set_peer_addr(from.as_ref().and_then(Addr::from_storage));
                    debug!(msgid = msg.id(), len, "datagram dispatched");
                    Self::deliver(core, Event::Msg(&conn, &msg));
                }
                Err(err) => {
                    core.dropped.set(core.dropped.get() + 1);
                    warn!(%err, len, "malformed datagram dropped");
                }
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        // Last handle gone: unhook every fd so the loop (possibly shared)
        // stops referencing the connections. Sockets close with their
        // owners; no events are delivered from a destructor.
        if let Some(fd) = self.listen_fd.borrow().as_ref() {
            let _ = self.lp.remove(fd.as_raw_fd());
        }
        if let Some(conn) = self.dgram_conn.borrow().as_ref() {
            let _ = self.lp.remove(conn.raw_fd());
        }
        for conn in self.conns.borrow().iter() {
            let _ = self.lp.remove(conn.raw_fd());
        }
        if let Some(conn) = self.client.borrow().as_ref() {
            let _ = self.lp.remove(conn.raw_fd());
        }
    }
}

fn open_socket(addr: &Addr, ty: SockType) -> Result<OwnedFd> {
    let fd = socket::socket(
        addr.family(),
        ty,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    Ok(fd)
}

fn accept_nonblocking(listen_fd: RawFd) -> nix::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        let raw = socket::accept4(
            listen_fd,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;
        // SAFETY: accept4 returned a fresh descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
        let raw = socket::accept(listen_fd)?;
        // SAFETY: accept returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        fcntl(raw, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(fd)
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(2));
        assert_eq!(cfg.max_msg_size, MAX_MSG_SIZE);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(2));

        let cfg: Config = serde_json::from_str(r#"{"reconnect_delay": "250ms"}"#).unwrap();
        assert_eq!(cfg.reconnect_delay, Duration::from_millis(250));
    }

    #[test]
    fn config_rejects_oversized_cap() {
        let cfg = Config {
            max_msg_size: MAX_MSG_SIZE + 1,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn event_kind_renders_like_the_wire_log() {
        assert_eq!(EventKind::Connected.to_string(), "CONNECTED");
        assert_eq!(EventKind::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(EventKind::Msg.to_string(), "MSG");
    }

    #[test]
    fn double_activation_is_busy() {
        let ctx = Context::new(Box::new(|_, _| {})).unwrap();
        let addr: Addr = "inet:127.0.0.1:0".parse().unwrap();
        ctx.listen(&addr).unwrap();
        assert!(matches!(ctx.listen(&addr), Err(Error::Busy(_))));
        assert!(matches!(ctx.connect(&addr), Err(Error::Busy(_))));
        ctx.stop().unwrap();
        // Reusable after stop.
        ctx.listen(&addr).unwrap();
        ctx.stop().unwrap();
    }

    #[test]
    fn send_without_endpoint_is_not_connected() {
        let ctx = Context::new(Box::new(|_, _| {})).unwrap();
        assert!(matches!(
            ctx.send(1, "%u", &[crate::codec::Arg::U32(1)]),
            Err(Error::NotConnected)
        ));
    }
}
