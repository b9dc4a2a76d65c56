//! Per-socket nonblocking framer.
//!
//! A [`Connection`] owns one socket and the state to move whole messages
//! across it without blocking: a read buffer reassembling frames across
//! packet boundaries, a FIFO of pending ancillary descriptors, and a write
//! queue of shared frame buffers flushed on writable readiness. The owning
//! context drives it from loop callbacks and delivers the resulting events.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use bytes::BytesMut;
use nix::errno::Errno;
use nix::sys::socket::{
    self, ControlMessage, ControlMessageOwned, MsgFlags, Shutdown, SockaddrStorage,
};
use tracing::{debug, warn};

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::evloop::{EventLoop, Watch};
use crate::message::{HEADER_SIZE, Message, parse_header};

/// Read chunk size. One drain loop keeps reading until `EAGAIN`, so this
/// only bounds the per-call copy, not throughput.
const READ_CHUNK: usize = 4096;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Client socket with `connect` in flight.
    Connecting,
    /// Live: messages flow both ways.
    Established,
    /// Error or shutdown seen; teardown pending.
    Closing,
    /// Torn down; the context no longer references it.
    Closed,
}

/// Frame reassembly phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for the 12 header bytes.
    NeedHeader,
    /// Header parsed; waiting for the full frame of this size.
    NeedBody(u32),
    /// Poisoned or closing; the framer no longer advances.
    Idle,
}

/// Credentials of the peer process on a local socket, read once via
/// `SO_PEERCRED` when the connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// User id of the peer process.
    pub uid: u32,
    /// Group id of the peer process.
    pub gid: u32,
    /// Process id of the peer, when the platform reports it.
    pub pid: Option<i32>,
}

/// What a socket pass concluded.
#[derive(Debug)]
pub(crate) enum SocketStatus {
    /// The socket stays usable.
    Open,
    /// Peer closed or a transport error; the connection must be torn down.
    Closed,
    /// Framing violation; the connection is poisoned and must be torn
    /// down.
    Poisoned(Error),
}

#[derive(Debug)]
struct QueueEntry {
    buf: Arc<Buffer>,
    off: usize,
    /// Ancillary descriptors go out with the first bytes of the entry,
    /// then never again.
    fds_sent: bool,
}

/// One peer socket with framing state.
#[derive(Debug)]
pub struct Connection {
    lp: EventLoop,
    fd: OwnedFd,
    /// Local (unix-domain) sockets carry ancillary data and credentials.
    local_domain: bool,
    dgram: bool,
    state: Cell<ConnState>,
    read_state: Cell<ReadState>,
    read_buf: RefCell<BytesMut>,
    pending_fds: RefCell<VecDeque<OwnedFd>>,
    write_queue: RefCell<VecDeque<QueueEntry>>,
    local_addr: RefCell<Option<Addr>>,
    peer_addr: RefCell<Option<Addr>>,
    peer_creds: Cell<Option<PeerCredentials>>,
    max_msg_size: u32,
}

impl Connection {
    pub(crate) fn stream(
        lp: EventLoop,
        fd: OwnedFd,
        local_domain: bool,
        state: ConnState,
        max_msg_size: u32,
    ) -> Rc<Self> {
        Rc::new(Self {
            lp,
            fd,
            local_domain,
            dgram: false,
            state: Cell::new(state),
            read_state: Cell::new(ReadState::NeedHeader),
            read_buf: RefCell::new(BytesMut::new()),
            pending_fds: RefCell::new(VecDeque::new()),
            write_queue: RefCell::new(VecDeque::new()),
            local_addr: RefCell::new(None),
            peer_addr: RefCell::new(None),
            peer_creds: Cell::new(None),
            max_msg_size,
        })
    }

    pub(crate) fn dgram(
        lp: EventLoop,
        fd: OwnedFd,
        local_domain: bool,
        max_msg_size: u32,
    ) -> Rc<Self> {
        Rc::new(Self {
            lp,
            fd,
            local_domain,
            dgram: true,
            state: Cell::new(ConnState::Established),
            read_state: Cell::new(ReadState::Idle),
            read_buf: RefCell::new(BytesMut::new()),
            pending_fds: RefCell::new(VecDeque::new()),
            write_queue: RefCell::new(VecDeque::new()),
            local_addr: RefCell::new(None),
            peer_addr: RefCell::new(None),
            peer_creds: Cell::new(None),
            max_msg_size,
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub(crate) fn is_local(&self) -> bool {
        self.local_domain
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.set(state);
    }

    /// Address of this end of the socket, once known.
    #[must_use]
    pub fn local_addr(&self) -> Option<Addr> {
        self.local_addr.borrow().clone()
    }

    /// Address of the peer, once known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<Addr> {
        self.peer_addr.borrow().clone()
    }

    pub(crate) fn set_peer_addr(&self, addr: Option<Addr>) {
        *self.peer_addr.borrow_mut() = addr;
    }

    /// Peer process credentials, available on local sockets.
    #[must_use]
    pub fn peer_creds(&self) -> Option<PeerCredentials> {
        self.peer_creds.get()
    }

    /// Refresh kernel-reported addresses and, on local sockets, the peer
    /// credentials. Called when the connection becomes established.
    pub(crate) fn load_endpoints(&self) {
        let fd = self.raw_fd();
        if let Ok(ss) = socket::getsockname::<SockaddrStorage>(fd) {
            *self.local_addr.borrow_mut() = Addr::from_storage(&ss);
        }
        if let Ok(ss) = socket::getpeername::<SockaddrStorage>(fd) {
            *self.peer_addr.borrow_mut() = Addr::from_storage(&ss);
        }
        if self.local_domain {
            self.peer_creds.set(read_peer_creds(&self.fd));
        }
    }

    /// Queue a finished message for sending.
    ///
    /// The frame bytes are shared by reference, not copied. Descriptors
    /// attached to the message ride out with the entry's first bytes.
    ///
    /// # Errors
    ///
    /// `NotConnected` unless the connection is established, `Unsupported`
    /// for descriptor-bearing messages on anything but a local stream
    /// socket.
    pub fn send_msg(&self, msg: &Message) -> Result<()> {
        let buf = msg.shared_buf()?;
        if buf.fd_count() > 0 && !(self.local_domain && !self.dgram) {
            return Err(Error::Unsupported(
                "descriptor passing needs a local stream socket",
            ));
        }
        if self.state.get() != ConnState::Established {
            return Err(Error::NotConnected);
        }
        if self.dgram {
            return self.send_dgram(&buf);
        }
        self.enqueue(buf);
        Ok(())
    }

    pub(crate) fn enqueue(&self, buf: Arc<Buffer>) {
        let mut queue = self.write_queue.borrow_mut();
        queue.push_back(QueueEntry {
            buf,
            off: 0,
            fds_sent: false,
        });
        if queue.len() == 1 {
            // First pending entry: start watching for writable.
            let _ = self.lp.update(self.raw_fd(), Watch::READ_WRITE);
        }
    }

    /// One `sendto` carries the whole datagram; the datagram boundary is
    /// the frame.
    fn send_dgram(&self, buf: &Buffer) -> Result<()> {
        let peer = self
            .peer_addr
            .borrow()
            .clone()
            .ok_or(Error::NotConnected)?;
        let os = peer.to_os()?;
        match os.sendto(self.raw_fd(), buf.as_slice(), MsgFlags::empty()) {
            Ok(_) => Ok(()),
            Err(Errno::EMSGSIZE) => Err(Error::TooLarge {
                what: "datagram",
                size: buf.len(),
                max: u16::MAX as usize,
            }),
            Err(errno) => Err(errno.into()),
        }
    }

    /// Ask the kernel to end the conversation. The readable event that
    /// follows takes the normal teardown path, so `Disconnected` is still
    /// delivered exactly once.
    pub fn disconnect(&self) -> Result<()> {
        if matches!(self.state.get(), ConnState::Closing | ConnState::Closed) {
            return Ok(());
        }
        self.state.set(ConnState::Closing);
        match socket::shutdown(self.raw_fd(), Shutdown::Both) {
            Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }

    /// Drain the socket and reassemble complete messages.
    pub(crate) fn handle_readable(&self) -> (Vec<Message>, SocketStatus) {
        let mut closed = false;
        loop {
            let mut scratch = [0u8; READ_CHUNK];
            match self.recv_chunk(&mut scratch) {
                RecvOutcome::Data(n, fds) => {
                    self.read_buf.borrow_mut().extend_from_slice(&scratch[..n]);
                    let mut pending = self.pending_fds.borrow_mut();
                    for fd in fds {
                        pending.push_back(fd);
                    }
                }
                RecvOutcome::WouldBlock => break,
                RecvOutcome::Eof | RecvOutcome::Gone => {
                    closed = true;
                    break;
                }
            }
        }
        match self.extract_frames() {
            Ok(msgs) => (
                msgs,
                if closed {
                    SocketStatus::Closed
                } else {
                    SocketStatus::Open
                },
            ),
            Err(err) => (Vec::new(), SocketStatus::Poisoned(err)),
        }
    }

    fn recv_chunk(&self, scratch: &mut [u8]) -> RecvOutcome {
        loop {
            let res = if self.local_domain {
                self.recvmsg_chunk(scratch)
            } else {
                socket::recv(self.raw_fd(), scratch, MsgFlags::empty())
                    .map(|n| (n, Vec::new()))
            };
            return match res {
                Ok((0, _)) => RecvOutcome::Eof,
                Ok((n, fds)) => RecvOutcome::Data(n, fds),
                Err(Errno::EAGAIN) => RecvOutcome::WouldBlock,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    debug!(fd = self.raw_fd(), %errno, "read failed");
                    RecvOutcome::Gone
                }
            };
        }
    }

    /// `recvmsg` variant for local sockets: ancillary descriptors are
    /// collected alongside the bytes.
    fn recvmsg_chunk(&self, scratch: &mut [u8]) -> nix::Result<(usize, Vec<OwnedFd>)> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = MsgFlags::MSG_CMSG_CLOEXEC;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = MsgFlags::empty();

        let mut iov = [IoSliceMut::new(scratch)];
        let mut cmsg = nix::cmsg_space!([RawFd; 16]);
        let received =
            socket::recvmsg::<SockaddrStorage>(self.raw_fd(), &mut iov, Some(&mut cmsg), flags)?;
        let mut fds = Vec::new();
        match received.cmsgs() {
            Ok(cmsgs) => {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                        for raw in raw_fds {
                            // SAFETY: SCM_RIGHTS installs fresh descriptors
                            // owned by this process; nothing else closes
                            // them.
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
            }
            Err(errno) => {
                warn!(fd = self.raw_fd(), %errno, "ancillary data truncated");
            }
        }
        Ok((received.bytes, fds))
    }

    /// Advance the two-phase framer over the read buffer.
    ///
    /// Ancillary descriptors received since the previous frame boundary
    /// attach to the frame completed next, in FIFO order.
    fn extract_frames(&self) -> Result<Vec<Message>> {
        let mut msgs = Vec::new();
        let mut read_buf = self.read_buf.borrow_mut();
        loop {
            match self.read_state.get() {
                ReadState::Idle => break,
                ReadState::NeedHeader => {
                    if read_buf.len() < HEADER_SIZE {
                        break;
                    }
                    let mut header = [0u8; HEADER_SIZE];
                    header.copy_from_slice(&read_buf[..HEADER_SIZE]);
                    let header = parse_header(&header, self.max_msg_size).inspect_err(|err| {
                        warn!(fd = self.raw_fd(), %err, "poisoned frame header");
                        self.read_state.set(ReadState::Idle);
                    })?;
                    self.read_state.set(ReadState::NeedBody(header.size));
                }
                ReadState::NeedBody(size) => {
                    if read_buf.len() < size as usize {
                        break;
                    }
                    let frame = read_buf.split_to(size as usize);
                    let mut buffer = Buffer::from_bytes(frame);
                    buffer.set_fds(self.pending_fds.borrow_mut().drain(..).collect());
                    let msg = Message::from_frame(buffer)?;
                    debug!(fd = self.raw_fd(), msgid = msg.id(), size, "frame received");
                    msgs.push(msg);
                    self.read_state.set(ReadState::NeedHeader);
                }
            }
        }
        Ok(msgs)
    }

    /// Flush the write queue as far as the socket allows.
    pub(crate) fn handle_writable(&self) -> SocketStatus {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = MsgFlags::MSG_NOSIGNAL;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = MsgFlags::empty();

        let mut queue = self.write_queue.borrow_mut();
        loop {
            let Some(entry) = queue.front_mut() else {
                // Queue drained: stop watching for writable.
                let _ = self.lp.update(self.raw_fd(), Watch::READ);
                return SocketStatus::Open;
            };
            let frame = entry.buf.as_slice();
            let iov = [IoSlice::new(&frame[entry.off..])];
            let raw_fds = if entry.fds_sent {
                Vec::new()
            } else {
                entry.buf.raw_fds()
            };
            let cmsgs: Vec<ControlMessage<'_>> = if raw_fds.is_empty() {
                Vec::new()
            } else {
                vec![ControlMessage::ScmRights(&raw_fds)]
            };
            match socket::sendmsg::<SockaddrStorage>(self.raw_fd(), &iov, &cmsgs, flags, None) {
                // A zero-byte write on a stream means the peer is gone.
                Ok(0) => return SocketStatus::Closed,
                Ok(n) => {
                    entry.fds_sent = true;
                    entry.off += n;
                    if entry.off >= frame.len() {
                        queue.pop_front();
                    }
                }
                Err(Errno::EAGAIN) => return SocketStatus::Open,
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    debug!(fd = self.raw_fd(), %errno, "write failed");
                    return SocketStatus::Closed;
                }
            }
        }
    }

    /// True when queued frames are still waiting for the socket.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.borrow().is_empty()
    }

    /// Drop queued frames (releasing their buffer references) and stop
    /// framing. Used during teardown.
    pub(crate) fn abandon(&self) {
        self.write_queue.borrow_mut().clear();
        self.read_buf.borrow_mut().clear();
        self.pending_fds.borrow_mut().clear();
        self.read_state.set(ReadState::Idle);
    }
}

enum RecvOutcome {
    Data(usize, Vec<OwnedFd>),
    WouldBlock,
    Eof,
    Gone,
}

fn read_peer_creds(fd: &OwnedFd) -> Option<PeerCredentials> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let creds = socket::getsockopt(fd, socket::sockopt::PeerCredentials).ok()?;
        Some(PeerCredentials {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: Some(creds.pid()),
        })
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = fd;
        None
    }
}
