//! # wiremsg
//!
//! Typed, self-describing message IPC over stream and datagram sockets.
//!
//! A message is a 32-bit id plus a payload carrying both the type tags and
//! the values of a heterogeneous argument list. Senders and receivers each
//! supply a printf-style format string; the decoder checks it against the
//! embedded tags, so schema drift between peers fails fast instead of
//! being misread. Local sockets can carry file descriptors alongside the
//! bytes.
//!
//! ## Features
//!
//! - **Wire codec**: format-string driven encoder/decoder with
//!   self-describing records, strings, buffers and descriptors
//! - **Connection framing**: nonblocking reassembly and a refcounted send
//!   queue with partial-write and ancillary-data handling
//! - **Contexts**: server, auto-reconnecting client, and datagram
//!   endpoints over one single-threaded readiness loop
//! - **Cross-thread wakeup**: the one multi-thread entry point
//!
//! ## Example
//!
//! ```rust,no_run
//! use wiremsg::{Arg, Context, Event};
//!
//! # fn main() -> wiremsg::Result<()> {
//! let server = Context::new(Box::new(|_ctx, event| {
//!     if let Event::Msg(_conn, msg) = event {
//!         println!("{}", msg.dump());
//!     }
//! }))?;
//! server.listen(&"unix:/tmp/demo.sock".parse()?)?;
//! loop {
//!     server.wait_and_process(None)?;
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod buffer;
pub mod codec;
pub mod conn;
pub mod ctx;
pub mod error;
pub mod evloop;
pub mod format;
pub mod message;

pub use addr::Addr;
pub use buffer::Buffer;
pub use codec::{Arg, Decoder, Encoder, Field, ReceivedFd, Tag};
pub use conn::{ConnState, Connection, PeerCredentials};
pub use ctx::{Config, Context, Event, EventKind, Handler};
pub use error::{Error, Result};
pub use evloop::{EventLoop, LoopWaker, Readiness, Timer, Watch};
pub use format::{Directive, FormatScanner};
pub use message::{HEADER_SIZE, MAGIC, MAX_MSG_SIZE, Message, MessageState};
