//! Typed record codec.
//!
//! A payload is a concatenation of `tag byte | body` records. The tag makes
//! the payload self-describing; the format string supplied by the caller is
//! checked against it, so schema drift between peers surfaces as a
//! [`Error::TypeMismatch`](crate::Error::TypeMismatch) instead of garbage
//! values.
//!
//! [`Encoder`] appends records to a message being written; [`Decoder`] walks
//! a finished message. Both expose per-type operations plus format-driven
//! `write`/`read` built on top of them.

mod decode;
mod dump;
mod encode;

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

pub use decode::Decoder;
pub(crate) use dump::dump_payload;
pub use encode::Encoder;

use crate::format::Directive;

/// Longest string body the encoder accepts, excluding the trailing NUL.
pub const MAX_STR_LEN: usize = 65535;

/// On-wire discriminator for one argument's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// `i8` body.
    I8 = 1,
    /// `u8` body.
    U8 = 2,
    /// `i16` little-endian body.
    I16 = 3,
    /// `u16` little-endian body.
    U16 = 4,
    /// `i32` little-endian body.
    I32 = 5,
    /// `u32` little-endian body.
    U32 = 6,
    /// `i64` little-endian body.
    I64 = 7,
    /// `u64` little-endian body.
    U64 = 8,
    /// `u32` length (including NUL) then bytes then NUL.
    Str = 9,
    /// `u32` length then bytes.
    Buf = 10,
    /// IEEE-754 binary32 little-endian body.
    F32 = 11,
    /// IEEE-754 binary64 little-endian body.
    F64 = 12,
    /// `u32 = 0` placeholder; the descriptor itself travels as ancillary
    /// data.
    Fd = 13,
}

impl Tag {
    /// Decode a tag byte.
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::I8,
            2 => Self::U8,
            3 => Self::I16,
            4 => Self::U16,
            5 => Self::I32,
            6 => Self::U32,
            7 => Self::I64,
            8 => Self::U64,
            9 => Self::Str,
            10 => Self::Buf,
            11 => Self::F32,
            12 => Self::F64,
            13 => Self::Fd,
            _ => return None,
        })
    }

    /// Wire name, as used in dumps and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "I8",
            Self::U8 => "U8",
            Self::I16 => "I16",
            Self::U16 => "U16",
            Self::I32 => "I32",
            Self::U32 => "U32",
            Self::I64 => "I64",
            Self::U64 => "U64",
            Self::Str => "STR",
            Self::Buf => "BUF",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::Fd => "FD",
        }
    }

    /// The tag a directive expects to find on the wire.
    #[must_use]
    pub(crate) fn for_directive(dir: Directive) -> Self {
        match dir {
            Directive::I8 => Self::I8,
            Directive::U8 => Self::U8,
            Directive::I16 => Self::I16,
            Directive::U16 => Self::U16,
            Directive::I32 => Self::I32,
            Directive::U32 => Self::U32,
            Directive::I64 => Self::I64,
            Directive::U64 => Self::U64,
            Directive::F32 => Self::F32,
            Directive::F64 => Self::F64,
            Directive::Str | Directive::StrOwned => Self::Str,
            Directive::Buf => Self::Buf,
            Directive::Fd => Self::Fd,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One argument handed to the encoder.
///
/// Borrows the caller's data; descriptors are duplicated at encode time so
/// the caller keeps ownership of the original.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    /// Signed 8-bit integer.
    I8(i8),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// String value.
    Str(&'a str),
    /// Raw byte buffer.
    Buf(&'a [u8]),
    /// File descriptor, duplicated into the message at encode time.
    Fd(BorrowedFd<'a>),
}

/// One argument produced by the decoder.
///
/// Views (`Str`, `Buf` borrowed variants, `Fd`) are tied to the message's
/// lifetime; `Cow::Owned` variants come from `%ms`-style directives.
#[derive(Debug)]
pub enum Field<'m> {
    /// Signed 8-bit integer.
    I8(i8),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// String contents.
    Str(Cow<'m, str>),
    /// Buffer contents.
    Buf(Cow<'m, [u8]>),
    /// Received descriptor, owned by the message.
    Fd(ReceivedFd<'m>),
}

impl PartialEq for Field<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::I8(a), Self::I8(b)) => a == b,
            (Self::U8(a), Self::U8(b)) => a == b,
            (Self::I16(a), Self::I16(b)) => a == b,
            (Self::U16(a), Self::U16(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::U32(a), Self::U32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::U64(a), Self::U64(b)) => a == b,
            // Bitwise so NaN payloads round-trip comparably.
            (Self::F32(a), Self::F32(b)) => a.to_bits() == b.to_bits(),
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Buf(a), Self::Buf(b)) => a == b,
            (Self::Fd(a), Self::Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        }
    }
}

/// Borrowed handle to a descriptor received with a message.
///
/// The descriptor stays owned by the message and is closed with it; callers
/// that need it longer duplicate it with [`ReceivedFd::try_clone`].
#[derive(Debug, Clone, Copy)]
pub struct ReceivedFd<'m> {
    fd: BorrowedFd<'m>,
}

impl<'m> ReceivedFd<'m> {
    pub(crate) fn new(fd: BorrowedFd<'m>) -> Self {
        Self { fd }
    }

    /// Borrow the descriptor.
    #[must_use]
    pub fn as_fd(&self) -> BorrowedFd<'m> {
        self.fd
    }

    /// Duplicate the descriptor into a fresh kernel identity the caller
    /// owns.
    pub fn try_clone(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone_to_owned()
    }
}

impl AsRawFd for ReceivedFd<'_> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl<'m> AsFd for ReceivedFd<'m> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd
    }
}
