//! Error types shared by the whole crate.

use std::io;

use crate::codec::Tag;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the library.
///
/// Protocol errors on a connection are fatal to that connection only: the
/// connection is closed and `Disconnected` is delivered, while the owning
/// context stays healthy. Connect failures never surface here; the client
/// reconnect timer absorbs them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input was misused (wrong state, wrong context kind, count
    /// mismatch between format and arguments, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The format string could not be scanned.
    #[error("invalid format at byte {pos}: {reason}")]
    InvalidFormat {
        /// Byte offset of the offending character in the format string.
        pos: usize,
        /// What the scanner choked on.
        reason: &'static str,
    },

    /// A format directive does not match the next wire tag.
    #[error("type mismatch: format expects {expected}, payload has {found}")]
    TypeMismatch {
        /// Tag implied by the current format directive.
        expected: Tag,
        /// Tag actually present in the payload.
        found: Tag,
    },

    /// The payload is malformed (string missing its NUL, embedded NUL,
    /// truncated record, fd list shorter than the FD tags, ...).
    #[error("invalid data: {0}")]
    InvalidData(&'static str),

    /// Framing failure: bad magic or an unbelievable size field.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Encoder input exceeds a wire limit.
    #[error("too large: {what} is {size} bytes, limit is {max}")]
    TooLarge {
        /// What exceeded the limit.
        what: &'static str,
        /// Observed size.
        size: usize,
        /// The limit that was exceeded.
        max: usize,
    },

    /// Send attempted on a client without a live connection.
    #[error("not connected")]
    NotConnected,

    /// The operation raced with an in-progress dispatch or an outstanding
    /// reference (e.g. rewriting a message still sitting in a send queue).
    #[error("busy: {0}")]
    Busy(&'static str),

    /// `wait_and_process` expired without delivering any work.
    #[error("timed out")]
    Timeout,

    /// Underlying socket error, OS code preserved.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The operation is not available here (e.g. descriptor passing over a
    /// non-local socket).
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<nix::Error> for Error {
    fn from(errno: nix::Error) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

impl Error {
    /// OS error code carried by an `Io` variant, if any.
    #[must_use]
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_preserves_os_code() {
        let err = Error::from(nix::Error::ECONNRESET);
        assert_eq!(err.os_error(), Some(nix::Error::ECONNRESET as i32));
    }

    #[test]
    fn display_is_stable() {
        let err = Error::TypeMismatch {
            expected: Tag::U32,
            found: Tag::Str,
        };
        assert_eq!(
            err.to_string(),
            "type mismatch: format expects U32, payload has STR"
        );
    }
}
