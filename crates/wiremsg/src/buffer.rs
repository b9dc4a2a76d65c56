//! Growable payload buffer with attached file descriptors.
//!
//! A [`Buffer`] carries the bytes of one message frame plus the descriptors
//! encoded into it. Once a message is finished the buffer is frozen behind an
//! `Arc` so a server broadcast can fan the same bytes out to every peer
//! without copying; only fd-bearing buffers need a per-peer [`Buffer::try_clone`]
//! because the kernel consumes ancillary descriptors at send time.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Largest number of descriptors one message may carry.
///
/// Matches the kernel's `SCM_MAX_FD` so a frame's ancillary data always fits
/// in a single `sendmsg`.
pub const MAX_FDS_PER_MSG: usize = 253;

/// Byte buffer plus the ordered descriptors belonging to it.
///
/// Every fd held here is owned and closed exactly once when the buffer is
/// dropped, whether it was duplicated at encode time or received as
/// ancillary data.
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
    fds: Vec<OwnedFd>,
}

impl Buffer {
    /// Empty buffer with no reserved capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty buffer with `cap` bytes reserved.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(cap),
            fds: Vec::new(),
        }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no bytes have been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current allocation size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// The written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append raw bytes at the end.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Overwrite `bytes.len()` bytes at `pos`, which must already be
    /// written. Used to patch the frame header once the payload size is
    /// known.
    pub fn write_at(&mut self, pos: usize, bytes: &[u8]) -> Result<()> {
        let end = pos
            .checked_add(bytes.len())
            .ok_or(Error::InvalidArgument("buffer offset overflow"))?;
        if end > self.data.len() {
            return Err(Error::InvalidArgument("write past end of buffer"));
        }
        self.data[pos..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Take ownership of a descriptor, keeping encounter order.
    ///
    /// # Errors
    ///
    /// `TooLarge` when the buffer already carries [`MAX_FDS_PER_MSG`]
    /// descriptors.
    pub fn push_fd(&mut self, fd: OwnedFd) -> Result<()> {
        if self.fds.len() >= MAX_FDS_PER_MSG {
            return Err(Error::TooLarge {
                what: "descriptor list",
                size: self.fds.len() + 1,
                max: MAX_FDS_PER_MSG,
            });
        }
        self.fds.push(fd);
        Ok(())
    }

    /// Number of attached descriptors.
    #[must_use]
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Borrow the `idx`-th descriptor in encounter order.
    #[must_use]
    pub fn fd(&self, idx: usize) -> Option<BorrowedFd<'_>> {
        self.fds.get(idx).map(AsFd::as_fd)
    }

    /// Raw values of all attached descriptors, for `SCM_RIGHTS` assembly.
    #[must_use]
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(AsRawFd::as_raw_fd).collect()
    }

    /// Duplicate every attached descriptor (fresh kernel identities).
    pub fn dup_fds(&self) -> io::Result<Vec<OwnedFd>> {
        self.fds
            .iter()
            .map(|fd| fd.as_fd().try_clone_to_owned())
            .collect()
    }

    /// Deep copy: bytes copied, descriptors duplicated.
    pub fn try_clone(&self) -> io::Result<Self> {
        let mut data = BytesMut::with_capacity(self.data.len());
        data.extend_from_slice(&self.data);
        Ok(Self {
            data,
            fds: self.dup_fds()?,
        })
    }

    /// Drop all content, keeping the allocation. Attached descriptors are
    /// closed.
    pub fn clear(&mut self) {
        self.data.clear();
        self.fds.clear();
    }

    pub(crate) fn from_bytes(data: BytesMut) -> Self {
        Self {
            data,
            fds: Vec::new(),
        }
    }

    pub(crate) fn set_fds(&mut self, fds: Vec<OwnedFd>) {
        self.fds = fds;
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::pipe;

    use super::*;

    #[test]
    fn write_at_patches_in_place() {
        let mut buf = Buffer::new();
        buf.extend_from_slice(&[0u8; 8]);
        buf.write_at(4, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        assert_eq!(&buf.as_slice()[4..], &0xDEAD_BEEFu32.to_le_bytes());
    }

    #[test]
    fn write_at_rejects_out_of_range() {
        let mut buf = Buffer::new();
        buf.extend_from_slice(&[0u8; 4]);
        assert!(matches!(
            buf.write_at(2, &[0u8; 4]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn dup_fds_yields_fresh_identities() {
        let (r, w) = pipe().unwrap();
        drop(w);
        let mut buf = Buffer::new();
        let orig_raw = r.as_raw_fd();
        buf.push_fd(r).unwrap();

        let dups = buf.dup_fds().unwrap();
        assert_eq!(dups.len(), 1);
        assert_ne!(dups[0].as_raw_fd(), orig_raw);

        // The duplicate outlives the buffer's own descriptor.
        drop(buf);
        assert!(dups[0].try_clone().is_ok());
    }

    #[test]
    fn clear_drops_fds() {
        let (r, w) = pipe().unwrap();
        let mut buf = Buffer::new();
        buf.push_fd(r).unwrap();
        buf.push_fd(w).unwrap();
        assert_eq!(buf.fd_count(), 2);
        buf.clear();
        assert_eq!(buf.fd_count(), 0);
    }
}
