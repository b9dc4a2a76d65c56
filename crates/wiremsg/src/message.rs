//! Message envelope: header plus typed payload.

use std::fmt;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::codec::{Arg, Decoder, Encoder, Field, dump_payload};
use crate::error::{Error, Result};

/// Frame magic, little-endian on the wire.
pub const MAGIC: u32 = 0x504F_4D50;

/// Bytes of the frame header: magic, msgid, size.
pub const HEADER_SIZE: usize = 12;

/// Hard cap on one frame, header included. Anything larger is a framing
/// error on receive and `TooLarge` on encode.
pub const MAX_MSG_SIZE: u32 = 256 * 1024 * 1024;

/// Lifecycle of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// No payload; the message must be initialized before use.
    Empty,
    /// Header reserved, records being appended.
    Writing,
    /// Header patched; the message is immutable and sendable.
    Finished,
    /// Built from received bytes; readable, never writable.
    Reading,
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty"),
            Self::Writing => f.write_str("writing"),
            Self::Finished => f.write_str("finished"),
            Self::Reading => f.write_str("reading"),
        }
    }
}

pub(crate) struct Header {
    pub msgid: u32,
    pub size: u32,
}

/// Validate the 12 header bytes of a frame.
pub(crate) fn parse_header(bytes: &[u8; HEADER_SIZE], max_size: u32) -> Result<Header> {
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != MAGIC {
        return Err(Error::Protocol("bad magic"));
    }
    let msgid = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if size < HEADER_SIZE as u32 {
        return Err(Error::Protocol("frame size below header size"));
    }
    if size > max_size {
        return Err(Error::Protocol("oversized frame"));
    }
    Ok(Header { msgid, size })
}

/// One typed message: a 32-bit id plus a self-describing payload.
///
/// The payload buffer is shared by reference with any send queue the message
/// is sitting in, so a server broadcast never copies the bytes. Rewriting a
/// message that is still queued fails with `Busy`.
#[derive(Debug)]
pub struct Message {
    buf: Arc<Buffer>,
    state: MessageState,
    msgid: u32,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// Empty message; call [`Message::init`] or [`Message::write`] next.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Buffer::new()),
            state: MessageState::Empty,
            msgid: 0,
        }
    }

    /// Build and finish a message in one call.
    pub fn with_args(msgid: u32, fmt: &str, args: &[Arg<'_>]) -> Result<Self> {
        let mut msg = Self::new();
        msg.write(msgid, fmt, args)?;
        Ok(msg)
    }

    /// Message id from the header.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.msgid
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Total frame size, header included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.state == MessageState::Writing
    }

    pub(crate) fn is_readable(&self) -> bool {
        matches!(self.state, MessageState::Finished | MessageState::Reading)
    }

    /// The payload records, header excluded.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.buf.as_slice().get(HEADER_SIZE..).unwrap_or(&[])
    }

    pub(crate) fn buffer(&self) -> &Buffer {
        &self.buf
    }

    /// Shared reference to the frame for queueing. Only finished or
    /// received messages are sendable.
    pub(crate) fn shared_buf(&self) -> Result<Arc<Buffer>> {
        if !self.is_readable() {
            return Err(Error::InvalidArgument("message is not finished"));
        }
        Ok(Arc::clone(&self.buf))
    }

    pub(crate) fn writable_buf(&mut self) -> Result<&mut Buffer> {
        Arc::get_mut(&mut self.buf).ok_or(Error::Busy("message is queued for sending"))
    }

    fn reset_buf(&mut self) {
        match Arc::get_mut(&mut self.buf) {
            Some(buf) => buf.clear(),
            // Still queued somewhere; leave that frame alone.
            None => self.buf = Arc::new(Buffer::new()),
        }
    }

    /// Start writing: reserves the header and moves to `Writing`.
    ///
    /// Re-initializing an already used message drops its previous content.
    pub fn init(&mut self, msgid: u32) -> Result<()> {
        self.reset_buf();
        self.msgid = msgid;
        let buf = self.writable_buf()?;
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&msgid.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        self.state = MessageState::Writing;
        Ok(())
    }

    /// Patch the header size and seal the message.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless the message is in the `Writing` state.
    pub fn finish(&mut self) -> Result<()> {
        if self.state != MessageState::Writing {
            return Err(Error::InvalidArgument("message is not being written"));
        }
        let size = self.buf.len() as u32;
        self.writable_buf()?.write_at(8, &size.to_le_bytes())?;
        self.state = MessageState::Finished;
        Ok(())
    }

    /// Drop the payload (closing attached descriptors) and return to
    /// `Empty`.
    pub fn clear(&mut self) {
        self.reset_buf();
        self.msgid = 0;
        self.state = MessageState::Empty;
    }

    /// Init, encode `args` per `fmt`, finish. An empty format encodes a
    /// message with no arguments.
    pub fn write(&mut self, msgid: u32, fmt: &str, args: &[Arg<'_>]) -> Result<()> {
        self.init(msgid)?;
        Encoder::new(self)?.write(fmt, args)?;
        self.finish()
    }

    /// Init, encode string-form `argv` per `fmt`, finish. Used by tooling
    /// that receives arguments as text.
    pub fn write_argv(&mut self, msgid: u32, fmt: &str, argv: &[&str]) -> Result<()> {
        self.init(msgid)?;
        Encoder::new(self)?.write_argv(fmt, argv)?;
        self.finish()
    }

    /// Decode the payload per `fmt`.
    pub fn read(&self, fmt: &str) -> Result<Vec<Field<'_>>> {
        Decoder::new(self)?.read(fmt)
    }

    /// Deep copy: bytes copied, descriptors duplicated into fresh kernel
    /// identities. Used by callbacks that must keep a received message past
    /// their own return.
    pub fn try_clone(&self) -> Result<Self> {
        if !self.is_readable() {
            return Err(Error::InvalidArgument("message is not finished"));
        }
        Ok(Self {
            buf: Arc::new(self.buf.try_clone()?),
            state: self.state,
            msgid: self.msgid,
        })
    }

    /// Render the payload in a human-readable `{ID:…, …}` form. Tolerates
    /// partially written or malformed payloads.
    #[must_use]
    pub fn dump(&self) -> String {
        dump_payload(self.msgid, self.payload())
    }

    /// Rebuild a message from one complete received frame.
    ///
    /// The header must already line up with the buffer: right magic, size
    /// equal to the byte count. Ancillary descriptors ride along inside
    /// `buf`.
    pub fn from_frame(buf: Buffer) -> Result<Self> {
        let bytes = buf.as_slice();
        let header: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|slice| slice.try_into().ok())
            .ok_or(Error::Protocol("frame shorter than header"))?;
        let header = parse_header(header, MAX_MSG_SIZE)?;
        if header.size as usize != bytes.len() {
            return Err(Error::Protocol("frame size does not match byte count"));
        }
        Ok(Self {
            msgid: header.msgid,
            buf: Arc::new(buf),
            state: MessageState::Reading,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::io::{Read as _, Write as _};
    use std::os::fd::AsFd;

    use super::*;
    use crate::codec::Tag;

    #[test]
    fn lifecycle_transitions() {
        let mut msg = Message::new();
        assert_eq!(msg.state(), MessageState::Empty);
        assert!(msg.read("%u").is_err());

        msg.init(3).unwrap();
        assert_eq!(msg.state(), MessageState::Writing);
        assert!(msg.read("%u").is_err());

        msg.finish().unwrap();
        assert_eq!(msg.state(), MessageState::Finished);
        assert!(msg.finish().is_err());

        msg.clear();
        assert_eq!(msg.state(), MessageState::Empty);
    }

    #[test]
    fn finished_header_has_magic_and_size() {
        let mut msg = Message::new();
        msg.write(42, "%u%s", &[Arg::U32(10), Arg::Str("PING")])
            .unwrap();
        let frame = msg.buffer().as_slice();
        assert_eq!(&frame[0..4], &MAGIC.to_le_bytes());
        assert_eq!(&frame[4..8], &42u32.to_le_bytes());
        assert_eq!(&frame[8..12], &(frame.len() as u32).to_le_bytes());
        assert_eq!(msg.size(), HEADER_SIZE + msg.payload().len());
    }

    #[test]
    fn roundtrip_mixed_arguments() {
        let mut msg = Message::new();
        msg.write(
            1,
            "%hhi%hhu%hi%hu%i%u%lli%llu%f%lf%s",
            &[
                Arg::I8(i8::MIN),
                Arg::U8(u8::MAX),
                Arg::I16(i16::MIN),
                Arg::U16(u16::MAX),
                Arg::I32(i32::MIN),
                Arg::U32(u32::MAX),
                Arg::I64(i64::MIN),
                Arg::U64(u64::MAX),
                Arg::F32(3.5),
                Arg::F64(-2.25),
                Arg::Str("hello"),
            ],
        )
        .unwrap();

        let fields = msg.read("%hhi%hhu%hi%hu%i%u%lli%llu%f%lf%s").unwrap();
        assert_eq!(
            fields,
            vec![
                Field::I8(i8::MIN),
                Field::U8(u8::MAX),
                Field::I16(i16::MIN),
                Field::U16(u16::MAX),
                Field::I32(i32::MIN),
                Field::U32(u32::MAX),
                Field::I64(i64::MIN),
                Field::U64(u64::MAX),
                Field::F32(3.5),
                Field::F64(-2.25),
                Field::Str(Cow::Borrowed("hello")),
            ]
        );
    }

    #[test]
    fn empty_and_max_strings_roundtrip() {
        let mut msg = Message::new();
        msg.write(1, "%s", &[Arg::Str("")]).unwrap();
        assert_eq!(
            msg.read("%s").unwrap(),
            vec![Field::Str(Cow::Borrowed(""))]
        );

        let max = "x".repeat(65535);
        let mut msg = Message::new();
        msg.write(1, "%s", &[Arg::Str(&max)]).unwrap();
        assert_eq!(
            msg.read("%ms").unwrap(),
            vec![Field::Str(Cow::Owned(max))]
        );

        let over = "x".repeat(65536);
        let mut msg = Message::new();
        assert!(matches!(
            msg.write(1, "%s", &[Arg::Str(&over)]),
            Err(Error::TooLarge { .. })
        ));
    }

    #[test]
    fn zero_length_buffer_roundtrips() {
        let mut msg = Message::new();
        msg.write(9, "%p%u", &[Arg::Buf(&[])]).unwrap();
        assert_eq!(
            msg.read("%p%u").unwrap(),
            vec![Field::Buf(Cow::Borrowed(&[][..]))]
        );
    }

    #[test]
    fn format_mismatch_fails_with_type_mismatch() {
        let mut msg = Message::new();
        msg.write(5, "%u", &[Arg::U32(7)]).unwrap();
        assert!(matches!(
            msg.read("%i"),
            Err(Error::TypeMismatch {
                expected: Tag::I32,
                found: Tag::U32,
            })
        ));
    }

    #[test]
    fn argument_count_mismatch_is_rejected() {
        let mut msg = Message::new();
        assert!(msg.write(1, "%u%u", &[Arg::U32(1)]).is_err());
        assert!(msg.write(1, "%u", &[Arg::U32(1), Arg::U32(2)]).is_err());
    }

    #[test]
    fn write_argv_parses_by_directive() {
        let mut msg = Message::new();
        msg.write_argv(8, "%i%u%hhx%s%lf", &["-42", "0x10", "0377", "PING", "1.5"])
            .unwrap();
        assert_eq!(
            msg.read("%i%u%hhx%s%lf").unwrap(),
            vec![
                Field::I32(-42),
                Field::U32(16),
                Field::U8(0o377),
                Field::Str(Cow::Borrowed("PING")),
                Field::F64(1.5),
            ]
        );
    }

    #[test]
    fn fd_roundtrips_through_a_message() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut msg = Message::new();
        msg.write(99, "%x", &[Arg::Fd(write_end.as_fd())]).unwrap();
        drop(write_end);

        let fields = msg.read("%x").unwrap();
        let Field::Fd(received) = &fields[0] else {
            panic!("expected an fd field");
        };
        let mut dup = std::fs::File::from(received.try_clone().unwrap());
        dup.write_all(b"abc").unwrap();
        drop(dup);
        drop(fields);
        // Closes the duplicate held by the message, releasing the last
        // writer so the read below sees EOF.
        drop(msg);

        let mut got = String::new();
        std::fs::File::from(read_end).read_to_string(&mut got).unwrap();
        assert_eq!(got, "abc");
    }

    #[test]
    fn try_clone_is_deep() {
        let mut msg = Message::new();
        msg.write(7, "%u%s", &[Arg::U32(1), Arg::Str("dup")]).unwrap();
        let copy = msg.try_clone().unwrap();
        msg.clear();
        assert_eq!(
            copy.read("%u%s").unwrap(),
            vec![Field::U32(1), Field::Str(Cow::Borrowed("dup"))]
        );
    }

    #[test]
    fn from_frame_validates_header() {
        let mut msg = Message::new();
        msg.write(11, "%u", &[Arg::U32(5)]).unwrap();

        let mut frame = Buffer::new();
        frame.extend_from_slice(msg.buffer().as_slice());
        let rebuilt = Message::from_frame(frame).unwrap();
        assert_eq!(rebuilt.id(), 11);
        assert_eq!(rebuilt.read("%u").unwrap(), vec![Field::U32(5)]);

        let mut bad = Buffer::new();
        bad.extend_from_slice(b"\xde\xad\xbe\xef\x00\x00\x00\x00\x0c\x00\x00\x00");
        assert!(matches!(
            Message::from_frame(bad),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn dump_renders_id_and_records() {
        let mut msg = Message::new();
        msg.write(42, "%u%s", &[Arg::U32(10), Arg::Str("PING")])
            .unwrap();
        assert_eq!(msg.dump(), "{ID:42, U32:10, STR:'PING'}");
    }
}
