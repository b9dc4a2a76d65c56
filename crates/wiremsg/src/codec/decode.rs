//! Record decoder.

use std::borrow::Cow;

use super::{Field, ReceivedFd, Tag};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::format::{Directive, FormatScanner};
use crate::message::Message;

/// Walks the typed records of a finished message.
///
/// The decoder checks every format directive against the tag embedded in the
/// payload before touching the body, so a drifted schema fails fast with
/// `TypeMismatch` instead of producing garbage. It never reads past the
/// payload end; truncated records fail with `InvalidData`.
#[derive(Debug)]
pub struct Decoder<'m> {
    buf: &'m Buffer,
    payload: &'m [u8],
    pos: usize,
    next_fd: usize,
}

impl<'m> Decoder<'m> {
    /// Start decoding `msg` from the first record.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the message is not readable (still being
    /// written, or cleared).
    pub fn new(msg: &'m Message) -> Result<Self> {
        if !msg.is_readable() {
            return Err(Error::InvalidArgument("message is not readable"));
        }
        Ok(Self {
            buf: msg.buffer(),
            payload: msg.payload(),
            pos: 0,
            next_fd: 0,
        })
    }

    /// True when every record has been consumed.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.payload.len()
    }

    fn take(&mut self, n: usize) -> Result<&'m [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.payload.len())
            .ok_or(Error::InvalidData("truncated record"))?;
        let bytes = &self.payload[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_tag(&mut self, expected: Tag) -> Result<()> {
        let byte = self.take(1)?[0];
        let found = Tag::from_u8(byte).ok_or(Error::InvalidData("unknown tag"))?;
        if found != expected {
            return Err(Error::TypeMismatch { expected, found });
        }
        Ok(())
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn take_u32_body(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read an `i8` record.
    pub fn read_i8(&mut self) -> Result<i8> {
        self.take_tag(Tag::I8)?;
        Ok(self.take(1)?[0] as i8)
    }

    /// Read a `u8` record.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.take_tag(Tag::U8)?;
        Ok(self.take(1)?[0])
    }

    /// Read an `i16` record.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.take_tag(Tag::I16)?;
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    /// Read a `u16` record.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.take_tag(Tag::U16)?;
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read an `i32` record.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.take_tag(Tag::I32)?;
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Read a `u32` record.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.take_tag(Tag::U32)?;
        self.take_u32_body()
    }

    /// Read an `i64` record.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.take_tag(Tag::I64)?;
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read a `u64` record.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.take_tag(Tag::U64)?;
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Read an `f32` record.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.take_tag(Tag::F32)?;
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read an `f64` record.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.take_tag(Tag::F64)?;
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    fn take_str_bytes(&mut self) -> Result<&'m str> {
        self.take_tag(Tag::Str)?;
        let len = self.take_u32_body()? as usize;
        if len == 0 {
            return Err(Error::InvalidData("string record with zero length"));
        }
        let bytes = self.take(len)?;
        let (content, terminator) = bytes.split_at(len - 1);
        if terminator != [0] {
            return Err(Error::InvalidData("string is not NUL-terminated"));
        }
        if content.contains(&0) {
            return Err(Error::InvalidData("string contains an embedded NUL"));
        }
        std::str::from_utf8(content).map_err(|_| Error::InvalidData("string is not valid UTF-8"))
    }

    /// Read a string record as a view into the message.
    pub fn read_cstr(&mut self) -> Result<&'m str> {
        self.take_str_bytes()
    }

    /// Read a string record as an owned copy.
    pub fn read_str(&mut self) -> Result<String> {
        Ok(self.take_str_bytes()?.to_owned())
    }

    fn take_buf_bytes(&mut self) -> Result<&'m [u8]> {
        self.take_tag(Tag::Buf)?;
        let len = self.take_u32_body()? as usize;
        self.take(len)
    }

    /// Read a buffer record as a view into the message.
    pub fn read_cbuf(&mut self) -> Result<&'m [u8]> {
        self.take_buf_bytes()
    }

    /// Read a buffer record as an owned copy.
    pub fn read_buf(&mut self) -> Result<Vec<u8>> {
        Ok(self.take_buf_bytes()?.to_vec())
    }

    /// Read a descriptor record.
    ///
    /// Yields the next unconsumed descriptor from the message's ancillary
    /// list, in encounter order. The descriptor stays owned by the message.
    ///
    /// # Errors
    ///
    /// `InvalidData` when the message carries fewer descriptors than its FD
    /// tags declare.
    pub fn read_fd(&mut self) -> Result<ReceivedFd<'m>> {
        self.take_tag(Tag::Fd)?;
        let _placeholder = self.take_u32_body()?;
        let idx = self.next_fd;
        let fd = self
            .buf
            .fd(idx)
            .ok_or(Error::InvalidData("descriptor list shorter than FD tags"))?;
        self.next_fd = idx + 1;
        Ok(ReceivedFd::new(fd))
    }

    /// Decode fields according to `fmt`, in lockstep.
    ///
    /// Fails fast on the first mismatching or malformed record; fields
    /// decoded before the failure are dropped.
    pub fn read(&mut self, fmt: &str) -> Result<Vec<Field<'m>>> {
        let mut scanner = FormatScanner::new(fmt);
        let mut out = Vec::new();
        while let Some(dir) = scanner.next_directive() {
            out.push(self.read_one(dir?)?);
        }
        Ok(out)
    }

    fn read_one(&mut self, dir: Directive) -> Result<Field<'m>> {
        Ok(match dir {
            Directive::I8 => Field::I8(self.read_i8()?),
            Directive::U8 => Field::U8(self.read_u8()?),
            Directive::I16 => Field::I16(self.read_i16()?),
            Directive::U16 => Field::U16(self.read_u16()?),
            Directive::I32 => Field::I32(self.read_i32()?),
            Directive::U32 => Field::U32(self.read_u32()?),
            Directive::I64 => Field::I64(self.read_i64()?),
            Directive::U64 => Field::U64(self.read_u64()?),
            Directive::F32 => Field::F32(self.read_f32()?),
            Directive::F64 => Field::F64(self.read_f64()?),
            Directive::Str => Field::Str(Cow::Borrowed(self.read_cstr()?)),
            Directive::StrOwned => Field::Str(Cow::Owned(self.read_str()?)),
            Directive::Buf => Field::Buf(Cow::Borrowed(self.read_cbuf()?)),
            Directive::Fd => Field::Fd(self.read_fd()?),
        })
    }
}
