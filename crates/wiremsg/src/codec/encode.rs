//! Record encoder.

use std::os::fd::BorrowedFd;

use super::{Arg, MAX_STR_LEN, Tag};
use crate::error::{Error, Result};
use crate::format::{Directive, FormatScanner};
use crate::message::{MAX_MSG_SIZE, Message};

/// Appends typed records to a message in the `Writing` state.
///
/// The encoder borrows the message exclusively; dropping it leaves the
/// message where it was, ready for more writes or for
/// [`Message::finish`](crate::Message::finish).
#[derive(Debug)]
pub struct Encoder<'m> {
    msg: &'m mut Message,
}

impl<'m> Encoder<'m> {
    /// Start encoding into `msg`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the message is not in the `Writing` state.
    pub fn new(msg: &'m mut Message) -> Result<Self> {
        if !msg.is_writing() {
            return Err(Error::InvalidArgument("message is not being written"));
        }
        Ok(Self { msg })
    }

    fn put(&mut self, tag: Tag, body: &[u8]) -> Result<()> {
        let buf = self.msg.writable_buf()?;
        let total = buf.len() + 1 + body.len();
        if total > MAX_MSG_SIZE as usize {
            return Err(Error::TooLarge {
                what: "message",
                size: total,
                max: MAX_MSG_SIZE as usize,
            });
        }
        buf.extend_from_slice(&[tag as u8]);
        buf.extend_from_slice(body);
        Ok(())
    }

    /// Append an `i8` record.
    pub fn write_i8(&mut self, v: i8) -> Result<()> {
        self.put(Tag::I8, &v.to_le_bytes())
    }

    /// Append a `u8` record.
    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(Tag::U8, &v.to_le_bytes())
    }

    /// Append an `i16` record.
    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.put(Tag::I16, &v.to_le_bytes())
    }

    /// Append a `u16` record.
    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put(Tag::U16, &v.to_le_bytes())
    }

    /// Append an `i32` record.
    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.put(Tag::I32, &v.to_le_bytes())
    }

    /// Append a `u32` record.
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(Tag::U32, &v.to_le_bytes())
    }

    /// Append an `i64` record.
    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.put(Tag::I64, &v.to_le_bytes())
    }

    /// Append a `u64` record.
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.put(Tag::U64, &v.to_le_bytes())
    }

    /// Append an `f32` record.
    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.put(Tag::F32, &v.to_le_bytes())
    }

    /// Append an `f64` record.
    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.put(Tag::F64, &v.to_le_bytes())
    }

    /// Append a string record: `u32` length including the trailing NUL,
    /// the bytes, then the NUL.
    ///
    /// # Errors
    ///
    /// `TooLarge` for strings longer than [`MAX_STR_LEN`] bytes.
    pub fn write_str(&mut self, v: &str) -> Result<()> {
        if v.len() > MAX_STR_LEN {
            return Err(Error::TooLarge {
                what: "string",
                size: v.len(),
                max: MAX_STR_LEN,
            });
        }
        let len = (v.len() + 1) as u32;
        let mut body = Vec::with_capacity(4 + v.len() + 1);
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(v.as_bytes());
        body.push(0);
        self.put(Tag::Str, &body)
    }

    /// Append a buffer record: `u32` length then the bytes.
    pub fn write_buf(&mut self, v: &[u8]) -> Result<()> {
        if v.len() > u32::MAX as usize {
            return Err(Error::TooLarge {
                what: "buffer",
                size: v.len(),
                max: u32::MAX as usize,
            });
        }
        let mut body = Vec::with_capacity(4 + v.len());
        body.extend_from_slice(&(v.len() as u32).to_le_bytes());
        body.extend_from_slice(v);
        self.put(Tag::Buf, &body)
    }

    /// Append a descriptor record.
    ///
    /// The descriptor is duplicated; the caller keeps the original. On the
    /// wire the record is only a placeholder; the duplicate travels as
    /// ancillary data when the message is sent over a local socket.
    pub fn write_fd(&mut self, v: BorrowedFd<'_>) -> Result<()> {
        let dup = v.try_clone_to_owned()?;
        self.put(Tag::Fd, &0u32.to_le_bytes())?;
        self.msg.writable_buf()?.push_fd(dup)
    }

    /// Encode `args` according to `fmt`, in lockstep.
    ///
    /// # Errors
    ///
    /// `InvalidFormat` for a bad format string, `InvalidArgument` when the
    /// argument list does not line up with it (count or kind).
    pub fn write(&mut self, fmt: &str, args: &[Arg<'_>]) -> Result<()> {
        let mut scanner = FormatScanner::new(fmt);
        let mut args = args.iter();
        loop {
            match (scanner.next_directive(), args.next()) {
                (None, None) => return Ok(()),
                (None, Some(_)) | (Some(Ok(_)), None) => {
                    return Err(Error::InvalidArgument(
                        "format and argument counts differ",
                    ));
                }
                (Some(Err(err)), _) => return Err(err),
                (Some(Ok(dir)), Some(arg)) => self.write_one(dir, arg)?,
            }
        }
    }

    fn write_one(&mut self, dir: Directive, arg: &Arg<'_>) -> Result<()> {
        match (dir, arg) {
            (Directive::I8, Arg::I8(v)) => self.write_i8(*v),
            (Directive::U8, Arg::U8(v)) => self.write_u8(*v),
            (Directive::I16, Arg::I16(v)) => self.write_i16(*v),
            (Directive::U16, Arg::U16(v)) => self.write_u16(*v),
            (Directive::I32, Arg::I32(v)) => self.write_i32(*v),
            (Directive::U32, Arg::U32(v)) => self.write_u32(*v),
            (Directive::I64, Arg::I64(v)) => self.write_i64(*v),
            (Directive::U64, Arg::U64(v)) => self.write_u64(*v),
            (Directive::F32, Arg::F32(v)) => self.write_f32(*v),
            (Directive::F64, Arg::F64(v)) => self.write_f64(*v),
            (Directive::Str | Directive::StrOwned, Arg::Str(v)) => self.write_str(v),
            (Directive::Buf, Arg::Buf(v)) => self.write_buf(v),
            (Directive::Fd, Arg::Fd(v)) => self.write_fd(*v),
            _ => Err(Error::InvalidArgument(
                "argument kind does not match format directive",
            )),
        }
    }

    /// Encode string-form arguments according to `fmt`.
    ///
    /// Each directive consumes one `argv` element, parsed by type: integers
    /// in base 10, 16 (`0x` prefix) or 8 (leading zero), floats through the
    /// locale-independent parser, `%x` descriptors as decimal fd numbers. A
    /// `%p%u` buffer consumes two elements: the raw bytes then their
    /// decimal length.
    pub fn write_argv(&mut self, fmt: &str, argv: &[&str]) -> Result<()> {
        fn next<'s>(args: &mut impl Iterator<Item = &'s str>) -> Result<&'s str> {
            args.next()
                .ok_or(Error::InvalidArgument("format and argument counts differ"))
        }

        let mut scanner = FormatScanner::new(fmt);
        let mut argv = argv.iter().copied();
        while let Some(dir) = scanner.next_directive() {
            match dir? {
                Directive::I8 => {
                    let v = parse_signed(next(&mut argv)?, i64::from(i8::MIN), i64::from(i8::MAX))?;
                    self.write_i8(v as i8)?;
                }
                Directive::U8 => {
                    let v = parse_unsigned(next(&mut argv)?, u64::from(u8::MAX))?;
                    self.write_u8(v as u8)?;
                }
                Directive::I16 => {
                    let v = parse_signed(next(&mut argv)?, i64::from(i16::MIN), i64::from(i16::MAX))?;
                    self.write_i16(v as i16)?;
                }
                Directive::U16 => {
                    let v = parse_unsigned(next(&mut argv)?, u64::from(u16::MAX))?;
                    self.write_u16(v as u16)?;
                }
                Directive::I32 => {
                    let v = parse_signed(next(&mut argv)?, i64::from(i32::MIN), i64::from(i32::MAX))?;
                    self.write_i32(v as i32)?;
                }
                Directive::U32 => {
                    let v = parse_unsigned(next(&mut argv)?, u64::from(u32::MAX))?;
                    self.write_u32(v as u32)?;
                }
                Directive::I64 => {
                    let v = parse_signed(next(&mut argv)?, i64::MIN, i64::MAX)?;
                    self.write_i64(v)?;
                }
                Directive::U64 => {
                    let v = parse_unsigned(next(&mut argv)?, u64::MAX)?;
                    self.write_u64(v)?;
                }
                Directive::F32 => {
                    let v: f32 = next(&mut argv)?
                        .parse()
                        .map_err(|_| Error::InvalidArgument("bad float argument"))?;
                    self.write_f32(v)?;
                }
                Directive::F64 => {
                    let v: f64 = next(&mut argv)?
                        .parse()
                        .map_err(|_| Error::InvalidArgument("bad float argument"))?;
                    self.write_f64(v)?;
                }
                Directive::Str | Directive::StrOwned => {
                    let v = next(&mut argv)?;
                    self.write_str(v)?;
                }
                Directive::Buf => {
                    let bytes = next(&mut argv)?;
                    let len = parse_unsigned(next(&mut argv)?, u64::from(u32::MAX))? as usize;
                    if len != bytes.len() {
                        return Err(Error::InvalidArgument(
                            "buffer length does not match its bytes",
                        ));
                    }
                    self.write_buf(bytes.as_bytes())?;
                }
                Directive::Fd => {
                    let raw = parse_signed(next(&mut argv)?, 0, i64::from(i32::MAX))? as i32;
                    // SAFETY: the fd number comes from the tool operator and
                    // is only borrowed for the duration of the dup below; an
                    // invalid number fails there with EBADF.
                    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
                    self.write_fd(fd)?;
                }
            }
        }
        if argv.next().is_some() {
            return Err(Error::InvalidArgument("format and argument counts differ"));
        }
        Ok(())
    }
}

fn split_radix(s: &str) -> (&str, u32) {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    }
}

fn parse_signed(s: &str, min: i64, max: i64) -> Result<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (digits, radix) = split_radix(digits);
    let magnitude = i64::from_str_radix(digits, radix)
        .map_err(|_| Error::InvalidArgument("bad integer argument"))?;
    let value = if neg { -magnitude } else { magnitude };
    if value < min || value > max {
        return Err(Error::InvalidArgument("integer argument out of range"));
    }
    Ok(value)
}

fn parse_unsigned(s: &str, max: u64) -> Result<u64> {
    let s = s.trim();
    let (digits, radix) = split_radix(s);
    let value = u64::from_str_radix(digits, radix)
        .map_err(|_| Error::InvalidArgument("bad integer argument"))?;
    if value > max {
        return Err(Error::InvalidArgument("integer argument out of range"));
    }
    Ok(value)
}
