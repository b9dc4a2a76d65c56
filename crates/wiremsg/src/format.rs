//! Single-pass scanner for the printf/scanf format subset.
//!
//! A format string describes the argument list of one message. Each `%…`
//! group scans to one [`Directive`]; the codec consumes directives in
//! lockstep with the arguments. Whitespace between directives is ignored,
//! anything else is an error.
//!
//! Accepted grammar per directive:
//!
//! ```text
//! %[hh|h|l|ll](i|d|u|x)    integers, length modifier selects the width
//! %[l](f|F|e|E|g|G)        floats, bare is 32-bit, `l` is 64-bit
//! %s                       string ("%ms" asks the decoder for an owned copy)
//! %p%u                     byte buffer, the pair scans as one directive
//! %x                       file descriptor (only without a length modifier)
//! ```
//!
//! A bare `%l` integer maps to the host word size, so 32-bit builds keep
//! their native `long` width on the wire. The embedded tag is authoritative
//! at decode time; a 64-bit sender and a 32-bit receiver disagreeing over
//! `%li` surface as a type mismatch rather than a silent coercion.

use crate::error::{Error, Result};

/// One scanned `%…` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// `%hhi` / `%hhd`
    I8,
    /// `%hhu` / `%hhx`
    U8,
    /// `%hi` / `%hd`
    I16,
    /// `%hu` / `%hx`
    U16,
    /// `%i` / `%d` (and `%li` on 32-bit hosts)
    I32,
    /// `%u` (and `%lu` on 32-bit hosts)
    U32,
    /// `%lli` / `%lld` (and `%li` on 64-bit hosts)
    I64,
    /// `%llu` / `%llx` (and `%lu` on 64-bit hosts)
    U64,
    /// `%f` and friends
    F32,
    /// `%lf` and friends
    F64,
    /// `%s`: encoded as a string; decoded as a view into the payload
    Str,
    /// `%ms`: decoded as an owned string
    StrOwned,
    /// `%p%u`: byte buffer, value plus size
    Buf,
    /// `%x` with no length modifier: file descriptor
    Fd,
}

/// Width selected by a length modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Length {
    None,
    Char,  // hh
    Short, // h
    Long,  // l
    LongLong, // ll
}

impl Length {
    /// Integer bit width. `Long` follows the host word size.
    fn int_bits(self) -> u32 {
        match self {
            Self::Char => 8,
            Self::Short => 16,
            Self::None => 32,
            Self::Long => usize::BITS,
            Self::LongLong => 64,
        }
    }
}

/// Lazy scanner over a format string.
///
/// Yields `Result<Directive>`; the first error ends the iteration. The codec
/// pulls one directive per argument so a bad trailing group is only reported
/// when reached.
#[derive(Debug, Clone)]
pub struct FormatScanner<'f> {
    src: &'f [u8],
    pos: usize,
}

impl<'f> FormatScanner<'f> {
    /// Scanner over `fmt`, positioned at the start.
    #[must_use]
    pub fn new(fmt: &'f str) -> Self {
        Self {
            src: fmt.as_bytes(),
            pos: 0,
        }
    }

    /// Byte offset of the next unscanned character.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn err(&self, pos: usize, reason: &'static str) -> Error {
        Error::InvalidFormat { pos, reason }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn scan_length(&mut self) -> Length {
        match self.peek() {
            Some(b'h') => {
                self.pos += 1;
                if self.peek() == Some(b'h') {
                    self.pos += 1;
                    Length::Char
                } else {
                    Length::Short
                }
            }
            Some(b'l') => {
                self.pos += 1;
                if self.peek() == Some(b'l') {
                    self.pos += 1;
                    Length::LongLong
                } else {
                    Length::Long
                }
            }
            _ => Length::None,
        }
    }

    fn int_directive(signed: bool, bits: u32) -> Directive {
        match (signed, bits) {
            (true, 8) => Directive::I8,
            (false, 8) => Directive::U8,
            (true, 16) => Directive::I16,
            (false, 16) => Directive::U16,
            (true, 32) => Directive::I32,
            (false, 32) => Directive::U32,
            (true, _) => Directive::I64,
            (false, _) => Directive::U64,
        }
    }

    /// Scan the next directive, or `None` at end of string.
    pub fn next_directive(&mut self) -> Option<Result<Directive>> {
        self.skip_whitespace();
        let start = self.pos;
        match self.bump() {
            None => None,
            Some(b'%') => Some(self.scan_conversion(start)),
            Some(_) => Some(Err(self.err(start, "stray text between directives"))),
        }
    }

    fn scan_conversion(&mut self, start: usize) -> Result<Directive> {
        // "%ms" asks for an owned string on decode.
        if self.peek() == Some(b'm') {
            self.pos += 1;
            return match self.bump() {
                Some(b's') => Ok(Directive::StrOwned),
                _ => Err(self.err(start, "'m' is only valid before 's'")),
            };
        }

        let length = self.scan_length();
        let conv = self
            .bump()
            .ok_or_else(|| self.err(start, "truncated directive"))?;
        match conv {
            b'i' | b'd' => Ok(Self::int_directive(true, length.int_bits())),
            b'u' => Ok(Self::int_directive(false, length.int_bits())),
            // A bare "%x" is a file descriptor; with a length modifier it is
            // an unsigned integer written in hex at the call site.
            b'x' | b'X' => {
                if length == Length::None && conv == b'x' {
                    Ok(Directive::Fd)
                } else {
                    Ok(Self::int_directive(false, length.int_bits()))
                }
            }
            b'f' | b'F' | b'e' | b'E' | b'g' | b'G' => match length {
                Length::None => Ok(Directive::F32),
                Length::Long => Ok(Directive::F64),
                _ => Err(self.err(start, "bad length modifier for float")),
            },
            b's' => {
                if length == Length::None {
                    Ok(Directive::Str)
                } else {
                    Err(self.err(start, "bad length modifier for string"))
                }
            }
            b'p' => {
                if length != Length::None {
                    return Err(self.err(start, "bad length modifier for buffer"));
                }
                // The buffer value is always paired with its "%u" size.
                self.skip_whitespace();
                let pair = self.pos;
                if self.bump() != Some(b'%') || self.bump() != Some(b'u') {
                    return Err(self.err(pair, "'%p' must be followed by '%u'"));
                }
                Ok(Directive::Buf)
            }
            _ => Err(self.err(start, "unknown conversion")),
        }
    }

    /// Scan the whole string eagerly. Used where the argument list is
    /// already in hand and a count check is wanted up front.
    pub fn scan_all(fmt: &str) -> Result<Vec<Directive>> {
        let mut scanner = FormatScanner::new(fmt);
        let mut out = Vec::new();
        while let Some(dir) = scanner.next_directive() {
            out.push(dir?);
        }
        Ok(out)
    }
}

impl Iterator for FormatScanner<'_> {
    type Item = Result<Directive>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_directive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(fmt: &str) -> Result<Vec<Directive>> {
        FormatScanner::scan_all(fmt)
    }

    #[test]
    fn integer_widths() {
        assert_eq!(
            scan("%hhi%hhu%hi%hu%i%u%lli%llu").unwrap(),
            vec![
                Directive::I8,
                Directive::U8,
                Directive::I16,
                Directive::U16,
                Directive::I32,
                Directive::U32,
                Directive::I64,
                Directive::U64,
            ]
        );
        assert_eq!(scan("%d").unwrap(), vec![Directive::I32]);
    }

    #[test]
    fn long_follows_host_word_size() {
        let expect = if usize::BITS == 64 {
            vec![Directive::I64, Directive::U64]
        } else {
            vec![Directive::I32, Directive::U32]
        };
        assert_eq!(scan("%li%lu").unwrap(), expect);
    }

    #[test]
    fn hex_with_length_is_integer_bare_is_fd() {
        assert_eq!(scan("%hhx").unwrap(), vec![Directive::U8]);
        assert_eq!(scan("%llx").unwrap(), vec![Directive::U64]);
        assert_eq!(scan("%x").unwrap(), vec![Directive::Fd]);
    }

    #[test]
    fn floats() {
        assert_eq!(scan("%f%e%G").unwrap(), vec![Directive::F32; 3]);
        assert_eq!(scan("%lf%lE").unwrap(), vec![Directive::F64; 2]);
        assert!(scan("%hf").is_err());
    }

    #[test]
    fn strings_and_buffers() {
        assert_eq!(scan("%s").unwrap(), vec![Directive::Str]);
        assert_eq!(scan("%ms").unwrap(), vec![Directive::StrOwned]);
        assert_eq!(scan("%p%u").unwrap(), vec![Directive::Buf]);
        assert_eq!(scan("%p %u").unwrap(), vec![Directive::Buf]);
    }

    #[test]
    fn unpaired_buffer_is_rejected() {
        assert!(matches!(
            scan("%p%s"),
            Err(Error::InvalidFormat { .. })
        ));
        assert!(scan("%p").is_err());
    }

    #[test]
    fn whitespace_is_ignored_stray_text_is_not() {
        assert_eq!(
            scan(" %u\t%s ").unwrap(),
            vec![Directive::U32, Directive::Str]
        );
        assert!(matches!(
            scan("%u id=%s"),
            Err(Error::InvalidFormat { pos: 3, .. })
        ));
    }

    #[test]
    fn unknown_conversion_is_rejected() {
        assert!(scan("%q").is_err());
        assert!(scan("%m").is_err());
        assert!(scan("%mq").is_err());
        assert!(scan("%").is_err());
    }

    #[test]
    fn empty_format_scans_to_nothing() {
        assert!(scan("").unwrap().is_empty());
        assert!(scan("  ").unwrap().is_empty());
    }
}
