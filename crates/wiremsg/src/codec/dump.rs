//! Human-readable payload rendering, for logs and tooling.

use std::fmt::Write as _;

use super::Tag;

fn take<'a>(payload: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
    let end = pos.checked_add(n).filter(|&end| end <= payload.len())?;
    let bytes = &payload[*pos..end];
    *pos = end;
    Some(bytes)
}

fn take_u32(payload: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = take(payload, pos, 4)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Some(u32::from_le_bytes(arr))
}

fn dump_record(out: &mut String, payload: &[u8], pos: &mut usize, fd_idx: &mut usize) -> bool {
    let Some(tag_byte) = take(payload, pos, 1) else {
        return false;
    };
    let Some(tag) = Tag::from_u8(tag_byte[0]) else {
        out.push_str("<invalid: unknown tag>");
        return false;
    };
    let ok = match tag {
        Tag::I8 => take(payload, pos, 1)
            .map(|b| {
                let _ = write!(out, "I8:{}", b[0] as i8);
            })
            .is_some(),
        Tag::U8 => take(payload, pos, 1)
            .map(|b| {
                let _ = write!(out, "U8:{}", b[0]);
            })
            .is_some(),
        Tag::I16 => take(payload, pos, 2)
            .map(|b| {
                let v = i16::from_le_bytes([b[0], b[1]]);
                let _ = write!(out, "I16:{v}");
            })
            .is_some(),
        Tag::U16 => take(payload, pos, 2)
            .map(|b| {
                let v = u16::from_le_bytes([b[0], b[1]]);
                let _ = write!(out, "U16:{v}");
            })
            .is_some(),
        Tag::I32 => take(payload, pos, 4)
            .map(|b| {
                let v = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let _ = write!(out, "I32:{v}");
            })
            .is_some(),
        Tag::U32 => take(payload, pos, 4)
            .map(|b| {
                let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let _ = write!(out, "U32:{v}");
            })
            .is_some(),
        Tag::I64 => take(payload, pos, 8)
            .map(|b| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                let _ = write!(out, "I64:{}", i64::from_le_bytes(arr));
            })
            .is_some(),
        Tag::U64 => take(payload, pos, 8)
            .map(|b| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                let _ = write!(out, "U64:{}", u64::from_le_bytes(arr));
            })
            .is_some(),
        Tag::F32 => take(payload, pos, 4)
            .map(|b| {
                let mut arr = [0u8; 4];
                arr.copy_from_slice(b);
                let _ = write!(out, "F32:{}", f32::from_le_bytes(arr));
            })
            .is_some(),
        Tag::F64 => take(payload, pos, 8)
            .map(|b| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                let _ = write!(out, "F64:{}", f64::from_le_bytes(arr));
            })
            .is_some(),
        Tag::Str => (|| {
            let len = take_u32(payload, pos)? as usize;
            let bytes = take(payload, pos, len)?;
            let content = bytes.split_last().map_or(&bytes[..0], |(_, rest)| rest);
            let _ = write!(out, "STR:'{}'", String::from_utf8_lossy(content));
            Some(())
        })()
        .is_some(),
        Tag::Buf => (|| {
            let len = take_u32(payload, pos)? as usize;
            take(payload, pos, len)?;
            let _ = write!(out, "BUF:[{len} bytes]");
            Some(())
        })()
        .is_some(),
        Tag::Fd => take_u32(payload, pos)
            .map(|_| {
                let _ = write!(out, "FD:#{fd_idx}");
                *fd_idx += 1;
            })
            .is_some(),
    };
    if !ok {
        out.push_str("<invalid: truncated record>");
    }
    ok
}

/// Render `{ID:…, TAG:value, …}` for a payload.
///
/// Tolerates malformed input: the dump stops at the first bad record and
/// marks it, so this is safe on unvalidated bytes.
pub(crate) fn dump_payload(msgid: u32, payload: &[u8]) -> String {
    let mut out = String::new();
    let _ = write!(out, "{{ID:{msgid}");
    let mut pos = 0;
    let mut fd_idx = 0;
    while pos < payload.len() {
        out.push_str(", ");
        if !dump_record(&mut out, payload, &mut pos, &mut fd_idx) {
            break;
        }
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_mixed_payload() {
        let mut payload = vec![Tag::U32 as u8];
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.push(Tag::Str as u8);
        payload.extend_from_slice(&5u32.to_le_bytes());
        payload.extend_from_slice(b"PING\0");
        assert_eq!(
            dump_payload(42, &payload),
            "{ID:42, U32:10, STR:'PING'}"
        );
    }

    #[test]
    fn marks_truncation() {
        let payload = [Tag::U32 as u8, 1, 2];
        assert_eq!(
            dump_payload(1, &payload),
            "{ID:1, <invalid: truncated record>}"
        );
    }

    #[test]
    fn marks_unknown_tag() {
        assert_eq!(dump_payload(1, &[0xEE]), "{ID:1, <invalid: unknown tag>}");
    }

    #[test]
    fn empty_payload_is_just_the_id() {
        assert_eq!(dump_payload(7, &[]), "{ID:7}");
    }
}
