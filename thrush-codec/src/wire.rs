//! Thrift binary protocol wire tags and value skipping. Everything on the
//! wire is big-endian; length prefixes are 4 bytes.

pub const T_STOP: u8 = 0;
pub const T_BOOL: u8 = 2;
pub const T_I8: u8 = 3;
pub const T_DOUBLE: u8 = 4;
pub const T_I16: u8 = 6;
pub const T_I32: u8 = 8;
pub const T_I64: u8 = 10;
pub const T_STRING: u8 = 11;
pub const T_STRUCT: u8 = 12;
pub const T_MAP: u8 = 13;
pub const T_SET: u8 = 14;
pub const T_LIST: u8 = 15;

pub const SKIP_EOF: i64 = -1;
pub const SKIP_INVALID: i64 = -2;
pub const SKIP_DEPTH: i64 = -3;

const MAX_SKIP_DEPTH: u32 = 64;

fn fixed_size(tag: u8) -> Option<usize> {
    match tag {
        T_BOOL | T_I8 => Some(1),
        T_I16 => Some(2),
        T_I32 => Some(4),
        T_DOUBLE | T_I64 => Some(8),
        _ => None,
    }
}

/// Skip one value of type `tag` at the start of `data`. Returns the byte
/// count consumed, or a negative `SKIP_*` code.
pub fn skip(data: &[u8], tag: u8) -> i64 {
    match skip_value(data, 0, tag, 0) {
        Ok(end) => end as i64,
        Err(code) => code,
    }
}

fn take(data: &[u8], pos: usize, n: usize) -> Result<usize, i64> {
    let end = pos.checked_add(n).ok_or(SKIP_EOF)?;
    if end <= data.len() { Ok(end) } else { Err(SKIP_EOF) }
}

fn read_len(data: &[u8], pos: usize) -> Result<usize, i64> {
    if pos + 4 > data.len() {
        return Err(SKIP_EOF);
    }
    let raw = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
    Ok(u32::from_be_bytes(raw) as usize)
}

fn skip_value(data: &[u8], pos: usize, tag: u8, depth: u32) -> Result<usize, i64> {
    if depth > MAX_SKIP_DEPTH {
        return Err(SKIP_DEPTH);
    }
    if let Some(n) = fixed_size(tag) {
        return take(data, pos, n);
    }
    match tag {
        T_STRING => {
            let len = read_len(data, pos)?;
            take(data, pos + 4, len)
        }
        T_STRUCT => {
            let mut pos = pos;
            loop {
                let ftag = *data.get(pos).ok_or(SKIP_EOF)?;
                pos += 1;
                if ftag == T_STOP {
                    return Ok(pos);
                }
                pos = take(data, pos, 2)?;
                pos = skip_value(data, pos, ftag, depth + 1)?;
            }
        }
        T_MAP => {
            let ktag = *data.get(pos).ok_or(SKIP_EOF)?;
            let vtag = *data.get(pos + 1).ok_or(SKIP_EOF)?;
            let count = read_len(data, pos + 2)?;
            let mut pos = pos + 6;
            for _ in 0..count {
                pos = skip_value(data, pos, ktag, depth + 1)?;
                pos = skip_value(data, pos, vtag, depth + 1)?;
            }
            Ok(pos)
        }
        T_SET | T_LIST => {
            let etag = *data.get(pos).ok_or(SKIP_EOF)?;
            let count = read_len(data, pos + 1)?;
            let mut pos = pos + 5;
            for _ in 0..count {
                pos = skip_value(data, pos, etag, depth + 1)?;
            }
            Ok(pos)
        }
        _ => Err(SKIP_INVALID),
    }
}
