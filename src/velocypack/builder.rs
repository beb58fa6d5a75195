//! VelocyPack encoder

use super::{
    VPackError, COMPACT_ARRAY, COMPACT_OBJECT, DOUBLE, EMPTY_ARRAY, EMPTY_OBJECT, FALSE,
    LONG_STRING, MAX_DEPTH, MAX_SHORT_STRING, NULL, SHORT_STRING, TRUE,
};
use serde_json::{Map, Number, Value};

type Result<T> = std::result::Result<T, VPackError>;

/// Encode a value tree into a fresh buffer
pub fn to_vec(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Append the encoding of `value` to `out`
///
/// Fails with [`VPackError::TooDeep`] when nesting exceeds [`MAX_DEPTH`].
pub fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    write_nested(out, value, 0)
}

fn write_nested(out: &mut Vec<u8>, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(VPackError::TooDeep(MAX_DEPTH));
    }
    match value {
        Value::Null => out.push(NULL),
        Value::Bool(false) => out.push(FALSE),
        Value::Bool(true) => out.push(TRUE),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => return write_array(out, items, depth + 1),
        Value::Object(map) => return write_object(out, map, depth + 1),
    }
    Ok(())
}

fn write_number(out: &mut Vec<u8>, n: &Number) {
    if let Some(i) = n.as_i64() {
        write_int(out, i);
    } else if let Some(u) = n.as_u64() {
        write_uint(out, u);
    } else if let Some(f) = n.as_f64() {
        out.push(DOUBLE);
        out.extend_from_slice(&f.to_le_bytes());
    }
}

fn write_int(out: &mut Vec<u8>, value: i64) {
    match value {
        0..=9 => out.push(0x30 + value as u8),
        -6..=-1 => out.push((0x40 + value) as u8),
        v if v > 0 => write_uint(out, v as u64),
        v => {
            // smallest width whose signed range still holds v
            let width = (1..=8usize)
                .find(|w| *w == 8 || v >= -(1i64 << (8 * w - 1)))
                .unwrap_or(8);
            out.push(0x1f + width as u8);
            out.extend_from_slice(&v.to_le_bytes()[..width]);
        }
    }
}

fn write_uint(out: &mut Vec<u8>, value: u64) {
    if value <= 9 {
        out.push(0x30 + value as u8);
        return;
    }
    let bits = 64 - value.leading_zeros() as usize;
    let width = bits.div_ceil(8).max(1);
    out.push(0x27 + width as u8);
    out.extend_from_slice(&value.to_le_bytes()[..width]);
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    if bytes.len() <= MAX_SHORT_STRING {
        out.push(SHORT_STRING + bytes.len() as u8);
    } else {
        out.push(LONG_STRING);
        out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    }
    out.extend_from_slice(bytes);
}

fn write_array(out: &mut Vec<u8>, items: &[Value], depth: usize) -> Result<()> {
    if items.is_empty() {
        out.push(EMPTY_ARRAY);
        return Ok(());
    }
    let mut body = Vec::new();
    for item in items {
        write_nested(&mut body, item, depth)?;
    }
    write_compact(out, COMPACT_ARRAY, &body, items.len());
    Ok(())
}

fn write_object(out: &mut Vec<u8>, map: &Map<String, Value>, depth: usize) -> Result<()> {
    if map.is_empty() {
        out.push(EMPTY_OBJECT);
        return Ok(());
    }
    let mut body = Vec::new();
    for (key, value) in map {
        write_string(&mut body, key);
        write_nested(&mut body, value, depth)?;
    }
    write_compact(out, COMPACT_OBJECT, &body, map.len());
    Ok(())
}

/// Compact layout: head, byte length (varint, counting itself), items,
/// item count (varint stored back to front).
fn write_compact(out: &mut Vec<u8>, head: u8, body: &[u8], count: usize) {
    let fixed = 1 + body.len() + varint_len(count as u64);
    let mut length_len = 1;
    while varint_len((fixed + length_len) as u64) > length_len {
        length_len += 1;
    }
    out.push(head);
    write_varint(out, (fixed + length_len) as u64);
    out.extend_from_slice(body);
    let mut count_bytes = Vec::with_capacity(varint_len(count as u64));
    write_varint(&mut count_bytes, count as u64);
    out.extend(count_bytes.iter().rev());
}

pub(super) fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub(super) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}
