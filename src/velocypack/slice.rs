//! VelocyPack decoder

use super::{
    translate_attribute, VPackError, COMPACT_ARRAY, COMPACT_OBJECT, LONG_STRING, MAX_DEPTH,
};
use serde_json::{Map, Number, Value};

type Result<T> = std::result::Result<T, VPackError>;

/// Decode exactly one value; trailing bytes are an error.
pub fn from_slice(bytes: &[u8]) -> Result<Value> {
    let (value, used) = read_value(bytes)?;
    if used != bytes.len() {
        return Err(VPackError::TrailingBytes(bytes.len() - used));
    }
    Ok(value)
}

/// Decode the value at the start of `bytes`, returning it together with the
/// number of bytes it occupies.
pub fn read_value(bytes: &[u8]) -> Result<(Value, usize)> {
    read_nested(bytes, 0)
}

fn read_nested(bytes: &[u8], depth: usize) -> Result<(Value, usize)> {
    if depth > MAX_DEPTH {
        return Err(VPackError::TooDeep(MAX_DEPTH));
    }
    let size = value_size(bytes)?;
    let data = take(bytes, 0, size)?;
    let head = data[0];

    let value = match head {
        0x01 => Value::Array(Vec::new()),
        0x0a => Value::Object(Map::new()),
        0x18 => Value::Null,
        0x19 => Value::Bool(false),
        0x1a => Value::Bool(true),
        0x1b => {
            let f = f64::from_le_bytes(fixed8(take(data, 1, 8)?));
            Value::Number(Number::from_f64(f).ok_or(VPackError::NonFiniteDouble)?)
        }
        0x1c => Value::from(i64::from_le_bytes(fixed8(take(data, 1, 8)?))),
        0x20..=0x27 => Value::from(read_int(&data[1..])),
        0x28..=0x2f => Value::from(read_uint(&data[1..])),
        0x30..=0x39 => Value::from(head - 0x30),
        0x3a..=0x3f => Value::from(head as i64 - 0x40),
        0x40..=0xbe => Value::String(utf8(&data[1..])?),
        LONG_STRING => Value::String(utf8(&data[9..])?),
        0x02..=0x05 => read_array_without_index(data, head, depth + 1)?,
        0x06..=0x09 => read_indexed_array(data, head, depth + 1)?,
        0x0b..=0x12 => read_indexed_object(data, head, depth + 1)?,
        COMPACT_ARRAY => read_compact_array(data, depth + 1)?,
        COMPACT_OBJECT => read_compact_object(data, depth + 1)?,
        other => return Err(VPackError::UnsupportedType(other)),
    };

    Ok((value, size))
}

/// Number of bytes the value at the start of `bytes` occupies.
pub fn value_size(bytes: &[u8]) -> Result<usize> {
    let head = *bytes.first().ok_or(VPackError::UnexpectedEof {
        offset: 0,
        needed: 1,
    })?;

    let size = match head {
        0x01 | 0x0a | 0x18..=0x1a | 0x1e | 0x1f | 0x30..=0x3f => 1,
        0x1b | 0x1c => 9,
        0x20..=0x27 => 1 + (head - 0x1f) as usize,
        0x28..=0x2f => 1 + (head - 0x27) as usize,
        0x40..=0xbe => 1 + (head - 0x40) as usize,
        LONG_STRING => 9 + to_usize(read_uint(take(bytes, 1, 8)?))?,
        0x02..=0x09 => {
            let width = 1usize << ((head - 0x02) % 4);
            to_usize(read_uint(take(bytes, 1, width)?))?
        }
        0x0b..=0x12 => {
            let width = 1usize << ((head - 0x0b) % 4);
            to_usize(read_uint(take(bytes, 1, width)?))?
        }
        COMPACT_ARRAY | COMPACT_OBJECT => to_usize(read_varint(&bytes[1..])?.0)?,
        0xc0..=0xc7 => {
            let width = (head - 0xbf) as usize;
            1 + width + to_usize(read_uint(take(bytes, 1, width)?))?
        }
        other => return Err(VPackError::UnsupportedType(other)),
    };

    if size == 0 {
        return Err(VPackError::InvalidLength(format!(
            "zero byte length for type 0x{head:02x}"
        )));
    }
    Ok(size)
}

fn read_array_without_index(data: &[u8], head: u8, depth: usize) -> Result<Value> {
    let width = 1usize << (head - 0x02);
    let mut start = 1 + width;
    // optional zero padding between header and first item
    while start < data.len() && data[start] == 0x00 {
        start += 1;
    }
    if start >= data.len() {
        return Ok(Value::Array(Vec::new()));
    }

    let item_size = value_size(&data[start..])?;
    let region = data.len() - start;
    if region % item_size != 0 {
        return Err(VPackError::InvalidLength(format!(
            "array region {region} not a multiple of item size {item_size}"
        )));
    }

    let mut items = Vec::with_capacity(region / item_size);
    for offset in (start..data.len()).step_by(item_size) {
        items.push(read_nested(&data[offset..offset + item_size], depth)?.0);
    }
    Ok(Value::Array(items))
}

/// Locate the index table of an indexed array/object. Returns the item
/// count and the start of the table.
fn index_table(data: &[u8], width: usize) -> Result<(usize, usize)> {
    let len = data.len();
    if width < 8 {
        let count = to_usize(read_uint(take(data, 1 + width, width)?))?;
        let table = count
            .checked_mul(width)
            .and_then(|t| len.checked_sub(t))
            .ok_or_else(|| VPackError::InvalidLength(format!("{count} items exceed {len} bytes")))?;
        Ok((count, table))
    } else {
        let count_at = len
            .checked_sub(8)
            .ok_or_else(|| VPackError::InvalidLength("missing item count".to_string()))?;
        let count = to_usize(read_uint(take(data, count_at, 8)?))?;
        let table = count
            .checked_mul(8)
            .and_then(|t| count_at.checked_sub(t))
            .ok_or_else(|| VPackError::InvalidLength(format!("{count} items exceed {len} bytes")))?;
        Ok((count, table))
    }
}

fn item_offsets(data: &[u8], width: usize) -> Result<Vec<usize>> {
    let (count, table) = index_table(data, width)?;
    (0..count)
        .map(|i| {
            let offset = to_usize(read_uint(take(data, table + i * width, width)?))?;
            if offset == 0 || offset >= table {
                return Err(VPackError::InvalidLength(format!(
                    "index entry {offset} outside data region"
                )));
            }
            Ok(offset)
        })
        .collect()
}

fn read_indexed_array(data: &[u8], head: u8, depth: usize) -> Result<Value> {
    let width = 1usize << (head - 0x06);
    let items = item_offsets(data, width)?
        .into_iter()
        .map(|offset| read_nested(&data[offset..], depth).map(|(v, _)| v))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Array(items))
}

fn read_indexed_object(data: &[u8], head: u8, depth: usize) -> Result<Value> {
    let width = 1usize << ((head - 0x0b) % 4);
    let mut map = Map::new();
    for offset in item_offsets(data, width)? {
        let (key, key_size) = read_key(&data[offset..])?;
        let rest = data.get(offset + key_size..).ok_or(VPackError::UnexpectedEof {
            offset: offset + key_size,
            needed: 1,
        })?;
        let (value, _) = read_nested(rest, depth)?;
        map.insert(key, value);
    }
    Ok(Value::Object(map))
}

fn compact_bounds(data: &[u8]) -> Result<(usize, usize, usize)> {
    let (_, length_len) = read_varint(&data[1..])?;
    let (count, count_len) = read_reverse_varint(data)?;
    let start = 1 + length_len;
    let end = data
        .len()
        .checked_sub(count_len)
        .filter(|end| *end >= start)
        .ok_or_else(|| VPackError::InvalidLength("compact value too short".to_string()))?;
    Ok((to_usize(count)?, start, end))
}

fn read_compact_array(data: &[u8], depth: usize) -> Result<Value> {
    let (count, mut pos, end) = compact_bounds(data)?;
    let mut items = Vec::with_capacity(count.min(end - pos));
    for _ in 0..count {
        let (value, used) = read_nested(&data[pos..end], depth)?;
        items.push(value);
        pos += used;
    }
    Ok(Value::Array(items))
}

fn read_compact_object(data: &[u8], depth: usize) -> Result<Value> {
    let (count, mut pos, end) = compact_bounds(data)?;
    let mut map = Map::new();
    for _ in 0..count {
        let (key, key_size) = read_key(&data[pos..end])?;
        pos += key_size;
        let (value, used) = read_nested(&data[pos..end], depth)?;
        pos += used;
        map.insert(key, value);
    }
    Ok(Value::Object(map))
}

fn read_key(bytes: &[u8]) -> Result<(String, usize)> {
    let head = *bytes.first().ok_or(VPackError::UnexpectedEof {
        offset: 0,
        needed: 1,
    })?;
    match head {
        0x40..=0xbf => match read_value(bytes)? {
            (Value::String(s), size) => Ok((s, size)),
            _ => Err(VPackError::InvalidKey(head)),
        },
        0x30..=0x39 | 0x28..=0x2f => {
            let (value, size) = read_value(bytes)?;
            let id = value.as_u64().ok_or(VPackError::InvalidKey(head))?;
            let name = translate_attribute(id).ok_or(VPackError::UnknownAttribute(id))?;
            Ok((name.to_string(), size))
        }
        other => Err(VPackError::InvalidKey(other)),
    }
}

fn take(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(VPackError::UnexpectedEof {
            offset,
            needed: len,
        })
}

fn fixed8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

fn read_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (*b as u64) << (8 * i))
}

fn read_int(bytes: &[u8]) -> i64 {
    let width = bytes.len().min(8);
    let raw = read_uint(&bytes[..width]);
    let shift = 64 - 8 * width as u32;
    ((raw << shift) as i64) >> shift
}

fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(VPackError::InvalidLength("unterminated varint".to_string()))
}

fn read_reverse_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in data.iter().rev().enumerate().take(10) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(VPackError::InvalidLength("unterminated item count".to_string()))
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| VPackError::InvalidLength(format!("{value} too large")))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| VPackError::InvalidUtf8)
}
