//! VelocyPack binary encoding
//!
//! VelocyPack is ArangoDB's compact, self-describing binary format. Every
//! value starts with a one-byte head that determines its type and, for
//! variable-sized types, how its length is stored.
//!
//! ## Supported Layouts
//!
//! | Head          | Type                                        |
//! |---------------|---------------------------------------------|
//! | `0x01`        | empty array                                 |
//! | `0x02..=0x05` | array, equal-sized items, no index table    |
//! | `0x06..=0x09` | array with index table                      |
//! | `0x0a`        | empty object                                |
//! | `0x0b..=0x12` | object with index table (sorted / unsorted) |
//! | `0x13`/`0x14` | compact array / compact object              |
//! | `0x18..=0x1a` | null, false, true                           |
//! | `0x1b`        | double                                      |
//! | `0x1c`        | UTC date (milliseconds, decoded as integer) |
//! | `0x20..=0x2f` | signed / unsigned integers, 1-8 bytes       |
//! | `0x30..=0x3f` | small integers -6..=9                       |
//! | `0x40..=0xbf` | short / long strings                        |
//!
//! The encoder always produces the compact array/object layouts, which need
//! no index table and no padding. The decoder accepts every layout above
//! because servers emit indexed layouts.
//!
//! Values pass through [`serde_json::Value`], which keeps signed, unsigned
//! and floating point numbers apart, so integers survive a round trip
//! unchanged.

mod builder;
mod slice;

pub use builder::{to_vec, write_value};
pub use slice::{from_slice, read_value, value_size};

use thiserror::Error;

/// Head bytes
pub const EMPTY_ARRAY: u8 = 0x01;
pub const EMPTY_OBJECT: u8 = 0x0a;
pub const COMPACT_ARRAY: u8 = 0x13;
pub const COMPACT_OBJECT: u8 = 0x14;
pub const NULL: u8 = 0x18;
pub const FALSE: u8 = 0x19;
pub const TRUE: u8 = 0x1a;
pub const DOUBLE: u8 = 0x1b;
pub const UTC_DATE: u8 = 0x1c;
pub const SHORT_STRING: u8 = 0x40;
pub const LONG_STRING: u8 = 0xbf;

/// Longest string that fits the short-string head
pub const MAX_SHORT_STRING: usize = 126;

/// Deepest array/object nesting accepted by the encoder and decoder
pub const MAX_DEPTH: usize = 128;

/// Errors raised while encoding or decoding VelocyPack
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VPackError {
    #[error("unexpected end of input: needed {needed} bytes at offset {offset}")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("unsupported value type 0x{0:02x}")]
    UnsupportedType(u8),

    #[error("invalid object key type 0x{0:02x}")]
    InvalidKey(u8),

    #[error("unknown attribute translation {0}")]
    UnknownAttribute(u64),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("double is not finite")]
    NonFiniteDouble,

    #[error("invalid length or offset: {0}")]
    InvalidLength(String),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

/// Maps the integer keys the server uses for well-known attributes.
pub fn translate_attribute(id: u64) -> Option<&'static str> {
    match id {
        1 => Some("_key"),
        2 => Some("_rev"),
        3 => Some("_id"),
        4 => Some("_from"),
        5 => Some("_to"),
        _ => None,
    }
}
