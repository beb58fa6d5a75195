//! VelocyStream 1.1 chunk framing
//!
//! Every message is split into chunks, each prefixed by a 24 byte
//! little-endian header:
//!
//! | offset | size | field                                          |
//! |--------|------|------------------------------------------------|
//! | 0      | 4    | chunk length, header included                  |
//! | 4      | 4    | chunkX: `count << 1 \| 1` first, `index << 1` rest |
//! | 8      | 8    | message id                                     |
//! | 16     | 8    | total message length                           |

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sent once by the client right after connecting
pub const VST_HANDSHAKE: &[u8] = b"VST/1.1\r\n\r\n";

pub const CHUNK_HEADER_SIZE: usize = 24;

/// Largest chunk or message accepted from a peer
pub const MAX_MESSAGE_SIZE: u64 = 256 * 1024 * 1024; // 256 MB

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub length: u32,
    pub chunk_x: u32,
    pub message_id: u64,
    pub message_length: u64,
}

impl ChunkHeader {
    pub fn is_first(&self) -> bool {
        self.chunk_x & 1 == 1
    }

    /// Number of chunks for a first chunk, position otherwise
    pub fn count_or_index(&self) -> u32 {
        self.chunk_x >> 1
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - CHUNK_HEADER_SIZE
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.chunk_x);
        buf.put_u64_le(self.message_id);
        buf.put_u64_le(self.message_length);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

/// Split `message` into framed chunks of at most `chunk_size` bytes
pub fn split_message(message_id: u64, message: &[u8], chunk_size: usize) -> Vec<Bytes> {
    let max_payload = chunk_size.saturating_sub(CHUNK_HEADER_SIZE).max(1);
    let pieces: Vec<&[u8]> = if message.is_empty() {
        vec![message]
    } else {
        message.chunks(max_payload).collect()
    };
    let count = pieces.len() as u32;

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, payload)| {
            let chunk_x = if index == 0 {
                (count << 1) | 1
            } else {
                (index as u32) << 1
            };
            let header = ChunkHeader {
                length: (CHUNK_HEADER_SIZE + payload.len()) as u32,
                chunk_x,
                message_id,
                message_length: message.len() as u64,
            };
            let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + payload.len());
            header.write(&mut buf);
            buf.put_slice(payload);
            buf.freeze()
        })
        .collect()
}

/// Write a whole message, chunked
pub async fn write_message<T>(
    stream: &mut T,
    message_id: u64,
    message: &[u8],
    chunk_size: usize,
) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    for chunk in split_message(message_id, message, chunk_size) {
        stream.write_all(&chunk).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Read one chunk from the stream
pub async fn read_chunk<T>(stream: &mut T) -> Result<Chunk>
where
    T: AsyncRead + Unpin,
{
    let length = stream.read_u32_le().await?;
    if (length as usize) < CHUNK_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "chunk length {} is shorter than its header",
            length
        )));
    }
    if length as u64 > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "chunk too large: {} bytes (max: {})",
            length, MAX_MESSAGE_SIZE
        )));
    }

    let header = ChunkHeader {
        length,
        chunk_x: stream.read_u32_le().await?,
        message_id: stream.read_u64_le().await?,
        message_length: stream.read_u64_le().await?,
    };
    if header.message_length > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "message too large: {} bytes (max: {})",
            header.message_length, MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; header.payload_len()];
    stream.read_exact(&mut payload).await?;

    Ok(Chunk {
        header,
        payload: Bytes::from(payload),
    })
}

#[derive(Debug, Default)]
struct PartialMessage {
    expected: Option<u32>,
    message_length: u64,
    pieces: BTreeMap<u32, Bytes>,
}

/// Reassembles interleaved chunks into messages
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: HashMap<u64, PartialMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages still waiting for chunks
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Add a chunk; returns the message once its last chunk arrived
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<(u64, Bytes)>> {
        let header = chunk.header;
        let id = header.message_id;

        if header.is_first() && header.count_or_index() == 1 {
            if chunk.payload.len() as u64 != header.message_length {
                return Err(Error::Protocol(format!(
                    "message {} declares {} bytes but carries {}",
                    id,
                    header.message_length,
                    chunk.payload.len()
                )));
            }
            return Ok(Some((id, chunk.payload)));
        }

        let partial = self.partial.entry(id).or_default();
        let index = if header.is_first() {
            if header.count_or_index() == 0 {
                return Err(Error::Protocol(format!("message {} has zero chunks", id)));
            }
            partial.expected = Some(header.count_or_index());
            partial.message_length = header.message_length;
            0
        } else {
            header.count_or_index()
        };
        if partial.pieces.insert(index, chunk.payload).is_some() {
            return Err(Error::Protocol(format!(
                "duplicate chunk {} for message {}",
                index, id
            )));
        }

        match partial.expected {
            Some(expected) if partial.pieces.len() as u32 >= expected => {
                let Some(partial) = self.partial.remove(&id) else {
                    return Ok(None);
                };
                let mut message = BytesMut::with_capacity(partial.message_length as usize);
                for piece in partial.pieces.into_values() {
                    message.extend_from_slice(&piece);
                }
                if message.len() as u64 != partial.message_length {
                    return Err(Error::Protocol(format!(
                        "message {} declares {} bytes but assembled {}",
                        id,
                        partial.message_length,
                        message.len()
                    )));
                }
                Ok(Some((id, message.freeze())))
            }
            _ => Ok(None),
        }
    }
}
