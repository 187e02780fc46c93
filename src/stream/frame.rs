//! Binary stream framing.
//!
//! A server-streamed response body in the protobuf encoding is a sequence of
//! length-delimited frames:
//!
//! ```text
//! frame   := tag varint, length varint, payload
//! tag     := 0x0A (message, field 1) | 0x12 (trailer, field 2)
//! trailer := "EOF" | JSON error envelope
//! ```
//!
//! The trailer is always the last frame. This module holds pure encode and
//! decode functions over byte buffers; reading from a body lives in
//! [`super::reader`].

use crate::error::Error;
use crate::error::envelope::{marshal_error, unmarshal_error};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Field tag of a message frame: field 1, length-delimited.
pub const MESSAGE_TAG: u64 = (1 << 3) | 2;

/// Field tag of the trailer frame: field 2, length-delimited.
pub const TRAILER_TAG: u64 = (2 << 3) | 2;

/// Largest frame payload a reader accepts.
pub const MAX_FRAME_BYTES: usize = 1 << 21;

/// Trailer payload marking a clean end of stream.
pub const EOF_TRAILER: &[u8] = b"EOF";

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Trailer {
    Eof,
    Error(Error),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Bytes),
    Trailer(Trailer),
}

/// Framing violations found while decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid field tag: {0}")]
    InvalidTag(u64),

    #[error("message length {len} exceeds maximum {max}")]
    TooLarge { len: u64, max: usize },

    #[error("malformed varint")]
    MalformedVarint,

    #[error("unable to decode trailer: {0}")]
    InvalidTrailer(#[from] serde_json::Error),
}

/// Appends a message frame carrying `payload`.
pub fn encode_message(payload: &[u8], buf: &mut BytesMut) {
    encode_frame(MESSAGE_TAG, payload, buf);
}

/// Appends a trailer frame: `EOF` for a clean end, the JSON envelope of
/// `err` otherwise.
pub fn encode_trailer(err: Option<&Error>, buf: &mut BytesMut) {
    match err {
        None => encode_frame(TRAILER_TAG, EOF_TRAILER, buf),
        Some(err) => encode_frame(TRAILER_TAG, &marshal_error(err), buf),
    }
}

fn encode_frame(tag: u64, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(
        prost::encoding::encoded_len_varint(tag)
            + prost::encoding::encoded_len_varint(payload.len() as u64)
            + payload.len(),
    );
    prost::encoding::encode_varint(tag, buf);
    prost::encoding::encode_varint(payload.len() as u64, buf);
    buf.put_slice(payload);
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; nothing
/// is consumed in that case. An oversized length is rejected as soon as the
/// length prefix is readable, before the payload is buffered.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let Some((tag, tag_len)) = read_varint(&buf[..])? else {
        return Ok(None);
    };
    if tag != MESSAGE_TAG && tag != TRAILER_TAG {
        return Err(FrameError::InvalidTag(tag));
    }
    let Some((len, len_len)) = read_varint(&buf[tag_len..])? else {
        return Ok(None);
    };
    if len > MAX_FRAME_BYTES as u64 {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let header = tag_len + len_len;
    let len = len as usize;
    if buf.len() < header + len {
        return Ok(None);
    }

    buf.advance(header);
    let payload = buf.split_to(len).freeze();
    if tag == MESSAGE_TAG {
        return Ok(Some(Frame::Message(payload)));
    }
    if payload.as_ref() == EOF_TRAILER {
        return Ok(Some(Frame::Trailer(Trailer::Eof)));
    }
    Ok(Some(Frame::Trailer(Trailer::Error(unmarshal_error(&payload)?))))
}

/// Reads a base-128 varint. `Ok(None)` if `buf` ends mid-varint.
fn read_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, FrameError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 10 {
            return Err(FrameError::MalformedVarint);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 10 {
        return Err(FrameError::MalformedVarint);
    }
    Ok(None)
}
