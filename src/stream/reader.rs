//! Client-side reader for server-streamed responses.
//!
//! The reader pulls body chunks on demand and decodes as many complete items
//! as the buffer holds. Binary bodies are frame sequences (see
//! [`super::frame`]); JSON bodies are a single document
//! `{"messages":[...],"trailer":{...}}` parsed incrementally, one message at
//! a time, so neither encoding buffers the whole response. A JSON element is
//! scanned once as bytes arrive and decoded when complete; like a binary
//! frame it may not exceed [`MAX_FRAME_BYTES`].

use crate::client::transport::ClientBody;
use crate::codec::{Codec, Message};
use crate::context::Context;
use crate::error::envelope::ErrorEnvelope;
use crate::error::{Error, ErrorCode};
use crate::stream::frame::{Frame, MAX_FRAME_BYTES, Trailer, decode_frame};
use bytes::{Buf, BytesMut};
use futures_util::Stream;
use futures_util::stream;
use http_body_util::BodyExt;
use std::fmt;
use std::marker::PhantomData;

/// Trailer code of a JSON stream that ended cleanly.
pub const STREAM_COMPLETE: &str = "stream_complete";

const JSON_HEADER: [&[u8]; 4] = [b"{", b"\"messages\"", b":", b"["];
const JSON_HEADER_ERRORS: [&str; 4] = [
    "missing leading { in JSON stream",
    "missing \"messages\" key in JSON stream",
    "missing \"messages\" key in JSON stream",
    "missing [ to open messages array in JSON stream",
];
const JSON_TRAILER: [&[u8]; 3] = [b",", b"\"trailer\"", b":"];

enum Step<T> {
    Message(T),
    End,
    NeedMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonState {
    Start,
    Messages { first: bool },
    Trailer,
}

/// Reads the messages of one server-streamed response.
///
/// [`StreamReader::next`] yields messages until the trailer: `Ok(None)`
/// after a clean end, `Err` with the trailer's error otherwise. After the
/// first error or the end, every further call returns `Ok(None)`.
pub struct StreamReader<T> {
    body: Option<ClientBody>,
    codec: Codec,
    buf: BytesMut,
    json: JsonState,
    scan: ValueScan,
    ctx: Context,
    _message: PhantomData<fn() -> T>,
}

impl<T: Message> StreamReader<T> {
    pub(crate) fn new(body: ClientBody, codec: Codec, ctx: Context) -> Self {
        Self {
            body: Some(body),
            codec,
            buf: BytesMut::new(),
            json: JsonState::Start,
            scan: ValueScan::default(),
            ctx,
            _message: PhantomData,
        }
    }

    /// Next message, `Ok(None)` at the end of the stream.
    pub async fn next(&mut self) -> Result<Option<T>, Error> {
        if self.body.is_none() {
            return Ok(None);
        }
        loop {
            let step = match self.codec {
                Codec::Protobuf => self.decode_binary(),
                Codec::Json => self.decode_json(),
            };
            match step {
                Ok(Step::Message(message)) => return Ok(Some(message)),
                Ok(Step::End) => {
                    self.close();
                    return Ok(None);
                }
                Ok(Step::NeedMore) => {}
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            }

            match self.fill().await {
                Ok(true) => {}
                Ok(false) => {
                    self.close();
                    return Err(Error::internal("unexpected end of stream"));
                }
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            }
        }
    }

    /// Stops reading and releases the response body. Idempotent.
    pub fn close(&mut self) {
        self.body = None;
        self.buf.clear();
        self.scan = ValueScan::default();
    }

    /// Adapts the reader into a [`Stream`] that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Error>> + Send {
        stream::unfold(self, |mut reader| async move {
            match reader.next().await {
                Ok(Some(message)) => Some((Ok(message), reader)),
                Ok(None) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }

    /// Appends the next body chunk to the buffer. `false` at end of body.
    async fn fill(&mut self) -> Result<bool, Error> {
        let Some(body) = self.body.as_mut() else {
            return Ok(false);
        };
        let frame = tokio::select! {
            biased;
            reason = self.ctx.done() => {
                return Err(Error::wrapped("aborted because context was done", reason));
            }
            frame = body.frame() => frame,
        };
        match frame {
            None => Ok(false),
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    self.buf.extend_from_slice(&data);
                }
                Ok(true)
            }
            Some(Err(err)) => Err(Error::wrapped("failed to read response body", err)),
        }
    }

    fn decode_binary(&mut self) -> Result<Step<T>, Error> {
        match decode_frame(&mut self.buf) {
            Ok(None) => Ok(Step::NeedMore),
            Ok(Some(Frame::Message(payload))) => self
                .codec
                .decode::<T>(&payload)
                .map(Step::Message)
                .map_err(|err| Error::wrapped("failed to unmarshal proto response", err)),
            Ok(Some(Frame::Trailer(Trailer::Eof))) => Ok(Step::End),
            Ok(Some(Frame::Trailer(Trailer::Error(err)))) => Err(err),
            Err(err) => Err(Error::wrap(ErrorCode::Internal, err.to_string(), err)),
        }
    }

    fn decode_json(&mut self) -> Result<Step<T>, Error> {
        loop {
            match self.json {
                JsonState::Start => match match_tokens(&self.buf, &JSON_HEADER) {
                    Lex::Matched(len) => {
                        self.buf.advance(len);
                        self.json = JsonState::Messages { first: true };
                    }
                    Lex::Partial => return Ok(Step::NeedMore),
                    Lex::Mismatch(i) => return Err(Error::internal(JSON_HEADER_ERRORS[i])),
                },
                JsonState::Messages { first } => {
                    let start = skip_whitespace(&self.buf, 0);
                    let Some(&next) = self.buf.get(start) else {
                        return Ok(Step::NeedMore);
                    };
                    if next == b']' {
                        self.buf.advance(start + 1);
                        self.json = JsonState::Trailer;
                        continue;
                    }
                    let value_start = if first {
                        start
                    } else if next == b',' {
                        skip_whitespace(&self.buf, start + 1)
                    } else {
                        return Err(Error::internal("missing end of message array in JSON stream"));
                    };
                    return match self.scan_value::<T>(value_start) {
                        Parsed::Value(message, end) => {
                            self.buf.advance(end);
                            self.json = JsonState::Messages { first: false };
                            Ok(Step::Message(message))
                        }
                        Parsed::Incomplete => Ok(Step::NeedMore),
                        Parsed::TooLarge(len) => Err(element_too_large(len)),
                        Parsed::Invalid(err) => {
                            Err(Error::wrapped("failed to unmarshal json response", err))
                        }
                    };
                }
                JsonState::Trailer => {
                    let header_len = match match_tokens(&self.buf, &JSON_TRAILER) {
                        Lex::Matched(len) => len,
                        Lex::Partial => return Ok(Step::NeedMore),
                        Lex::Mismatch(_) => {
                            return Err(Error::internal("missing trailer after messages in JSON stream"));
                        }
                    };
                    let value_start = skip_whitespace(&self.buf, header_len);
                    return match self.scan_value::<ErrorEnvelope>(value_start) {
                        Parsed::Value(envelope, _) if envelope.code == STREAM_COMPLETE => Ok(Step::End),
                        Parsed::Value(envelope, _) => Err(envelope.into_error()),
                        Parsed::Incomplete => Ok(Step::NeedMore),
                        Parsed::TooLarge(len) => Err(element_too_large(len)),
                        Parsed::Invalid(err) => Err(Error::wrapped("unable to decode stream trailer", err)),
                    };
                }
            }
        }
    }

    /// Continues scanning the JSON value starting at `start` and decodes it
    /// once complete. `Parsed::Value` carries the buffer offset just past
    /// the value.
    fn scan_value<V: serde::de::DeserializeOwned>(&mut self, start: usize) -> Parsed<V> {
        let value = &self.buf[start..];
        match self.scan.resume(value) {
            Some(len) if len > MAX_FRAME_BYTES => Parsed::TooLarge(len),
            Some(len) => {
                self.scan = ValueScan::default();
                match serde_json::from_slice(&value[..len]) {
                    Ok(decoded) => Parsed::Value(decoded, start + len),
                    Err(err) => Parsed::Invalid(err),
                }
            }
            None if value.len() > MAX_FRAME_BYTES => Parsed::TooLarge(value.len()),
            None => Parsed::Incomplete,
        }
    }
}

fn element_too_large(len: usize) -> Error {
    Error::internal(format!(
        "JSON stream element of at least {len} bytes exceeds maximum {MAX_FRAME_BYTES}"
    ))
}

impl<T> fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("codec", &self.codec)
            .field("open", &self.body.is_some())
            .field("buffered", &self.buf.len())
            .finish()
    }
}

enum Lex {
    Matched(usize),
    Partial,
    Mismatch(usize),
}

/// Matches `tokens` in order, each optionally preceded by whitespace.
fn match_tokens(buf: &[u8], tokens: &[&[u8]]) -> Lex {
    let mut pos = 0;
    for (i, token) in tokens.iter().enumerate() {
        pos = skip_whitespace(buf, pos);
        let available = &buf[pos..];
        let n = available.len().min(token.len());
        if available[..n] != token[..n] {
            return Lex::Mismatch(i);
        }
        if n < token.len() {
            return Lex::Partial;
        }
        pos += token.len();
    }
    Lex::Matched(pos)
}

fn skip_whitespace(buf: &[u8], mut pos: usize) -> usize {
    while buf.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
        pos += 1;
    }
    pos
}

enum Parsed<V> {
    Value(V, usize),
    Incomplete,
    TooLarge(usize),
    Invalid(serde_json::Error),
}

/// Resumable search for the end of one JSON value.
///
/// Tracks nesting depth and string state across calls, so each byte is
/// examined once however the value is split into chunks.
#[derive(Debug, Default, Clone, Copy)]
struct ValueScan {
    /// Bytes of the value examined so far.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl ValueScan {
    /// Scans `value`, which starts at the value's first byte. Returns the
    /// value's length once its end has been seen.
    fn resume(&mut self, value: &[u8]) -> Option<usize> {
        while let Some(&b) = value.get(self.pos) {
            self.pos += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                continue;
            }
            // A bare scalar ends at the first delimiter after it.
            if self.depth == 0 && self.pos > 1 && (matches!(b, b',' | b']' | b'}') || b.is_ascii_whitespace()) {
                self.pos -= 1;
                return Some(self.pos);
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }
}
