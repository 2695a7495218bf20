//! RESP wire codec.
//!
//! Frames are self-delimiting: a one-byte type tag followed by a CRLF
//! terminated line, a length-prefixed payload, or a count of nested frames.
//! The same encoding is used on the socket and inside the append-only file.

use std::io;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SIMPLE_STRING: u8 = b'+';
const ERROR: u8 = b'-';
const BULK: u8 = b'$';
const ARRAY: u8 = b'*';

const CRLF: &[u8] = b"\r\n";
const NULL_BULK: &[u8] = b"$-1\r\n";

/// Largest bulk payload the decoder will allocate for.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

// Caps the up-front allocation for arrays; larger arrays still decode, they
// just grow as elements arrive.
const ARRAY_PREALLOC_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Simple string, `+<text>\r\n`.
    String(String),
    /// Bulk string, `$<len>\r\n<bytes>\r\n`. Binary-safe.
    Bulk(Vec<u8>),
    /// Array, `*<count>\r\n` followed by `count` frames.
    Array(Vec<Value>),
    /// Error, `-<text>\r\n`.
    Error(String),
    /// Null bulk string, `$-1\r\n`.
    Null,
}

impl Value {
    pub fn ok() -> Self {
        Value::String("OK".to_string())
    }

    pub fn simple(text: impl Into<String>) -> Self {
        Value::String(text.into())
    }

    pub fn bulk(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bulk(bytes.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Value::Error(text.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "simple string",
            Value::Bulk(_) => "bulk string",
            Value::Array(_) => "array",
            Value::Error(_) => "error",
            Value::Null => "null",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::String(text) => encode_line(out, SIMPLE_STRING, text.as_bytes()),
            Value::Error(text) => encode_line(out, ERROR, text.as_bytes()),
            Value::Bulk(bytes) => {
                encode_line(out, BULK, bytes.len().to_string().as_bytes());
                out.extend_from_slice(bytes);
                out.extend_from_slice(CRLF);
            }
            Value::Array(items) => {
                encode_line(out, ARRAY, items.len().to_string().as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            Value::Null => out.extend_from_slice(NULL_BULK),
        }
    }
}

fn encode_line(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.reserve(body.len() + 3);
    out.push(tag);
    out.extend_from_slice(body);
    out.extend_from_slice(CRLF);
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The stream ended before the first byte of a frame.
    #[error("no more input")]
    NoMoreInput,
    #[error("input ended in the middle of a frame")]
    Truncated,
    #[error("invalid {kind} length {line:?}")]
    InvalidLength { kind: &'static str, line: String },
    #[error("bulk length {0} exceeds the 512 MiB limit")]
    TooLarge(usize),
    #[error("bulk payload is not terminated by CRLF")]
    MissingTerminator,
    #[error("simple string or error line is not valid UTF-8")]
    InvalidUtf8,
    #[error("unexpected type tag {0:?} inside an array")]
    UnexpectedTag(char),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// True for a clean end of stream, false for anything malformed.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DecodeError::NoMoreInput)
    }
}

/// Reads exactly one frame from `reader`.
///
/// Returns `Ok(None)` when the leading byte is not a tag this codec
/// understands (including `:` integers). Only that byte is consumed, so stray
/// line endings between frames never swallow the next frame's header.
pub async fn read_value<R>(reader: &mut R) -> Result<Option<Value>, DecodeError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(DecodeError::NoMoreInput);
        }
        Err(err) => return Err(DecodeError::Io(err)),
    };

    match tag {
        SIMPLE_STRING | ERROR | BULK | ARRAY => read_frame(reader, tag).await.map(Some),
        _ => Ok(None),
    }
}

pub async fn write_value<W>(writer: &mut W, value: &Value) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = value.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

// Boxed so that arrays can recurse into their elements.
fn read_frame<'a, R>(reader: &'a mut R, tag: u8) -> BoxFuture<'a, Result<Value, DecodeError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        match tag {
            SIMPLE_STRING => Ok(Value::String(read_text_line(reader).await?)),
            ERROR => Ok(Value::Error(read_text_line(reader).await?)),
            BULK => read_bulk(reader).await,
            ARRAY => read_array(reader).await,
            other => Err(DecodeError::UnexpectedTag(other as char)),
        }
    }
    .boxed()
}

async fn read_bulk<R>(reader: &mut R) -> Result<Value, DecodeError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let len = read_length(reader, "bulk").await?;
    if len == -1 {
        return Ok(Value::Null);
    }
    let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength {
        kind: "bulk",
        line: len.to_string(),
    })?;
    if len > MAX_BULK_LEN {
        return Err(DecodeError::TooLarge(len));
    }

    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await.map_err(truncated)?;

    let mut terminator = [0u8; 2];
    reader.read_exact(&mut terminator).await.map_err(truncated)?;
    if terminator[..] != *CRLF {
        return Err(DecodeError::MissingTerminator);
    }

    Ok(Value::Bulk(payload))
}

async fn read_array<R>(reader: &mut R) -> Result<Value, DecodeError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let count = read_length(reader, "array").await?;
    let count = usize::try_from(count).map_err(|_| DecodeError::InvalidLength {
        kind: "array",
        line: count.to_string(),
    })?;

    let mut items = Vec::with_capacity(count.min(ARRAY_PREALLOC_LIMIT));
    for _ in 0..count {
        let tag = reader.read_u8().await.map_err(truncated)?;
        items.push(read_frame(reader, tag).await?);
    }
    Ok(Value::Array(items))
}

async fn read_length<R>(reader: &mut R, kind: &'static str) -> Result<i64, DecodeError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_text_line(reader).await?;
    line.parse::<i64>()
        .map_err(|_| DecodeError::InvalidLength { kind, line })
}

async fn read_text_line<R>(reader: &mut R) -> Result<String, DecodeError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_line_bytes(reader).await?;
    String::from_utf8(line).map_err(|_| DecodeError::InvalidUtf8)
}

// A bare LF is payload; only CRLF ends the line.
async fn read_line_bytes<R>(reader: &mut R) -> Result<Vec<u8>, DecodeError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = Vec::new();
    loop {
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Err(DecodeError::Truncated);
        }
        if line.ends_with(CRLF) {
            line.truncate(line.len() - CRLF.len());
            return Ok(line);
        }
    }
}

fn truncated(err: io::Error) -> DecodeError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        DecodeError::Truncated
    } else {
        DecodeError::Io(err)
    }
}
