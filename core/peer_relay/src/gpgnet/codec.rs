//! GPGNet message framing
//!
//! All integers are little-endian.
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────┬──────────────────────────────┐
//! │ hdr len (4B) │ header UTF-8 │ argc (4B)   │ argc × (type (1B), payload)  │
//! └──────────────┴──────────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! Field type 0 carries a 4-byte signed integer, type 1 a string
//! (4-byte length and UTF-8 bytes).

use std::fmt;
use std::io::{self, Read, Write};

use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

pub const FIELD_TYPE_INT: u8 = 0;
pub const FIELD_TYPE_STRING: u8 = 1;
/// Continuation string, read like a plain string
pub const FIELD_TYPE_FOLLOWING_STRING: u8 = 2;

/// Largest string accepted from the game
pub const MAX_STRING_LEN: usize = 1024 * 1024;

/// Largest argument count accepted from the game
pub const MAX_ARGS: usize = 4096;

// ============================================================================
// Messages
// ============================================================================

/// One GPGNet argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpgnetArg {
    Int(i32),
    Str(String),
}

impl GpgnetArg {
    /// Convert a JSON value from the control channel
    ///
    /// Numbers are truncated to integers; anything other than a number or a
    /// string has no GPGNet form.
    pub fn from_json(value: &Value) -> Option<GpgnetArg> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(|i| GpgnetArg::Int(i as i32))
                .or_else(|| n.as_f64().map(GpgnetArg::from)),
            Value::String(s) => Some(GpgnetArg::Str(s.clone())),
            Value::Bool(b) => Some(GpgnetArg::Int(i32::from(*b))),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            GpgnetArg::Int(i) => Value::from(*i),
            GpgnetArg::Str(s) => Value::from(s.as_str()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GpgnetArg::Str(s) => Some(s),
            GpgnetArg::Int(_) => None,
        }
    }
}

impl From<i32> for GpgnetArg {
    fn from(value: i32) -> Self {
        GpgnetArg::Int(value)
    }
}

impl From<f64> for GpgnetArg {
    fn from(value: f64) -> Self {
        GpgnetArg::Int(value as i32)
    }
}

impl From<&str> for GpgnetArg {
    fn from(value: &str) -> Self {
        GpgnetArg::Str(value.to_string())
    }
}

impl From<String> for GpgnetArg {
    fn from(value: String) -> Self {
        GpgnetArg::Str(value)
    }
}

impl fmt::Display for GpgnetArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpgnetArg::Int(i) => write!(f, "{}", i),
            GpgnetArg::Str(s) => f.write_str(s),
        }
    }
}

/// A command and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpgnetMessage {
    pub header: String,
    pub args: Vec<GpgnetArg>,
}

impl GpgnetMessage {
    pub fn new(header: impl Into<String>, args: Vec<GpgnetArg>) -> Self {
        Self {
            header: header.into(),
            args,
        }
    }

    pub fn json_args(&self) -> Vec<Value> {
        self.args.iter().map(GpgnetArg::to_json).collect()
    }

    /// `header arg1 arg2 ...`, for logging
    pub fn describe(&self) -> String {
        let mut line = self.header.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string());
        }
        line
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_i32(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Encode a message into its wire form
pub fn encode_message(message: &GpgnetMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + message.header.len());
    put_string(&mut buf, &message.header);
    put_i32(&mut buf, message.args.len() as i32);
    for arg in &message.args {
        match arg {
            GpgnetArg::Int(i) => {
                buf.push(FIELD_TYPE_INT);
                put_i32(&mut buf, *i);
            }
            GpgnetArg::Str(s) => {
                buf.push(FIELD_TYPE_STRING);
                put_string(&mut buf, s);
            }
        }
    }
    buf
}

/// Encode and write a message, flushing immediately
pub fn write_message<W: Write>(writer: &mut W, message: &GpgnetMessage) -> io::Result<()> {
    writer.write_all(&encode_message(message))?;
    writer.flush()
}

// ============================================================================
// Decoding
// ============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(DecodeError::Incomplete(end - self.buf.len()));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn length(&mut self, limit: usize, what: &str) -> Result<usize, DecodeError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(DecodeError::Malformed(format!("negative {} length {}", what, len)));
        }
        let len = len as usize;
        if len > limit {
            return Err(DecodeError::MessageTooLarge(len));
        }
        Ok(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.length(MAX_STRING_LEN, "string")?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DecodeError::Malformed(format!("invalid UTF-8: {}", e)))
    }
}

/// Decode one message from the front of `buf`
///
/// Returns the message and the number of bytes consumed.
pub fn decode_message(buf: &[u8]) -> Result<(GpgnetMessage, usize), DecodeError> {
    let mut cursor = Cursor { buf, pos: 0 };

    let header = cursor.string()?;
    let count = cursor.length(MAX_ARGS, "argument")?;

    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        match cursor.u8()? {
            FIELD_TYPE_INT => args.push(GpgnetArg::Int(cursor.i32()?)),
            FIELD_TYPE_STRING | FIELD_TYPE_FOLLOWING_STRING => {
                // The game escapes tabs and newlines inside strings
                let value = cursor.string()?.replace("/t", "\t").replace("/n", "\n");
                args.push(GpgnetArg::Str(value));
            }
            other => {
                return Err(DecodeError::Malformed(format!("unknown field type {}", other)));
            }
        }
    }

    Ok((GpgnetMessage { header, args }, cursor.pos))
}

/// Read exactly one message from a blocking reader
pub fn read_message<R: Read>(reader: &mut R) -> Result<GpgnetMessage, DecodeError> {
    let mut buf = Vec::new();
    let mut needed = 4;
    loop {
        let start = buf.len();
        buf.resize(start + needed, 0);
        reader.read_exact(&mut buf[start..]).map_err(DecodeError::Io)?;

        match decode_message(&buf) {
            Ok((message, _)) => return Ok(message),
            Err(DecodeError::Incomplete(more)) => needed = more,
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while decoding GPGNet input
#[derive(Debug)]
pub enum DecodeError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    /// Structurally invalid frame
    Malformed(String),
    /// A length field exceeds its limit
    MessageTooLarge(usize),
    /// Reading from the stream failed
    Io(io::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Incomplete(needed) => {
                write!(f, "incomplete message, need {} more bytes", needed)
            }
            DecodeError::Malformed(reason) => write!(f, "malformed message: {}", reason),
            DecodeError::MessageTooLarge(len) => write!(f, "length field too large: {}", len),
            DecodeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
