//! Provides a type representing a RESP protocol frame, the command-argument
//! union accepted by the encoder, and utilities for turning a command into
//! its wire bytes and for parsing the inline payload of a frame line.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::Error;

/// The RESP line terminator.
pub(crate) const CRLF: &[u8] = b"\r\n";

/// A frame in the RESP protocol.
///
/// `Null` is produced both by a null bulk string (`$-1\r\n`) and by a null
/// array (`*-1\r\n`); either is distinct from the empty bulk string (`$0`)
/// and the empty array (`*0`).
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// A simple string, e.g. `+OK`.
    Simple(String),
    /// A signed integer, e.g. `:42`.
    Integer(i64),
    /// A bulk string. Kept as raw bytes; RESP bulk payloads are binary-safe.
    Bulk(Bytes),
    /// A null bulk string or null array.
    Null,
    /// An array of frames, possibly nested.
    Array(Vec<Frame>),
    /// An error reply, split into the leading kind token and the message.
    Error { kind: String, message: String },
}

/// One argument of a command, as accepted by [`encode_command`].
///
/// Conversions exist for the common source types, so callers can write
/// `&["SET".into(), key.into(), 42i64.into()]`.
#[derive(Clone, Debug)]
pub enum Arg {
    /// Encoded as the UTF-8 bytes of the text.
    Text(String),
    /// Encoded as-is.
    Bytes(Bytes),
    /// Encoded as decimal ASCII text.
    Int(i64),
    /// Encoded as decimal ASCII text, `1` or `0`.
    Bool(bool),
}

impl From<&str> for Arg {
    fn from(src: &str) -> Arg {
        Arg::Text(src.to_string())
    }
}

impl From<String> for Arg {
    fn from(src: String) -> Arg {
        Arg::Text(src)
    }
}

impl From<Bytes> for Arg {
    fn from(src: Bytes) -> Arg {
        Arg::Bytes(src)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(src: Vec<u8>) -> Arg {
        Arg::Bytes(Bytes::from(src))
    }
}

impl From<&[u8]> for Arg {
    fn from(src: &[u8]) -> Arg {
        Arg::Bytes(Bytes::copy_from_slice(src))
    }
}

impl From<i64> for Arg {
    fn from(src: i64) -> Arg {
        Arg::Int(src)
    }
}

impl From<bool> for Arg {
    fn from(src: bool) -> Arg {
        Arg::Bool(src)
    }
}

/// Encodes a command as a RESP array of bulk strings, the request form.
///
/// Emits `*<argcount>\r\n`, then `$<bytelength>\r\n<bytes>\r\n` per
/// argument. Encoding is all-or-nothing: an invalid argument list fails
/// with [`Error::InvalidArgument`] before any bytes are produced, so a
/// partial command can never reach the transport.
pub fn encode_command(args: &[Arg]) -> crate::Result<Bytes> {
    if args.is_empty() {
        return Err(Error::InvalidArgument(
            "command must have at least one argument".to_string(),
        ));
    }

    let mut dst = BytesMut::new();

    dst.put_u8(b'*');
    put_decimal(&mut dst, args.len() as i64);
    dst.extend_from_slice(CRLF);

    for arg in args {
        match arg {
            Arg::Text(text) => put_bulk(&mut dst, text.as_bytes()),
            Arg::Bytes(bytes) => put_bulk(&mut dst, bytes),
            Arg::Int(value) => {
                let digits = Decimal::new(*value);
                put_bulk(&mut dst, digits.as_bytes());
            }
            Arg::Bool(value) => {
                let digit: &[u8] = if *value { b"1" } else { b"0" };
                put_bulk(&mut dst, digit);
            }
        }
    }

    Ok(dst.freeze())
}

/// Writes one `$<len>\r\n<bytes>\r\n` bulk string into the buffer.
fn put_bulk(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u8(b'$');
    put_decimal(dst, bytes.len() as i64);
    dst.extend_from_slice(CRLF);
    dst.extend_from_slice(bytes);
    dst.extend_from_slice(CRLF);
}

/// Writes the decimal ASCII representation of `val` into the buffer.
fn put_decimal(dst: &mut BytesMut, val: i64) {
    let digits = Decimal::new(val);
    dst.extend_from_slice(digits.as_bytes());
}

/// Decimal ASCII digits of an `i64`, formatted into a stack buffer.
struct Decimal {
    buf: [u8; 20],
    start: usize,
}

impl Decimal {
    fn new(val: i64) -> Decimal {
        // 20 bytes fit any i64: 19 digits plus a sign.
        let mut buf = [0u8; 20];
        let mut pos = buf.len();
        let negative = val < 0;
        let mut rest = val.unsigned_abs();

        loop {
            pos -= 1;
            buf[pos] = b'0' + (rest % 10) as u8;
            rest /= 10;
            if rest == 0 {
                break;
            }
        }

        if negative {
            pos -= 1;
            buf[pos] = b'-';
        }

        Decimal { buf, start: pos }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }
}

/// Parses the inline payload of an integer or length line as a base-10
/// signed integer.
///
/// The whole payload must be consumed: a digit prefix followed by trailing
/// junk is malformed, not a shorter number.
pub(crate) fn parse_decimal(line: &[u8]) -> crate::Result<i64> {
    use atoi::FromRadix10SignedChecked;

    match i64::from_radix_10_signed_checked(line) {
        (Some(value), consumed)
            if consumed == line.len() && line.iter().any(|b| b.is_ascii_digit()) =>
        {
            Ok(value)
        }
        _ => Err(Error::Decode(format!(
            "invalid decimal line {:?}",
            String::from_utf8_lossy(line)
        ))),
    }
}

/// Splits an error payload into its kind token and message.
///
/// The kind is everything up to the first space byte; the message is the
/// remainder with the separating whitespace run removed. A payload without
/// a space carries no kind token and defaults to the generic `ERR`.
pub(crate) fn split_error(payload: &str) -> (String, String) {
    match payload.split_once(' ') {
        Some((kind, message)) => (kind.to_string(), message.trim_start_matches(' ').to_string()),
        None => ("ERR".to_string(), payload.to_string()),
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use std::str;

        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error { kind, message } => write!(fmt, "error: {} {}", kind, message),
            Frame::Integer(num) => num.fmt(fmt),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => string.fmt(fmt),
                Err(_) => write!(fmt, "{:?}", msg),
            },
            Frame::Null => "(nil)".fmt(fmt),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }

                    part.fmt(fmt)?;
                }

                Ok(())
            }
        }
    }
}
