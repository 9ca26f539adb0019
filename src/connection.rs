//! Byte-stream primitives over the transport and the frame decoder driven
//! by them.
//!
//! [`FrameReader`] owns the only read-side buffer: leftover bytes pulled
//! from the transport but not yet consumed are retained between calls and
//! never exposed. [`FrameWriter`] forwards encoded bytes to the transport
//! behind a write-level buffer; back-pressure is delegated to the transport
//! itself.

use crate::frame::{self, Frame};
use crate::Error;

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::pin::Pin;
use std::str;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::debug;

/// Default bound on array nesting while decoding.
///
/// The element count of an array frame is server-provided, so nesting depth
/// must be capped rather than trusted; beyond the cap the decode fails with
/// a decode error.
pub const DEFAULT_MAX_FRAME_DEPTH: usize = 64;

/// Reads frames from one direction of the transport.
///
/// Exposes two byte-exact primitives, `read_line` and `read_exact`, plus
/// `read_frame` which drives the recursive RESP decode on top of them. A
/// read that pulls more bytes from the transport than requested keeps the
/// remainder in an internal buffer for the next call.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,

    // Leftover bytes between calls. Never handed out except as the return
    // value of a read primitive.
    buffer: BytesMut,

    max_depth: usize,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    /// Creates a reader with the default nesting bound.
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader::with_max_depth(reader, DEFAULT_MAX_FRAME_DEPTH)
    }

    /// Creates a reader with an explicit bound on array nesting.
    pub fn with_max_depth(reader: R, max_depth: usize) -> FrameReader<R> {
        FrameReader {
            reader,
            // 4KB default matches typical response sizes; larger replies
            // grow the buffer as needed.
            buffer: BytesMut::with_capacity(4 * 1024),
            max_depth,
        }
    }

    /// Reads bytes up to and including the first `\n`.
    ///
    /// If the transport ends before a terminator is seen, returns whatever
    /// was collected, possibly empty. Callers must check for the terminator
    /// rather than assume success.
    pub async fn read_line(&mut self) -> crate::Result<Bytes> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                return Ok(self.buffer.split_to(pos + 1).freeze());
            }

            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                // Stream ended mid-line. Hand back what was collected.
                let len = self.buffer.len();
                return Ok(self.buffer.split_to(len).freeze());
            }
        }
    }

    /// Reads exactly `n` bytes, pulling additional chunks as needed.
    ///
    /// If the transport ends first, returns whatever was collected, possibly
    /// fewer than `n` bytes. Callers must check the length.
    pub async fn read_exact(&mut self, n: usize) -> crate::Result<Bytes> {
        while self.buffer.len() < n {
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                let len = self.buffer.len();
                return Ok(self.buffer.split_to(len).freeze());
            }
        }

        Ok(self.buffer.split_to(n).freeze())
    }

    /// Reads a single `Frame` value from the underlying stream.
    ///
    /// Any failure, including inside a nested array element, aborts the
    /// entire decode; a partial array is never returned.
    pub async fn read_frame(&mut self) -> crate::Result<Frame> {
        self.read_value(self.max_depth).await
    }

    // Recursive worker behind `read_frame`. Boxing breaks the otherwise
    // infinitely-sized future type that async recursion would produce.
    fn read_value(
        &mut self,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = crate::Result<Frame>> + Send + '_>> {
        Box::pin(async move {
            let line = self.read_line().await?;

            if line.is_empty() {
                // Stream ended cleanly between frames.
                return Err(Error::ConnectionClosed);
            }

            let payload = strip_line_terminator(&line)?;

            let (&tag, rest) = match payload.split_first() {
                Some(split) => split,
                // A bare terminator carries no type byte; treated
                // permissively like an unrecognized type.
                None => return Ok(Frame::Null),
            };

            match tag {
                b'+' => Ok(Frame::Simple(utf8(rest)?.to_string())),
                b':' => Ok(Frame::Integer(frame::parse_decimal(rest)?)),
                b'-' => {
                    let (kind, message) = frame::split_error(utf8(rest)?);
                    Ok(Frame::Error { kind, message })
                }
                b'$' => {
                    let len = frame::parse_decimal(rest)?;
                    if len == -1 {
                        return Ok(Frame::Null);
                    }
                    let len = usize::try_from(len)
                        .map_err(|_| Error::Decode(format!("invalid bulk length {}", len)))?;

                    // Payload plus the trailing CRLF.
                    let data = self.read_exact(len + 2).await?;
                    if data.len() < len + 2 {
                        return Err(Error::ConnectionClosed);
                    }
                    if &data[len..] != frame::CRLF {
                        return Err(Error::Decode(
                            "bulk string not terminated by CRLF".to_string(),
                        ));
                    }

                    Ok(Frame::Bulk(data.slice(..len)))
                }
                b'*' => {
                    let len = frame::parse_decimal(rest)?;
                    if len == -1 {
                        return Ok(Frame::Null);
                    }
                    let len = usize::try_from(len)
                        .map_err(|_| Error::Decode(format!("invalid array length {}", len)))?;

                    if depth == 0 {
                        return Err(Error::Decode(format!(
                            "array nesting exceeds limit of {}",
                            self.max_depth
                        )));
                    }

                    // The element count is server-provided; cap the
                    // pre-allocation and let a lying count fail on the
                    // missing elements instead.
                    let mut out = Vec::with_capacity(len.min(64));
                    for _ in 0..len {
                        out.push(self.read_value(depth - 1).await?);
                    }

                    Ok(Frame::Array(out))
                }
                tag => {
                    // Unrecognized frame type. Treated permissively rather
                    // than as fatal; the line is already consumed.
                    debug!("unrecognized frame type byte {:#04x}", tag);
                    Ok(Frame::Null)
                }
            }
        })
    }
}

/// Writes raw command bytes to one direction of the transport.
#[derive(Debug)]
pub struct FrameWriter<W> {
    // The write half is decorated with a `BufWriter` for write-level
    // buffering; the flush after each command hands back-pressure to the
    // transport.
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a writer backed by `writer`.
    pub fn new(writer: W) -> FrameWriter<W> {
        FrameWriter {
            writer: BufWriter::new(writer),
        }
    }

    /// Forwards `bytes` to the transport's outbound queue.
    pub async fn write(&mut self, bytes: &[u8]) -> crate::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Releases the write side. Best-effort: failures from an already
    /// broken transport are swallowed.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Strips the trailing CRLF from a terminated line.
///
/// A line that lacks the final `\n` means the stream ended mid-line; a line
/// terminated by a lone `\n` is malformed.
fn strip_line_terminator(line: &[u8]) -> crate::Result<&[u8]> {
    if let Some(stripped) = line.strip_suffix(b"\r\n") {
        return Ok(stripped);
    }

    if line.ends_with(b"\n") {
        Err(Error::Decode("line not terminated by CRLF".to_string()))
    } else {
        Err(Error::ConnectionClosed)
    }
}

fn utf8(bytes: &[u8]) -> crate::Result<&str> {
    str::from_utf8(bytes).map_err(|_| Error::Decode("invalid UTF-8 in frame line".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(wire: &'static [u8]) -> crate::Result<Frame> {
        FrameReader::new(wire).read_frame().await
    }

    #[tokio::test]
    async fn decodes_simple_string() {
        assert_eq!(decode(b"+PONG\r\n").await.unwrap(), Frame::Simple("PONG".into()));
    }

    #[tokio::test]
    async fn decodes_integers() {
        assert_eq!(decode(b":1\r\n").await.unwrap(), Frame::Integer(1));
        assert_eq!(decode(b":-42\r\n").await.unwrap(), Frame::Integer(-42));
    }

    #[tokio::test]
    async fn decodes_bulk_string() {
        assert_eq!(
            decode(b"$5\r\nhello\r\n").await.unwrap(),
            Frame::Bulk(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn null_bulk_is_distinct_from_empty_bulk() {
        assert_eq!(decode(b"$-1\r\n").await.unwrap(), Frame::Null);
        assert_eq!(decode(b"$0\r\n\r\n").await.unwrap(), Frame::Bulk(Bytes::new()));
    }

    #[tokio::test]
    async fn null_array_is_distinct_from_empty_array() {
        assert_eq!(decode(b"*-1\r\n").await.unwrap(), Frame::Null);
        assert_eq!(decode(b"*0\r\n").await.unwrap(), Frame::Array(vec![]));
    }

    #[tokio::test]
    async fn decodes_nested_array() {
        let frame = decode(b"*2\r\n*1\r\n$3\r\nfoo\r\n:9\r\n").await.unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Array(vec![Frame::Bulk(Bytes::from_static(b"foo"))]),
                Frame::Integer(9),
            ])
        );
    }

    #[tokio::test]
    async fn splits_error_frame_into_kind_and_message() {
        let frame = decode(b"-ERR unknown command 'FOO'\r\n").await.unwrap();
        assert_eq!(
            frame,
            Frame::Error {
                kind: "ERR".into(),
                message: "unknown command 'FOO'".into(),
            }
        );
    }

    #[tokio::test]
    async fn error_frame_without_space_gets_generic_kind() {
        let frame = decode(b"-broken\r\n").await.unwrap();
        assert_eq!(
            frame,
            Frame::Error {
                kind: "ERR".into(),
                message: "broken".into(),
            }
        );
    }

    #[tokio::test]
    async fn unrecognized_type_byte_decodes_to_null() {
        assert_eq!(decode(b"?what\r\n").await.unwrap(), Frame::Null);
    }

    #[tokio::test]
    async fn malformed_integer_fails_decode() {
        assert!(matches!(decode(b":abc\r\n").await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn malformed_length_line_fails_decode() {
        // Trailing junk after the digits must not be silently dropped.
        assert!(matches!(
            decode(b"$5x\r\nhello\r\n").await,
            Err(Error::Decode(_))
        ));
        assert!(matches!(decode(b":4x2\r\n").await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn hostile_array_count_fails_without_allocating() {
        // A lying element count must surface as an error on the missing
        // elements, not as an allocation of the declared size.
        assert!(matches!(
            decode(b"*9223372036854775807\r\n").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn malformed_utf8_fails_decode() {
        assert!(matches!(decode(b"+\xff\xfe\r\n").await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn empty_stream_reports_connection_closed() {
        assert!(matches!(decode(b"").await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn stream_ending_mid_line_reports_connection_closed() {
        assert!(matches!(decode(b"+PON").await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn stream_ending_mid_bulk_reports_connection_closed() {
        assert!(matches!(
            decode(b"$10\r\nabc").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn partial_array_is_never_returned() {
        // Second element is cut off; the whole decode must fail.
        assert!(matches!(
            decode(b"*2\r\n:1\r\n").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn nesting_beyond_the_limit_fails_decode() {
        let wire: &[u8] = b"*1\r\n*1\r\n*1\r\n:1\r\n";
        let mut reader = FrameReader::with_max_depth(wire, 2);
        assert!(matches!(reader.read_frame().await, Err(Error::Decode(_))));

        let mut reader = FrameReader::with_max_depth(wire, 3);
        assert!(reader.read_frame().await.is_ok());
    }

    #[tokio::test]
    async fn frames_split_across_transport_chunks() {
        let mock = tokio_test::io::Builder::new()
            .read(b"+PO")
            .read(b"NG\r")
            .read(b"\n$5\r\nhel")
            .read(b"lo\r\n")
            .build();

        let mut reader = FrameReader::new(mock);
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Simple("PONG".into()));
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Bulk(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn leftover_bytes_survive_between_reads() {
        let mut reader = FrameReader::new(&b"+a\r\n:42\r\n"[..]);
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Simple("a".into()));
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Integer(42));
    }

    #[tokio::test]
    async fn read_line_returns_collected_bytes_on_eof() {
        let mut reader = FrameReader::new(&b"no terminator"[..]);
        let line = reader.read_line().await.unwrap();
        assert_eq!(&line[..], b"no terminator");
    }

    #[tokio::test]
    async fn read_exact_returns_short_on_eof() {
        let mut reader = FrameReader::new(&b"abc"[..]);
        let data = reader.read_exact(10).await.unwrap();
        assert_eq!(&data[..], b"abc");
    }
}
