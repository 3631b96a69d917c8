//! Line framing
//!
//! Clients speak raw newline-terminated lines. No escaping, no length prefix
//! and no encoding requirement: payloads are relayed as bytes.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use crate::error::RelayError;
use crate::Result;

/// Separator between the sender identity and the payload on the wire
pub const SEPARATOR: &[u8] = b" -> ";

/// Reads newline-delimited frames from a stream with a per-line size cap.
///
/// Partially read bytes live in `self`, so dropping a pending `next_line`
/// future (e.g. when it loses a `select!`) loses no data.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, limit: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            limit,
        }
    }

    /// Read the next line with its terminator stripped.
    ///
    /// Returns `Ok(None)` on EOF. Bytes after the last `'\n'` are discarded at
    /// EOF since they never formed a complete line.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if !self.buf.is_empty() {
                    debug!("Discarding {} bytes of unterminated input", self.buf.len());
                    self.buf.clear();
                }
                return Ok(None);
            }

            let (complete, used) = match available.iter().position(|&b| b == b'\n') {
                Some(idx) => (true, idx + 1),
                None => (false, available.len()),
            };

            if self.buf.len() + used > self.limit {
                self.buf.clear();
                return Err(RelayError::LineTooLong { limit: self.limit }.into());
            }

            self.buf.extend_from_slice(&available[..used]);
            self.reader.consume(used);

            if complete {
                let line = std::mem::take(&mut self.buf);
                return Ok(Some(strip_terminator(line)));
            }
        }
    }
}

/// Drop the trailing `'\n'` and then one trailing `'\r'`, if present.
pub fn strip_terminator(mut line: Vec<u8>) -> Bytes {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Bytes::from(line)
}

/// Build the relayed form of a line: `<sender> -> <payload>`.
pub fn format_message(sender: &str, payload: &[u8], append_newline: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(sender.len() + SEPARATOR.len() + payload.len() + 1);
    out.put_slice(sender.as_bytes());
    out.put_slice(SEPARATOR);
    out.put_slice(payload);
    if append_newline {
        out.put_u8(b'\n');
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reads_lines_in_order() {
        let input: &[u8] = b"hello\nworld\n";
        let mut reader = LineReader::new(input, 1024);

        assert_eq!(reader.next_line().await.unwrap().unwrap(), "hello");
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "world");
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_line_is_a_frame() {
        let input: &[u8] = b"\n\r\n";
        let mut reader = LineReader::new(input, 1024);

        assert_eq!(reader.next_line().await.unwrap().unwrap(), "");
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "");
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crlf_is_stripped() {
        let input: &[u8] = b"dos line\r\n";
        let mut reader = LineReader::new(input, 1024);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "dos line");
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_dropped() {
        let input: &[u8] = b"complete\npartial";
        let mut reader = LineReader::new(input, 1024);

        assert_eq!(reader.next_line().await.unwrap().unwrap(), "complete");
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let input = vec![b'a'; 64];
        let mut reader = LineReader::new(input.as_slice(), 16);

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::LineTooLong { limit: 16 })
        ));
    }

    #[tokio::test]
    async fn test_line_split_across_writes() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = LineReader::new(server, 1024);

        let writer = tokio::spawn(async move {
            let mut client = client;
            client.write_all(b"hel").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"lo\n").await.unwrap();
        });

        assert_eq!(reader.next_line().await.unwrap().unwrap(), "hello");
        writer.await.unwrap();
    }

    #[test]
    fn test_format_message() {
        let msg = format_message("127.0.0.1:5000", b"hi there", true);
        assert_eq!(msg, "127.0.0.1:5000 -> hi there\n");

        let bare = format_message("127.0.0.1:5000", b"", false);
        assert_eq!(bare, "127.0.0.1:5000 -> ");
    }

    #[test]
    fn test_non_utf8_payload_is_preserved() {
        let msg = format_message("peer", &[0xff, 0xfe], false);
        assert_eq!(&msg[..], b"peer -> \xff\xfe");
    }
}
