//! Buffered line-oriented reading for session sockets.
//!
//! Commands arrive as lines terminated by CRLF or a bare LF. Control
//! characters below 0x20 other than horizontal tab are stripped, as is
//! DEL (0x7F). The reader keeps an internal buffer so later body or
//! tunnel reads must drain it before touching the socket again.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 4096;

/// Line/byte reader over a session stream half.
pub struct LineReader<R> {
    inner: R,
    buf: VecDeque<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: VecDeque::new(),
        }
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        self.buf.extend(&chunk[..n]);
        Ok(n)
    }

    async fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }
        Ok(self.buf.pop_front())
    }

    /// Reads one line. Returns `None` on end of stream before any byte of
    /// the line. A line longer than `max_len` is truncated; the remainder
    /// up to the terminator is consumed and discarded.
    pub async fn read_line(&mut self, max_len: usize) -> std::io::Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        let mut seen_any = false;
        loop {
            let Some(b) = self.next_byte().await? else {
                if !seen_any {
                    return Ok(None);
                }
                break;
            };
            seen_any = true;
            match b {
                b'\n' => break,
                b'\r' => {
                    // CR is only a terminator when followed by LF; a lone
                    // CR is dropped like any other control byte.
                    match self.next_byte().await? {
                        Some(b'\n') | None => break,
                        Some(other) => {
                            self.buf.push_front(other);
                        }
                    }
                }
                b'\t' => {
                    if line.len() < max_len {
                        line.push(b);
                    }
                }
                0x00..=0x1F | 0x7F => {}
                _ => {
                    if line.len() < max_len {
                        line.push(b);
                    }
                }
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Reads up to `out.len()` bytes, draining the internal buffer first.
    pub async fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(0);
        }
        let n = out.len().min(self.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buf.pop_front().unwrap();
        }
        Ok(n)
    }

    /// Reads exactly `len` bytes.
    pub async fn read_exact(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended mid-body",
                ));
            }
            filled += n;
        }
        Ok(out)
    }

    /// Takes whatever is currently buffered without touching the socket.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.buf.drain(..).collect()
    }

    /// Consumes the reader, returning the underlying stream half and any
    /// bytes read past the last line.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buf.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reader(data: &[u8]) -> LineReader<std::io::Cursor<Vec<u8>>> {
        LineReader::new(std::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn crlf_and_bare_lf_both_terminate() {
        let mut r = reader(b"GET / HTTP/1.1\r\nsecond\nthird").await;
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "GET / HTTP/1.1");
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "second");
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "third");
        assert!(r.read_line(1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_before_any_byte_is_none() {
        let mut r = reader(b"").await;
        assert!(r.read_line(1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn control_bytes_stripped_tab_kept() {
        let mut r = reader(b"a\x01b\tc\x7fd\r\n").await;
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "ab\tcd");
    }

    #[tokio::test]
    async fn lone_cr_is_dropped_not_terminator() {
        let mut r = reader(b"ab\rcd\n").await;
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "abcd");
    }

    #[tokio::test]
    async fn overlong_line_truncated_but_consumed() {
        let mut r = reader(b"abcdefgh\nnext\n").await;
        assert_eq!(r.read_line(4).await.unwrap().unwrap(), "abcd");
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "next");
    }

    #[tokio::test]
    async fn body_read_drains_buffer_first() {
        let mut r = reader(b"line\r\nBODYBYTES").await;
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "line");
        let body = r.read_exact(9).await.unwrap();
        assert_eq!(&body, b"BODYBYTES");
    }

    #[tokio::test]
    async fn take_buffered_returns_leftover() {
        let mut r = reader(b"line\nrest").await;
        assert_eq!(r.read_line(1024).await.unwrap().unwrap(), "line");
        // Depending on chunking, "rest" may already sit in the buffer.
        let mut leftover = r.take_buffered();
        if leftover.is_empty() {
            leftover = r.read_exact(4).await.unwrap();
        }
        assert_eq!(&leftover, b"rest");
    }
}
