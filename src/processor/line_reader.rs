//! Line-oriented reader for process output
//!
//! Lines longer than the read buffer are reassembled from partial reads, and
//! a final line without a trailing newline is still returned.

use futures::stream::{self, Stream};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size.max(1), reader),
            buf: Vec::new(),
        }
    }

    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` at end of input when no partial line is pending.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.buf.extend_from_slice(&available[..i]);
                    self.reader.consume(i + 1);
                    return Ok(Some(self.take_line()));
                }
                None => {
                    let n = available.len();
                    self.buf.extend_from_slice(available);
                    self.reader.consume(n);
                }
            }
        }

        if self.buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.take_line()))
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// Consume the reader as a stream of lines; the stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<String>> {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
