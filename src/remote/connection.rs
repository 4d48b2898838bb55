//! One control-protocol session over a Unix stream.

use crate::error::{Error, Result};
use crate::remote::wire::{compose_line, parse_line};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::trace;

/// First word of a report line.
pub const REPORT_MARKER: &str = "<";

/// Line reader/writer for one client session.
pub struct RemoteConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    fd: RawFd,
}

impl RemoteConnection {
    pub fn new(stream: UnixStream) -> Self {
        let fd = stream.as_raw_fd();
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
            fd,
        }
    }

    /// Connect to a control socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::new(stream))
    }

    /// Read the next line as words. `None` once the peer closed the stream.
    pub async fn read_words(&mut self) -> Result<Option<Vec<String>>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        trace!(line = %line.trim_end(), "Received line");
        parse_line(&line).map(Some)
    }

    /// Send one line made of `words`.
    pub async fn send_words<S: AsRef<str>>(&mut self, words: &[S]) -> Result<()> {
        let mut line = compose_line(words);
        trace!(line = %line, "Sending line");
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a progress line ahead of the final answer.
    pub async fn send_report<S: AsRef<str>>(&mut self, words: &[S]) -> Result<()> {
        let mut line = vec![REPORT_MARKER];
        line.extend(words.iter().map(|w| w.as_ref()));
        self.send_words(&line).await
    }

    /// Send an `ERROR` answer. Internal details stay out of the message.
    pub async fn send_error(&mut self, err: &Error) -> Result<()> {
        let message = if err.is_internal() {
            "internal error".to_string()
        } else {
            err.to_string()
        };
        self.send_words(&["ERROR", err.code(), &message]).await
    }

    /// Descriptor of the underlying socket.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}
