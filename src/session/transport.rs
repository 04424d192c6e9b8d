//! The session layer talks to a client through this capability set alone, so
//! anything that frames UTF-8 lines over a reliable stream fits: a plain TCP
//! socket here, a TLS-wrapped stream at the deployment boundary, a scripted
//! double in tests.

use std::future::Future;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};

pub trait Transport: Send {
    /// Next complete line, without its terminator. `Ok(None)` is a graceful
    /// peer close, distinct from an error.
    fn read_line(&mut self) -> impl Future<Output = io::Result<Option<String>>> + Send;

    /// Write one line; the terminator is appended here.
    fn write_line(&mut self, line: &str) -> impl Future<Output = io::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;

    fn is_open(&self) -> bool;
}

/// Line framing over any duplex byte stream.
pub struct StreamTransport<S> {
    lines: Lines<BufReader<ReadHalf<S>>>,
    writer: WriteHalf<S>,
    open: bool,
}

impl<S: AsyncRead + AsyncWrite + Send> StreamTransport<S> {
    pub fn new(stream: S) -> StreamTransport<S> {
        let (reader, writer) = tokio::io::split(stream);
        StreamTransport {
            lines: BufReader::new(reader).lines(),
            writer,
            open: true,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send> Transport for StreamTransport<S> {
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        if !self.open {
            return Ok(None);
        }
        match self.lines.next_line().await {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => {
                self.open = false;
                Ok(None)
            }
            Err(e) => {
                self.open = false;
                Err(e)
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
