// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The physical channel contract.
//!
//! The driver only ever needs two things from the wire: a bounded-wait line
//! read for the response loop and a raw byte write for outgoing commands.
//! Both are trait objects so that a serial port and an in-memory pipe (used
//! throughout the tests) are interchangeable.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::{AsyncBufReadExt, Lines};
use tokio_serial::SerialPortBuilderExt;

use crate::DynResult;

/// Read half of a connection.
pub trait TransportRead: Send {
    /// Read one line, waiting at most `wait`. `Ok(None)` means the wait
    /// lapsed with no complete line; an error means the connection is dead.
    fn read_line<'a>(
        &'a mut self,
        wait: Duration,
    ) -> Pin<Box<dyn Future<Output = DynResult<Option<String>>> + Send + 'a>>;
}

/// Write half of a connection.
pub trait TransportWrite: Send {
    fn write_all<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = DynResult<()>> + Send + 'a>>;
}

/// Line reader over any async byte stream.
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Send + Unpin + 'static> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }
}

impl<R: AsyncRead + Send + Unpin + 'static> TransportRead for LineReader<R> {
    fn read_line<'a>(
        &'a mut self,
        wait: Duration,
    ) -> Pin<Box<dyn Future<Output = DynResult<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            // next_line is cancellation safe, so a lapsed wait just means
            // the partial line stays buffered for the next call.
            match tokio::time::timeout(wait, self.lines.next_line()).await {
                Err(_) => Ok(None),
                Ok(Ok(Some(line))) => Ok(Some(line)),
                Ok(Ok(None)) => Err("transport closed".into()),
                Ok(Err(e)) => Err(e.into()),
            }
        })
    }
}

/// Byte writer over any async byte stream.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Send + Unpin + 'static> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Send + Unpin + 'static> TransportWrite for LineWriter<W> {
    fn write_all<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = DynResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.write_all(data).await?;
            self.inner.flush().await?;
            Ok(())
        })
    }
}

/// Open a serial port and split it into the two transport halves.
pub fn open_serial(
    path: &str,
    baud: u32,
) -> DynResult<(Box<dyn TransportRead>, Box<dyn TransportWrite>)> {
    let stream = tokio_serial::new(path, baud).open_native_async()?;
    let (reader, writer) = tokio::io::split(stream);
    Ok((
        Box::new(LineReader::new(reader)),
        Box::new(LineWriter::new(writer)),
    ))
}

/// Split any async byte stream into the two transport halves. Tests use
/// this with `tokio::io::duplex`.
pub fn split_stream<S>(stream: S) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        Box::new(LineReader::new(reader)),
        Box::new(LineWriter::new(writer)),
    )
}
