//! Message body framing: request body decoding and response body encoding.
//!
//! Both codecs are stream-agnostic. They hold only framing state and take the
//! underlying stream as an argument on every call, so the connection's single
//! buffered transport can serve the request body and the response body in turn.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Framing;

/// Longest chunk-size or trailer line accepted while dechunking.
const MAX_CHUNK_LINE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Done,
}

/// Decoder for a request body delimited by `Content-Length` or chunked coding.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// use http_engine::http::{Framing, body::BodyReader};
/// use tokio::io::BufReader;
///
/// let mut wire = BufReader::new(&b"5\r\nhello\r\n0\r\n\r\n"[..]);
/// let mut body = BodyReader::new(Framing::Chunked);
/// let mut out = Vec::new();
/// body.read_to_end(&mut wire, &mut out).await?;
/// assert_eq!(out, b"hello");
/// assert!(body.is_done());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BodyReader {
    state: ReadState,
}

impl BodyReader {
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => ReadState::Done,
            Framing::Length(n) => ReadState::Fixed { remaining: n },
            Framing::Chunked => ReadState::ChunkSize,
        };
        Self { state }
    }

    /// Returns `true` once the end of the body has been consumed.
    pub fn is_done(&self) -> bool {
        self.state == ReadState::Done
    }

    /// Reads decoded body bytes into `buf`, returning `0` at end of body.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::UnexpectedEof`] if the peer closes mid-body, and
    /// [`io::ErrorKind::InvalidData`] for malformed chunk framing.
    pub async fn read<R>(&mut self, io: &mut R, buf: &mut [u8]) -> io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ReadState::Done => return Ok(0),
                ReadState::Fixed { remaining } => {
                    let n = read_some(io, buf, remaining).await?;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        ReadState::Done
                    } else {
                        ReadState::Fixed { remaining }
                    };
                    return Ok(n);
                }
                ReadState::ChunkSize => {
                    let size = read_chunk_size(io).await?;
                    if size == 0 {
                        skip_trailers(io).await?;
                        self.state = ReadState::Done;
                    } else {
                        self.state = ReadState::ChunkData { remaining: size };
                    }
                }
                ReadState::ChunkData { remaining } => {
                    let n = read_some(io, buf, remaining).await?;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        ReadState::ChunkEnd
                    } else {
                        ReadState::ChunkData { remaining }
                    };
                    return Ok(n);
                }
                ReadState::ChunkEnd => {
                    let line = read_short_line(io).await?;
                    if line != b"\r\n" && line != b"\n" {
                        return Err(invalid("missing CRLF after chunk data"));
                    }
                    self.state = ReadState::ChunkSize;
                }
            }
        }
    }

    /// Reads the rest of the body, appending it to `out`.
    pub async fn read_to_end<R>(&mut self, io: &mut R, out: &mut Vec<u8>) -> io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut chunk = [0u8; 8192];
        let mut total = 0;
        loop {
            let n = self.read(io, &mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Discards up to `limit` body bytes. Returns `true` if the end of the
    /// body was reached within the limit.
    pub async fn drain<R>(&mut self, io: &mut R, limit: u64) -> io::Result<bool>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut scratch = [0u8; 4096];
        let mut drained = 0u64;
        while !self.is_done() {
            if drained >= limit {
                return Ok(false);
            }
            let want = (limit - drained).min(scratch.len() as u64) as usize;
            let n = self.read(io, &mut scratch[..want]).await?;
            drained += n as u64;
        }
        Ok(true)
    }
}

async fn read_some<R>(io: &mut R, buf: &mut [u8], remaining: u64) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let want = remaining.min(buf.len() as u64) as usize;
    let n = io.read(&mut buf[..want]).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before end of request body",
        ));
    }
    Ok(n)
}

async fn read_short_line<R>(io: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(16);
    let n = (&mut *io).take(MAX_CHUNK_LINE).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside chunk framing",
        ));
    }
    if line.last() != Some(&b'\n') {
        return Err(invalid("chunk framing line too long"));
    }
    Ok(line)
}

async fn read_chunk_size<R>(io: &mut R) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_short_line(io).await?;
    let text = std::str::from_utf8(&line).map_err(|_| invalid("chunk size is not ASCII"))?;
    // Chunk extensions after ';' are ignored.
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() {
        return Err(invalid("empty chunk size"));
    }
    u64::from_str_radix(digits, 16).map_err(|_| invalid("chunk size is not hexadecimal"))
}

async fn skip_trailers<R>(io: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = read_short_line(io).await?;
        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Fixed { remaining: u64 },
    Chunked,
    CloseDelimited,
    NoBody,
}

/// Encoder for a response body.
///
/// A fixed-length writer refuses bytes beyond the declared length without
/// entering an error state, and reports a short body from [`finish`](Self::finish).
#[derive(Debug)]
pub struct BodyWriter {
    mode: WriteMode,
    finished: bool,
}

impl BodyWriter {
    /// Exactly `len` bytes must be written.
    pub fn fixed(len: u64) -> Self {
        Self::with_mode(WriteMode::Fixed { remaining: len })
    }

    /// Each write becomes one chunk; `finish` writes the terminating chunk.
    pub fn chunked() -> Self {
        Self::with_mode(WriteMode::Chunked)
    }

    /// Raw bytes delimited by closing the connection (HTTP/1.0 peers).
    pub fn close_delimited() -> Self {
        Self::with_mode(WriteMode::CloseDelimited)
    }

    /// No body may be written at all.
    pub fn no_body() -> Self {
        Self::with_mode(WriteMode::NoBody)
    }

    fn with_mode(mode: WriteMode) -> Self {
        Self { mode, finished: false }
    }

    /// Returns `true` if the peer can only detect the end of this body by
    /// the connection closing.
    pub fn is_close_delimited(&self) -> bool {
        self.mode == WriteMode::CloseDelimited
    }

    /// Writes `data` as body bytes.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::InvalidInput`] when `data` would overrun a fixed
    /// length or the response has no body; nothing is written in that case.
    pub async fn write<W>(&mut self, io: &mut W, data: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response body already finished",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        match self.mode {
            WriteMode::NoBody => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response does not permit a body",
            )),
            WriteMode::Fixed { remaining } => {
                if data.len() as u64 > remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "too many bytes to write to stream",
                    ));
                }
                io.write_all(data).await?;
                self.mode = WriteMode::Fixed {
                    remaining: remaining - data.len() as u64,
                };
                Ok(())
            }
            WriteMode::Chunked => {
                io.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
                io.write_all(data).await?;
                io.write_all(b"\r\n").await
            }
            WriteMode::CloseDelimited => io.write_all(data).await,
        }
    }

    /// Completes the body and flushes the stream.
    ///
    /// Calling `finish` again after success is a no-op.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::UnexpectedEof`] if a fixed-length body is short. The
    /// connection must not be reused after that.
    pub async fn finish<W>(&mut self, io: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.finished {
            return Ok(());
        }
        match self.mode {
            WriteMode::Fixed { remaining } if remaining > 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("insufficient bytes written to stream: {remaining} missing"),
                ));
            }
            WriteMode::Chunked => io.write_all(b"0\r\n\r\n").await?,
            _ => {}
        }
        io.flush().await?;
        self.finished = true;
        Ok(())
    }
}
