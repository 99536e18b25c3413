use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 4096;

/// Yields successive `\n`-delimited lines from an async byte stream.
///
/// A trailing unterminated line is yielded once when the stream ends. Bytes
/// handed to the caller are never redelivered.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        LineReader {
            inner,
            buf: Vec::new(),
            start: 0,
            eof: false,
        }
    }

    /// The next line (without its terminator), or `None` once the stream is
    /// exhausted.
    pub async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(offset) = memchr::memchr(b'\n', &self.buf[self.start..]) {
                let line = self.buf[self.start..self.start + offset].to_vec();
                self.start += offset + 1;
                self.compact();
                return Ok(Some(line));
            }

            if self.eof {
                if self.start < self.buf.len() {
                    let line = self.buf[self.start..].to_vec();
                    self.start = self.buf.len();
                    return Ok(Some(line));
                }
                return Ok(None);
            }

            self.compact();
            let old_len = self.buf.len();
            self.buf.resize(old_len + READ_CHUNK, 0);
            let n = self.inner.read(&mut self.buf[old_len..]).await?;
            self.buf.truncate(old_len + n);
            if n == 0 {
                self.eof = true;
            }
        }
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

/// Yields opaque chunks of up to 64 KiB from an async byte stream. The
/// previous chunk is invalidated by the next call.
pub struct ChunkReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub const MAX_CHUNK: usize = 64 * 1024;

    pub fn new(inner: R) -> Self {
        ChunkReader {
            inner,
            buf: vec![0; Self::MAX_CHUNK],
        }
    }

    /// The next chunk of bytes; an empty slice means the stream ended.
    pub async fn read_some(&mut self) -> io::Result<&[u8]> {
        let n = self.inner.read(&mut self.buf).await?;
        Ok(&self.buf[..n])
    }
}

/// Feed every line of `reader` to `consume` until the stream ends. EOF is a
/// clean completion, not an error.
pub async fn consume_all_lines<R, F>(reader: R, mut consume: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut reader = LineReader::new(reader);
    while let Some(line) = reader.read_line().await? {
        consume(&line);
    }
    Ok(())
}

/// Feed every chunk of `reader` to `consume` until the stream ends.
pub async fn consume_all_bytes<R, F>(reader: R, mut consume: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut reader = ChunkReader::new(reader);
    loop {
        let chunk = reader.read_some().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        consume(chunk);
    }
}
