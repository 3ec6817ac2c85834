//! Frame decoder: pulls one record at a time off a byte stream.
//!
//! TCP hands us bytes, not records. One read can return the tail of one
//! record and the head of the next, or a single byte. [`FrameReader`] keeps a
//! connection-level buffer and reads in two phases:
//!
//! 1. [`FrameReader::probe_header`] fills the buffer until the common header
//!    is present and parses it without consuming anything. Calling it again
//!    yields the same header.
//! 2. Once the header has been validated against the catalog, the reader
//!    consumes exactly the declared size, and nothing beyond it.
//!
//! The declared size is checked before any body byte is read, so a hostile
//! peer can never make the buffer grow past [`MAX_RECORD_SIZE`].

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::DecodeError;
use crate::record::{Header, Record, HEADER_SIZE, MAX_RECORD_SIZE};

/// Upper bound on bytes requested from the socket per read call.
const READ_CHUNK: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Record(Record),
    /// The peer shut down cleanly between records.
    EndOfStream,
}

#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(MAX_RECORD_SIZE),
        }
    }

    /// Bytes read from the stream but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Look at the next header without consuming it.
    ///
    /// Returns `None` when the stream ends before a single byte of a new
    /// record arrives.
    ///
    /// # Errors
    ///
    /// `Io` on socket failure, `Truncated` if the stream ends part way
    /// through the header.
    pub async fn probe_header(&mut self) -> Result<Option<Header>, DecodeError> {
        let complete = self.fill_to(HEADER_SIZE).await?;
        match self.buf.first_chunk::<HEADER_SIZE>() {
            Some(head) if complete => Ok(Some(Header::parse(head))),
            _ if self.buf.is_empty() => Ok(None),
            _ => Err(DecodeError::Truncated {
                expected: HEADER_SIZE,
                received: self.buf.len(),
            }),
        }
    }

    /// Read the next complete record.
    ///
    /// # Errors
    ///
    /// Any [`DecodeError`]. After an error the stream position is unknown and
    /// the reader must not be used again.
    pub async fn read_record(&mut self) -> Result<ReadOutcome, DecodeError> {
        let Some(header) = self.probe_header().await? else {
            return Ok(ReadOutcome::EndOfStream);
        };
        let (kind, size) = header.validate()?;
        let frame = self.consume(size).await?;
        Ok(ReadOutcome::Record(Record::decode_body(
            kind,
            &frame[HEADER_SIZE..],
        )))
    }

    async fn consume(&mut self, n: usize) -> Result<Vec<u8>, DecodeError> {
        if !self.fill_to(n).await? {
            return Err(DecodeError::Truncated {
                expected: n,
                received: self.buf.len(),
            });
        }
        Ok(self.buf.drain(..n).collect())
    }

    // Returns false if the stream ended first.
    async fn fill_to(&mut self, n: usize) -> Result<bool, DecodeError> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.buf.len() < n {
            let want = (n - self.buf.len()).min(READ_CHUNK);
            let read = self.inner.read(&mut chunk[..want]).await?;
            if read == 0 {
                return Ok(false);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(true)
    }
}
