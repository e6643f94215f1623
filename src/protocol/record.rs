//! Record framing.
//!
//! Every record starts with an 8-byte header:
//! ```text
//! ┌─────────┬──────┬────────────┬────────────┬─────────┬──────────┐
//! │ Version │ Type │ Request ID │ Body len   │ Padding │ Reserved │
//! │ u8      │ u8   │ u16 BE     │ u16 BE     │ u8      │ u8       │
//! └─────────┴──────┴────────────┴────────────┴─────────┴──────────┘
//! ```
//! followed by the body and the padding bytes. Senders pad every frame to a
//! multiple of 8 bytes; receivers trust the padding length in the header.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::Buffers;
use crate::error::{Error, Result};

/// Protocol version written into every record.
pub const FCGI_VERSION_1: u8 = 1;

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest body a single record can carry.
pub const MAX_BODY_LEN: usize = 0xFFFF;

/// Request id used by management records (`GetValues` and friends).
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// Record types. Values outside 1..=11 are kept as [`RecordType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    StandardInput,
    StandardOutput,
    StandardError,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::StandardInput,
            6 => RecordType::StandardOutput,
            7 => RecordType::StandardError,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::StandardInput => 5,
            RecordType::StandardOutput => 6,
            RecordType::StandardError => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(other) => other,
        }
    }
}

/// Number of padding bytes that aligns a body of `body_len` bytes to 8.
#[inline]
pub fn padding_for(body_len: usize) -> u8 {
    ((8 - body_len % 8) % 8) as u8
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub record_type: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    /// Header for an outgoing record, padded to an 8-byte boundary.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: FCGI_VERSION_1,
            record_type,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into the first 8 bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_LEN);
        buf[0] = self.version;
        buf[1] = self.record_type.into();
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0;
    }

    /// Returns `None` if `buf` is shorter than a header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            version: buf[0],
            record_type: RecordType::from(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Total frame length including header and padding.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// One received record. The body borrows the reader's receive buffers and is
/// only valid until the next `receive`.
#[derive(Debug)]
pub struct Record<'a> {
    pub header: Header,
    pub body: &'a [u8],
}

impl Record<'_> {
    #[inline]
    pub fn record_type(&self) -> RecordType {
        self.header.record_type
    }

    #[inline]
    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }

    /// Zero-length stream records terminate their stream.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Reads records from a byte stream through a pooled buffer triple.
#[derive(Debug)]
pub struct RecordReader<R> {
    inner: R,
    buffers: Buffers,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R, buffers: Buffers) -> Self {
        Self { inner, buffers }
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a record
    /// boundary and [`Error::Truncated`] when it closed mid-record.
    pub async fn receive(&mut self) -> Result<Option<Record<'_>>> {
        let header_buf = self.buffers.header(HEADER_LEN);
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.inner.read(&mut header_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Truncated);
            }
            filled += n;
        }

        let header = Header::decode(header_buf).ok_or(Error::Truncated)?;
        let body_len = header.content_length as usize;
        let padding_len = header.padding_length as usize;

        read_full(&mut self.inner, self.buffers.body(body_len)).await?;
        read_full(&mut self.inner, self.buffers.padding(padding_len)).await?;

        tracing::debug!(
            record_type = ?header.record_type,
            request_id = header.request_id,
            body_len,
            "record received"
        );

        Ok(Some(Record {
            header,
            body: self.buffers.body(body_len),
        }))
    }
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Truncated),
        Err(e) => Err(e.into()),
    }
}

/// Writes records to a byte stream through a pooled buffer triple.
#[derive(Debug)]
pub struct RecordWriter<W> {
    inner: W,
    buffers: Buffers,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W, buffers: Buffers) -> Self {
        Self { inner, buffers }
    }

    /// Frame `body` as one record and write it out.
    pub async fn send(&mut self, record_type: RecordType, request_id: u16, body: &[u8]) -> Result<()> {
        if body.len() > MAX_BODY_LEN {
            return Err(Error::Protocol(format!(
                "record body of {} bytes exceeds {}",
                body.len(),
                MAX_BODY_LEN
            )));
        }

        let header = Header::new(record_type, request_id, body.len() as u16);
        let padding_len = header.padding_length as usize;

        header.encode_into(self.buffers.header(HEADER_LEN));
        self.buffers.body(body.len()).copy_from_slice(body);
        self.buffers.padding(padding_len).fill(0);

        self.inner.write_all(self.buffers.header(HEADER_LEN)).await?;
        self.inner.write_all(self.buffers.body(body.len())).await?;
        self.inner.write_all(self.buffers.padding(padding_len)).await?;
        self.inner.flush().await?;

        tracing::debug!(
            record_type = ?record_type,
            request_id,
            body_len = body.len(),
            "record sent"
        );

        Ok(())
    }

    /// Flush and shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
