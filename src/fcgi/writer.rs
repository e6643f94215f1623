//! Serialized send path of a connection.
//!
//! Requests running on different tasks share one socket. Every record is
//! written under the sink's lock so frames never interleave on the wire;
//! records of different requests may interleave between frames.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use super::request::OutputState;
use crate::protocol::{EndRequestBody, RecordType, RecordWriter};

/// Largest body written per output record. Stream writes are split into
/// chunks of at most this many bytes.
pub const MAX_STREAM_CHUNK: usize = 0x7FFF;

pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) struct RecordSink {
    writer: Mutex<Option<RecordWriter<BoxedWrite>>>,
    open: AtomicBool,
}

impl RecordSink {
    pub(crate) fn new(writer: RecordWriter<BoxedWrite>) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
        }
    }

    /// Whether the last send succeeded and the sink has not been closed.
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Send one record. Failures are logged and swallowed: the peer is
    /// presumed gone and the read side will notice.
    pub(crate) async fn send(&self, record_type: RecordType, request_id: u16, body: &[u8]) -> bool {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => self.write(writer, record_type, request_id, body).await,
            None => false,
        }
    }

    /// Send `data` on an output stream of one request, split into records
    /// of at most [`MAX_STREAM_CHUNK`] bytes. Empty data sends nothing.
    ///
    /// Completion is checked under the lock before every chunk, so nothing
    /// follows the request's `EndRequest` once [`finish`](Self::finish) ran.
    pub(crate) async fn send_stream(
        &self,
        output: &OutputState,
        record_type: RecordType,
        request_id: u16,
        data: &[u8],
    ) {
        for chunk in data.chunks(MAX_STREAM_CHUNK) {
            let mut guard = self.writer.lock().await;
            if output.is_completed() {
                tracing::trace!(request_id, "output after completion dropped");
                return;
            }
            let Some(writer) = guard.as_mut() else {
                return;
            };
            if !self.write(writer, record_type, request_id, chunk).await {
                return;
            }
        }
    }

    /// Mark the request completed and send its stream terminators and
    /// `EndRequest` in one critical section.
    pub(crate) async fn finish(&self, output: &OutputState, request_id: u16, end: EndRequestBody) {
        let mut guard = self.writer.lock().await;
        output.mark_completed();
        let Some(writer) = guard.as_mut() else {
            return;
        };

        if output.stdout_opened()
            && !self.write(writer, RecordType::StandardOutput, request_id, &[]).await
        {
            return;
        }
        if output.stderr_opened()
            && !self.write(writer, RecordType::StandardError, request_id, &[]).await
        {
            return;
        }
        self.write(writer, RecordType::EndRequest, request_id, &end.encode())
            .await;
    }

    async fn write(
        &self,
        writer: &mut RecordWriter<BoxedWrite>,
        record_type: RecordType,
        request_id: u16,
        body: &[u8],
    ) -> bool {
        match writer.send(record_type, request_id, body).await {
            Ok(()) => true,
            Err(e) => {
                self.open.store(false, Ordering::Release);
                tracing::debug!(
                    record_type = ?record_type,
                    request_id,
                    error = %e,
                    "send failed"
                );
                false
            }
        }
    }

    /// Shut the write side down and release the send buffers.
    pub(crate) async fn close(&self) {
        self.open.store(false, Ordering::Release);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(error = %e, "shutdown of write half failed");
            }
        }
    }
}
