use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::fcgi::request::{OutputState, Progress, RequestInput, RequestSlot};
use crate::fcgi::responder::{DEFERRED_STATUS, RequestHandle, ResponderRequest};
use crate::fcgi::writer::{BoxedWrite, RecordSink};
use crate::protocol::{
    BeginRequestBody, EndRequestBody, MANAGEMENT_REQUEST_ID, ProtocolStatus, Record, RecordReader,
    RecordType, RecordWriter, UnknownTypeBody, name_value,
};
use crate::server::ServerShared;

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Application status reported for aborted and force-completed requests.
pub const ABORTED_STATUS: i32 = -1;

#[derive(Debug, Clone, Copy)]
enum Stream {
    Params,
    StandardInput,
    Data,
}

enum Admission {
    Admitted,
    Duplicate,
    CantMultiplex,
    Overloaded,
    Malformed,
    UnknownRole,
}

#[derive(Debug, Default)]
struct ConnectionState {
    requests: HashMap<u16, RequestSlot>,
    keep_alive: bool,
    stopping: bool,
    closed: bool,
}

impl ConnectionState {
    fn unfinished_requests(&self) -> bool {
        self.requests.values().any(RequestSlot::data_needed)
    }
}

/// Shared core of one accepted connection.
///
/// The read loop owns the receive side; requests processed on other tasks
/// reach the send side and the request table through an `Arc` of the core.
pub(crate) struct ConnectionCore {
    id: u64,
    server: Arc<ServerShared>,
    sink: RecordSink,
    state: Mutex<ConnectionState>,
    stop_tx: watch::Sender<bool>,
}

impl ConnectionCore {
    pub(crate) fn new(id: u64, server: Arc<ServerShared>, writer: RecordWriter<BoxedWrite>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            id,
            server,
            sink: RecordSink::new(writer),
            state: Mutex::new(ConnectionState::default()),
            stop_tx,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.state.lock().closed && self.sink.is_open()
    }

    /// Drive the record loop until the connection is finished.
    pub(crate) async fn run(self: Arc<Self>, mut reader: RecordReader<BoxedRead>) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        let idle_timeout = self.server.idle_timeout();
        tracing::debug!("connection running");

        let outcome = loop {
            if self.is_stopping() {
                break Ok(());
            }

            let received = tokio::select! {
                biased;
                _ = stop_rx.changed() => break Ok(()),
                res = receive(&mut reader, idle_timeout) => res,
            };

            match received {
                Ok(Some(record)) => {
                    if let Err(e) = self.handle_record(record).await {
                        break Err(e);
                    }
                }
                Ok(None) if self.request_count() > 0 => {
                    break Err(Error::Protocol(
                        "peer closed the connection with requests outstanding".to_string(),
                    ));
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }

            if !self.keep_reading() {
                break Ok(());
            }
        };

        // Releases the receive buffers.
        drop(reader);

        match outcome {
            Ok(()) => {
                if self.request_count() == 0 {
                    self.close().await;
                }
                tracing::debug!("connection loop finished");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "terminating connection");
                self.stop().await;
                Err(e)
            }
        }
    }

    fn is_stopping(&self) -> bool {
        let state = self.state.lock();
        state.stopping || state.closed
    }

    /// Keep reading while some request still needs input or the web server
    /// asked for keep-alive.
    fn keep_reading(&self) -> bool {
        let state = self.state.lock();
        !state.stopping && !state.closed && (state.unfinished_requests() || state.keep_alive)
    }

    async fn handle_record(self: &Arc<Self>, record: Record<'_>) -> Result<()> {
        let request_id = record.request_id();

        match record.record_type() {
            RecordType::BeginRequest => self.begin_request(request_id, record.body).await?,
            RecordType::Params => self.feed(request_id, Stream::Params, record.body).await,
            RecordType::StandardInput => self.feed(request_id, Stream::StandardInput, record.body).await,
            RecordType::Data => self.feed(request_id, Stream::Data, record.body).await,
            RecordType::AbortRequest => {
                self.abort(request_id, "request aborted by the web server").await
            }
            RecordType::GetValues => self.get_values(request_id, record.body).await,
            other => {
                tracing::warn!(record_type = ?other, request_id, "unknown record type");
                let body = UnknownTypeBody::new(other.into()).encode();
                self.sink.send(RecordType::UnknownType, request_id, &body).await;
            }
        }

        Ok(())
    }

    async fn begin_request(self: &Arc<Self>, request_id: u16, body: &[u8]) -> Result<()> {
        let admission = {
            let mut state = self.state.lock();

            if state.requests.contains_key(&request_id) {
                Admission::Duplicate
            } else if !self.server.multiplex() && state.unfinished_requests() {
                Admission::CantMultiplex
            } else if !self.server.try_admit_request() {
                Admission::Overloaded
            } else {
                match BeginRequestBody::decode(body) {
                    None => {
                        self.server.release_request();
                        Admission::Malformed
                    }
                    Some(begin) if !self.server.supports_role(begin.role) => {
                        self.server.release_request();
                        tracing::warn!(request_id, role = ?begin.role, "role not supported");
                        Admission::UnknownRole
                    }
                    Some(begin) => {
                        state
                            .requests
                            .insert(request_id, RequestSlot::new(request_id, begin.role, begin.keep_alive()));
                        state.keep_alive = begin.keep_alive();
                        Admission::Admitted
                    }
                }
            }
        };

        match admission {
            Admission::Admitted => {
                tracing::debug!(request_id, "request started");
                Ok(())
            }
            Admission::Duplicate => Err(Error::Protocol(format!(
                "request {request_id} already exists on this connection"
            ))),
            Admission::CantMultiplex => {
                self.send_end_request(request_id, 0, ProtocolStatus::CantMultiplexConnections)
                    .await;
                Ok(())
            }
            Admission::Overloaded => {
                tracing::warn!(request_id, "request limit reached");
                self.send_end_request(request_id, 0, ProtocolStatus::Overloaded).await;
                Ok(())
            }
            Admission::Malformed => {
                tracing::error!(request_id, len = body.len(), "malformed BeginRequest body");
                self.send_end_request(request_id, ABORTED_STATUS, ProtocolStatus::RequestComplete)
                    .await;
                Ok(())
            }
            Admission::UnknownRole => {
                self.send_end_request(request_id, 0, ProtocolStatus::UnknownRole).await;
                Ok(())
            }
        }
    }

    async fn feed(self: &Arc<Self>, request_id: u16, stream: Stream, body: &[u8]) {
        let progress = {
            let mut state = self.state.lock();
            state.requests.get_mut(&request_id).map(|slot| match stream {
                Stream::Params => slot.add_params(body),
                Stream::StandardInput => slot.add_input(body),
                Stream::Data => slot.add_file_data(body),
            })
        };

        match progress {
            None => {
                tracing::warn!(request_id, stream = ?stream, "record for inactive request ignored");
            }
            Some(Ok(Progress::Pending)) => {}
            Some(Ok(Progress::Ready(input))) => self.process(request_id, input).await,
            Some(Err(e)) => self.abort(request_id, &e.to_string()).await,
        }
    }

    /// Run the responder inline, or on its own task when the server
    /// multiplexes connections.
    async fn process(self: &Arc<Self>, request_id: u16, input: RequestInput) {
        let handle = RequestHandle::new(request_id, Arc::clone(self), Arc::clone(&input.output));
        let mut request = ResponderRequest::new(handle, input);
        let mut responder = self.server.create_responder(&request);

        let work = async move {
            let status = responder.process(&mut request).await;
            if status == DEFERRED_STATUS {
                tracing::trace!("responder completes the request itself");
            } else {
                request.complete(status).await;
            }
        }
        .instrument(tracing::debug_span!("request", request_id));

        if self.server.multiplex() {
            tokio::spawn(work);
        } else {
            work.await;
        }
    }

    async fn get_values(&self, request_id: u16, body: &[u8]) {
        if request_id != MANAGEMENT_REQUEST_ID {
            tracing::debug!(request_id, "GetValues sent with a request id");
        }
        let response = match name_value::decode(body) {
            Ok(query) => {
                let values = self.server.get_values(query.keys().map(String::as_str));
                name_value::encode(values.iter().map(|(name, value)| (name, value)))
                    .unwrap_or_default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot decode GetValues query");
                Vec::new()
            }
        };

        self.sink
            .send(RecordType::GetValuesResult, request_id, &response)
            .await;
    }

    /// Output for one request. Chunks are dropped once the request completed.
    pub(crate) async fn send_stream(
        &self,
        output: &OutputState,
        record_type: RecordType,
        request_id: u16,
        data: &[u8],
    ) {
        self.sink
            .send_stream(output, record_type, request_id, data)
            .await;
    }

    async fn send_end_request(&self, request_id: u16, app_status: i32, protocol_status: ProtocolStatus) {
        let body = EndRequestBody::new(app_status, protocol_status).encode();
        self.sink.send(RecordType::EndRequest, request_id, &body).await;
    }

    /// Fail one request: report `message` on `StandardError`, then end it
    /// with status -1. Unknown ids are ignored.
    pub(crate) async fn abort(&self, request_id: u16, message: &str) {
        let output = {
            let state = self.state.lock();
            state.requests.get(&request_id).map(|slot| Arc::clone(slot.output()))
        };
        let Some(output) = output else {
            tracing::debug!(request_id, "abort for inactive request ignored");
            return;
        };

        tracing::error!(request_id, reason = message, "aborting request");
        output.open_stderr();
        self.sink
            .send_stream(&output, RecordType::StandardError, request_id, message.as_bytes())
            .await;
        self.complete_request(request_id, ABORTED_STATUS, ProtocolStatus::RequestComplete)
            .await;
    }

    /// Close the opened output streams, send `EndRequest` and drop the
    /// request. Only the first completion of an id has any effect.
    pub(crate) async fn complete_request(
        &self,
        request_id: u16,
        app_status: i32,
        protocol_status: ProtocolStatus,
    ) {
        let removed = self.state.lock().requests.remove(&request_id);
        let Some(slot) = removed else {
            return;
        };

        self.server.release_request();
        self.sink
            .finish(
                slot.output(),
                request_id,
                EndRequestBody::new(app_status, protocol_status),
            )
            .await;
        tracing::debug!(request_id, app_status, protocol_status = ?protocol_status, "request completed");

        let finished = {
            let state = self.state.lock();
            state.requests.is_empty() && (state.stopping || !state.keep_alive)
        };
        if finished {
            self.close().await;
        }
    }

    /// Force-complete every active request with status -1 and close.
    pub(crate) async fn stop(&self) {
        let request_ids: Vec<u16> = {
            let mut state = self.state.lock();
            state.stopping = true;
            state.requests.keys().copied().collect()
        };
        self.stop_tx.send_replace(true);

        for request_id in request_ids {
            self.complete_request(request_id, ABORTED_STATUS, ProtocolStatus::RequestComplete)
                .await;
        }
        self.close().await;
    }

    /// Tear the connection down. Runs once; later calls return immediately.
    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.stop_tx.send_replace(true);
        self.sink.close().await;
        self.server.unregister(self.id);
        tracing::info!(connection = self.id, "connection closed");
    }
}

async fn receive(
    reader: &mut RecordReader<BoxedRead>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Record<'_>>> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.receive())
            .await
            .map_err(|_| Error::IdleTimeout(limit))?,
        None => reader.receive().await,
    }
}
