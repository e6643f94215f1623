//! Application boundary.
//!
//! The engine hands each fully received Responder request to a [`Responder`]
//! built by the server's factory. The responder reads parameters and input
//! from the [`ResponderRequest`], streams output back through it, and returns
//! an application exit status.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::fcgi::connection::ConnectionCore;
use crate::fcgi::request::{OutputState, RequestInput};
use crate::protocol::{ProtocolStatus, RecordType, Role};

/// Exit status telling the engine the responder completes the request
/// itself, through a [`RequestHandle`].
pub const DEFERRED_STATUS: i32 = i32::MIN;

/// Application callback for one request.
#[async_trait]
pub trait Responder: Send {
    /// Produce the response. Returning [`DEFERRED_STATUS`] leaves the request
    /// open; any other value completes it with that application status.
    async fn process(&mut self, request: &mut ResponderRequest) -> i32;
}

/// Builds a responder for each request that becomes ready.
pub type ResponderFactory = Arc<dyn Fn(&ResponderRequest) -> Box<dyn Responder> + Send + Sync>;

/// Cloneable handle to the output side of a request.
#[derive(Clone)]
pub struct RequestHandle {
    request_id: u16,
    connection: Arc<ConnectionCore>,
    output: Arc<OutputState>,
}

impl RequestHandle {
    pub(crate) fn new(request_id: u16, connection: Arc<ConnectionCore>, output: Arc<OutputState>) -> Self {
        Self {
            request_id,
            connection,
            output,
        }
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Whether the connection can still carry output for this request.
    pub fn is_connected(&self) -> bool {
        !self.output.is_completed() && self.connection.is_connected()
    }

    /// Write bytes to the request's `StandardOutput` stream.
    pub async fn write_stdout(&self, data: &[u8]) {
        if data.is_empty() || self.output.is_completed() {
            return;
        }
        self.output.open_stdout();
        self.connection
            .send_stream(&self.output, RecordType::StandardOutput, self.request_id, data)
            .await;
    }

    /// Write bytes to the request's `StandardError` stream.
    pub async fn write_stderr(&self, data: &[u8]) {
        if data.is_empty() || self.output.is_completed() {
            return;
        }
        self.output.open_stderr();
        self.connection
            .send_stream(&self.output, RecordType::StandardError, self.request_id, data)
            .await;
    }

    /// Close the output streams and send `EndRequest` with `app_status`.
    /// Completing an already completed request does nothing.
    pub async fn complete(&self, app_status: i32) {
        self.connection
            .complete_request(self.request_id, app_status, ProtocolStatus::RequestComplete)
            .await;
    }
}

/// A fully received request as seen by the application.
pub struct ResponderRequest {
    handle: RequestHandle,
    role: Role,
    keep_alive: bool,
    params: HashMap<String, String>,
    input: Bytes,
    file_data: Bytes,
}

impl ResponderRequest {
    pub(crate) fn new(handle: RequestHandle, input: RequestInput) -> Self {
        Self {
            handle,
            role: input.role,
            keep_alive: input.keep_alive,
            params: input.params,
            input: input.input,
            file_data: input.file_data,
        }
    }

    pub fn request_id(&self) -> u16 {
        self.handle.request_id()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the web server asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn host_name(&self) -> Option<&str> {
        self.param("HTTP_HOST")
    }

    /// `SERVER_PORT`, if present and numeric.
    pub fn port(&self) -> Option<u16> {
        self.param("SERVER_PORT").and_then(|v| v.parse().ok())
    }

    pub fn script_name(&self) -> Option<&str> {
        self.param("SCRIPT_NAME")
    }

    pub fn physical_path(&self) -> Option<&str> {
        self.param("SCRIPT_FILENAME")
    }

    /// Request body received on `StandardInput`.
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// File data received on the `Data` stream (Filter role).
    pub fn file_data(&self) -> &[u8] {
        &self.file_data
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub async fn write_stdout(&self, data: &[u8]) {
        self.handle.write_stdout(data).await;
    }

    pub async fn write_stderr(&self, data: &[u8]) {
        self.handle.write_stderr(data).await;
    }

    pub async fn complete(&self, app_status: i32) {
        self.handle.complete(app_status).await;
    }

    /// A handle that outlives this borrow, for responders that finish the
    /// request from another task.
    pub fn handle(&self) -> RequestHandle {
        self.handle.clone()
    }
}
