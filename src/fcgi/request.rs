//! Per-request input state machine.
//!
//! ```text
//!   BeginRequest
//!        │
//!        ▼
//!  ┌───────────────┐  Params(""), StandardInput("")
//!  │ AwaitingInput │  (and Data("") for Filter)
//!  └───────┬───────┘
//!          ▼
//!  ┌───────────────┐  responder runs
//!  │  Processing   │
//!  └───────┬───────┘
//!          ▼
//!     EndRequest sent, slot removed
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::error::NameValueError;
use crate::protocol::{Role, name_value};

/// Parameter carrying the declared request body length.
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    AwaitingInput,
    Processing,
}

/// Per-request failures. The request is aborted with the message on
/// `StandardError`; the connection survives.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("cannot parse request parameters: {0}")]
    InvalidParams(#[from] NameValueError),

    #[error("request input arrived without a CONTENT_LENGTH parameter")]
    NoContentLength,

    #[error("CONTENT_LENGTH is not a number: {0:?}")]
    ContentLengthNotNumber(String),

    #[error("request input exceeds CONTENT_LENGTH of {expected} bytes")]
    ContentExceedsLength { expected: usize },

    #[error("request input ended after {received} of {expected} bytes")]
    IncompleteInput { received: usize, expected: usize },
}

/// Output-side bookkeeping shared between the connection and the
/// responder's handles.
#[derive(Debug, Default)]
pub(crate) struct OutputState {
    stdout_opened: AtomicBool,
    stderr_opened: AtomicBool,
    completed: AtomicBool,
}

impl OutputState {
    pub(crate) fn open_stdout(&self) {
        self.stdout_opened.store(true, Ordering::Release);
    }

    pub(crate) fn open_stderr(&self) {
        self.stderr_opened.store(true, Ordering::Release);
    }

    pub(crate) fn stdout_opened(&self) -> bool {
        self.stdout_opened.load(Ordering::Acquire)
    }

    pub(crate) fn stderr_opened(&self) -> bool {
        self.stderr_opened.load(Ordering::Acquire)
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Everything a responder needs once all input streams are closed.
#[derive(Debug)]
pub(crate) struct RequestInput {
    pub(crate) role: Role,
    pub(crate) keep_alive: bool,
    pub(crate) params: HashMap<String, String>,
    pub(crate) input: Bytes,
    pub(crate) file_data: Bytes,
    pub(crate) output: Arc<OutputState>,
}

#[derive(Debug)]
pub(crate) enum Progress {
    Pending,
    Ready(RequestInput),
}

#[derive(Debug, Default)]
struct InputStream {
    data: BytesMut,
    done: bool,
}

/// One active request on a connection.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    id: u16,
    role: Role,
    keep_alive: bool,
    state: RequestState,
    params: InputStream,
    table: Option<HashMap<String, String>>,
    stdin: InputStream,
    data: InputStream,
    content_length: Option<usize>,
    output: Arc<OutputState>,
}

impl RequestSlot {
    pub(crate) fn new(id: u16, role: Role, keep_alive: bool) -> Self {
        Self {
            id,
            role,
            keep_alive,
            state: RequestState::AwaitingInput,
            params: InputStream::default(),
            table: None,
            stdin: InputStream::default(),
            data: InputStream::default(),
            content_length: None,
            output: Arc::new(OutputState::default()),
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    /// True until every input stream of the request has been terminated.
    pub(crate) fn data_needed(&self) -> bool {
        self.state() == RequestState::AwaitingInput
    }

    pub(crate) fn output(&self) -> &Arc<OutputState> {
        &self.output
    }

    pub(crate) fn add_params(&mut self, body: &[u8]) -> Result<Progress, RequestError> {
        if self.params.done {
            tracing::warn!(request_id = self.id, "parameters already completed, record ignored");
            return Ok(Progress::Pending);
        }

        if !body.is_empty() {
            self.params.data.extend_from_slice(body);
            return Ok(Progress::Pending);
        }

        let raw = std::mem::take(&mut self.params.data);
        self.table = Some(name_value::decode(&raw)?);
        self.params.done = true;
        Ok(self.try_ready())
    }

    pub(crate) fn add_input(&mut self, body: &[u8]) -> Result<Progress, RequestError> {
        if self.stdin.done {
            tracing::warn!(request_id = self.id, "standard input already completed, record ignored");
            return Ok(Progress::Pending);
        }

        if body.is_empty() {
            self.stdin.done = true;
            if let Some(expected) = self.content_length {
                let received = self.stdin.data.len();
                if received < expected {
                    return Err(RequestError::IncompleteInput { received, expected });
                }
            }
            return Ok(self.try_ready());
        }

        if self.role == Role::Responder {
            let expected = match self.content_length {
                Some(expected) => expected,
                None => {
                    let expected = self.declared_length()?;
                    self.content_length = Some(expected);
                    expected
                }
            };
            if self.stdin.data.len() + body.len() > expected {
                return Err(RequestError::ContentExceedsLength { expected });
            }
        }

        self.stdin.data.extend_from_slice(body);
        Ok(Progress::Pending)
    }

    pub(crate) fn add_file_data(&mut self, body: &[u8]) -> Result<Progress, RequestError> {
        if self.data.done {
            tracing::warn!(request_id = self.id, "file data already completed, record ignored");
            return Ok(Progress::Pending);
        }

        if body.is_empty() {
            self.data.done = true;
            return Ok(self.try_ready());
        }

        self.data.data.extend_from_slice(body);
        Ok(Progress::Pending)
    }

    fn declared_length(&self) -> Result<usize, RequestError> {
        let text = self
            .table
            .as_ref()
            .and_then(|table| table.get(CONTENT_LENGTH))
            .ok_or(RequestError::NoContentLength)?;

        text.trim()
            .parse()
            .map_err(|_| RequestError::ContentLengthNotNumber(text.clone()))
    }

    fn inputs_complete(&self) -> bool {
        let file_data_done = self.role != Role::Filter || self.data.done;
        self.params.done && self.stdin.done && file_data_done
    }

    fn try_ready(&mut self) -> Progress {
        if self.state != RequestState::AwaitingInput || !self.inputs_complete() {
            return Progress::Pending;
        }

        self.state = RequestState::Processing;
        Progress::Ready(RequestInput {
            role: self.role,
            keep_alive: self.keep_alive,
            params: self.table.take().unwrap_or_default(),
            input: std::mem::take(&mut self.stdin.data).freeze(),
            file_data: std::mem::take(&mut self.data.data).freeze(),
            output: Arc::clone(&self.output),
        })
    }
}
