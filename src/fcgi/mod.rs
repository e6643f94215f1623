//! Application side of a FastCGI connection.
//!
//! - **`connection`**: the per-connection read loop and record dispatch
//! - **`request`**: input assembly for one request
//! - **`responder`**: the callback boundary handed to the application
//! - **`writer`**: the serialized send path shared by all requests of a connection

pub mod connection;
pub mod request;
pub mod responder;
pub mod writer;

pub use connection::ABORTED_STATUS;
pub use request::{CONTENT_LENGTH, RequestError, RequestState};
pub use responder::{DEFERRED_STATUS, RequestHandle, Responder, ResponderFactory, ResponderRequest};
pub use writer::MAX_STREAM_CHUNK;
