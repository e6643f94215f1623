//! FastCGI wire protocol.
//!
//! - **`record`**: record header, record types, and the framed reader/writer
//! - **`body`**: fixed-size bodies (`BeginRequest`, `EndRequest`, `UnknownType`)
//! - **`name_value`**: length-prefixed name/value pair streams
//!
//! # Record flow on one connection
//!
//! ```text
//!  web server                              application
//!  ──────────                              ───────────
//!  BeginRequest(id, role, flags) ───────►
//!  Params(id, ...) ... Params(id, "") ──►
//!  StandardInput(id, ...) ... (id, "") ─►
//!                                 ◄──────── StandardOutput(id, ...)
//!                                 ◄──────── StandardOutput(id, "")
//!                                 ◄──────── EndRequest(id, status)
//! ```

pub mod body;
pub mod name_value;
pub mod record;

pub use body::{
    BeginRequestBody, EndRequestBody, FLAG_KEEP_CONN, ProtocolStatus, Role, UnknownTypeBody,
};
pub use record::{
    FCGI_VERSION_1, HEADER_LEN, Header, MANAGEMENT_REQUEST_ID, MAX_BODY_LEN, Record, RecordReader,
    RecordType, RecordWriter, padding_for,
};

/// Management variable: maximum concurrent connections.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";

/// Management variable: maximum concurrent requests.
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";

/// Management variable: "1" if connections may be multiplexed, "0" otherwise.
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";
