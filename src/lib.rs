//! fcgi-host - FastCGI application server
//!
//! Core library for the FastCGI wire protocol, connection handling and
//! request admission.

pub mod buffer;
pub mod config;
pub mod error;
pub mod fcgi;
pub mod protocol;
pub mod server;

pub use error::{Error, NameValueError, Result};
pub use fcgi::{DEFERRED_STATUS, RequestHandle, Responder, ResponderRequest};
pub use server::{ListenAddr, Listener, Server, ServerSettings};
