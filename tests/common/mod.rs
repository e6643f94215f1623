//! Web-server side of a FastCGI conversation, for driving a `Server` in tests.

#![allow(dead_code)]

use std::time::Duration;

use fcgi_host::buffer::BufferPools;
use fcgi_host::protocol::{
    BeginRequestBody, EndRequestBody, Header, MANAGEMENT_REQUEST_ID, RecordReader, RecordType, Role, name_value,
};
use fcgi_host::{Responder, ResponderRequest, Server, ServerSettings};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// An owned copy of a received record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub record_type: RecordType,
    pub request_id: u16,
    pub body: Vec<u8>,
}

impl Received {
    pub fn end_request(&self) -> EndRequestBody {
        assert_eq!(self.record_type, RecordType::EndRequest, "not an EndRequest: {self:?}");
        EndRequestBody::decode(&self.body).expect("malformed EndRequest body")
    }
}

pub struct Client<S> {
    reader: RecordReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    pub fn new(stream: S) -> Self {
        let pools = BufferPools::default();
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: RecordReader::new(read_half, pools.claim_triple()),
            writer,
        }
    }

    pub async fn send(&mut self, record_type: RecordType, request_id: u16, body: &[u8]) {
        let header = Header::new(record_type, request_id, body.len() as u16);
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(body);
        frame.resize(header.frame_len(), 0);
        self.writer.write_all(&frame).await.expect("write failed");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write failed");
    }

    pub async fn begin(&mut self, request_id: u16, role: Role, flags: u8) {
        let body = BeginRequestBody::new(role, flags).encode();
        self.send(RecordType::BeginRequest, request_id, &body).await;
    }

    /// Send the parameter stream, including its terminator.
    pub async fn params(&mut self, request_id: u16, pairs: &[(&str, &str)]) {
        if !pairs.is_empty() {
            let body = name_value::encode(pairs.iter().copied()).unwrap();
            self.send(RecordType::Params, request_id, &body).await;
        }
        self.send(RecordType::Params, request_id, &[]).await;
    }

    /// Send the standard input stream, including its terminator.
    pub async fn stdin(&mut self, request_id: u16, data: &[u8]) {
        if !data.is_empty() {
            self.send(RecordType::StandardInput, request_id, data).await;
        }
        self.send(RecordType::StandardInput, request_id, &[]).await;
    }

    pub async fn get_values(&mut self, names: &[&str]) -> std::collections::HashMap<String, String> {
        let body = name_value::encode(names.iter().map(|name| (*name, ""))).unwrap();
        self.send(RecordType::GetValues, MANAGEMENT_REQUEST_ID, &body).await;
        let reply = self.recv().await.expect("connection closed before GetValuesResult");
        assert_eq!(reply.record_type, RecordType::GetValuesResult);
        name_value::decode(&reply.body).unwrap()
    }

    /// Next record, or `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<Received> {
        let record = tokio::time::timeout(TIMEOUT, self.reader.receive())
            .await
            .expect("timed out waiting for a record")
            .expect("receive failed")?;
        Some(Received {
            record_type: record.record_type(),
            request_id: record.request_id(),
            body: record.body.to_vec(),
        })
    }

    /// Records up to and including the `EndRequest` of `request_id`.
    pub async fn until_end(&mut self, request_id: u16) -> Vec<Received> {
        let mut records = Vec::new();
        loop {
            let record = self.recv().await.expect("connection closed before EndRequest");
            let done = record.record_type == RecordType::EndRequest && record.request_id == request_id;
            records.push(record);
            if done {
                return records;
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Concatenated bodies of the records of one stream type.
pub fn stream_data(records: &[Received], record_type: RecordType) -> Vec<u8> {
    records
        .iter()
        .filter(|r| r.record_type == record_type)
        .flat_map(|r| r.body.iter().copied())
        .collect()
}

pub fn server_with<R>(settings: ServerSettings) -> Server
where
    R: Responder + Default + 'static,
{
    Server::new(settings, |_: &ResponderRequest| {
        Box::new(R::default()) as Box<dyn Responder>
    })
    .unwrap()
}

/// Serve one in-memory connection; returns the client end and the
/// connection task.
pub fn connect(
    server: &Server,
) -> (
    Client<tokio::io::DuplexStream>,
    JoinHandle<fcgi_host::Result<()>>,
) {
    connect_with_capacity(server, 1 << 20)
}

/// Like [`connect`], with `capacity` bytes of buffering per direction.
/// A small capacity makes the server block on writes until the client reads.
pub fn connect_with_capacity(
    server: &Server,
    capacity: usize,
) -> (
    Client<tokio::io::DuplexStream>,
    JoinHandle<fcgi_host::Result<()>>,
) {
    let (client, stream) = tokio::io::duplex(capacity);
    let server = server.clone();
    let task = tokio::spawn(async move { server.serve_connection(stream).await });
    (Client::new(client), task)
}

/// Poll `check` until it holds or the timeout expires.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
