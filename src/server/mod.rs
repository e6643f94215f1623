//! Server: connection registry, admission control and the accept loop.
//!
//! Admission happens at two points. The accept loop refuses sockets once
//! `max_connections` connections are live, and every `BeginRequest` reserves
//! one slot of the `max_requests` budget shared by all connections.

pub mod listener;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::buffer::{BufferPools, DEFAULT_BODY_REGION_SIZE};
use crate::error::{Error, Result};
use crate::fcgi::connection::{BoxedRead, ConnectionCore};
use crate::fcgi::responder::{Responder, ResponderFactory, ResponderRequest};
use crate::fcgi::writer::BoxedWrite;
use crate::protocol::{FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, RecordReader, RecordWriter, Role};

pub use listener::{ListenAddr, Listener};

/// Admission and resource settings of a [`Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub max_connections: usize,
    pub max_requests: usize,
    pub multiplex_connections: bool,
    /// Tear a connection down when no record arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Suggested size of pooled record body regions.
    pub body_region_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_requests: 1024,
            multiplex_connections: false,
            idle_timeout: None,
            body_region_size: DEFAULT_BODY_REGION_SIZE,
        }
    }
}

/// State shared by the server handle, the accept loop and every connection.
pub(crate) struct ServerShared {
    max_connections: AtomicUsize,
    max_requests: AtomicUsize,
    multiplex: AtomicBool,
    idle_timeout: Option<Duration>,
    active_requests: AtomicUsize,
    connections: Mutex<HashMap<u64, Arc<ConnectionCore>>>,
    next_connection_id: AtomicU64,
    pools: BufferPools,
    factory: ResponderFactory,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerShared {
    pub(crate) fn multiplex(&self) -> bool {
        self.multiplex.load(Ordering::Acquire)
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Only the Responder role has an application behind it.
    pub(crate) fn supports_role(&self, role: Role) -> bool {
        role == Role::Responder
    }

    /// Reserve one slot of the global request budget.
    pub(crate) fn try_admit_request(&self) -> bool {
        let limit = self.max_requests.load(Ordering::Acquire);
        self.active_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_request(&self) {
        let _ = self
            .active_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| active.checked_sub(1));
    }

    pub(crate) fn create_responder(&self, request: &ResponderRequest) -> Box<dyn Responder> {
        (self.factory)(request)
    }

    fn register(&self, connection: Arc<ConnectionCore>) -> Result<()> {
        let mut connections = self.connections.lock();

        if *self.shutdown.borrow() {
            return Err(Error::State("server is stopping"));
        }

        let limit = self.max_connections.load(Ordering::Acquire);
        if connections.len() >= limit {
            return Err(Error::ConnectionLimit(limit));
        }

        connections.insert(connection.id(), connection);
        Ok(())
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    /// Answer a management query. Unknown names and repeats are dropped.
    pub(crate) fn get_values<'a, I>(&self, names: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut values: Vec<(String, String)> = Vec::new();

        for name in names {
            if values.iter().any(|(known, _)| known == name) {
                continue;
            }

            let value = match name {
                FCGI_MAX_CONNS => self.max_connections.load(Ordering::Acquire).to_string(),
                FCGI_MAX_REQS => self.max_requests.load(Ordering::Acquire).to_string(),
                FCGI_MPXS_CONNS => String::from(if self.multiplex() { "1" } else { "0" }),
                _ => {
                    tracing::debug!(name, "unknown management variable ignored");
                    continue;
                }
            };
            values.push((name.to_string(), value));
        }

        values
    }
}

/// A FastCGI application server.
///
/// Cheap to clone; every clone drives the same connection set.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server. `factory` builds one [`Responder`] per ready request.
    pub fn new<F>(settings: ServerSettings, factory: F) -> Result<Self>
    where
        F: Fn(&ResponderRequest) -> Box<dyn Responder> + Send + Sync + 'static,
    {
        if settings.max_connections < 1 {
            return Err(Error::InvalidSetting("max_connections must be at least 1"));
        }
        if settings.max_requests < 1 {
            return Err(Error::InvalidSetting("max_requests must be at least 1"));
        }
        if settings.body_region_size < 1 {
            return Err(Error::InvalidSetting("body_region_size must be at least 1"));
        }

        let (shutdown, _) = watch::channel(false);
        let shared = ServerShared {
            max_connections: AtomicUsize::new(settings.max_connections),
            max_requests: AtomicUsize::new(settings.max_requests),
            multiplex: AtomicBool::new(settings.multiplex_connections),
            idle_timeout: settings.idle_timeout,
            active_requests: AtomicUsize::new(0),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            pools: BufferPools::new(settings.body_region_size),
            factory: Arc::new(factory),
            shutdown,
            started: AtomicBool::new(false),
            accept_task: Mutex::new(None),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections.load(Ordering::Acquire)
    }

    pub fn set_max_connections(&self, value: usize) -> Result<()> {
        if value < 1 {
            return Err(Error::InvalidSetting("max_connections must be at least 1"));
        }
        self.shared.max_connections.store(value, Ordering::Release);
        Ok(())
    }

    pub fn max_requests(&self) -> usize {
        self.shared.max_requests.load(Ordering::Acquire)
    }

    pub fn set_max_requests(&self, value: usize) -> Result<()> {
        if value < 1 {
            return Err(Error::InvalidSetting("max_requests must be at least 1"));
        }
        self.shared.max_requests.store(value, Ordering::Release);
        Ok(())
    }

    pub fn multiplex_connections(&self) -> bool {
        self.shared.multiplex()
    }

    pub fn set_multiplex_connections(&self, value: bool) {
        self.shared.multiplex.store(value, Ordering::Release);
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Requests admitted and not yet completed, across all connections.
    pub fn request_count(&self) -> usize {
        self.shared.active_requests.load(Ordering::Acquire)
    }

    pub fn can_accept(&self) -> bool {
        self.connection_count() < self.max_connections()
    }

    pub fn can_request(&self) -> bool {
        self.request_count() < self.max_requests()
    }

    /// Values for the requested management variables, in request order.
    pub fn get_values<'a, I>(&self, names: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.shared.get_values(names)
    }

    /// Buffer pools shared by every connection of this server.
    pub fn pools(&self) -> &BufferPools {
        &self.shared.pools
    }

    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::Acquire) && !*self.shared.shutdown.borrow()
    }

    /// Serve one already-accepted stream until the connection closes.
    ///
    /// Fails with [`Error::ConnectionLimit`] when the server is full; the
    /// stream is dropped without a reply in that case.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: BoxedRead = Box::new(read_half);
        let write_half: BoxedWrite = Box::new(write_half);

        let id = self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let reader = RecordReader::new(read_half, self.shared.pools.claim_triple());
        let writer = RecordWriter::new(write_half, self.shared.pools.claim_triple());
        let connection = Arc::new(ConnectionCore::new(id, Arc::clone(&self.shared), writer));

        self.shared.register(Arc::clone(&connection))?;

        connection
            .run(reader)
            .instrument(tracing::info_span!("connection", connection = id))
            .await
    }

    /// Start accepting connections on `listener` in a background task.
    pub fn start(&self, listener: Listener) -> Result<()> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(Error::State("server already started"));
        }

        let server = self.clone();
        let shutdown = self.shared.shutdown.subscribe();
        let task = tokio::spawn(async move {
            if let Err(e) = listener::run(server, listener, shutdown).await {
                tracing::error!("Accept loop failed: {}", e);
            }
        });

        *self.shared.accept_task.lock() = Some(task);
        Ok(())
    }

    /// Close the listener, wait for the accept loop, then force-end every
    /// live connection. Active requests get `EndRequest(-1)`.
    pub async fn stop(&self) {
        self.shared.shutdown.send_replace(true);

        let task = self.shared.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "accept loop panicked");
            }
        }

        let connections: Vec<Arc<ConnectionCore>> =
            self.shared.connections.lock().values().cloned().collect();
        tracing::info!(connections = connections.len(), "stopping connections");

        for connection in connections {
            connection.stop().await;
        }
    }
}
