use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

use anyhow::{Context, bail};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::info;

use super::Server;

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port`
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl ListenAddr {
    /// Parse `tcp://host:port`, `unix:///path/to/socket` or a bare `host:port`.
    pub fn parse(addr: &str) -> anyhow::Result<Self> {
        if !addr.contains("://") {
            return Ok(ListenAddr::Tcp(addr.to_string()));
        }

        let url = url::Url::parse(addr).with_context(|| format!("invalid listen address {addr:?}"))?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .with_context(|| format!("listen address {addr:?} has no host"))?;
                let port = url
                    .port()
                    .with_context(|| format!("listen address {addr:?} has no port"))?;
                Ok(ListenAddr::Tcp(format!("{host}:{port}")))
            }
            #[cfg(unix)]
            "unix" => {
                if url.path().is_empty() || url.path() == "/" {
                    bail!("listen address {addr:?} has no socket path");
                }
                Ok(ListenAddr::Unix(PathBuf::from(url.path())))
            }
            other => bail!("unsupported listen scheme {other:?}"),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Listener {
    /// Bind `addr`. A stale Unix socket file at the path is removed first.
    pub async fn bind(addr: &ListenAddr) -> anyhow::Result<Self> {
        let listener = match addr {
            ListenAddr::Tcp(host) => Listener::Tcp(
                TcpListener::bind(host)
                    .await
                    .with_context(|| format!("cannot bind {addr}"))?,
            ),
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)
                        .with_context(|| format!("cannot remove stale socket {}", path.display()))?;
                }
                Listener::Unix {
                    listener: UnixListener::bind(path).with_context(|| format!("cannot bind {addr}"))?,
                    path: path.clone(),
                }
            }
        };

        info!("Listening on {}", addr);
        Ok(listener)
    }

    /// Bound TCP address; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }

    async fn accept(&self) -> std::io::Result<(Accepted, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Accepted::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Accepted::Unix(stream), path.display().to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Accept loop. Runs until `shutdown` flips to `true`; the listener is
/// dropped on return.
pub(crate) async fn run(
    server: Server,
    listener: Listener,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => res,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        if !server.can_accept() {
            tracing::warn!(
                peer = %peer,
                limit = server.max_connections(),
                "Connection limit reached, refusing connection"
            );
            continue;
        }

        info!("Accepted connection from {}", peer);

        let server = server.clone();
        tokio::spawn(async move {
            let result = match stream {
                Accepted::Tcp(stream) => server.serve_connection(stream).await,
                #[cfg(unix)]
                Accepted::Unix(stream) => server.serve_connection(stream).await,
            };
            if let Err(e) = result {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }

    info!("Listener closed");
    Ok(())
}
