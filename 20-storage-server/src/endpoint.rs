use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info};

/// Where the server listens and clients connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

/// A connected byte stream of either flavour.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type Stream = Box<dyn Connection>;

impl Endpoint {
    pub fn loopback(port: u16) -> Self {
        Endpoint::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    /// Binds a listener, deleting a socket file left behind by an earlier run.
    pub async fn bind(&self) -> io::Result<Listener> {
        match self {
            Endpoint::Unix(path) => bind_unix(path).await,
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    pub async fn connect(&self) -> io::Result<Stream> {
        match self {
            Endpoint::Unix(path) => connect_unix(path).await,
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[cfg(unix)]
async fn bind_unix(path: &std::path::Path) -> io::Result<Listener> {
    if tokio::fs::try_exists(path).await? {
        info!(path = %path.display(), "deleting stale socket file");
        tokio::fs::remove_file(path).await?;
    }
    let listener = tokio::net::UnixListener::bind(path)?;
    Ok(Listener::Unix {
        listener,
        path: path.to_path_buf(),
    })
}

#[cfg(not(unix))]
async fn bind_unix(path: &std::path::Path) -> io::Result<Listener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets unavailable for {}", path.display()),
    ))
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> io::Result<Stream> {
    Ok(Box::new(tokio::net::UnixStream::connect(path).await?))
}

#[cfg(not(unix))]
async fn connect_unix(path: &std::path::Path) -> io::Result<Stream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets unavailable for {}", path.display()),
    ))
}

/// Bound listening socket. Call [`Listener::close`] to remove the socket file.
pub enum Listener {
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
    Tcp(TcpListener),
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted tcp client");
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// The endpoint clients should use, with any ephemeral port resolved.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
        }
    }

    pub fn close(self) {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                drop(listener);
                if path.exists() {
                    info!(path = %path.display(), "deleting socket file");
                    if let Err(error) = std::fs::remove_file(&path) {
                        tracing::warn!(?error, "failed to delete socket file");
                    }
                }
            }
            Listener::Tcp(listener) => drop(listener),
        }
    }
}
