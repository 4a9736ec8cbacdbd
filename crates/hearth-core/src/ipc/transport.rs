//! Byte-stream transports: local pipes and TCP sockets.
//!
//! On Unix a pipe is a Unix domain socket; on Windows it is a named pipe.
//! Both sides see the connection as a type-erased [`IpcStream`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::IpcConfig;
use crate::error::HearthError;
use crate::Result;

/// Which end of the connection a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Binds the address and accepts exactly one peer.
    Server,
    /// Connects to the address, retrying until the server is up.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Pipe,
    Network,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Pipe => f.write_str("pipe"),
            TransportKind::Network => f.write_str("network"),
        }
    }
}

/// Bidirectional stream object shared by every transport.
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn IpcStream>;

/// Resolve a pipe name to the platform endpoint.
///
/// Names containing a path separator are used as-is; bare names are placed in
/// the temp directory (Unix) or the `\\.\pipe\` namespace (Windows).
pub fn pipe_path(name: &str) -> PathBuf {
    if cfg!(windows) {
        if name.starts_with(r"\\") {
            PathBuf::from(name)
        } else {
            PathBuf::from(format!(
                r"\\.\pipe\{}{}",
                IpcConfig::PIPE_NAME_PREFIX,
                name
            ))
        }
    } else if name.contains('/') {
        PathBuf::from(name)
    } else {
        std::env::temp_dir().join(format!("{}{}.sock", IpcConfig::PIPE_NAME_PREFIX, name))
    }
}

/// A bound server endpoint waiting for its single peer.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
    #[cfg(windows)]
    NamedPipe {
        server: tokio::net::windows::named_pipe::NamedPipeServer,
        path: PathBuf,
    },
}

impl Listener {
    /// Bind synchronously so the address is known before the accept starts.
    ///
    /// Must run inside a tokio runtime context.
    pub fn bind(kind: TransportKind, address: &str) -> Result<Self> {
        match kind {
            TransportKind::Network => {
                let listener = std::net::TcpListener::bind(address)?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Tcp(TcpListener::from_std(listener)?))
            }
            TransportKind::Pipe => Self::bind_pipe(address),
        }
    }

    #[cfg(unix)]
    fn bind_pipe(address: &str) -> Result<Self> {
        let path = pipe_path(address);
        // A socket file left behind by a crashed server blocks the bind.
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Listener::Unix { listener, path })
    }

    #[cfg(windows)]
    fn bind_pipe(address: &str) -> Result<Self> {
        let path = pipe_path(address);
        let server = tokio::net::windows::named_pipe::ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)?;
        Ok(Listener::NamedPipe { server, path })
    }

    #[cfg(not(any(unix, windows)))]
    fn bind_pipe(_address: &str) -> Result<Self> {
        Err(HearthError::Config {
            message: "pipe transport is not supported on this platform".to_string(),
        })
    }

    /// The address peers should connect to.
    pub fn local_address(&self) -> Result<String> {
        match self {
            Listener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(path.display().to_string()),
            #[cfg(windows)]
            Listener::NamedPipe { path, .. } => Ok(path.display().to_string()),
        }
    }

    /// Wait for the peer. Consumes the listener so no second peer is accepted.
    pub async fn accept(self) -> Result<BoxedStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!("Accepted TCP peer {}", peer);
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                debug!("Accepted pipe peer on {}", path.display());
                // The endpoint is no longer needed once the peer is connected.
                let _ = std::fs::remove_file(&path);
                Ok(Box::new(stream))
            }
            #[cfg(windows)]
            Listener::NamedPipe { server, path } => {
                server.connect().await?;
                debug!("Accepted pipe peer on {}", path.display());
                Ok(Box::new(server))
            }
        }
    }
}

/// Single client connection attempt.
pub async fn connect(kind: TransportKind, address: &str) -> Result<BoxedStream> {
    match kind {
        TransportKind::Network => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        TransportKind::Pipe => connect_pipe(address).await,
    }
}

#[cfg(unix)]
async fn connect_pipe(address: &str) -> Result<BoxedStream> {
    let stream = tokio::net::UnixStream::connect(pipe_path(address)).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
async fn connect_pipe(address: &str) -> Result<BoxedStream> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(pipe_path(address))?;
    Ok(Box::new(client))
}

#[cfg(not(any(unix, windows)))]
async fn connect_pipe(_address: &str) -> Result<BoxedStream> {
    Err(HearthError::Config {
        message: "pipe transport is not supported on this platform".to_string(),
    })
}

impl std::str::FromStr for TransportKind {
    type Err = HearthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pipe" => Ok(TransportKind::Pipe),
            "network" | "tcp" => Ok(TransportKind::Network),
            other => Err(HearthError::Config {
                message: format!("unknown transport '{other}', expected pipe or network"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_pipe_name_goes_to_temp_dir() {
        let path = pipe_path("engine");
        if cfg!(unix) {
            assert_eq!(path, std::env::temp_dir().join("hearth-engine.sock"));
        }
    }

    #[test]
    fn test_pipe_path_is_kept() {
        if cfg!(unix) {
            assert_eq!(pipe_path("/tmp/x.sock"), PathBuf::from("/tmp/x.sock"));
        }
    }

    #[test]
    fn test_transport_kind_parses() {
        assert_eq!("pipe".parse::<TransportKind>().unwrap(), TransportKind::Pipe);
        assert_eq!("tcp".parse::<TransportKind>().unwrap(), TransportKind::Network);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[tokio::test]
    async fn test_tcp_listener_reports_assigned_port() {
        let listener = Listener::bind(TransportKind::Network, "127.0.0.1:0").unwrap();
        let address = listener.local_address().unwrap();
        assert!(!address.ends_with(":0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_pipe_connects() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("link.sock").display().to_string();
        let listener = Listener::bind(TransportKind::Pipe, &name).unwrap();

        let accept = tokio::spawn(listener.accept());
        let mut client = connect(TransportKind::Pipe, &name).await.unwrap();
        let mut server = accept.await.unwrap().unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
