//! Byte-stream transport plumbing for the socket backend.
//!
//! Supports:
//! - TCP: Standard network transport (default)
//! - UDS: Unix Domain Sockets for local IPC

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::info;

/// Transport type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// TCP transport (network).
    #[default]
    Tcp,
    /// Unix Domain Socket transport (local IPC).
    Uds,
}

/// Listener configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Transport type discriminator.
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    /// TCP-specific configuration.
    pub tcp: TcpConfig,
    /// UDS-specific configuration.
    pub uds: UdsConfig,
}

impl ListenerConfig {
    /// TCP listener on `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport_type: TransportType::Tcp,
            tcp: TcpConfig {
                host: host.into(),
                port,
            },
            uds: UdsConfig::default(),
        }
    }

    /// UDS listener at `base_path/<socket_name>.sock`.
    pub fn uds(base_path: impl Into<PathBuf>) -> Self {
        Self {
            transport_type: TransportType::Uds,
            tcp: TcpConfig::default(),
            uds: UdsConfig {
                base_path: base_path.into(),
                ..Default::default()
            },
        }
    }
}

/// TCP transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to. Zero picks an ephemeral port.
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5400,
        }
    }
}

impl TcpConfig {
    /// Get the socket address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// UDS transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UdsConfig {
    /// Base path for socket files.
    pub base_path: PathBuf,
    /// Socket file name without extension.
    pub socket_name: String,
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/tmp/commgr"),
            socket_name: "commgr".to_string(),
        }
    }
}

impl UdsConfig {
    /// Get the socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.base_path.join(format!("{}.sock", self.socket_name))
    }
}

/// RAII guard for cleaning up UDS socket files.
pub struct UdsCleanupGuard {
    path: PathBuf,
}

impl UdsCleanupGuard {
    /// Create a new cleanup guard for the given socket path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UdsCleanupGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up UDS socket"
                );
            } else {
                tracing::debug!(
                    path = %self.path.display(),
                    "Cleaned up UDS socket"
                );
            }
        }
    }
}

/// Prepare a UDS socket path for binding.
///
/// - Creates parent directories if needed
/// - Removes stale socket file if exists
/// - Returns a cleanup guard that removes the socket on drop
pub fn prepare_uds_socket(path: &Path) -> io::Result<UdsCleanupGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        info!(path = %path.display(), "Removing stale UDS socket");
        std::fs::remove_file(path)?;
    }

    Ok(UdsCleanupGuard::new(path))
}

/// Any duplex byte stream a client can be bound to.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An established byte-stream connection.
pub struct Connection {
    pub stream: Box<dyn AsyncStream>,
    /// Peer address for logs.
    pub peer: String,
    /// Peer process id, when the transport exposes credentials.
    pub pid: Option<u32>,
}

fn uds_peer_pid(stream: &UnixStream) -> Option<u32> {
    stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .and_then(|pid| u32::try_from(pid).ok())
}

/// Bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    Uds {
        listener: UnixListener,
        guard: UdsCleanupGuard,
    },
}

impl Listener {
    /// Bind the configured listener.
    pub async fn bind(config: &ListenerConfig) -> io::Result<Self> {
        match config.transport_type {
            TransportType::Tcp => {
                let listener = TcpListener::bind(config.tcp.addr()).await?;
                info!(
                    address = %listener.local_addr()?,
                    transport = "tcp",
                    "Listening"
                );
                Ok(Self::Tcp(listener))
            }
            TransportType::Uds => {
                let path = config.uds.socket_path();
                let guard = prepare_uds_socket(&path)?;
                let listener = UnixListener::bind(&path)?;
                info!(path = %path.display(), transport = "uds", "Listening");
                Ok(Self::Uds {
                    listener,
                    guard,
                })
            }
        }
    }

    /// Address peers can pass to `connect_to_address`.
    pub fn local_address(&self) -> io::Result<String> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            Self::Uds { guard, .. } => Ok(guard.path().display().to_string()),
        }
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Connection {
                    stream: Box::new(stream),
                    peer: addr.to_string(),
                    pid: None,
                })
            }
            Self::Uds { listener, guard } => {
                let (stream, _) = listener.accept().await?;
                let pid = uds_peer_pid(&stream);
                Ok(Connection {
                    stream: Box::new(stream),
                    peer: guard.path().display().to_string(),
                    pid,
                })
            }
        }
    }
}

/// Check if an address is a UDS path.
pub fn is_uds_address(address: &str) -> bool {
    address.starts_with('/') || address.starts_with("./")
}

/// Connect to a peer by address.
///
/// Paths starting with `/` or `./` are Unix domain sockets; everything
/// else is a TCP `host:port`.
pub async fn connect_to_address(address: &str) -> io::Result<Connection> {
    if is_uds_address(address) {
        info!(path = %address, transport = "uds", "Connecting");
        let stream = UnixStream::connect(address).await?;
        let pid = uds_peer_pid(&stream);
        Ok(Connection {
            stream: Box::new(stream),
            peer: address.to_string(),
            pid,
        })
    } else {
        info!(address = %address, transport = "tcp", "Connecting");
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        Ok(Connection {
            stream: Box::new(stream),
            peer,
            pid: None,
        })
    }
}
