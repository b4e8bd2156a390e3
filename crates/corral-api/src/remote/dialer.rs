//! Low-level connection dialers
//!
//! A cluster is reached either directly over TCP or, when its agent holds a
//! reverse connection open, through a tunnel the agent serves. The
//! [`DialerFactory`] picks one per cluster when the proxy handle is built.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Byte stream a dialer hands back
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Boxed [`Io`]
pub type BoxedIo = Box<dyn Io>;

/// Opens connections to a cluster's API endpoint
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `host:port`
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedIo>;
}

/// Dials the endpoint directly over TCP
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedIo> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Size of the in-memory pipe backing one tunneled connection
const TUNNEL_BUFFER: usize = 64 * 1024;

/// Reverse-connection sessions registered by cluster agents
///
/// Each session is a channel of stream halves: opening a tunneled
/// connection sends one half of a fresh pipe to the agent side, which
/// bridges it to the cluster, and returns the other half to the caller.
#[derive(Default)]
pub struct TunnelRegistry {
    sessions: DashMap<String, mpsc::Sender<DuplexStream>>,
}

impl TunnelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the session for `cluster_id`, replacing any previous one
    ///
    /// The agent side reads new connections from the returned receiver.
    pub fn register(&self, cluster_id: &str, backlog: usize) -> mpsc::Receiver<DuplexStream> {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        if self.sessions.insert(cluster_id.to_string(), tx).is_some() {
            info!(cluster = %cluster_id, "Tunnel session replaced");
        } else {
            info!(cluster = %cluster_id, "Tunnel session registered");
        }
        rx
    }

    /// Drop the session for `cluster_id`
    pub fn unregister(&self, cluster_id: &str) {
        if self.sessions.remove(cluster_id).is_some() {
            info!(cluster = %cluster_id, "Tunnel session removed");
        }
    }

    /// Whether a live session exists for `cluster_id`
    pub fn is_connected(&self, cluster_id: &str) -> bool {
        self.sessions
            .get(cluster_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Open a tunneled connection to `cluster_id`
    pub async fn open(&self, cluster_id: &str) -> io::Result<DuplexStream> {
        let tx = self
            .sessions
            .get(cluster_id)
            .map(|tx| tx.clone())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("no tunnel session for cluster {cluster_id}"),
                )
            })?;

        let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER);
        tx.send(remote).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("tunnel session for cluster {cluster_id} closed"),
            )
        })?;
        debug!(cluster = %cluster_id, "Opened tunneled connection");
        Ok(local)
    }
}

/// Dials through a cluster's reverse tunnel
///
/// The host and port are carried in the proxied request; the tunnel itself
/// always terminates at the cluster's API server.
pub struct TunnelDialer {
    cluster_id: String,
    registry: Arc<TunnelRegistry>,
}

impl TunnelDialer {
    /// Dialer for `cluster_id` over `registry`
    pub fn new(cluster_id: impl Into<String>, registry: Arc<TunnelRegistry>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            registry,
        }
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<BoxedIo> {
        let stream = self.registry.open(&self.cluster_id).await?;
        Ok(Box::new(stream))
    }
}

/// Maps a cluster ID to the dialer used to reach it
pub trait DialerFactory: Send + Sync {
    /// Dialer for `cluster_id`
    fn dialer_for(&self, cluster_id: &str) -> Arc<dyn Dialer>;
}

/// Tunnels when the cluster's agent is connected, dials directly otherwise
pub struct DefaultDialerFactory {
    tunnels: Arc<TunnelRegistry>,
}

impl DefaultDialerFactory {
    /// Create a factory over `tunnels`
    pub fn new(tunnels: Arc<TunnelRegistry>) -> Self {
        Self { tunnels }
    }
}

impl DialerFactory for DefaultDialerFactory {
    fn dialer_for(&self, cluster_id: &str) -> Arc<dyn Dialer> {
        if self.tunnels.is_connected(cluster_id) {
            debug!(cluster = %cluster_id, "Using tunnel dialer");
            Arc::new(TunnelDialer::new(cluster_id, self.tunnels.clone()))
        } else {
            Arc::new(DirectDialer)
        }
    }
}
