//! Transport seam between sessions and the wire.
//!
//! A [`Connector`] turns a [`Target`] into a live [`Transport`], optionally
//! tunnelled through the transport of a jump host. Sessions only talk to these
//! traits; [`super::SshConnector`] is the SSH implementation and tests plug in
//! in-memory fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;

use super::Credentials;

/// Where a session connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or IP literal.
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One message read from an exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
}

/// A byte stream usable as the carrier of a nested SSH connection.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// An exclusive channel running one remote command.
#[async_trait]
pub trait ExecChannel: Send {
    /// Writes to the command's stdin.
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Next event, `None` once the command has finished and the channel is
    /// closed.
    ///
    /// A channel lost before that, such as a dropped connection, yields
    /// `Some(Err(TransportError::Closed))` rather than `None`, so partial
    /// output is never mistaken for a complete reply.
    async fn recv(&mut self) -> Option<Result<ChannelEvent, TransportError>>;
}

/// Metadata of a remote file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Base name for directory listings, full path for `stat`.
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Minimal remote filesystem used by the transfer layer.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError>;

    /// Lists a directory, without `.` and `..`.
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    async fn open_read(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError>;

    /// Creates or truncates a file for writing.
    async fn open_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError>;

    /// Creates a directory, succeeding if it already exists.
    async fn create_dir(&self, path: &str) -> Result<(), TransportError>;
}

/// A live, authenticated connection to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a channel and starts `command` on it.
    async fn open_exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError>;

    /// Opens a `direct-tcpip` style tunnel to `target` through this transport.
    async fn open_tunnel(&self, target: &Target) -> Result<Box<dyn TunnelIo>, TransportError>;

    /// Starts a file transfer subsystem.
    async fn open_fs(&self) -> Result<Box<dyn RemoteFs>, TransportError>;

    /// Whether the transport has been closed by either side.
    fn is_closed(&self) -> bool;

    /// Liveness probe run by the keepalive supervisor.
    async fn probe(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Closes the transport. Safe to call more than once.
    async fn close(&self);
}

/// Creates transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and authenticates to `target`.
    ///
    /// When `via` is given the connection is carried by a tunnel opened on that
    /// transport; failures before authentication should then be reported as
    /// [`TransportError::Tunnel`].
    async fn connect(
        &self,
        target: &Target,
        credentials: &Credentials,
        via: Option<Arc<dyn Transport>>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
