//! SSH implementation of the transport seam.
//!
//! Direct connections go through async-ssh2-tokio. Connections behind a jump
//! host are carried by a `direct-tcpip` channel of the jump host's transport
//! with a plain russh handshake on top, since async-ssh2-tokio only dials TCP.

use std::sync::Arc;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_trait::async_trait;
use log::debug;
use russh::client::{Handle, Handler, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;

use super::security::ConnectionSecurityOptions;
use super::transport::{
    ChannelEvent, Connector, ExecChannel, RemoteEntry, RemoteFs, Target, Transport, TunnelIo,
};
use super::Credentials;

/// SSH stderr extended data type.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Connects over SSH with password authentication.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    security: ConnectionSecurityOptions,
    keepalive: Option<Duration>,
}

impl SshConnector {
    pub fn new(security: ConnectionSecurityOptions, keepalive: Option<Duration>) -> Self {
        Self {
            security,
            keepalive,
        }
    }

    async fn connect_direct(
        &self,
        target: &Target,
        credentials: &Credentials,
    ) -> Result<SshTransport, TransportError> {
        let password = credentials.password.clone().unwrap_or_default();
        let client = Client::connect_with_config(
            (target.host.clone(), target.port),
            &credentials.user,
            AuthMethod::with_password(&password),
            self.security.server_check.clone(),
            self.security.client_config(self.keepalive),
        )
        .await?;
        debug!("{}@{} TCP connection successful", credentials.user, target);
        Ok(SshTransport {
            link: SshLink::Direct(client),
        })
    }

    async fn connect_tunneled(
        &self,
        target: &Target,
        credentials: &Credentials,
        via: Arc<dyn Transport>,
    ) -> Result<SshTransport, TransportError> {
        let stream = via
            .open_tunnel(target)
            .await
            .map_err(|err| TransportError::Tunnel(format!("{target}: {err}")))?;
        debug!("{}@{} tunnel open", credentials.user, target);

        let handler = TunnelHandler {
            host: target.host.clone(),
            port: target.port,
            security: self.security.clone(),
        };
        let config = self.security.shared_client_config(self.keepalive);
        let mut handle = russh::client::connect_stream(config, stream, handler)
            .await
            .map_err(|err| TransportError::Tunnel(format!("{target}: {err}")))?;

        let accepted = match &credentials.password {
            Some(password) => handle
                .authenticate_password(credentials.user.as_str(), password.as_str())
                .await?
                .success(),
            None => handle
                .authenticate_none(credentials.user.as_str())
                .await?
                .success(),
        };
        if !accepted {
            return Err(TransportError::Authentication(format!(
                "{}@{target}: password rejected",
                credentials.user
            )));
        }
        debug!("{}@{} authenticated over tunnel", credentials.user, target);
        Ok(SshTransport {
            link: SshLink::Tunneled(handle),
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &Target,
        credentials: &Credentials,
        via: Option<Arc<dyn Transport>>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = match via {
            None => self.connect_direct(target, credentials).await?,
            Some(via) => self.connect_tunneled(target, credentials, via).await?,
        };
        Ok(Arc::new(transport))
    }
}

/// Host key verification for handshakes made over a tunnel.
struct TunnelHandler {
    host: String,
    port: u16,
    security: ConnectionSecurityOptions,
}

impl Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self
            .security
            .accepts_server_key(&self.host, self.port, server_public_key))
    }
}

enum SshLink {
    Direct(Client),
    Tunneled(Handle<TunnelHandler>),
}

struct SshTransport {
    link: SshLink,
}

impl SshTransport {
    async fn session_channel(&self) -> Result<Channel<Msg>, TransportError> {
        match &self.link {
            SshLink::Direct(client) => Ok(client.get_channel().await?),
            SshLink::Tunneled(handle) => Ok(handle.channel_open_session().await?),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError> {
        let channel = self.session_channel().await?;
        channel.exec(true, command).await?;
        Ok(Box::new(SshExecChannel {
            channel,
            eof: false,
            exit_status: false,
            finished: false,
        }))
    }

    async fn open_tunnel(&self, target: &Target) -> Result<Box<dyn TunnelIo>, TransportError> {
        let channel = match &self.link {
            SshLink::Direct(client) => {
                client
                    .open_direct_tcpip_channel((target.host.as_str(), target.port), None)
                    .await?
            }
            SshLink::Tunneled(handle) => {
                handle
                    .channel_open_direct_tcpip(
                        target.host.as_str(),
                        u32::from(target.port),
                        "127.0.0.1",
                        0,
                    )
                    .await?
            }
        };
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_fs(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
        let channel = self.session_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(Box::new(SftpFs { sftp }))
    }

    fn is_closed(&self) -> bool {
        match &self.link {
            SshLink::Direct(client) => client.is_closed(),
            SshLink::Tunneled(handle) => handle.is_closed(),
        }
    }

    async fn close(&self) {
        let result = match &self.link {
            SshLink::Direct(client) => client.disconnect().await.map_err(TransportError::from),
            SshLink::Tunneled(handle) => handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(TransportError::from),
        };
        if let Err(err) = result {
            debug!("Failed to close SSH connection: {err}");
        }
    }
}

struct SshExecChannel {
    channel: Channel<Msg>,
    eof: bool,
    exit_status: bool,
    finished: bool,
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ChannelEvent, TransportError>> {
        if self.finished {
            return None;
        }
        // The exit status may arrive after EOF, so EOF alone does not end the stream.
        loop {
            let Some(message) = self.channel.wait().await else {
                self.finished = true;
                // Losing the channel after EOF and exit status is a missing Close.
                if self.eof && self.exit_status {
                    return None;
                }
                return Some(Err(TransportError::Closed));
            };
            match message {
                ChannelMsg::Data { data } => {
                    return Some(Ok(ChannelEvent::Stdout(data.to_vec())));
                }
                ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    return Some(Ok(ChannelEvent::Stderr(data.to_vec())));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    self.exit_status = true;
                    return Some(Ok(ChannelEvent::ExitStatus(exit_status)));
                }
                ChannelMsg::Eof => self.eof = true,
                ChannelMsg::Close => {
                    self.finished = true;
                    return None;
                }
                _ => {}
            }
        }
    }
}

struct SftpFs {
    sftp: SftpSession,
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError> {
        let metadata = self.sftp.metadata(path).await?;
        Ok(RemoteEntry {
            name: path.to_string(),
            is_dir: metadata.is_dir(),
            size: metadata.size.unwrap_or(0),
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let entries = self.sftp.read_dir(path).await?;
        Ok(entries
            .filter(|entry| entry.file_name() != "." && entry.file_name() != "..")
            .map(|entry| {
                let metadata = entry.metadata();
                RemoteEntry {
                    name: entry.file_name(),
                    is_dir: metadata.is_dir(),
                    size: metadata.size.unwrap_or(0),
                }
            })
            .collect())
    }

    async fn open_read(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError> {
        Ok(Box::new(self.sftp.open(path).await?))
    }

    async fn open_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError> {
        Ok(Box::new(self.sftp.create(path).await?))
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        if let Ok(metadata) = self.sftp.metadata(path).await
            && metadata.is_dir()
        {
            return Ok(());
        }
        self.sftp.create_dir(path).await?;
        Ok(())
    }
}
