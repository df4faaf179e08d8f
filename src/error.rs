//! Error types for sessions, device commands, output parsing and fleet runs.
//!
//! Errors are layered the same way the crate is: transports report
//! [`TransportError`], sessions classify those into [`SessionError`], the
//! protocol layer adds device-reported failures in [`DeviceError`].

use thiserror::Error;

/// Errors raised by the session layer.
///
/// These are always returned to the immediate caller and also recorded on the
/// session so an observer can inspect the last failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The endpoint could not be reached or the SSH handshake failed.
    ///
    /// Covers name resolution failures, timeouts, refused or reset connections.
    #[error("connect error: {0}")]
    Connect(String),

    /// The device rejected the supplied credentials.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The connection failed while routed through a jump host.
    ///
    /// Reported separately from [`SessionError::Connect`] so callers can tell a
    /// dead target from a dead jump host.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// A command could not be executed: not connected, channel failure or timeout.
    ///
    /// The device never got to report anything itself.
    #[error("execution error: {0}")]
    Execution(String),
}

/// Failures reported by a [`crate::session::Transport`] or
/// [`crate::session::Connector`] implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// TCP connect, name resolution or SSH handshake failure.
    #[error("{0}")]
    Connect(String),

    /// Credentials were rejected.
    #[error("{0}")]
    Authentication(String),

    /// The jump host could not open a tunnel to the target.
    #[error("tunnel: {0}")]
    Tunnel(String),

    /// A channel could not be opened or broke while in use.
    #[error("channel: {0}")]
    Channel(String),

    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// The operation did not finish in time.
    #[error("timeout")]
    Timeout,

    /// SFTP subsystem failure.
    #[error("sftp: {0}")]
    Sftp(String),

    /// Local or remote I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),
}

impl From<async_ssh2_tokio::Error> for TransportError {
    fn from(err: async_ssh2_tokio::Error) -> Self {
        use async_ssh2_tokio::Error as E;
        let message = err.to_string();
        match err {
            E::PasswordWrong | E::KeyAuthFailed => TransportError::Authentication(message),
            E::SshError(inner) => TransportError::Russh(inner),
            _ => TransportError::Connect(message),
        }
    }
}

impl From<russh_sftp::client::error::Error> for TransportError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        TransportError::Sftp(err.to_string())
    }
}

/// Errors raised by the protocol layer on top of a session.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The session could not run the command at all.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The device accepted the command but reported an error in its output.
    #[error("command error: {0}")]
    Command(String),

    /// Structured output could not be converted into nested maps.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Errors raised while converting an XML reply into nested maps.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The text is not well-formed XML.
    #[error("xml parse error: {0}")]
    Xml(String),

    /// Two siblings share a tag and neither carries an index child.
    #[error("duplicated value for tag: {0}")]
    DuplicateTag(String),

    /// Two siblings share a tag and the same index text.
    #[error("duplicated value for tag: {path} index: {index}")]
    DuplicateIndex { path: String, index: String },

    /// Some repetitions of a tag carry the index child and others do not.
    #[error("inconsistent index for tag: {path} (expected index `{index_tag}`)")]
    InconsistentIndex { path: String, index_tag: String },

    /// The index child exists but has no text.
    #[error("wrong value for tag: {path} index: <empty>")]
    EmptyIndex { path: String },
}

impl From<roxmltree::Error> for ParseError {
    fn from(err: roxmltree::Error) -> Self {
        ParseError::Xml(err.to_string())
    }
}

/// Errors raised while assembling a fleet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    /// A device with the same id is already part of the fleet.
    #[error("duplicate device with id {0}")]
    DuplicateDevice(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_render_their_class() {
        assert_eq!(
            SessionError::Proxy("jump host down".into()).to_string(),
            "proxy error: jump host down"
        );
        assert_eq!(
            SessionError::Execution("not connected".into()).to_string(),
            "execution error: not connected"
        );
    }

    #[test]
    fn device_error_is_transparent_over_session_error() {
        let err = DeviceError::from(SessionError::Connect("refused".into()));
        assert_eq!(err.to_string(), "connect error: refused");
    }

    #[test]
    fn async_ssh2_password_failure_maps_to_authentication() {
        let err = TransportError::from(async_ssh2_tokio::Error::PasswordWrong);
        assert!(matches!(err, TransportError::Authentication(_)));
    }
}
