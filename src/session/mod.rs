//! Supervised SSH sessions to device endpoints.
//!
//! A [`Session`] owns at most one live [`Transport`] and drives it through the
//! connection state machine:
//!
//! ```text
//! DISCONNECTED -> WAITING_CONNECT -> CONNECTING -> CONNECTED
//!                                       |   ^
//!                                       v   |
//!                                 WAITING_RECONNECT
//! ```
//!
//! A connected session holds one slot of the connections pool for its whole
//! lifetime and is watched by a keepalive task; a failed probe tears it down
//! the same way a remote close does. Sessions routed through a jump host
//! borrow the proxy session's transport to open a tunnel and never own it.
//!
//! # Main Components
//!
//! - [`Session`] - state machine, command execution, request tracking
//! - [`SessionContext`] - pools, connector and defaults shared by a run
//! - [`Connector`] / [`Transport`] - the wire seam, see [`SshConnector`]
//! - [`Output`] - result of one command

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::{PoolLimits, SessionOptions};
use crate::error::{SessionError, TransportError};
use crate::pools::ResourcePools;

mod request;
mod security;
mod ssh;
mod transport;

use request::lock;
pub(crate) use request::{RequestGuard, RequestRegistry};
pub use request::{CmdRequest, FileRequest, Request};
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use ssh::SshConnector;
pub use transport::{
    ChannelEvent, Connector, ExecChannel, RemoteEntry, RemoteFs, Target, Transport, TunnelIo,
};

/// Login credentials of a device.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    /// Password of the device's root account, used by privileged shell commands.
    pub root_password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Some(password.into()),
            root_password: None,
        }
    }

    pub fn with_root_password(mut self, root_password: impl Into<String>) -> Self {
        self.root_password = Some(root_password.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .field("root_password", &redact(&self.root_password))
            .finish()
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    /// Waiting for a slot in the connections pool.
    WaitingConnect,
    Connecting,
    Connected,
    /// Pausing between two connect attempts.
    WaitingReconnect,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::WaitingConnect => "WAITING_CONNECT",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::WaitingReconnect => "WAITING_RECONNECT",
        };
        f.write_str(name)
    }
}

/// Retry policy of one [`Session::connect_with`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Handshake attempts, at least one is always made.
    pub attempts: u32,
    /// Bound on each handshake.
    pub connect_timeout: Duration,
    /// Pause between two attempts.
    pub reconnect_timeout: Duration,
}

impl From<&SessionOptions> for ConnectOptions {
    fn from(options: &SessionOptions) -> Self {
        Self {
            attempts: options.connect_attempts,
            connect_timeout: options.connect_timeout(),
            reconnect_timeout: options.reconnect_timeout(),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&SessionOptions::default())
    }
}

/// Result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    /// Exit status reported by the device, if any.
    pub exit_status: Option<u32>,
}

/// Everything the sessions of one run share.
///
/// Built once per execution context; sessions created from different
/// contexts never compete for the same pool slots.
#[derive(Clone)]
pub struct SessionContext {
    pub pools: ResourcePools,
    pub connector: Arc<dyn Connector>,
    pub options: SessionOptions,
}

impl SessionContext {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            pools: ResourcePools::default(),
            connector,
            options: SessionOptions::default(),
        }
    }

    /// Context connecting over SSH with the given security policy.
    pub fn ssh(security: ConnectionSecurityOptions, options: SessionOptions) -> Self {
        let connector = SshConnector::new(security, options.keepalive());
        Self::new(Arc::new(connector)).with_options(options)
    }

    pub fn with_pools(mut self, limits: PoolLimits) -> Self {
        self.pools = ResourcePools::new(limits);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("pools", &self.pools)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

enum Route {
    Direct,
    /// Tunnelled through the transport of another session.
    Proxied(Weak<SessionInner>),
}

/// The live half of a connected session.
struct Link {
    transport: Arc<dyn Transport>,
    generation: u64,
    supervisor: Option<JoinHandle<()>>,
    _slot: OwnedSemaphorePermit,
}

impl Link {
    fn stop_supervisor(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.abort();
        }
    }
}

struct SessionInner {
    label: String,
    device_id: String,
    target: Target,
    credentials: Credentials,
    route: Route,
    context: SessionContext,
    connect_lock: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    state: watch::Sender<SessionState>,
    error: Mutex<Option<SessionError>>,
    requests: RequestRegistry,
    generation: AtomicU64,
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("{}: {}", self.label, state);
        }
    }

    fn record(&self, err: SessionError) {
        *lock(&self.error) = Some(err);
    }

    fn live(&self) -> Option<(Arc<dyn Transport>, u64)> {
        lock(&self.link)
            .as_ref()
            .map(|link| (link.transport.clone(), link.generation))
    }

    /// Detaches the current link, only if it still is `generation` when given.
    fn take_link(&self, generation: Option<u64>) -> Option<Link> {
        let link = {
            let mut slot = lock(&self.link);
            match (slot.as_ref(), generation) {
                (None, _) => return None,
                (Some(link), Some(generation)) if link.generation != generation => return None,
                _ => slot.take(),
            }
        };
        self.set_state(SessionState::Disconnected);
        link
    }

    async fn handshake(&self, timeout: Duration) -> Result<Arc<dyn Transport>, SessionError> {
        let via = match &self.route {
            Route::Direct => None,
            Route::Proxied(proxy) => {
                let proxy = proxy
                    .upgrade()
                    .ok_or_else(|| SessionError::Proxy("proxy session dropped".to_string()))?;
                let (transport, _) = proxy
                    .live()
                    .ok_or_else(|| SessionError::Proxy(format!("{} not connected", proxy.label)))?;
                Some(transport)
            }
        };
        let proxied = via.is_some();

        let connect = self
            .context
            .connector
            .connect(&self.target, &self.credentials, via);
        match time::timeout(timeout, connect).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(err)) => Err(classify_connect(&self.target, err, proxied)),
            Err(_) => Err(classify_connect(&self.target, TransportError::Timeout, proxied)),
        }
    }

    fn execution_failed(&self, generation: u64, transport: &dyn Transport, message: String) -> SessionError {
        let err = SessionError::Execution(message);
        error!("{}: {}", self.label, err);
        self.record(err.clone());
        if transport.is_closed()
            && let Some(link) = self.take_link(Some(generation))
        {
            link.stop_supervisor();
        }
        err
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let link = self
            .link
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(link) = link {
            link.stop_supervisor();
        }
    }
}

fn classify_connect(target: &Target, err: TransportError, proxied: bool) -> SessionError {
    match err {
        TransportError::Authentication(message) => SessionError::Authentication(message),
        other if proxied => SessionError::Proxy(format!("{target}: {other}")),
        other => SessionError::Connect(format!("{target}: {other}")),
    }
}

/// Puts a session back to DISCONNECTED if `connect` is dropped half way.
struct ConnectGuard<'a> {
    inner: &'a SessionInner,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.set_state(SessionState::Disconnected);
        }
    }
}

async fn supervise(
    inner: Weak<SessionInner>,
    transport: Arc<dyn Transport>,
    generation: u64,
    period: Duration,
) {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Err(err) = transport.probe().await else {
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let err = SessionError::Connect(format!("keepalive failed: {err}"));
        error!("{}: {}", inner.label, err);
        if let Some(link) = inner.take_link(Some(generation)) {
            inner.record(err);
            link.transport.close().await;
        }
        return;
    }
}

/// A managed SSH connection to one device endpoint.
///
/// Cloning is cheap and yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// A session connecting straight to `target`.
    pub fn new(
        device_id: impl Into<String>,
        target: Target,
        credentials: Credentials,
        context: SessionContext,
    ) -> Self {
        Self::with_route(device_id.into(), target, credentials, Route::Direct, context)
    }

    /// A session tunnelled through `proxy`, which must be connected first.
    pub fn proxied(
        device_id: impl Into<String>,
        target: Target,
        credentials: Credentials,
        proxy: &Session,
        context: SessionContext,
    ) -> Self {
        Self::behind(device_id, target, credentials, Some(proxy), context)
    }

    /// A proxied session; without a proxy session every connect attempt
    /// fails with [`SessionError::Proxy`].
    pub(crate) fn behind(
        device_id: impl Into<String>,
        target: Target,
        credentials: Credentials,
        proxy: Option<&Session>,
        context: SessionContext,
    ) -> Self {
        let proxy = proxy
            .map(|proxy| Arc::downgrade(&proxy.inner))
            .unwrap_or_default();
        let route = Route::Proxied(proxy);
        Self::with_route(device_id.into(), target, credentials, route, context)
    }

    fn with_route(
        device_id: String,
        target: Target,
        credentials: Credentials,
        route: Route,
        context: SessionContext,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                label: format!("{} (ip={}): ssh", device_id, target.host),
                device_id,
                target,
                credentials,
                route,
                context,
                connect_lock: tokio::sync::Mutex::new(()),
                link: Mutex::new(None),
                state,
                error: Mutex::new(None),
                requests: RequestRegistry::default(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    /// The jump host session, `None` for direct sessions or a dropped proxy.
    pub fn proxy(&self) -> Option<Session> {
        match &self.inner.route {
            Route::Direct => None,
            Route::Proxied(proxy) => proxy.upgrade().map(|inner| Session { inner }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Receiver observing every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// The last failure recorded on this session.
    pub fn last_error(&self) -> Option<SessionError> {
        lock(&self.inner.error).clone()
    }

    /// Commands and transfers running right now.
    pub fn requests(&self) -> Vec<Request> {
        self.inner.requests.snapshot()
    }

    pub(crate) fn track_file(&self, file_name: &str) -> RequestGuard<FileRequest> {
        self.inner.requests.track_file(file_name)
    }

    /// The live transport, or the error every operation reports without one.
    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        match self.inner.live() {
            Some((transport, _)) => Ok(transport),
            None => {
                warn!("{}: not connected", self.inner.label);
                Err(SessionError::Execution("not connected".to_string()))
            }
        }
    }

    /// Connects with the retry policy of the session's context.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.connect_with(ConnectOptions::from(&self.inner.context.options))
            .await
    }

    /// Connects unless already connected.
    ///
    /// Concurrent callers are serialized and all but the first find the
    /// session connected. A connections pool slot is taken before the first
    /// handshake and kept until the session disconnects.
    pub async fn connect_with(&self, options: ConnectOptions) -> Result<(), SessionError> {
        let inner = &self.inner;
        let _serialized = inner.connect_lock.lock().await;

        if let Some((transport, generation)) = inner.live() {
            if !transport.is_closed() {
                return Ok(());
            }
            debug!("{}: discarding closed transport", inner.label);
            if let Some(link) = inner.take_link(Some(generation)) {
                link.stop_supervisor();
            }
        }

        let mut guard = ConnectGuard { inner, armed: true };
        *lock(&inner.error) = None;
        inner.set_state(SessionState::WaitingConnect);
        let slot = inner.context.pools.connections.acquire().await;

        let attempts = options.attempts.max(1);
        let mut attempt = 1;
        loop {
            inner.set_state(SessionState::Connecting);
            debug!(
                "{}: connecting to {} (attempt {attempt}/{attempts})",
                inner.label, inner.target
            );
            match inner.handshake(options.connect_timeout).await {
                Ok(transport) => {
                    self.install(transport, slot);
                    guard.armed = false;
                    return Ok(());
                }
                Err(err) if attempt >= attempts => {
                    error!("{}: {}", inner.label, err);
                    inner.record(err.clone());
                    drop(slot);
                    return Err(err);
                }
                Err(err) => {
                    warn!("{}: {}, retrying in {:?}", inner.label, err, options.reconnect_timeout);
                    inner.set_state(SessionState::WaitingReconnect);
                    time::sleep(options.reconnect_timeout).await;
                    attempt += 1;
                }
            }
        }
    }

    fn install(&self, transport: Arc<dyn Transport>, slot: OwnedSemaphorePermit) {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let supervisor = inner.context.options.keepalive().map(|period| {
            tokio::spawn(supervise(
                Arc::downgrade(inner),
                transport.clone(),
                generation,
                period,
            ))
        });
        *lock(&inner.link) = Some(Link {
            transport,
            generation,
            supervisor,
            _slot: slot,
        });
        inner.set_state(SessionState::Connected);
    }

    /// Closes the transport and releases the connection slot.
    ///
    /// Does nothing on a session that is not connected.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _serialized = inner.connect_lock.lock().await;
        if let Some(link) = inner.take_link(None) {
            link.stop_supervisor();
            link.transport.close().await;
        }
    }

    /// Connects, runs `f` and disconnects again, whatever `f` returned.
    pub async fn scoped<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SessionError>,
    {
        self.connect().await?;
        let result = f(self.clone()).await;
        self.disconnect().await;
        result
    }

    /// Runs `command` with the configured command timeout.
    pub async fn execute_default(&self, command: &str) -> Result<Output, SessionError> {
        let timeout = self.inner.context.options.command_timeout();
        self.execute(command, timeout, None).await
    }

    /// Runs one command on its own channel.
    ///
    /// `password`, when given, is written to the command's stdin followed by a
    /// newline. Never connects: a disconnected session fails immediately.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        password: Option<&str>,
    ) -> Result<Output, SessionError> {
        let inner = &self.inner;
        let Some((transport, generation)) = inner.live() else {
            warn!("{}: {command:?} not executed, not connected", inner.label);
            return Err(SessionError::Execution("not connected".to_string()));
        };

        let request = inner.requests.track_cmd(command);
        let _slot = inner.context.pools.executions.acquire().await;
        debug!("{}: exec {command:?}", inner.label);

        let run = run_command(transport.as_ref(), &request, password);
        match time::timeout(timeout, run).await {
            Ok(Ok(exit_status)) => {
                debug!("{}: {}", inner.label, *request);
                Ok(Output {
                    stdout: request.stdout(),
                    stderr: request.stderr(),
                    exit_status,
                })
            }
            Ok(Err(err)) => Err(inner.execution_failed(
                generation,
                transport.as_ref(),
                format!("{command:?}: {err}"),
            )),
            Err(_) => Err(inner.execution_failed(
                generation,
                transport.as_ref(),
                format!("{command:?}: timed out after {timeout:?}"),
            )),
        }
    }
}

async fn run_command(
    transport: &dyn Transport,
    request: &CmdRequest,
    password: Option<&str>,
) -> Result<Option<u32>, TransportError> {
    let mut channel = transport.open_exec(request.command()).await?;
    if let Some(password) = password {
        channel.send(format!("{password}\n").as_bytes()).await?;
    }
    let mut exit_status = None;
    while let Some(event) = channel.recv().await {
        match event? {
            ChannelEvent::Stdout(data) => request.push_stdout(&data),
            ChannelEvent::Stderr(data) => request.push_stderr(&data),
            ChannelEvent::ExitStatus(status) => exit_status = Some(status),
        }
    }
    Ok(exit_status)
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.label)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.inner.device_id)
            .field("target", &self.inner.target)
            .field("state", &self.state())
            .finish()
    }
}
