//! In-memory connector, transport and device used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netfleet::config::{PoolLimits, SessionOptions};
use netfleet::error::TransportError;
use netfleet::session::{
    ChannelEvent, Connector, Credentials, ExecChannel, RemoteEntry, RemoteFs, SessionContext,
    Target, Transport, TunnelIo,
};
use tokio::io::{AsyncRead, AsyncWrite};

/// What a fake device answers to one command.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
    /// Never answers; the channel stays open forever.
    pub hang: bool,
    /// The connection drops after the output is sent.
    pub broken: bool,
}

impl Reply {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            exit_status: Some(0),
            ..Default::default()
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stderr: text.into(),
            exit_status: Some(1),
            ..Default::default()
        }
    }

    /// Sends part of the output, then the connection drops.
    pub fn broken(partial: impl Into<String>) -> Self {
        Self {
            stdout: partial.into(),
            broken: true,
            ..Default::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }
}

pub type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

pub fn echo() -> Responder {
    Arc::new(|command: &str| Reply::stdout(format!("{command}\n")))
}

/// How the next connect attempts end.
#[derive(Debug, Clone)]
pub enum Outcome {
    Refused,
    Denied,
    /// Never completes; only a connect timeout ends it.
    Stall,
}

pub struct FakeConnector {
    responder: Responder,
    fs_root: Option<PathBuf>,
    script: Mutex<VecDeque<Outcome>>,
    handshake_delay: Mutex<Option<Duration>>,
    unreachable: Mutex<HashSet<String>>,
    pub connects: AtomicUsize,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeConnector {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self::build(responder, None))
    }

    /// Transports expose `root` as their remote filesystem.
    pub fn with_fs(responder: Responder, root: &Path) -> Arc<Self> {
        Arc::new(Self::build(responder, Some(root.to_path_buf())))
    }

    fn build(responder: Responder, fs_root: Option<PathBuf>) -> Self {
        Self {
            responder,
            fs_root,
            script: Mutex::new(VecDeque::new()),
            handshake_delay: Mutex::new(None),
            unreachable: Mutex::new(HashSet::new()),
            connects: AtomicUsize::new(0),
            transports: Mutex::new(Vec::new()),
        }
    }

    /// Queues outcomes for the next attempts; later attempts succeed.
    pub fn fail_next(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// Every connect to `host` is refused.
    pub fn unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    pub fn delay_handshakes(&self, delay: Duration) {
        *self.handshake_delay.lock().unwrap() = Some(delay);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport created")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        target: &Target,
        credentials: &Credentials,
        via: Option<Arc<dyn Transport>>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.handshake_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(via) = &via {
            via.open_tunnel(target).await?;
        }
        let outcome = if self.unreachable.lock().unwrap().contains(&target.host) {
            Some(Outcome::Refused)
        } else {
            self.script.lock().unwrap().pop_front()
        };
        match outcome {
            Some(Outcome::Refused) => {
                let message = format!("{target}: connection refused");
                return Err(match via {
                    Some(_) => TransportError::Tunnel(message),
                    None => TransportError::Connect(message),
                });
            }
            Some(Outcome::Denied) => {
                return Err(TransportError::Authentication(format!(
                    "{} rejected",
                    credentials.user
                )));
            }
            Some(Outcome::Stall) => std::future::pending::<()>().await,
            None => {}
        }
        let transport = Arc::new(FakeTransport {
            target: target.clone(),
            responder: self.responder.clone(),
            fs_root: self.fs_root.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            tunnels: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            stdin: Arc::new(Mutex::new(Vec::new())),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub struct FakeTransport {
    pub target: Target,
    responder: Responder,
    fs_root: Option<PathBuf>,
    closed: Arc<AtomicBool>,
    pub tunnels: Mutex<Vec<Target>>,
    pub commands: Mutex<Vec<String>>,
    pub stdin: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    /// The remote side drops the connection.
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.commands.lock().unwrap().push(command.to_string());
        let reply = (self.responder)(command);
        let mut events = VecDeque::new();
        if !reply.stdout.is_empty() {
            events.push_back(ChannelEvent::Stdout(reply.stdout.into_bytes()));
        }
        if !reply.stderr.is_empty() {
            events.push_back(ChannelEvent::Stderr(reply.stderr.into_bytes()));
        }
        if let Some(status) = reply.exit_status {
            events.push_back(ChannelEvent::ExitStatus(status));
        }
        Ok(Box::new(FakeChannel {
            events,
            hang: reply.hang,
            broken: reply.broken,
            closed: Arc::clone(&self.closed),
            stdin: Arc::clone(&self.stdin),
        }))
    }

    async fn open_tunnel(&self, target: &Target) -> Result<Box<dyn TunnelIo>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Tunnel(format!("{target}: proxy closed")));
        }
        self.tunnels.lock().unwrap().push(target.clone());
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(near))
    }

    async fn open_fs(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
        match &self.fs_root {
            Some(root) => Ok(Box::new(LocalFs::new(root))),
            None => Err(TransportError::Sftp("subsystem not available".to_string())),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeChannel {
    events: VecDeque<ChannelEvent>,
    hang: bool,
    broken: bool,
    closed: Arc<AtomicBool>,
    stdin: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ExecChannel for FakeChannel {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stdin
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ChannelEvent, TransportError>> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        match self.events.pop_front() {
            Some(event) => Some(Ok(event)),
            None if self.broken => {
                self.broken = false;
                self.closed.store(true, Ordering::SeqCst);
                Some(Err(TransportError::Closed))
            }
            None => None,
        }
    }
}

/// A [`RemoteFs`] over a local directory; remote paths are relative to it.
///
/// Files whose name starts with `unreadable` cannot be opened.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches("./").trim_start_matches('/');
        self.root.join(relative)
    }
}

#[async_trait]
impl RemoteFs for LocalFs {
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError> {
        let metadata = tokio::fs::metadata(self.resolve(path)).await?;
        Ok(RemoteEntry {
            name: path.to_string(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.resolve(path)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        Ok(entries)
    }

    async fn open_read(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError> {
        let resolved = self.resolve(path);
        let unreadable = resolved
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with("unreadable"));
        if unreadable {
            return Err(TransportError::Sftp(format!("{path}: permission denied")));
        }
        Ok(Box::new(tokio::fs::File::open(resolved).await?))
    }

    async fn open_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError> {
        Ok(Box::new(tokio::fs::File::create(self.resolve(path)).await?))
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        match tokio::fs::create_dir(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A Junos box that understands a handful of commands and keeps its host name.
pub struct FakeJunos {
    factory_hostname: String,
    hostname: Mutex<String>,
}

impl FakeJunos {
    pub fn new(hostname: &str) -> Arc<Self> {
        Arc::new(Self {
            factory_hostname: hostname.to_string(),
            hostname: Mutex::new(hostname.to_string()),
        })
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().unwrap().clone()
    }

    pub fn responder(self: &Arc<Self>) -> Responder {
        let device = Arc::clone(self);
        Arc::new(move |command: &str| device.respond(command))
    }

    fn respond(&self, command: &str) -> Reply {
        if let Some(block) = command.strip_prefix("configure private\n") {
            return self.configure(block);
        }
        match command {
            "show version" => Reply::stdout(format!(
                "Hostname: {}\nModel: mx480\nJunos: 21.4R3\n",
                self.hostname()
            )),
            "show system information | display xml" => Reply::stdout(format!(
                concat!(
                    "\n<rpc-reply xmlns:junos=\"http://xml.juniper.net/junos/21.4R3/junos\">\n",
                    "    <system-information>\n",
                    "        <hardware-model>mx480</hardware-model>\n",
                    "        <host-name>{}</host-name>\n",
                    "    </system-information>\n",
                    "</rpc-reply>\n",
                ),
                self.hostname()
            )),
            "show system information | display json" => Reply::stdout(format!(
                "{{\"system-information\": [{{\"host-name\": [{{\"data\": \"{}\"}}]}}]}}",
                self.hostname()
            )),
            "show system uptime | display json" => Reply::stdout("[1, 2, 3]"),
            "request pfe execute target fpc0 command \"show jnh 0 pool summary\"" => {
                Reply::stdout(concat!(
                    "SENT: Ukern command: show jnh 0 pool summary\n",
                    "GOT:\n",
                    "GOT: Name    Size    Allocated\n",
                    "GOT: EDMEM   33554368  1943840\n",
                ))
            }
            "request pfe execute target fpc9 command \"show jnh 0 pool summary\"" => {
                Reply::stdout(concat!(
                    "SENT: Ukern command: show jnh 0 pool summary\n",
                    "error: fpc9 is not online\n",
                ))
            }
            "start shell command \"uname -s\"" => Reply::stdout("FreeBSD\n"),
            "start shell command \"cat /nonexistent\"" => {
                Reply::stderr("cat: /nonexistent: No such file or directory\n")
            }
            "start shell user root command \"id -u\"" => Reply::stdout("Password:\n0\n"),
            _ => Reply::stdout(format!(
                "{command}\nerror: syntax error, expecting <command>: {command}\n"
            )),
        }
    }

    fn configure(&self, block: &str) -> Reply {
        let mut lines = block.lines().collect::<Vec<_>>();
        if lines.pop() != Some("commit and-quit") {
            return Reply::stdout("\nerror: configuration database modified\n");
        }
        let mut hostname = None;
        for line in lines {
            let line = line.trim();
            if let Some(name) = line.strip_prefix("set system host-name ") {
                hostname = Some(name.to_string());
            } else if line == "delete system host-name" {
                hostname = Some(self.factory_hostname.clone());
            } else {
                return Reply::stdout(format!(
                    "Entering configuration mode\nerror: syntax error: {line}\n"
                ));
            }
        }
        if let Some(name) = hostname {
            *self.hostname.lock().unwrap() = name;
        }
        Reply::stdout("Entering configuration mode\ncommit complete\nExiting configuration mode\n")
    }
}

/// Options without keepalive and with short timeouts.
pub fn quiet_options() -> SessionOptions {
    SessionOptions {
        connect_timeout_secs: 5,
        reconnect_timeout_secs: 1,
        command_timeout_secs: 5,
        keepalive_secs: 0,
        ..Default::default()
    }
}

pub fn context(connector: Arc<FakeConnector>) -> SessionContext {
    SessionContext::new(connector).with_options(quiet_options())
}

pub fn context_with_pools(connector: Arc<FakeConnector>, limits: PoolLimits) -> SessionContext {
    context(connector).with_pools(limits)
}

pub fn credentials() -> Credentials {
    Credentials::new("lab", "lab123")
}
