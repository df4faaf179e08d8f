//! In-flight request tracking.
//!
//! Every command and every file transfer registers itself on its session for
//! the duration of the operation, so an observer can ask a session what it is
//! doing right now. Registration is tied to a guard; dropping the guard (normal
//! completion, error, or a cancelled future) removes the entry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running command with its output so far.
#[derive(Debug)]
pub struct CmdRequest {
    command: String,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl CmdRequest {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            stdout: Mutex::new(Vec::new()),
            stderr: Mutex::new(Vec::new()),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub(crate) fn push_stdout(&self, data: &[u8]) {
        lock(&self.stdout).extend_from_slice(data);
    }

    pub(crate) fn push_stderr(&self, data: &[u8]) {
        lock(&self.stderr).extend_from_slice(data);
    }

    pub fn stdout_len(&self) -> usize {
        lock(&self.stdout).len()
    }

    pub fn stderr_len(&self) -> usize {
        lock(&self.stderr).len()
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&lock(&self.stdout)).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&lock(&self.stderr)).into_owned()
    }
}

impl fmt::Display for CmdRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t/\t{}",
            self.command,
            self.stdout_len(),
            self.stderr_len()
        )
    }
}

/// A file being transferred.
#[derive(Debug)]
pub struct FileRequest {
    file_name: String,
    received_bytes: AtomicU64,
    total_bytes: AtomicU64,
    /// Bytes per second, stored as `f64` bits.
    speed: AtomicU64,
}

impl FileRequest {
    fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            received_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            speed: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed.load(Ordering::Relaxed))
    }

    /// Fraction done, `1.0` for empty files.
    pub fn progress(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            1.0
        } else {
            self.received_bytes() as f64 / total as f64
        }
    }

    pub(crate) fn update(&self, received: u64, total: u64) {
        self.received_bytes.store(received, Ordering::Relaxed);
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    pub(crate) fn set_speed(&self, speed: f64) {
        self.speed.store(speed.to_bits(), Ordering::Relaxed);
    }
}

impl fmt::Display for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\tof\t{}\t[ {:.0}% ]\tat {:.0} Bps",
            self.file_name,
            self.received_bytes(),
            self.total_bytes(),
            self.progress() * 100.0,
            self.speed()
        )
    }
}

/// Work currently running on a session.
#[derive(Debug, Clone)]
pub enum Request {
    Cmd(Arc<CmdRequest>),
    File(Arc<FileRequest>),
}

impl Request {
    fn same(&self, other: &Request) -> bool {
        match (self, other) {
            (Request::Cmd(a), Request::Cmd(b)) => Arc::ptr_eq(a, b),
            (Request::File(a), Request::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Cmd(request) => fmt::Display::fmt(request.as_ref(), f),
            Request::File(request) => fmt::Display::fmt(request.as_ref(), f),
        }
    }
}

/// The list of in-flight requests of one session.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestRegistry {
    entries: Arc<Mutex<Vec<Request>>>,
}

impl RequestRegistry {
    pub(crate) fn track_cmd(&self, command: &str) -> RequestGuard<CmdRequest> {
        let request = Arc::new(CmdRequest::new(command));
        self.track(Request::Cmd(request.clone()), request)
    }

    pub(crate) fn track_file(&self, file_name: &str) -> RequestGuard<FileRequest> {
        let request = Arc::new(FileRequest::new(file_name));
        self.track(Request::File(request.clone()), request)
    }

    fn track<T>(&self, entry: Request, request: Arc<T>) -> RequestGuard<T> {
        lock(&self.entries).push(entry.clone());
        RequestGuard {
            registry: self.clone(),
            entry,
            request,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Request> {
        lock(&self.entries).clone()
    }

    fn remove(&self, entry: &Request) {
        lock(&self.entries).retain(|other| !other.same(entry));
    }
}

/// Keeps a request registered until dropped.
pub(crate) struct RequestGuard<T> {
    registry: RequestRegistry,
    entry: Request,
    request: Arc<T>,
}

impl<T> std::ops::Deref for RequestGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.request
    }
}

impl<T> Drop for RequestGuard<T> {
    fn drop(&mut self) {
        self.registry.remove(&self.entry);
    }
}
