//! Vendor CLI dialects and the command verbs built on them.
//!
//! A [`Dialect`] knows how to wrap a command for the device's shell, host or
//! forwarding engine, how to ask for structured output, and how the device
//! reports errors in otherwise successful output. [`Cli`] binds a dialect to
//! a connected [`Session`] and turns device-reported failures into
//! [`DeviceError::Command`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use roxmltree::Document;
use uuid::Uuid;

use crate::error::{DeviceError, ParseError};
use crate::parser::{Value, XmlParser};
use crate::session::{Output, Session};
use crate::transfer::{TransferManager, TransferReport};

/// Junos prints CLI errors as the second line of stdout:
/// `error: syntax error, expecting <command>: foo`.
static JUNOS_ERROR: Lazy<Regex> = Lazy::new(|| match Regex::new(r"^error: (.*)$") {
    Ok(re) => re,
    Err(err) => panic!("invalid JUNOS_ERROR regex: {err}"),
});

/// Finds device-reported errors in command output.
pub trait ErrorMatcher: Send + Sync {
    /// The error message, if `stdout` reports one.
    fn device_error(&self, stdout: &str) -> Option<String>;
}

/// Matches a pattern against one fixed line of the output.
///
/// The first capture group of the pattern is the reported message.
#[derive(Debug, Clone)]
pub struct LineErrorMatcher {
    line: usize,
    pattern: Regex,
}

impl LineErrorMatcher {
    pub fn new(line: usize, pattern: Regex) -> Self {
        Self { line, pattern }
    }
}

impl ErrorMatcher for LineErrorMatcher {
    fn device_error(&self, stdout: &str) -> Option<String> {
        let line = stdout.split('\n').nth(self.line)?;
        let captures = self.pattern.captures(line)?;
        Some(captures.get(1).map_or("", |m| m.as_str()).to_string())
    }
}

/// Command framing of one vendor CLI.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn error_matcher(&self) -> &dyn ErrorMatcher;

    fn shell_command(&self, command: &str) -> String;

    /// Shell command run as root; the root password is expected on stdin.
    fn root_shell_command(&self, command: &str) -> String;

    /// Strips what the privileged shell echoes before the command output.
    fn strip_root_prompt<'a>(&self, stdout: &'a str) -> &'a str {
        stdout
    }

    fn pfe_command(&self, command: &str, fpc: u32) -> String;

    fn host_command(&self, command: &str) -> String;

    fn xml_command(&self, command: &str) -> String;

    /// Rewrites XML output into something a namespace-unaware parser accepts.
    fn normalize_xml(&self, output: &str) -> String {
        output.to_string()
    }

    fn json_command(&self, command: &str) -> String;

    /// One command applying `block` as a configuration transaction.
    fn config_command(&self, block: &str) -> String;

    /// Names of the redundant controllers; empty or one entry when there is
    /// no redundancy.
    fn routing_engines(&self) -> &[String];

    /// Command archiving `path` into `archive`, on every routing engine when
    /// the device has more than one.
    fn archive_command(&self, archive: &str, path: &str) -> String;

    /// Command copying `archive` off routing engine `re` to a local name.
    fn fetch_archive_command(&self, re: &str, archive: &str, local: &str) -> String;

    fn delete_command(&self, path: &str) -> String;
}

/// Juniper Junos.
#[derive(Debug, Clone)]
pub struct Junos {
    routing_engines: Vec<String>,
    matcher: LineErrorMatcher,
}

impl Default for Junos {
    fn default() -> Self {
        Self {
            routing_engines: Vec::new(),
            matcher: LineErrorMatcher::new(1, JUNOS_ERROR.clone()),
        }
    }
}

impl Junos {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chassis with the two routing engines `re0` and `re1`.
    pub fn redundant() -> Self {
        Self::default().with_routing_engines(["re0", "re1"])
    }

    pub fn with_routing_engines<I, S>(mut self, engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_engines = engines.into_iter().map(Into::into).collect();
        self
    }

    fn redundant_engines(&self) -> bool {
        self.routing_engines.len() > 1
    }
}

impl Dialect for Junos {
    fn name(&self) -> &str {
        "junos"
    }

    fn error_matcher(&self) -> &dyn ErrorMatcher {
        &self.matcher
    }

    fn shell_command(&self, command: &str) -> String {
        format!("start shell command \"{command}\"")
    }

    fn root_shell_command(&self, command: &str) -> String {
        format!("start shell user root command \"{command}\"")
    }

    fn strip_root_prompt<'a>(&self, stdout: &'a str) -> &'a str {
        stdout.strip_prefix("Password:").unwrap_or(stdout)
    }

    fn pfe_command(&self, command: &str, fpc: u32) -> String {
        format!("request pfe execute target fpc{fpc} command \"{command}\"")
    }

    fn host_command(&self, command: &str) -> String {
        format!("request app-engine host-cmd \"{command}\"")
    }

    fn xml_command(&self, command: &str) -> String {
        format!("{command} | display xml")
    }

    fn normalize_xml(&self, output: &str) -> String {
        output
            .replace(" xmlns=", " xmlnamespace=")
            .replace("junos:", "")
    }

    fn json_command(&self, command: &str) -> String {
        format!("{command} | display json")
    }

    fn config_command(&self, block: &str) -> String {
        let mut lines = vec!["configure private"];
        lines.extend(block.lines().map(str::trim).filter(|line| !line.is_empty()));
        lines.push("commit and-quit");
        lines.join("\n")
    }

    fn routing_engines(&self) -> &[String] {
        &self.routing_engines
    }

    fn archive_command(&self, archive: &str, path: &str) -> String {
        if self.redundant_engines() {
            format!(
                "request routing-engine execute command \"tar -czf ./{archive} {path}\" routing-engine both"
            )
        } else {
            self.shell_command(&format!("tar -czf ./{archive} {path}"))
        }
    }

    fn fetch_archive_command(&self, re: &str, archive: &str, local: &str) -> String {
        format!("file copy {re}:./{archive} ./{local}")
    }

    fn delete_command(&self, path: &str) -> String {
        format!("file delete {path}")
    }
}

/// File name of an archive of `path`: `var.log.messages.tgz` for `/var/log/messages*`.
pub fn archive_name(path: &str) -> String {
    let name = path
        .trim_start_matches('/')
        .replace('/', ".")
        .replace('*', "");
    format!("{name}.tgz")
}

/// XML output of a command, checked to be well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlOutput {
    text: String,
}

impl XmlOutput {
    pub fn new(text: impl Into<String>) -> Result<Self, ParseError> {
        let text = text.into().trim().to_string();
        Document::parse(&text)?;
        Ok(Self { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn document(&self) -> Result<Document<'_>, ParseError> {
        Ok(Document::parse(&self.text)?)
    }

    /// Converts the document with `parser`.
    pub fn parse(&self, parser: &XmlParser) -> Result<Value, ParseError> {
        parser.parse(&self.document()?)
    }
}

/// Command verbs of one session in one dialect.
#[derive(Debug, Clone)]
pub struct Cli {
    session: Session,
    dialect: Arc<dyn Dialect>,
    timeout: Duration,
}

impl Cli {
    pub fn new(session: Session, dialect: Arc<dyn Dialect>) -> Self {
        let timeout = session.context().options.command_timeout();
        Self {
            session,
            dialect,
            timeout,
        }
    }

    /// Command timeout used by every verb.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    async fn exec(&self, command: &str, password: Option<&str>) -> Result<Output, DeviceError> {
        Ok(self.session.execute(command, self.timeout, password).await?)
    }

    fn check_stdout(&self, command: &str, stdout: &str) -> Result<(), DeviceError> {
        match self.dialect.error_matcher().device_error(stdout) {
            Some(message) => {
                warn!("{}: {}: run_cmd `{command}`: ERROR: {message}", self.session, self.dialect.name());
                Err(DeviceError::Command(message))
            }
            None => Ok(()),
        }
    }

    fn check_stderr(&self, verb: &str, stderr: &str) -> Result<(), DeviceError> {
        let stderr = stderr.trim();
        if stderr.is_empty() {
            return Ok(());
        }
        warn!("{}: {}: {verb}: ERROR: {stderr}", self.session, self.dialect.name());
        Err(DeviceError::Command(stderr.to_string()))
    }

    /// Runs `command` as typed at the CLI prompt.
    pub async fn run_cmd(&self, command: &str) -> Result<String, DeviceError> {
        let output = self.exec(command, None).await?;
        self.check_stdout(command, &output.stdout)?;
        Ok(output.stdout)
    }

    /// Runs `command` in the device's unix shell.
    pub async fn run_shell_cmd(&self, command: &str) -> Result<String, DeviceError> {
        let output = self.exec(&self.dialect.shell_command(command), None).await?;
        self.check_stdout(command, &output.stdout)?;
        self.check_stderr("run_shell_cmd", &output.stderr)?;
        Ok(output.stdout)
    }

    /// Runs `command` in the unix shell as root, with the device's root password.
    pub async fn run_root_shell_cmd(&self, command: &str) -> Result<String, DeviceError> {
        let Some(root_password) = self.session.credentials().root_password.as_deref() else {
            return Err(DeviceError::Command("root password is not set".to_string()));
        };
        let framed = self.dialect.root_shell_command(command);
        let output = self.exec(&framed, Some(root_password)).await?;
        let stdout = self.dialect.strip_root_prompt(&output.stdout);
        self.check_stdout(command, stdout)?;
        self.check_stderr("run_root_shell_cmd", &output.stderr)?;
        Ok(stdout.to_string())
    }

    /// Runs `command` on the forwarding engine of line card `fpc`.
    ///
    /// The echoed command and the status line are removed from the result.
    pub async fn run_pfe_cmd(&self, command: &str, fpc: u32) -> Result<String, DeviceError> {
        let output = self.exec(&self.dialect.pfe_command(command, fpc), None).await?;
        self.check_stdout(command, &output.stdout)?;
        self.check_stderr("run_pfe_cmd", &output.stderr)?;

        let mut parts = output.stdout.splitn(3, '\n');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_echo), Some(status), Some(rest)) => {
                if status.contains("error") {
                    warn!("{}: {}: run_pfe_cmd: ERROR: {status}", self.session, self.dialect.name());
                    return Err(DeviceError::Command(status.to_string()));
                }
                Ok(rest.to_string())
            }
            _ => Ok(output.stdout),
        }
    }

    /// Runs `command` on the host OS underneath the CLI.
    pub async fn run_host_cmd(&self, command: &str) -> Result<String, DeviceError> {
        let output = self.exec(&self.dialect.host_command(command), None).await?;
        self.check_stdout(command, &output.stdout)?;
        self.check_stderr("run_host_cmd", &output.stderr)?;
        Ok(output.stdout)
    }

    /// Runs `command` asking for XML output.
    pub async fn run_xml_cmd(&self, command: &str) -> Result<XmlOutput, DeviceError> {
        let output = self.exec(&self.dialect.xml_command(command), None).await?;
        self.check_stdout(command, &output.stdout)?;
        let normalized = self.dialect.normalize_xml(&output.stdout);
        XmlOutput::new(normalized).map_err(|err| {
            warn!("{}: {}: run_xml_cmd: {err}", self.session, self.dialect.name());
            DeviceError::Command(format!("{command}: {err}"))
        })
    }

    /// Runs `command` asking for JSON output, which must be an object.
    pub async fn run_json_cmd(
        &self,
        command: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, DeviceError> {
        let output = self.exec(&self.dialect.json_command(command), None).await?;
        self.check_stdout(command, &output.stdout)?;
        match serde_json::from_str(&output.stdout) {
            Ok(serde_json::Value::Object(object)) => Ok(object),
            Ok(_) => {
                warn!("{}: {}: run_json_cmd: not a json object", self.session, self.dialect.name());
                Err(DeviceError::Command(format!("{command}: not a json object")))
            }
            Err(err) => {
                warn!("{}: {}: run_json_cmd: {err}", self.session, self.dialect.name());
                Err(DeviceError::Command(format!("{command}: {err}")))
            }
        }
    }

    /// Applies a configuration block in one private configuration transaction.
    ///
    /// Only errors the CLI prints in the usual place are detected; a commit
    /// rejected later in the output goes unnoticed.
    pub async fn config(&self, block: &str) -> Result<String, DeviceError> {
        let command = self.dialect.config_command(block);
        debug!("{}: {}: config\n{command}", self.session, self.dialect.name());
        self.run_cmd(&command).await
    }

    /// Downloads a remote file or directory into `local`.
    pub async fn download(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
    ) -> Result<TransferReport, DeviceError> {
        let transfer = TransferManager::new(self.session.clone());
        Ok(transfer.download(remote, local.as_ref(), None).await?)
    }

    /// Archives `remote_path` on the device and downloads the archive.
    ///
    /// On chassis with redundant routing engines one archive per engine is
    /// fetched and saved as `re0.<name>.tgz`, `re1.<name>.tgz`; otherwise as
    /// `<name>.tgz`. Steps run in order and nothing is undone when one fails.
    pub async fn archive_download(
        &self,
        remote_path: &str,
        local_dir: impl AsRef<Path>,
    ) -> Result<Vec<TransferReport>, DeviceError> {
        let local_dir = local_dir.as_ref();
        let local_name = archive_name(remote_path);
        let archive = format!("{}.{local_name}", Uuid::new_v4());
        let transfer = TransferManager::new(self.session.clone());

        self.run_cmd(&self.dialect.archive_command(&archive, remote_path))
            .await?;

        let engines = self.dialect.routing_engines();
        let mut reports = Vec::new();
        if engines.len() > 1 {
            for re in engines {
                let fetched = format!("{re}.{archive}");
                self.run_cmd(&self.dialect.fetch_archive_command(re, &archive, &fetched))
                    .await?;
                let local = local_dir.join(format!("{re}.{local_name}"));
                reports.push(transfer.download(&fetched, &local, None).await?);
            }
            for re in engines {
                self.run_cmd(&self.dialect.delete_command(&format!("./{re}.{archive}")))
                    .await?;
                self.run_cmd(&self.dialect.delete_command(&format!("{re}:./{archive}")))
                    .await?;
            }
        } else {
            let local = local_dir.join(&local_name);
            reports.push(transfer.download(&archive, &local, None).await?);
            self.run_cmd(&self.dialect.delete_command(&format!("./{archive}")))
                .await?;
        }
        info!(
            "{}: {}: archived {remote_path} into {} file(s)",
            self.session,
            self.dialect.name(),
            reports.len()
        );
        Ok(reports)
    }
}
